//! 事件总线
//!
//! 两个投递通道：
//!
//! - **同步监听器**：在发布者的任务中内联调用，接收全部事件；STARTING、STOPPING、
//!   LAZY_ACTIVATION 在状态变更过程中发布，因此只有同步监听器能看到
//! - **异步监听器**：每个监听器拥有一个 FIFO 队列，由独立任务依次消费；接收除上述三种以外的事件。
//!   不同监听器之间不保证相对顺序
//!
//! 单个监听器 panic 不影响其他监听器，也不会终止队列任务。

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::event::{EventFilter, ModuleEvent};
use crate::utils::{generate_id, is_valid_id};

/// 默认的队列排空等待上限
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// 事件回调
pub type EventCallback = Arc<dyn Fn(&ModuleEvent) + Send + Sync>;

enum Delivery {
    Event(Arc<ModuleEvent>),
    Flush(oneshot::Sender<()>),
}

struct SyncEntry {
    id: String,
    filter: EventFilter,
    callback: EventCallback,
}

struct AsyncEntry {
    filter: EventFilter,
    queue: mpsc::UnboundedSender<Delivery>,
}

struct BusInner {
    sync_listeners: RwLock<Vec<SyncEntry>>,
    async_listeners: RwLock<HashMap<String, AsyncEntry>>,
    published: AtomicU64,
    flush_timeout: Duration,
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sync_listeners", &self.inner.sync_listeners.read().len())
            .field("async_listeners", &self.inner.async_listeners.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_flush_timeout(DEFAULT_FLUSH_TIMEOUT)
    }

    pub fn with_flush_timeout(flush_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sync_listeners: RwLock::new(Vec::new()),
                async_listeners: RwLock::new(HashMap::new()),
                published: AtomicU64::new(0),
                flush_timeout,
            }),
        }
    }

    /// 订阅异步事件
    ///
    /// 必须在 tokio 运行时内调用：每个监听器启动一个队列任务。
    pub fn subscribe(&self, filter: EventFilter, callback: EventCallback) -> String {
        let id = generate_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let listener_id = id.clone();

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Event(event) => {
                        if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                            warn!(
                                subscription_id = %listener_id,
                                event_kind = %event.kind,
                                "异步监听器 panic"
                            );
                        }
                    }
                    Delivery::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            trace!(subscription_id = %listener_id, "异步监听器队列关闭");
        });

        self.inner
            .async_listeners
            .write()
            .insert(id.clone(), AsyncEntry { filter, queue: tx });
        debug!(subscription_id = %id, "异步监听器订阅成功");
        id
    }

    /// 订阅同步事件
    pub fn subscribe_sync(&self, filter: EventFilter, callback: EventCallback) -> String {
        let id = generate_id();
        self.inner.sync_listeners.write().push(SyncEntry {
            id: id.clone(),
            filter,
            callback,
        });
        debug!(subscription_id = %id, "同步监听器订阅成功");
        id
    }

    /// 取消订阅，返回订阅是否存在
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        if !is_valid_id(subscription_id) {
            return false;
        }
        if self
            .inner
            .async_listeners
            .write()
            .remove(subscription_id)
            .is_some()
        {
            return true;
        }
        let mut sync = self.inner.sync_listeners.write();
        let before = sync.len();
        sync.retain(|entry| entry.id != subscription_id);
        before != sync.len()
    }

    /// 发布事件
    ///
    /// 同步监听器在当前任务中依次调用后才返回；异步监听器只是入队。
    pub fn publish(&self, event: ModuleEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        trace!(
            event_id = %event.event_id,
            event_kind = %event.kind,
            module_id = %event.module,
            "发布事件"
        );

        let callbacks: Vec<EventCallback> = self
            .inner
            .sync_listeners
            .read()
            .iter()
            .filter(|entry| entry.filter.matches(&event))
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(event_kind = %event.kind, "同步监听器 panic");
            }
        }

        if event.kind.is_synchronous() {
            return;
        }

        let event = Arc::new(event);
        let listeners = self.inner.async_listeners.read();
        for entry in listeners.values() {
            if entry.filter.matches(&event) {
                let _ = entry.queue.send(Delivery::Event(event.clone()));
            }
        }
    }

    /// 等待所有异步队列消费完当前已入队的事件
    ///
    /// 超时返回 `false`。
    pub async fn flush(&self) -> bool {
        let waits: Vec<oneshot::Receiver<()>> = {
            let listeners = self.inner.async_listeners.read();
            listeners
                .values()
                .filter_map(|entry| {
                    let (tx, rx) = oneshot::channel();
                    entry.queue.send(Delivery::Flush(tx)).ok().map(|_| rx)
                })
                .collect()
        };

        match tokio::time::timeout(self.inner.flush_timeout, join_all(waits)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_ms = self.inner.flush_timeout.as_millis() as u64,
                    "等待异步监听器超时"
                );
                false
            }
        }
    }

    /// `(同步, 异步)` 监听器数量
    pub fn listener_count(&self) -> (usize, usize) {
        (
            self.inner.sync_listeners.read().len(),
            self.inner.async_listeners.read().len(),
        )
    }

    /// 已发布事件总数
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event::ModuleEventKind;
    use crate::module::ModuleId;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<ModuleEventKind>>>, EventCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: EventCallback = Arc::new(move |event: &ModuleEvent| {
            sink.lock().push(event.kind);
        });
        (seen, callback)
    }

    #[tokio::test]
    async fn test_sync_listener_invoked_inline() {
        let bus = EventBus::new();
        let (seen, callback) = recorder();
        bus.subscribe_sync(EventFilter::all(), callback);

        bus.publish(ModuleEvent::new(ModuleEventKind::Starting, ModuleId(1), None));
        assert_eq!(*seen.lock(), vec![ModuleEventKind::Starting]);
    }

    #[tokio::test]
    async fn test_async_listener_skips_synchronous_kinds() {
        let bus = EventBus::new();
        let (seen, callback) = recorder();
        bus.subscribe(EventFilter::all(), callback);

        bus.publish(ModuleEvent::new(ModuleEventKind::Starting, ModuleId(1), None));
        bus.publish(ModuleEvent::new(ModuleEventKind::Started, ModuleId(1), None));
        bus.publish(ModuleEvent::new(ModuleEventKind::Stopped, ModuleId(1), None));
        assert!(bus.flush().await);

        assert_eq!(
            *seen.lock(),
            vec![ModuleEventKind::Started, ModuleEventKind::Stopped]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_queue() {
        let bus = EventBus::new();
        bus.subscribe(EventFilter::all(), Arc::new(|_: &ModuleEvent| panic!("boom")));
        let (seen, callback) = recorder();
        let id = bus.subscribe(EventFilter::all(), callback);

        bus.publish(ModuleEvent::new(ModuleEventKind::Installed, ModuleId(1), None));
        bus.publish(ModuleEvent::new(ModuleEventKind::Resolved, ModuleId(1), None));
        assert!(bus.flush().await);
        assert_eq!(seen.lock().len(), 2);

        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
        assert_eq!(bus.listener_count(), (0, 1));
        assert_eq!(bus.published_count(), 2);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::new();
        let (seen, callback) = recorder();
        bus.subscribe(EventFilter::kinds([ModuleEventKind::Uninstalled]), callback);

        bus.publish(ModuleEvent::new(ModuleEventKind::Installed, ModuleId(1), None));
        bus.publish(ModuleEvent::new(ModuleEventKind::Uninstalled, ModuleId(1), None));
        bus.flush().await;

        assert_eq!(*seen.lock(), vec![ModuleEventKind::Uninstalled]);
    }
}
