//! 状态变更锁
//!
//! 每个模块记录持有一把状态变更锁。锁的所有者是一个执行者（[`ActorId`]），
//! 而不是线程：同一执行者在激活钩子或同步监听器中重入同一模块的状态变更时立即失败，
//! 其他执行者则有界等待。
//!
//! 执行者身份保存在 tokio 任务本地变量中。运行时的每个入口都在执行者作用域内运行
//! （见 [`in_actor_scope`]）；派发到批量工作者或异步监听器的工作使用新的执行者。

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::module::metadata::ModuleId;
use crate::utils::{Result, RuntimeError};

/// 默认的状态变更等待上限
pub const DEFAULT_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ACTOR: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_ACTOR: ActorId;
}

/// 执行者身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId(u64);

impl ActorId {
    /// 分配新的执行者身份
    pub fn fresh() -> Self {
        ActorId(NEXT_ACTOR.fetch_add(1, Ordering::Relaxed))
    }

    /// 当前任务所在的执行者
    pub fn current() -> Option<Self> {
        CURRENT_ACTOR.try_with(|actor| *actor).ok()
    }

    /// 当前执行者；不在作用域内时分配一个新的一次性身份
    pub fn current_or_fresh() -> Self {
        Self::current().unwrap_or_else(Self::fresh)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor-{}", self.0)
    }
}

/// 在执行者作用域内运行：已在作用域内则沿用，否则分配新的执行者
pub async fn in_actor_scope<F: Future>(future: F) -> F::Output {
    match ActorId::current() {
        Some(_) => future.await,
        None => CURRENT_ACTOR.scope(ActorId::fresh(), future).await,
    }
}

/// 在新的执行者作用域内运行
pub async fn with_fresh_actor<F: Future>(future: F) -> F::Output {
    scoped_actor(ActorId::fresh(), future).await
}

/// 以指定执行者身份运行
pub async fn scoped_actor<F: Future>(actor: ActorId, future: F) -> F::Output {
    CURRENT_ACTOR.scope(actor, future).await
}

/// 模块状态变更锁
#[derive(Debug, Default)]
pub struct StateChangeLock {
    owner: Mutex<Option<ActorId>>,
    released: Notify,
}

impl StateChangeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前所有者
    pub fn owner(&self) -> Option<ActorId> {
        *self.owner.lock()
    }

    /// 是否被任何执行者持有
    pub fn is_held(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// 尝试立即获取
    ///
    /// 同一执行者重入返回 `SelfStateChangeRecursion`；被其他执行者持有时返回 `Ok(false)`。
    pub fn try_begin(&self, module: ModuleId, actor: ActorId) -> Result<bool> {
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(actor);
                Ok(true)
            }
            Some(current) if current == actor => {
                Err(RuntimeError::SelfStateChangeRecursion(module))
            }
            Some(_) => Ok(false),
        }
    }

    /// 获取锁，被其他执行者持有时最多等待 `timeout`
    ///
    /// 同一执行者重入立即失败，不等待。
    pub async fn begin(&self, module: ModuleId, actor: ActorId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_begin(module, actor)? {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                // 超时后最后检查一次：所有者可能恰好在此刻释放
                if self.try_begin(module, actor)? {
                    return Ok(());
                }
                return Err(RuntimeError::StateChangeTimeout {
                    module,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// 释放锁并唤醒一个等待者
    ///
    /// 只有当前所有者的释放生效。
    pub fn complete(&self, actor: ActorId) {
        let mut owner = self.owner.lock();
        if *owner == Some(actor) {
            *owner = None;
            drop(owner);
            self.released.notify_one();
        } else {
            tracing::warn!(
                actor = %actor,
                owner = ?*owner,
                "非所有者尝试释放状态变更锁"
            );
        }
    }
}

/// 已持有的状态变更锁，丢弃时释放
#[derive(Debug)]
pub struct StateChangeGuard {
    lock: Arc<StateChangeLock>,
    module: ModuleId,
    actor: ActorId,
}

impl StateChangeGuard {
    /// 获取锁（有界等待）
    pub async fn acquire(
        lock: Arc<StateChangeLock>,
        module: ModuleId,
        actor: ActorId,
        timeout: Duration,
    ) -> Result<Self> {
        lock.begin(module, actor, timeout).await?;
        Ok(Self { lock, module, actor })
    }

    /// 立即尝试获取，不等待
    ///
    /// 被其他执行者持有时返回 `Ok(None)`；同一执行者已持有时返回 `SelfStateChangeRecursion`。
    pub fn try_acquire(
        lock: Arc<StateChangeLock>,
        module: ModuleId,
        actor: ActorId,
    ) -> Result<Option<Self>> {
        if lock.try_begin(module, actor)? {
            Ok(Some(Self { lock, module, actor }))
        } else {
            Ok(None)
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }
}

impl Drop for StateChangeGuard {
    fn drop(&mut self) {
        self.lock.complete(self.actor);
    }
}
