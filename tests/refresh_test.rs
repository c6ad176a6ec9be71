//! 刷新集成测试
//!
//! 覆盖刷新闭包的计算、更新后重新接线、事件顺序、单个模块失败时的错误事件，
//! 以及闭包包含扩展模块时的整体重启。

use async_trait::async_trait;
use chips_runtime::module::ImportSpec;
use chips_runtime::{
    ActivatorContext, CallbackActivator, EventFilter, ModuleActivator, ModuleDescriptor,
    ModuleEventKind, ModuleId, ModuleRuntime, ModuleState, RuntimeConfig, StartOptions,
    StopOptions,
};
use parking_lot::Mutex;
use semver::Version;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn v(major: u64, minor: u64) -> Version {
    Version::new(major, minor, 0)
}

async fn runtime() -> ModuleRuntime {
    let runtime = ModuleRuntime::new(Default::default()).await.unwrap();
    runtime.launch().await.unwrap();
    runtime
}

fn provider(version: Version, content: &str) -> ModuleDescriptor {
    ModuleDescriptor::new("com.example.api", version.clone())
        .export("com.example.api", version)
        .entry("com.example.api.Service", content)
}

fn consumer() -> ModuleDescriptor {
    ModuleDescriptor::new("com.example.consumer", v(1, 0))
        .import(ImportSpec::new("com.example.api"))
}

type Seen = Arc<Mutex<Vec<(ModuleEventKind, ModuleId)>>>;

fn record(runtime: &ModuleRuntime, filter: EventFilter) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    runtime.subscribe_sync(
        filter,
        Arc::new(move |event| sink.lock().push((event.kind, event.module))),
    );
    seen
}

type Errors = Arc<Mutex<Vec<(ModuleId, Option<String>)>>>;

fn record_errors(runtime: &ModuleRuntime) -> Errors {
    let errors: Errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    runtime.subscribe_sync(
        EventFilter::kinds([ModuleEventKind::Error]),
        Arc::new(move |event| sink.lock().push((event.module, event.error_code.clone()))),
    );
    errors
}

/// 启动时停在闸门上，直到测试放行
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

struct GatedActivator(Arc<Gate>);

#[async_trait]
impl ModuleActivator for GatedActivator {
    async fn start(&self, _ctx: &ActivatorContext) -> anyhow::Result<()> {
        self.0.entered.notify_one();
        self.0.release.notified().await;
        Ok(())
    }

    async fn stop(&self, _ctx: &ActivatorContext) -> anyhow::Result<()> {
        Ok(())
    }
}

fn position(seen: &[(ModuleEventKind, ModuleId)], kind: ModuleEventKind, module: ModuleId) -> usize {
    seen.iter()
        .position(|entry| *entry == (kind, module))
        .unwrap_or_else(|| panic!("缺少事件 {:?} {}", kind, module))
}

#[tokio::test]
async fn test_isolated_module_refresh_touches_only_itself() {
    let runtime = runtime().await;
    let x = runtime
        .install("mem:x", ModuleDescriptor::new("com.example.x", v(1, 0)))
        .await
        .unwrap();
    let y = runtime
        .install("mem:y", ModuleDescriptor::new("com.example.y", v(1, 0)))
        .await
        .unwrap();
    runtime.start(x, StartOptions::empty()).await.unwrap();
    runtime.start(y, StartOptions::empty()).await.unwrap();

    assert_eq!(runtime.refresh_closure(&[x]).into_iter().collect::<Vec<_>>(), vec![x]);

    let others = record(&runtime, EventFilter::all().for_module(y));
    let own = record(&runtime, EventFilter::all().for_module(x));
    runtime.refresh_sync(vec![x]).await.unwrap();

    assert!(others.lock().is_empty());
    let own = own.lock().clone();
    assert!(position(&own, ModuleEventKind::Stopped, x) < position(&own, ModuleEventKind::Unresolved, x));
    assert!(position(&own, ModuleEventKind::Resolved, x) < position(&own, ModuleEventKind::Started, x));
    assert!(runtime.module(x).unwrap().is_active());
    assert!(runtime.module(y).unwrap().is_active());
}

#[tokio::test]
async fn test_refresh_after_update_rewires_users() {
    let runtime = runtime().await;
    let api = runtime.install("mem:api", provider(v(1, 0), "v1")).await.unwrap();
    let user = runtime.install("mem:consumer", consumer()).await.unwrap();
    runtime.start(api, StartOptions::empty()).await.unwrap();
    runtime.start(user, StartOptions::empty()).await.unwrap();

    runtime.update(api, provider(v(1, 1), "v2")).await.unwrap();
    let module = runtime.module(api).unwrap();
    assert!(module.is_active());
    assert_eq!(module.version, v(1, 1));
    assert!(module.removal_pending);

    // 刷新前使用者仍看到旧修订
    let found = runtime.load_class(user, "com.example.api.Service").await.unwrap();
    assert_eq!(found.content, b"v1".to_vec());

    let seen = record(&runtime, EventFilter::all());
    runtime.refresh_sync(vec![api]).await.unwrap();

    assert!(runtime.removal_pending().is_empty());
    assert!(runtime.module(api).unwrap().is_active());
    assert!(runtime.module(user).unwrap().is_active());
    let found = runtime.load_class(user, "com.example.api.Service").await.unwrap();
    assert_eq!(found.content, b"v2".to_vec());

    let seen = seen.lock().clone();
    assert!(position(&seen, ModuleEventKind::Unresolved, user) < position(&seen, ModuleEventKind::Resolved, user));
    assert!(position(&seen, ModuleEventKind::Resolved, api) < position(&seen, ModuleEventKind::Started, user));
    // 提供者先于使用者恢复
    assert!(position(&seen, ModuleEventKind::Started, api) < position(&seen, ModuleEventKind::Started, user));
}

#[tokio::test]
async fn test_refresh_resumes_only_previously_running_modules() {
    let runtime = runtime().await;
    let api = runtime.install("mem:api", provider(v(1, 0), "v1")).await.unwrap();
    let user = runtime.install("mem:consumer", consumer()).await.unwrap();
    runtime.start(api, StartOptions::empty()).await.unwrap();
    runtime.start(user, StartOptions::empty()).await.unwrap();
    runtime.stop(user, StopOptions::empty()).await.unwrap();

    runtime.update(api, provider(v(1, 1), "v2")).await.unwrap();
    runtime.refresh(vec![]).unwrap().wait().await.unwrap();

    assert!(runtime.module(api).unwrap().is_active());
    assert_eq!(runtime.module(user).unwrap().state, ModuleState::Resolved);
}

#[tokio::test]
async fn test_refresh_without_pending_revisions_is_noop() {
    let runtime = runtime().await;
    let x = runtime
        .install("mem:x", ModuleDescriptor::new("com.example.x", v(1, 0)))
        .await
        .unwrap();
    runtime.start(x, StartOptions::empty()).await.unwrap();

    let seen = record(&runtime, EventFilter::all());
    runtime.refresh_sync(vec![]).await.unwrap();

    assert!(seen.lock().is_empty());
    assert!(runtime.module(x).unwrap().is_active());
}

#[tokio::test]
async fn test_extension_in_closure_triggers_restart() {
    let runtime = runtime().await;
    let ext = runtime
        .install(
            "mem:ext",
            ModuleDescriptor::new("com.example.ext", v(1, 0)).extension(),
        )
        .await
        .unwrap();
    runtime.start(ext, StartOptions::empty()).await.unwrap();

    let levels = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = levels.clone();
        runtime.subscribe_sync(
            EventFilter::kinds([ModuleEventKind::LevelChanged]),
            Arc::new(move |event| sink.lock().push(event.level)),
        );
    }

    runtime.refresh_sync(vec![ext]).await.unwrap();

    assert_eq!(levels.lock().clone(), vec![Some(0), Some(1)]);
    assert_eq!(runtime.active_level(), 1);
    assert!(runtime.module(ModuleId::SYSTEM).unwrap().is_active());
    assert!(runtime.module(ext).unwrap().is_active());
}

#[tokio::test]
async fn test_failed_stop_hook_does_not_abort_refresh() {
    let runtime = ModuleRuntime::builder()
        .activator(
            "stop-fails",
            CallbackActivator::new(|_| Ok(()), |_| Err(anyhow::anyhow!("stop failed"))),
        )
        .build()
        .await
        .unwrap();
    runtime.launch().await.unwrap();

    let api = runtime.install("mem:api", provider(v(1, 0), "v1")).await.unwrap();
    let user = runtime
        .install("mem:consumer", consumer().activator("stop-fails"))
        .await
        .unwrap();
    runtime.start(api, StartOptions::empty()).await.unwrap();
    runtime.start(user, StartOptions::empty()).await.unwrap();
    runtime.update(api, provider(v(1, 1), "v2")).await.unwrap();

    let errors = record_errors(&runtime);
    let seen = record(&runtime, EventFilter::all());
    runtime.refresh_sync(vec![api]).await.unwrap();

    assert_eq!(
        errors.lock().clone(),
        vec![(user, Some("LIFECYCLE-004".to_string()))]
    );
    let seen = seen.lock().clone();
    assert!(position(&seen, ModuleEventKind::Stopped, user) < position(&seen, ModuleEventKind::Unresolved, user));
    assert!(position(&seen, ModuleEventKind::Resolved, user) < position(&seen, ModuleEventKind::Started, user));

    assert!(runtime.removal_pending().is_empty());
    assert!(runtime.module(api).unwrap().is_active());
    assert!(runtime.module(user).unwrap().is_active());
    let found = runtime.load_class(user, "com.example.api.Service").await.unwrap();
    assert_eq!(found.content, b"v2".to_vec());
}

#[tokio::test]
async fn test_pending_revision_still_in_use_reports_error() {
    let gate = Arc::new(Gate::default());
    let config = RuntimeConfig::builder()
        .state_change_timeout(Duration::from_millis(50))
        .build();
    let runtime = ModuleRuntime::builder()
        .config(config)
        .activator("gated", GatedActivator(gate.clone()))
        .build()
        .await
        .unwrap();
    runtime.launch().await.unwrap();

    let api = runtime.install("mem:api", provider(v(1, 0), "v1")).await.unwrap();
    let user = runtime
        .install("mem:consumer", consumer().activator("gated"))
        .await
        .unwrap();
    assert!(runtime.resolve(&[]).await.unwrap());
    runtime.update(api, provider(v(1, 1), "v2")).await.unwrap();
    assert_eq!(runtime.removal_pending(), vec![api]);

    // 使用者的启动卡在激活钩子里，刷新无法锁定它
    let starter = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.start(user, StartOptions::empty()).await })
    };
    gate.entered.notified().await;

    let errors = record_errors(&runtime);
    runtime.refresh_sync(vec![api]).await.unwrap();

    let errors = errors.lock().clone();
    assert!(errors.contains(&(user, Some("LIFECYCLE-001".to_string()))));
    assert!(errors.contains(&(api, Some("REFRESH-001".to_string()))));
    assert_eq!(runtime.removal_pending(), vec![api]);

    gate.release.notify_one();
    starter.await.unwrap().unwrap();
    let found = runtime.load_class(user, "com.example.api.Service").await.unwrap();
    assert_eq!(found.content, b"v1".to_vec());
}

#[tokio::test]
async fn test_unresolved_events_precede_resolved_events() {
    let runtime = runtime().await;
    let api = runtime.install("mem:api", provider(v(1, 0), "v1")).await.unwrap();
    let user = runtime.install("mem:consumer", consumer()).await.unwrap();
    assert!(runtime.resolve(&[]).await.unwrap());
    runtime.update(api, provider(v(1, 1), "v2")).await.unwrap();

    let seen = record(
        &runtime,
        EventFilter::kinds([ModuleEventKind::Unresolved, ModuleEventKind::Resolved]),
    );
    runtime.refresh_sync(vec![api]).await.unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 4);
    for module in [api, user] {
        let count = |kind: ModuleEventKind| seen.iter().filter(|entry| **entry == (kind, module)).count();
        assert_eq!(count(ModuleEventKind::Unresolved), 1);
        assert_eq!(count(ModuleEventKind::Resolved), 1);
    }
    let last_unresolved = seen
        .iter()
        .rposition(|(kind, _)| *kind == ModuleEventKind::Unresolved)
        .unwrap();
    let first_resolved = seen
        .iter()
        .position(|(kind, _)| *kind == ModuleEventKind::Resolved)
        .unwrap();
    assert!(last_unresolved < first_resolved);
    assert_eq!(runtime.module(user).unwrap().state, ModuleState::Resolved);
}
