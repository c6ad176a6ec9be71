//! 启动级别集成测试
//!
//! 覆盖逐级恢复与暂停的顺序、惰性模块优先、模块级别调整和有序关闭。

use chips_runtime::module::ImportSpec;
use chips_runtime::{
    EventFilter, ModuleDescriptor, ModuleEventKind, ModuleId, ModuleRuntime, ModuleState,
    PersistentStatus, RuntimeConfig, RuntimeError, StartOptions,
};
use parking_lot::Mutex;
use semver::Version;
use std::sync::Arc;

fn v(major: u64, minor: u64) -> Version {
    Version::new(major, minor, 0)
}

async fn runtime_with_beginning_level(level: u32) -> ModuleRuntime {
    let config = RuntimeConfig::builder().beginning_level(level).build();
    ModuleRuntime::new(config).await.unwrap()
}

type Seen = Arc<Mutex<Vec<(ModuleEventKind, ModuleId)>>>;

fn record(runtime: &ModuleRuntime, kinds: impl IntoIterator<Item = ModuleEventKind>) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    runtime.subscribe_sync(
        EventFilter::kinds(kinds),
        Arc::new(move |event| sink.lock().push((event.kind, event.module))),
    );
    seen
}

fn position(seen: &[(ModuleEventKind, ModuleId)], kind: ModuleEventKind, module: ModuleId) -> usize {
    seen.iter()
        .position(|entry| *entry == (kind, module))
        .unwrap_or_else(|| panic!("缺少事件 {:?} {}", kind, module))
}

#[tokio::test]
async fn test_lower_level_active_before_higher_level_starts() {
    let runtime = runtime_with_beginning_level(2).await;

    let x = runtime
        .install(
            "mem:x",
            ModuleDescriptor::new("com.example.x", v(1, 0)).export("com.example.x", v(1, 0)),
        )
        .await
        .unwrap();
    runtime.set_initial_module_level(2).await.unwrap();
    let y = runtime
        .install(
            "mem:y",
            ModuleDescriptor::new("com.example.y", v(1, 0)).import(ImportSpec::new("com.example.x")),
        )
        .await
        .unwrap();
    assert_eq!(runtime.module_level(x).unwrap(), 1);
    assert_eq!(runtime.module_level(y).unwrap(), 2);

    // 启动前只记录持久启动标志
    runtime.start(y, StartOptions::empty()).await.unwrap();
    runtime.start(x, StartOptions::empty()).await.unwrap();
    assert!(!runtime.module(x).unwrap().is_active());

    let seen = record(
        &runtime,
        [ModuleEventKind::Starting, ModuleEventKind::Started, ModuleEventKind::LevelChanged],
    );
    runtime.launch().await.unwrap();

    let seen = seen.lock().clone();
    assert!(position(&seen, ModuleEventKind::Started, x) < position(&seen, ModuleEventKind::Starting, y));
    assert_eq!(seen.last(), Some(&(ModuleEventKind::LevelChanged, ModuleId::SYSTEM)));
    assert_eq!(runtime.active_level(), 2);
    assert!(runtime.module(x).unwrap().is_active());
    assert!(runtime.module(y).unwrap().is_active());
}

#[tokio::test]
async fn test_lazy_modules_resume_before_eager_ones() {
    let runtime = runtime_with_beginning_level(1).await;
    let eager = runtime
        .install("mem:eager", ModuleDescriptor::new("com.example.eager", v(1, 0)))
        .await
        .unwrap();
    let lazy = runtime
        .install(
            "mem:lazy",
            ModuleDescriptor::new("com.example.lazy", v(1, 0)).lazy(),
        )
        .await
        .unwrap();
    runtime.start(eager, StartOptions::empty()).await.unwrap();
    runtime
        .start(lazy, StartOptions::USE_ACTIVATION_POLICY)
        .await
        .unwrap();

    let seen = record(
        &runtime,
        [ModuleEventKind::Starting, ModuleEventKind::LazyActivation],
    );
    runtime.launch().await.unwrap();

    let seen = seen.lock().clone();
    assert!(
        position(&seen, ModuleEventKind::LazyActivation, lazy)
            < position(&seen, ModuleEventKind::Starting, eager)
    );
    assert_eq!(runtime.module(lazy).unwrap().state, ModuleState::Starting);
    assert!(runtime.module(eager).unwrap().is_active());
}

#[tokio::test]
async fn test_lowering_level_stops_in_descending_id_order() {
    let runtime = runtime_with_beginning_level(2).await;
    runtime.set_initial_module_level(2).await.unwrap();

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        let id = runtime
            .install(
                &format!("mem:{name}"),
                ModuleDescriptor::new(format!("com.example.{name}"), v(1, 0)),
            )
            .await
            .unwrap();
        runtime.start(id, StartOptions::empty()).await.unwrap();
        ids.push(id);
    }
    runtime.launch().await.unwrap();
    assert!(ids.iter().all(|id| runtime.module(*id).unwrap().is_active()));

    let seen = record(&runtime, [ModuleEventKind::Stopping]);
    runtime.set_active_level(1).unwrap().wait().await.unwrap();

    let stopped: Vec<ModuleId> = seen.lock().iter().map(|(_, id)| *id).collect();
    assert_eq!(stopped, vec![ids[2], ids[1], ids[0]]);
    for id in &ids {
        let module = runtime.module(*id).unwrap();
        assert_eq!(module.state, ModuleState::Resolved);
        assert!(module.persistent_status.contains(PersistentStatus::STARTED));
    }

    runtime.set_active_level(2).unwrap().wait().await.unwrap();
    assert!(ids.iter().all(|id| runtime.module(*id).unwrap().is_active()));
}

#[tokio::test]
async fn test_level_requests_apply_in_submission_order() {
    let runtime = runtime_with_beginning_level(1).await;
    runtime.launch().await.unwrap();

    let levels = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = levels.clone();
        runtime.subscribe_sync(
            EventFilter::kinds([ModuleEventKind::LevelChanged]),
            Arc::new(move |event| sink.lock().push(event.level)),
        );
    }

    let up = runtime.set_active_level(3).unwrap();
    let down = runtime.set_active_level(2).unwrap();
    up.wait().await.unwrap();
    down.wait().await.unwrap();

    assert_eq!(levels.lock().clone(), vec![Some(3), Some(2)]);
    assert_eq!(runtime.active_level(), 2);
}

#[tokio::test]
async fn test_module_level_change_suspends_and_resumes() {
    let runtime = runtime_with_beginning_level(1).await;
    runtime.launch().await.unwrap();
    let id = runtime
        .install("mem:m", ModuleDescriptor::new("com.example.m", v(1, 0)))
        .await
        .unwrap();
    runtime.start(id, StartOptions::empty()).await.unwrap();

    runtime.set_module_level(id, 3).unwrap().wait().await.unwrap();
    let module = runtime.module(id).unwrap();
    assert_eq!(module.start_level, 3);
    assert_eq!(module.state, ModuleState::Resolved);
    assert!(module.persistent_status.contains(PersistentStatus::STARTED));

    runtime.set_module_level(id, 1).unwrap().wait().await.unwrap();
    assert!(runtime.module(id).unwrap().is_active());
}

#[tokio::test]
async fn test_invalid_level_requests_rejected() {
    let runtime = runtime_with_beginning_level(1).await;
    runtime.launch().await.unwrap();
    let id = runtime
        .install("mem:m", ModuleDescriptor::new("com.example.m", v(1, 0)))
        .await
        .unwrap();

    assert!(matches!(
        runtime.set_active_level(0),
        Err(RuntimeError::InvalidStartLevel(0))
    ));
    assert!(matches!(
        runtime.set_module_level(id, 0),
        Err(RuntimeError::InvalidStartLevel(0))
    ));
    assert!(matches!(
        runtime.set_module_level(ModuleId(999), 2),
        Err(RuntimeError::ModuleNotFound(_))
    ));
    assert!(matches!(
        runtime.set_initial_module_level(0).await,
        Err(RuntimeError::InvalidStartLevel(0))
    ));
}

#[tokio::test]
async fn test_shutdown_unwires_everything() {
    let runtime = runtime_with_beginning_level(1).await;
    runtime.launch().await.unwrap();
    let id = runtime
        .install("mem:m", ModuleDescriptor::new("com.example.m", v(1, 0)))
        .await
        .unwrap();
    runtime.start(id, StartOptions::empty()).await.unwrap();

    let levels = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = levels.clone();
        runtime.subscribe_sync(
            EventFilter::kinds([ModuleEventKind::LevelChanged]),
            Arc::new(move |event| sink.lock().push(event.level)),
        );
    }

    runtime.shutdown().await.unwrap();

    assert_eq!(levels.lock().clone(), vec![Some(0)]);
    assert_eq!(runtime.active_level(), 0);
    assert_eq!(runtime.module(id).unwrap().state, ModuleState::Installed);
    assert_eq!(
        runtime.module(ModuleId::SYSTEM).unwrap().state,
        ModuleState::Installed
    );
    assert!(runtime
        .module(id)
        .unwrap()
        .persistent_status
        .contains(PersistentStatus::STARTED));

    // 再次关闭是空操作，批量请求被拒绝
    runtime.shutdown().await.unwrap();
    assert!(matches!(
        runtime.set_active_level(1),
        Err(RuntimeError::WorkerClosed)
    ));
}

#[tokio::test]
async fn test_restart_returns_to_current_level() {
    let runtime = runtime_with_beginning_level(2).await;
    runtime.launch().await.unwrap();
    let id = runtime
        .install("mem:m", ModuleDescriptor::new("com.example.m", v(1, 0)))
        .await
        .unwrap();
    runtime.start(id, StartOptions::empty()).await.unwrap();

    runtime.restart().await.unwrap();

    assert_eq!(runtime.active_level(), 2);
    assert!(runtime.module(id).unwrap().is_active());
    assert!(runtime.module(ModuleId::SYSTEM).unwrap().is_active());
}
