//! 配置与描述目录集成测试
//!
//! 测试配置文件加载、合并、环境覆盖，以及配置对运行时行为的影响。

use chips_runtime::module::{discover_descriptors, ImportSpec};
use chips_runtime::{ModuleDescriptor, ModuleRuntime, RuntimeConfig, RuntimeError};
use semver::Version;
use std::time::Duration;
use tempfile::TempDir;

/// 测试从 YAML 文件加载完整配置
#[tokio::test]
async fn test_load_yaml_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.yaml");
    tokio::fs::write(
        &path,
        r#"
logging:
  level: debug
modules:
  initial_module_level: 3
  beginning_level: 5
  state_change_timeout_ms: 250
  boot_delegation:
    - "com.example.boot.*"
  system_packages:
    - name: com.example.host
      version: 2.1.0
  auto_start:
    - com.example.app
events:
  flush_timeout_ms: 100
dev_mode: true
"#,
    )
    .await
    .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();
    assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.modules.initial_module_level, 3);
    assert_eq!(config.modules.beginning_level, 5);
    assert_eq!(config.modules.state_change_timeout(), Duration::from_millis(250));
    assert_eq!(config.modules.boot_delegation, vec!["com.example.boot.*"]);
    assert_eq!(config.modules.system_packages[0].version, Version::new(2, 1, 0));
    assert_eq!(config.modules.auto_start, vec!["com.example.app"]);
    assert_eq!(config.events.flush_timeout_ms, 100);
    assert!(config.dev_mode);
    config.validate().unwrap();
}

/// 测试 JSON 配置按扩展名解析，缺省字段取默认值
#[tokio::test]
async fn test_load_json_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.json");
    tokio::fs::write(&path, r#"{ "modules": { "beginning_level": 4 } }"#)
        .await
        .unwrap();

    let config = RuntimeConfig::from_file(&path).await.unwrap();
    assert_eq!(config.modules.beginning_level, 4);
    assert_eq!(config.modules.initial_module_level, 1);
    assert_eq!(config.modules.state_change_timeout_ms, 5000);
    assert_eq!(config.logging.level, "info");
}

#[tokio::test]
async fn test_missing_config_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let result = RuntimeConfig::from_file(temp_dir.path().join("absent.yaml")).await;
    assert!(matches!(result, Err(RuntimeError::ConfigLoadFailed(_))));
}

/// 测试文件配置、覆盖配置和环境变量的叠加
#[test]
fn test_layered_configuration() {
    let mut config = RuntimeConfig::parse(
        r#"
modules:
  beginning_level: 2
  descriptor_dirs: ["/opt/modules"]
"#,
        false,
    )
    .unwrap();

    let overlay = RuntimeConfig::parse(
        r#"
logging:
  level: warn
modules:
  descriptor_dirs: ["/srv/modules"]
"#,
        false,
    )
    .unwrap();
    config.merge(overlay);

    config
        .apply_vars(vec![
            ("CHIPS_RUNTIME_STATE_CHANGE_TIMEOUT_MS".to_string(), "750".to_string()),
            ("CHIPS_RUNTIME_ALLOW_DUPLICATE_NAMES".to_string(), "true".to_string()),
            ("UNRELATED".to_string(), "ignored".to_string()),
        ])
        .unwrap();

    assert_eq!(config.modules.beginning_level, 2);
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.modules.descriptor_dirs.len(), 2);
    assert_eq!(config.modules.state_change_timeout_ms, 750);
    assert!(config.modules.allow_duplicate_names);
}

#[test]
fn test_invalid_overrides_rejected() {
    let mut config = RuntimeConfig::default();
    let err = config
        .apply_vars(vec![(
            "CHIPS_RUNTIME_BEGINNING_LEVEL".to_string(),
            "high".to_string(),
        )])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidConfigValue { .. }));

    config.modules.beginning_level = 0;
    assert!(config.validate().is_err());
}

/// 测试配置中的系统包由系统模块导出
#[tokio::test]
async fn test_system_packages_exported_by_system_module() {
    let config = RuntimeConfig::builder()
        .system_package("com.example.host", Version::new(2, 0, 0))
        .build();
    let runtime = ModuleRuntime::new(config).await.unwrap();
    runtime.launch().await.unwrap();

    let id = runtime
        .install(
            "mem:client",
            ModuleDescriptor::new("com.example.client", Version::new(1, 0, 0))
                .import(ImportSpec::new("com.example.host")),
        )
        .await
        .unwrap();
    assert!(runtime.resolve(&[id]).await.unwrap());
    assert_eq!(
        runtime.dependents(chips_runtime::ModuleId::SYSTEM),
        vec![id]
    );
}

/// 测试允许重复标识的配置
#[tokio::test]
async fn test_allow_duplicate_names() {
    let config = RuntimeConfig::builder().allow_duplicate_names(true).build();
    let runtime = ModuleRuntime::new(config).await.unwrap();

    let descriptor = ModuleDescriptor::new("com.example.twin", Version::new(1, 0, 0));
    let first = runtime.install("mem:one", descriptor.clone()).await.unwrap();
    let second = runtime.install("mem:two", descriptor).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(runtime.find_by_symbolic_name("com.example.twin").len(), 2);
}

/// 测试描述目录扫描：按文件名排序，跳过无效文件
#[tokio::test]
async fn test_discover_descriptors_from_directory() {
    let temp_dir = TempDir::new().unwrap();
    tokio::fs::write(
        temp_dir.path().join("b.yaml"),
        "symbolic_name: com.example.b\nversion: 1.0.0\nimports:\n  - name: com.example.a\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        temp_dir.path().join("a.json"),
        r#"{ "symbolic_name": "com.example.a", "version": "1.0.0",
             "exports": [{ "name": "com.example.a", "version": "1.0.0" }] }"#,
    )
    .await
    .unwrap();
    tokio::fs::write(temp_dir.path().join("broken.yaml"), "symbolic_name: [")
        .await
        .unwrap();
    tokio::fs::write(temp_dir.path().join("notes.txt"), "ignored")
        .await
        .unwrap();

    let config = RuntimeConfig::builder().descriptor_dir(temp_dir.path()).build();
    let found = discover_descriptors(&config.modules.descriptor_dirs).await;
    let names: Vec<_> = found
        .iter()
        .map(|(_, d)| d.symbolic_name.clone().unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["com.example.a", "com.example.b"]);
    assert!(found[0].0.starts_with("file:"));

    let runtime = ModuleRuntime::new(config).await.unwrap();
    for (location, descriptor) in found {
        runtime.install(&location, descriptor).await.unwrap();
    }
    assert!(runtime.resolve(&[]).await.unwrap());
}
