//! 运行时配置
//!
//! 定义运行时的配置结构、文件加载、环境变量覆盖和校验逻辑。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::{Result, RuntimeError};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "CHIPS_RUNTIME_";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
        }
    }
}

/// 系统模块导出的包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPackage {
    /// 包名
    pub name: String,

    /// 包版本
    #[serde(default = "default_package_version")]
    pub version: semver::Version,
}

fn default_package_version() -> semver::Version {
    semver::Version::new(0, 0, 0)
}

impl SystemPackage {
    pub fn new(name: impl Into<String>, version: semver::Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// 模块系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 新安装模块的启动级别
    #[serde(default = "default_initial_module_level")]
    pub initial_module_level: u32,

    /// 启动完成时的目标活动级别
    #[serde(default = "default_beginning_level")]
    pub beginning_level: u32,

    /// 状态变更锁等待上限（毫秒）
    #[serde(default = "default_state_change_timeout_ms")]
    pub state_change_timeout_ms: u64,

    /// 是否允许相同符号名 + 版本的模块重复安装
    #[serde(default)]
    pub allow_duplicate_names: bool,

    /// 启动委派包（直接委派给系统模块），支持 `*` 与 `a.b.*`
    #[serde(default)]
    pub boot_delegation: Vec<String>,

    /// 系统模块导出的包
    #[serde(default)]
    pub system_packages: Vec<SystemPackage>,

    /// 启动器扫描的模块描述目录
    #[serde(default)]
    pub descriptor_dirs: Vec<PathBuf>,

    /// 启动后自动启动的模块（符号名）
    #[serde(default)]
    pub auto_start: Vec<String>,
}

fn default_initial_module_level() -> u32 {
    1
}

fn default_beginning_level() -> u32 {
    1
}

fn default_state_change_timeout_ms() -> u64 {
    5000
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            initial_module_level: default_initial_module_level(),
            beginning_level: default_beginning_level(),
            state_change_timeout_ms: default_state_change_timeout_ms(),
            allow_duplicate_names: false,
            boot_delegation: vec![],
            system_packages: vec![],
            descriptor_dirs: vec![],
            auto_start: vec![],
        }
    }
}

impl ModuleConfig {
    /// 状态变更超时
    pub fn state_change_timeout(&self) -> Duration {
        Duration::from_millis(self.state_change_timeout_ms)
    }
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 等待异步监听队列排空的上限（毫秒）
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

fn default_flush_timeout_ms() -> u64 {
    5000
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 模块系统配置
    #[serde(default)]
    pub modules: ModuleConfig,

    /// 事件配置
    #[serde(default)]
    pub events: EventConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,

    /// 数据目录（持久化模块记录）；未设置时只保存在内存中
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置（`.json` 按 JSON 解析，其余按 YAML）
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            RuntimeError::ConfigLoadFailed(format!("读取 {} 失败: {}", path.display(), e))
        })?;

        let mut config = Self::parse(&content, path.extension().map(|e| e == "json").unwrap_or(false))?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 从字符串解析配置
    pub fn parse(content: &str, json: bool) -> Result<Self> {
        let config: RuntimeConfig = if json {
            serde_json::from_str(content)?
        } else {
            serde_yaml::from_str(content)?
        };
        Ok(config)
    }

    /// 合并另一个配置（非默认值覆盖）
    pub fn merge(&mut self, other: RuntimeConfig) {
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.modules.initial_module_level != default_initial_module_level() {
            self.modules.initial_module_level = other.modules.initial_module_level;
        }
        if other.modules.beginning_level != default_beginning_level() {
            self.modules.beginning_level = other.modules.beginning_level;
        }
        if other.modules.state_change_timeout_ms != default_state_change_timeout_ms() {
            self.modules.state_change_timeout_ms = other.modules.state_change_timeout_ms;
        }
        if other.modules.allow_duplicate_names {
            self.modules.allow_duplicate_names = true;
        }
        self.modules.boot_delegation.extend(other.modules.boot_delegation);
        self.modules.system_packages.extend(other.modules.system_packages);
        self.modules.descriptor_dirs.extend(other.modules.descriptor_dirs);
        self.modules.auto_start.extend(other.modules.auto_start);
        if other.dev_mode {
            self.dev_mode = true;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
    }

    /// 应用环境变量覆盖
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(std::env::vars())
    }

    /// 应用给定的键值对覆盖（键带 [`ENV_PREFIX`] 前缀）
    pub fn apply_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "INITIAL_MODULE_LEVEL" => {
                    self.modules.initial_module_level = parse_value(&key, &value)?;
                }
                "BEGINNING_LEVEL" => {
                    self.modules.beginning_level = parse_value(&key, &value)?;
                }
                "STATE_CHANGE_TIMEOUT_MS" => {
                    self.modules.state_change_timeout_ms = parse_value(&key, &value)?;
                }
                "ALLOW_DUPLICATE_NAMES" => {
                    self.modules.allow_duplicate_names = parse_value(&key, &value)?;
                }
                "LOG_LEVEL" => self.logging.level = value,
                "DATA_DIR" => self.data_dir = Some(PathBuf::from(value)),
                _ => {
                    tracing::debug!(key = %key, "忽略未知的环境变量");
                }
            }
        }
        Ok(())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.modules.state_change_timeout_ms == 0 {
            return Err(RuntimeError::InvalidConfigValue {
                key: "modules.state_change_timeout_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.modules.beginning_level == 0 {
            return Err(RuntimeError::InvalidConfigValue {
                key: "modules.beginning_level".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.modules.initial_module_level == 0 {
            return Err(RuntimeError::InvalidConfigValue {
                key: "modules.initial_module_level".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| RuntimeError::InvalidConfigValue {
        key: key.to_string(),
        reason: format!("无法解析 '{}'", value),
    })
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 新安装模块的启动级别
    pub fn initial_module_level(mut self, level: u32) -> Self {
        self.config.modules.initial_module_level = level;
        self
    }

    /// 启动完成时的目标级别
    pub fn beginning_level(mut self, level: u32) -> Self {
        self.config.modules.beginning_level = level;
        self
    }

    /// 状态变更等待上限
    pub fn state_change_timeout(mut self, timeout: Duration) -> Self {
        self.config.modules.state_change_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 允许重复的符号名 + 版本
    pub fn allow_duplicate_names(mut self, allow: bool) -> Self {
        self.config.modules.allow_duplicate_names = allow;
        self
    }

    /// 添加启动委派模式
    pub fn boot_delegation(mut self, pattern: impl Into<String>) -> Self {
        self.config.modules.boot_delegation.push(pattern.into());
        self
    }

    /// 添加系统导出包
    pub fn system_package(mut self, name: impl Into<String>, version: semver::Version) -> Self {
        self.config
            .modules
            .system_packages
            .push(SystemPackage::new(name, version));
        self
    }

    /// 添加描述目录
    pub fn descriptor_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.modules.descriptor_dirs.push(dir.into());
        self
    }

    /// 设置数据目录
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
