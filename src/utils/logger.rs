//! 日志系统模块
//!
//! 基于 tracing 生态初始化运行时日志：
//!
//! - 多级别日志，`RUST_LOG` 优先于配置级别
//! - 控制台输出（可选 JSON 格式）
//! - 文件输出（非阻塞写入，按时间轮转）
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::utils::logger::{Logger, LoggerConfig};
//!
//! let _guard = Logger::init(LoggerConfig::default()).unwrap();
//! tracing::info!(module_id = 3, "模块已启动");
//! ```

use crate::utils::{Result, RuntimeError};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从配置字符串解析，未知值回落到每天轮转
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别
    pub level: String,
    /// 是否使用 JSON 格式
    pub json_format: bool,
    /// 是否输出到控制台
    pub console_output: bool,
    /// 文件输出目录
    pub file_output: Option<PathBuf>,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 轮转策略
    pub rotation: RotationStrategy,
    /// 是否显示目标模块
    pub show_target: bool,
    /// 是否显示线程 ID
    pub show_thread_ids: bool,
    /// 是否启用 ANSI 颜色
    pub ansi_colors: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "chips-runtime".to_string(),
            rotation: RotationStrategy::Daily,
            show_target: true,
            show_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LoggerConfig {
    /// 从运行时配置的 `logging` 段创建
    pub fn from_log_config(log_config: &crate::core::config::LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            ..Default::default()
        }
    }

    /// 设置日志级别
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }
}

/// 日志系统守卫
///
/// 丢弃时等待挂起的日志写入完成。
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

impl LogGuard {
    fn empty() -> Self {
        Self { _guards: Vec::new() }
    }
}

static LOGGER_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化日志系统
    ///
    /// 返回的 [`LogGuard`] 必须保持到程序退出。重复初始化返回错误。
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(RuntimeError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
        let mut guard = LogGuard::empty();

        let console = if config.console_output {
            let (writer, g) = tracing_appender::non_blocking(io::stdout());
            guard._guards.push(g);
            Some(writer)
        } else {
            None
        };
        let file = config.file_output.as_ref().map(|dir| {
            let appender = RollingFileAppender::new(
                config.rotation.to_rotation(),
                dir,
                format!("{}.log", config.file_prefix),
            );
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard._guards.push(g);
            writer
        });

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = if config.json_format {
            registry
                .with(console.map(|w| {
                    fmt::layer()
                        .json()
                        .with_writer(w)
                        .with_target(config.show_target)
                        .with_thread_ids(config.show_thread_ids)
                }))
                .with(file.map(|w| {
                    fmt::layer()
                        .json()
                        .with_writer(w)
                        .with_target(config.show_target)
                }))
                .try_init()
        } else {
            registry
                .with(console.map(|w| {
                    fmt::layer()
                        .with_writer(w)
                        .with_target(config.show_target)
                        .with_thread_ids(config.show_thread_ids)
                        .with_ansi(config.ansi_colors)
                }))
                .with(file.map(|w| {
                    fmt::layer()
                        .with_writer(w)
                        .with_target(config.show_target)
                        .with_ansi(false)
                }))
                .try_init()
        };
        result.map_err(|e| RuntimeError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(true);
        Ok(guard)
    }

    /// 尝试初始化；已初始化时返回空守卫
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_else(|_| LogGuard::empty())
    }
}
