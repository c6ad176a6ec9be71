//! # Chips Runtime - 薯片动态模块运行时
//!
//! 一个宿主进程，可以在不重启的情况下安装、解析、启动、停止、更新和卸载自描述的模块：
//!
//! - **生命周期状态机**: 每个模块一把状态变更锁，有界等待，同一执行者重入立即失败
//! - **加载委派**: 按导入、动态导入、依赖模块和本地代码的顺序查找条目
//! - **刷新**: 更新或卸载后，受影响的模块整体暂停、重新解析、按序恢复
//! - **启动级别**: 逐级恢复和暂停模块，所有批量操作由一个工作者按序执行
//! - **生命周期事件**: 同步监听器内联接收，异步监听器各自排队
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_runtime::{ModuleDescriptor, ModuleRuntime, RuntimeConfig, StartOptions};
//! use semver::Version;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ModuleRuntime::new(RuntimeConfig::default()).await?;
//!     runtime.launch().await?;
//!
//!     let api = ModuleDescriptor::new("com.example.api", Version::new(1, 0, 0))
//!         .export("com.example.api", Version::new(1, 0, 0));
//!     let id = runtime.install("mem:api", api).await?;
//!     runtime.start(id, StartOptions::empty()).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 模块系统：描述、注册表、解析、生命周期、刷新、启动级别
//! - `event` - 生命周期事件与事件总线
//! - `api` - 运行时门面
//! - `core` - 运行时配置
//! - `utils` - 错误类型、ID 生成、日志

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod event;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{ModuleRuntime, ModuleRuntimeBuilder};

pub use event::{EventBus, EventCallback, EventFilter, ModuleEvent, ModuleEventKind};

pub use module::{
    ActivatorContext, BasicResolver, CallbackActivator, CodeLoader, FoundEntry, JobHandle,
    MemoryCodeLoader, ModuleActivator, ModuleDescriptor, ModuleId, ModuleKind, ModuleParser,
    ModuleSnapshot, ModuleState, PersistentStatus, Resolver, ServiceDirectory, StartOptions,
    StopOptions,
};

pub use utils::{error_code, generate_id, generate_uuid, Result, RuntimeError};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, RotationStrategy};

pub use core::config::{
    EventConfig, LogConfig, ModuleConfig, RuntimeConfig, RuntimeConfigBuilder, SystemPackage,
};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
