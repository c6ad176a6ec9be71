//! API 模块
//!
//! 对外提供的运行时门面。
//!
//! - `runtime`: [`ModuleRuntime`] 及其构建器，提供模块的安装、解析、启停、更新、卸载、
//!   刷新和启动级别调整

pub mod runtime;

pub use runtime::{ModuleRuntime, ModuleRuntimeBuilder};
