//! 事件模块
//!
//! 模块生命周期通知的数据结构和事件总线。

pub mod bus;
#[allow(clippy::module_inception)]
pub mod event;

pub use bus::{EventBus, EventCallback};
pub use event::{EventFilter, ModuleEvent, ModuleEventKind};
