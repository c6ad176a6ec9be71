//! 模块管理模块
//!
//! 包含模块系统的核心组件：
//! - 模块描述、状态机和持久状态
//! - 注册表、修订与加载委派
//! - 解析、生命周期、刷新和启动级别调度
//! - 外部协作者接口（解析器、代码加载器、激活钩子、服务目录）

pub mod delegate;
pub mod dependency;
pub mod lifecycle;
pub mod manager;
pub mod metadata;
pub mod parser;
pub mod record;
pub mod refresh;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod start_level;
pub mod state_lock;
pub mod storage;
pub mod wiring;
pub mod worker;

// 重导出常用类型
pub use delegate::{FoundEntry, LoadDelegate};
pub use dependency::DependencyGraph;
pub use manager::{ModuleManager, SYSTEM_LOCATION, SYSTEM_SYMBOLIC_NAME};
pub use metadata::{
    ExportSpec, HostSpec, ImportSpec, ModuleDescriptor, ModuleId, ModuleKind, ModuleSnapshot,
    ModuleState, PersistentStatus, RequireSpec, StartOptions, StopOptions,
};
pub use parser::ModuleParser;
pub use record::{ModuleRecord, Revision};
pub use registry::{discover_descriptors, ModuleRegistry};
pub use resolver::{BasicResolver, ResolveCandidate, ResolveRequest, ResolvedWiring, Resolver, WiringDelta};
pub use runtime::{
    ActivatorContext, CallbackActivator, ClasspathSegment, CodeLoader, LoaderHandle,
    MemoryCodeLoader, ModuleActivator, NoopServiceDirectory, ServiceDirectory,
};
pub use state_lock::{ActorId, DEFAULT_STATE_CHANGE_TIMEOUT};
pub use wiring::{PackageSource, SupplierRef};
pub use worker::JobHandle;
