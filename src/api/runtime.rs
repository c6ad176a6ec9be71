//! 模块运行时门面
//!
//! [`ModuleRuntime`] 是运行时唯一的对外入口。它可以廉价克隆，激活钩子通过
//! [`ActivatorContext`](crate::module::ActivatorContext) 拿到的也是它。每个入口都在执行者
//! 作用域内运行：从激活钩子或同步监听器中重入时沿用调用者的执行者，因此对同一模块的
//! 递归状态变更会立即失败而不是死锁。
//!
//! # 示例
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
//!     let descriptor = ModuleDescriptor::new("com.example.hello", Version::new(1, 0, 0));
//!     let id = runtime.install("mem:hello", descriptor).await?;
//!     runtime.start(id, StartOptions::empty()).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::core::config::RuntimeConfig;
use crate::event::{EventBus, EventCallback, EventFilter};
use crate::module::manager::{ManagerParts, ModuleManager};
use crate::module::state_lock::in_actor_scope;
use crate::module::{
    BasicResolver, CodeLoader, FoundEntry, JobHandle, MemoryCodeLoader, ModuleActivator,
    ModuleDescriptor, ModuleId, ModuleSnapshot, NoopServiceDirectory, Resolver,
    ServiceDirectory, StartOptions, StopOptions,
};
use crate::utils::Result;

/// 模块运行时
#[derive(Clone)]
pub struct ModuleRuntime {
    manager: Arc<ModuleManager>,
}

impl std::fmt::Debug for ModuleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("manager", &self.manager)
            .finish()
    }
}

impl ModuleRuntime {
    /// 用默认协作者创建运行时
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        Self::builder().config(config).build().await
    }

    pub fn builder() -> ModuleRuntimeBuilder {
        ModuleRuntimeBuilder::new()
    }

    pub(crate) fn from_manager(manager: Arc<ModuleManager>) -> Self {
        Self { manager }
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.manager.config()
    }

    pub fn events(&self) -> &EventBus {
        self.manager.events()
    }

    // ==================== 运行时生命周期 ====================

    /// 启动运行时：启动系统模块，解析全部，升到起始级别
    #[instrument(skip(self))]
    pub async fn launch(&self) -> Result<()> {
        in_actor_scope(self.manager.launch()).await
    }

    /// 关闭运行时：停止所有模块，拆除全部接线
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        in_actor_scope(self.manager.shutdown()).await
    }

    /// 进程内重启：降到 0 级再回到当前级别
    #[instrument(skip(self))]
    pub async fn restart(&self) -> Result<()> {
        in_actor_scope(self.manager.restart()).await
    }

    // ==================== 单个模块 ====================

    /// 安装模块；同一位置已安装时返回已有模块的 ID
    #[instrument(skip(self, descriptor))]
    pub async fn install(&self, location: &str, descriptor: ModuleDescriptor) -> Result<ModuleId> {
        in_actor_scope(self.manager.install(location, descriptor)).await
    }

    #[instrument(skip(self), fields(module_id = %id))]
    pub async fn start(&self, id: ModuleId, options: StartOptions) -> Result<()> {
        in_actor_scope(self.manager.start(id, options)).await
    }

    #[instrument(skip(self), fields(module_id = %id))]
    pub async fn stop(&self, id: ModuleId, options: StopOptions) -> Result<()> {
        in_actor_scope(self.manager.stop(id, options)).await
    }

    /// 用新描述更新模块；新描述无法解析时什么都不改变
    #[instrument(skip(self, descriptor), fields(module_id = %id))]
    pub async fn update(&self, id: ModuleId, descriptor: ModuleDescriptor) -> Result<()> {
        in_actor_scope(self.manager.update(id, descriptor)).await
    }

    #[instrument(skip(self), fields(module_id = %id))]
    pub async fn uninstall(&self, id: ModuleId) -> Result<()> {
        in_actor_scope(self.manager.uninstall(id)).await
    }

    /// 解析指定模块（为空时解析全部），返回目标是否都已解析
    #[instrument(skip(self))]
    pub async fn resolve(&self, ids: &[ModuleId]) -> Result<bool> {
        in_actor_scope(self.manager.resolve(ids)).await
    }

    /// 通过模块的加载委派查找条目，必要时触发惰性激活
    #[instrument(skip(self), fields(module_id = %id))]
    pub async fn load_class(&self, id: ModuleId, name: &str) -> Result<FoundEntry> {
        in_actor_scope(self.manager.load_class(id, name)).await
    }

    // ==================== 批量操作 ====================

    /// 把刷新排入批量工作者，入队后立即返回
    pub fn refresh(&self, ids: Vec<ModuleId>) -> Result<JobHandle> {
        self.manager.refresh_async(ids)
    }

    /// 刷新并等待完成
    #[instrument(skip(self))]
    pub async fn refresh_sync(&self, ids: Vec<ModuleId>) -> Result<()> {
        in_actor_scope(self.manager.refresh_sync(ids)).await
    }

    /// 请求调整活动级别，入队后立即返回
    pub fn set_active_level(&self, level: u32) -> Result<JobHandle> {
        self.manager.set_active_level(level)
    }

    /// 请求调整模块的启动级别，入队后立即返回
    pub fn set_module_level(&self, id: ModuleId, level: u32) -> Result<JobHandle> {
        self.manager.set_module_level(id, level)
    }

    pub async fn set_initial_module_level(&self, level: u32) -> Result<()> {
        self.manager.set_initial_module_level(level).await
    }

    // ==================== 查询 ====================

    pub fn module(&self, id: ModuleId) -> Option<ModuleSnapshot> {
        let registry = self.manager.registry();
        registry
            .get(id)
            .map(|record| record.snapshot(registry.is_removal_pending(id)))
    }

    /// 所有已安装模块，按 ID 升序
    pub fn modules(&self) -> Vec<ModuleSnapshot> {
        let registry = self.manager.registry();
        let mut modules: Vec<ModuleSnapshot> = registry
            .snapshot()
            .iter()
            .map(|record| record.snapshot(registry.is_removal_pending(record.id())))
            .collect();
        modules.sort_by_key(|m| m.id);
        modules
    }

    pub fn find_by_location(&self, location: &str) -> Option<ModuleSnapshot> {
        let registry = self.manager.registry();
        registry
            .find_by_location(location)
            .map(|record| record.snapshot(registry.is_removal_pending(record.id())))
    }

    pub fn find_by_symbolic_name(&self, name: &str) -> Vec<ModuleSnapshot> {
        let registry = self.manager.registry();
        registry
            .find_by_symbolic_name(name)
            .iter()
            .map(|record| record.snapshot(registry.is_removal_pending(record.id())))
            .collect()
    }

    /// 有旧修订等待移除的模块
    pub fn removal_pending(&self) -> Vec<ModuleId> {
        self.manager
            .registry()
            .removal_pending()
            .iter()
            .map(|revision| revision.module())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.manager.dependents(id)
    }

    /// 刷新这些模块时会受影响的模块
    pub fn refresh_closure(&self, ids: &[ModuleId]) -> BTreeSet<ModuleId> {
        self.manager.refresh_closure(ids)
    }

    pub fn active_level(&self) -> u32 {
        self.manager.active_level()
    }

    pub fn module_level(&self, id: ModuleId) -> Result<u32> {
        self.manager.module_level(id)
    }

    pub fn initial_module_level(&self) -> u32 {
        self.manager.initial_module_level()
    }

    // ==================== 事件 ====================

    /// 订阅异步事件，返回订阅 ID
    pub fn subscribe(&self, filter: EventFilter, callback: EventCallback) -> String {
        self.events().subscribe(filter, callback)
    }

    /// 订阅同步事件（包括 STARTING、STOPPING、LAZY_ACTIVATION），返回订阅 ID
    pub fn subscribe_sync(&self, filter: EventFilter, callback: EventCallback) -> String {
        self.events().subscribe_sync(filter, callback)
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.events().unsubscribe(subscription_id)
    }
}

/// 运行时构建器
///
/// 未提供的协作者使用内置实现：[`BasicResolver`]、[`MemoryCodeLoader`]、
/// [`NoopServiceDirectory`]。
#[derive(Default)]
pub struct ModuleRuntimeBuilder {
    config: RuntimeConfig,
    resolver: Option<Arc<dyn Resolver>>,
    code_loader: Option<Arc<dyn CodeLoader>>,
    activators: HashMap<String, Arc<dyn ModuleActivator>>,
    services: Option<Arc<dyn ServiceDirectory>>,
    system_descriptor: Option<ModuleDescriptor>,
}

impl ModuleRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn code_loader(mut self, code_loader: Arc<dyn CodeLoader>) -> Self {
        self.code_loader = Some(code_loader);
        self
    }

    /// 注册激活钩子，由描述的 `activator` 字段按名称选择
    pub fn activator(mut self, name: impl Into<String>, activator: impl ModuleActivator + 'static) -> Self {
        self.activators.insert(name.into(), Arc::new(activator));
        self
    }

    pub fn service_directory(mut self, services: Arc<dyn ServiceDirectory>) -> Self {
        self.services = Some(services);
        self
    }

    /// 替换系统模块的描述；配置中的系统包仍会并入其导出
    pub fn system_descriptor(mut self, descriptor: ModuleDescriptor) -> Self {
        self.system_descriptor = Some(descriptor);
        self
    }

    /// 构建运行时，恢复持久化的模块记录
    pub async fn build(self) -> Result<ModuleRuntime> {
        let events = EventBus::with_flush_timeout(Duration::from_millis(
            self.config.events.flush_timeout_ms,
        ));
        let manager = ModuleManager::new(ManagerParts {
            resolver: self.resolver.unwrap_or_else(|| Arc::new(BasicResolver)),
            code_loader: self
                .code_loader
                .unwrap_or_else(|| Arc::new(MemoryCodeLoader::new())),
            activators: self.activators,
            services: self
                .services
                .unwrap_or_else(|| Arc::new(NoopServiceDirectory)),
            system_descriptor: self.system_descriptor,
            events,
            config: self.config,
        })
        .await?;
        Ok(ModuleRuntime::from_manager(manager))
    }
}
