//! 模块管理器
//!
//! 运行时的共享状态：注册表、协作者（解析器、代码加载器、激活钩子、服务目录）、事件总线、
//! 级别状态、持久化和批量工作者。生命周期、刷新和启动级别的具体流程分别在
//! `lifecycle`、`refresh`、`start_level` 中实现，这里只放它们共用的部分，
//! 其中最重要的是解析过程（[`ModuleManager::resolve_modules`]）。

use parking_lot::Mutex;
use semver::Version;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::delegate::{DelegateTables, LoadDelegate, LookupContext};
use super::metadata::{ModuleDescriptor, ModuleId, ModuleState};
use super::record::{ModuleRecord, Revision};
use super::registry::ModuleRegistry;
use super::resolver::{ResolveCandidate, ResolveRequest, ResolvedWiring, Resolver, WiringDelta};
use super::runtime::{CodeLoader, ModuleActivator, ServiceDirectory};
use super::state_lock::{ActorId, StateChangeGuard};
use super::storage::{PersistedModule, PersistedState, RecordStore};
use super::wiring::{PackagePatterns, RequiredSupplier};
use super::worker::{ensure_not_worker, Job, JobHandle, Worker};
use crate::api::ModuleRuntime;
use crate::core::config::RuntimeConfig;
use crate::event::{EventBus, ModuleEvent, ModuleEventKind};
use crate::utils::{Result, RuntimeError};

/// 系统模块的安装位置
pub const SYSTEM_LOCATION: &str = "system:runtime";

/// 系统模块的默认符号名
pub const SYSTEM_SYMBOLIC_NAME: &str = "chips.runtime.system";

/// 构建管理器所需的部件
pub struct ManagerParts {
    pub config: RuntimeConfig,
    pub resolver: Arc<dyn Resolver>,
    pub code_loader: Arc<dyn CodeLoader>,
    pub activators: HashMap<String, Arc<dyn ModuleActivator>>,
    pub services: Arc<dyn ServiceDirectory>,
    pub system_descriptor: Option<ModuleDescriptor>,
    pub events: EventBus,
}

/// 当前活动级别和进行中变更的目标级别
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LevelState {
    pub active: u32,
    pub requested: u32,
}

/// 待发布的事件
///
/// 状态变更锁释放之后才发布，避免监听器重入 API 时死锁。
#[derive(Debug, Default)]
pub(crate) struct PendingEvents {
    events: Vec<ModuleEvent>,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ModuleEvent) {
        self.events.push(event);
    }

    pub fn module(&mut self, kind: ModuleEventKind, record: &ModuleRecord) {
        self.push(ModuleEvent::new(
            kind,
            record.id(),
            Some(record.location().to_string()),
        ));
    }

    pub fn error(&mut self, module: ModuleId, location: Option<&str>, error: &RuntimeError) {
        self.push(ModuleEvent::error(
            module,
            location.map(str::to_string),
            error,
        ));
    }

    pub fn publish(&mut self, bus: &EventBus) {
        for event in self.events.drain(..) {
            bus.publish(event);
        }
    }
}

/// 模块管理器
pub struct ModuleManager {
    config: RuntimeConfig,
    registry: ModuleRegistry,
    resolver: Arc<dyn Resolver>,
    code_loader: Arc<dyn CodeLoader>,
    activators: HashMap<String, Arc<dyn ModuleActivator>>,
    services: Arc<dyn ServiceDirectory>,
    events: EventBus,
    store: Option<RecordStore>,
    boot: Arc<PackagePatterns>,
    pub(crate) levels: Mutex<LevelState>,
    initial_level: AtomicU32,
    timeout: Duration,
    /// 串行化解析过程；持有者从不等待状态变更锁
    pub(crate) resolve_lock: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.registry.len())
            .field("levels", &*self.levels.lock())
            .finish_non_exhaustive()
    }
}

impl ModuleManager {
    /// 创建管理器：安装系统模块、恢复持久化记录、启动批量工作者
    pub async fn new(parts: ManagerParts) -> Result<Arc<Self>> {
        let ManagerParts {
            config,
            resolver,
            code_loader,
            activators,
            services,
            system_descriptor,
            events,
        } = parts;
        config.validate()?;

        let modules = &config.modules;
        let registry = ModuleRegistry::new(modules.allow_duplicate_names);
        let system = Arc::new(ModuleRecord::new(
            ModuleId::SYSTEM,
            SYSTEM_LOCATION,
            system_descriptor_for(&config, system_descriptor),
            0,
        ));
        registry.add(system)?;

        let manager = Arc::new(Self {
            boot: Arc::new(PackagePatterns::from_patterns(&modules.boot_delegation)),
            initial_level: AtomicU32::new(modules.initial_module_level),
            timeout: modules.state_change_timeout(),
            store: config.data_dir.as_ref().map(RecordStore::new),
            levels: Mutex::new(LevelState::default()),
            resolve_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
            registry,
            resolver,
            code_loader,
            activators,
            services,
            events,
            config,
        });

        manager.restore().await?;
        manager.ensure_worker();
        info!(
            modules = manager.registry.len(),
            initial_module_level = manager.initial_module_level(),
            "模块管理器已创建"
        );
        Ok(manager)
    }

    // ==================== 访问器 ====================

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn resolver(&self) -> &dyn Resolver {
        self.resolver.as_ref()
    }

    pub(crate) fn services(&self) -> &dyn ServiceDirectory {
        self.services.as_ref()
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn lookup_context(&self) -> LookupContext<'_> {
        LookupContext {
            registry: &self.registry,
            code_loader: self.code_loader.as_ref(),
        }
    }

    /// 供激活钩子重入的运行时句柄
    pub(crate) fn runtime_handle(self: &Arc<Self>) -> ModuleRuntime {
        ModuleRuntime::from_manager(self.clone())
    }

    /// 描述选择的激活钩子；未声明或未注册时为空
    pub(crate) fn activator_for(
        &self,
        record: &ModuleRecord,
    ) -> Option<Arc<dyn ModuleActivator>> {
        let descriptor = record.descriptor();
        let name = descriptor.activator.as_deref()?;
        let activator = self.activators.get(name).cloned();
        if activator.is_none() {
            warn!(
                module_id = %record.id(),
                activator = name,
                "激活钩子未注册，按无钩子处理"
            );
        }
        activator
    }

    pub fn initial_module_level(&self) -> u32 {
        self.initial_level.load(Ordering::SeqCst)
    }

    /// 修改新安装模块的启动级别
    pub async fn set_initial_module_level(&self, level: u32) -> Result<()> {
        if level == 0 {
            return Err(RuntimeError::InvalidStartLevel(0));
        }
        self.initial_level.store(level, Ordering::SeqCst);
        let mut pending = PendingEvents::new();
        self.persist(ModuleId::SYSTEM, &mut pending).await;
        pending.publish(&self.events);
        Ok(())
    }

    pub fn active_level(&self) -> u32 {
        self.levels.lock().active
    }

    /// 获取模块的状态变更锁（有界等待），模块已卸载时失败
    pub(crate) async fn lock_module(&self, record: &ModuleRecord) -> Result<StateChangeGuard> {
        let guard = StateChangeGuard::acquire(
            record.state_lock(),
            record.id(),
            ActorId::current_or_fresh(),
            self.timeout,
        )
        .await?;
        if record.state() == ModuleState::Uninstalled {
            return Err(RuntimeError::ModuleUninstalled(record.id()));
        }
        Ok(guard)
    }

    // ==================== 批量工作者 ====================

    /// 工作者已关闭时重新启动
    pub(crate) fn ensure_worker(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(Worker::spawn(Arc::downgrade(self)));
        }
    }

    pub(crate) fn submit(&self, job: Job) -> Result<JobHandle> {
        self.worker
            .lock()
            .as_ref()
            .ok_or(RuntimeError::WorkerClosed)?
            .submit(job)
    }

    /// 入队并等待完成
    pub(crate) async fn submit_and_wait(&self, job: Job) -> Result<()> {
        ensure_not_worker(self.worker_actor())?;
        self.submit(job)?.wait().await
    }

    pub(crate) fn worker_actor(&self) -> Option<ActorId> {
        self.worker.lock().as_ref().map(Worker::actor)
    }

    /// 关闭工作者，等待已入队作业完成
    pub(crate) async fn close_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.close().await;
        }
    }

    /// 在工作者上执行一个作业
    pub(crate) async fn run_job(self: &Arc<Self>, job: Job) -> Result<()> {
        match job {
            Job::SetActiveLevel(level) => self.change_level(level).await,
            Job::SetModuleLevel { module, level } => self.apply_module_level(module, level).await,
            Job::Refresh(seeds) => match self.refresh(seeds).await {
                Err(RuntimeError::RestartRequired) => {
                    warn!("刷新闭包包含系统模块或扩展模块，执行进程内重启");
                    self.restart_in_place().await
                }
                other => other,
            },
            Job::Restart => self.restart_in_place().await,
        }
    }

    // ==================== 解析 ====================

    /// 解析目标模块（`force_full` 时尝试解析全部未解析模块）
    ///
    /// 新解析模块的 RESOLVED 事件放入 `pending`。
    pub(crate) async fn resolve_modules(
        &self,
        targets: &[ModuleId],
        force_full: bool,
        pending: &mut PendingEvents,
    ) -> Result<WiringDelta> {
        let _pass = self.resolve_lock.lock().await;
        self.resolve_pass(targets, force_full, pending)
    }

    /// 一次解析过程，调用方持有 `resolve_lock`
    ///
    /// 未解析模块的状态变更锁用 `try_acquire` 获取：被其他执行者持有的模块不参与本次解析，
    /// 当前执行者已持有的模块照常参与。解析过程从不等待状态变更锁。
    pub(crate) fn resolve_pass(
        &self,
        targets: &[ModuleId],
        force_full: bool,
        pending: &mut PendingEvents,
    ) -> Result<WiringDelta> {
        let actor = ActorId::current_or_fresh();
        let mut guards = Vec::new();
        let mut candidates = Vec::new();

        for record in self.registry.snapshot() {
            let state = record.state();
            if state == ModuleState::Uninstalled {
                continue;
            }
            if !state.is_resolved() {
                match StateChangeGuard::try_acquire(record.state_lock(), record.id(), actor) {
                    Ok(Some(guard)) => guards.push(guard),
                    Err(RuntimeError::SelfStateChangeRecursion(_)) => {}
                    Ok(None) => {
                        trace!(module_id = %record.id(), "模块正在变更状态，不参与本次解析");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let state = record.state();
            if state == ModuleState::Uninstalled {
                continue;
            }
            candidates.push(ResolveCandidate {
                id: record.id(),
                descriptor: record.descriptor(),
                resolved: state.is_resolved(),
            });
        }

        let request = ResolveRequest {
            candidates,
            targets: targets.to_vec(),
            force_full,
        };
        let delta = self.resolver.resolve(&request)?;
        for (module, reason) in &delta.failures {
            if targets.contains(module) {
                debug!(module_id = %module, reason = reason.as_str(), "模块无法解析");
            }
        }
        self.apply_delta(&delta, pending);
        drop(guards);
        Ok(delta)
    }

    /// 应用接线增量：先宿主后片段
    fn apply_delta(&self, delta: &WiringDelta, pending: &mut PendingEvents) {
        let (fragments, hosts): (Vec<&ResolvedWiring>, Vec<&ResolvedWiring>) =
            delta.resolved.iter().partition(|w| w.host.is_some());

        for wiring in hosts {
            let Some(record) = self.registry.get(wiring.module) else {
                continue;
            };
            if record.state() != ModuleState::Installed {
                continue;
            }
            let revision = record.revision();

            let mut fragment_descriptors = Vec::new();
            for fragment in fragments.iter().filter(|f| f.host == Some(wiring.module)) {
                if let Err(e) = revision.attach_fragment(fragment.module) {
                    warn!(module_id = %wiring.module, fragment = %fragment.module, error = %e, "附着片段失败");
                    continue;
                }
                if let Some(fragment_record) = self.registry.get(fragment.module) {
                    fragment_descriptors.push(fragment_record.descriptor());
                }
            }

            let tables = self.build_tables(&revision, wiring, &fragment_descriptors);
            let delegate = Arc::new(LoadDelegate::new(
                wiring.module,
                revision.number(),
                tables,
                self.boot.clone(),
            ));
            for supplier in delegate.suppliers() {
                if let Some(supplier_revision) = self.registry.revision(supplier) {
                    supplier_revision.add_user(wiring.module);
                }
            }
            revision.set_delegate(delegate);

            match record.set_state(ModuleState::Resolved) {
                Ok(_) => {
                    info!(module_id = %wiring.module, location = record.location(), "模块已解析");
                    pending.module(ModuleEventKind::Resolved, &record);
                }
                Err(e) => warn!(module_id = %wiring.module, error = %e, "解析后状态转换失败"),
            }
        }

        for wiring in fragments {
            let (Some(record), Some(host_id)) = (self.registry.get(wiring.module), wiring.host)
            else {
                continue;
            };
            if record.state() != ModuleState::Installed {
                continue;
            }
            let Some(host) = self.registry.get(host_id) else {
                continue;
            };
            let host_revision = host.revision();

            if !host_revision.fragments().contains(&wiring.module) {
                // 宿主在更早的解析中已就绪：按追加规则附着，片段的接线并入宿主的委派
                if let Err(e) = host_revision.attach_fragment(wiring.module) {
                    warn!(module_id = %wiring.module, host = %host_id, error = %e, "附着片段失败");
                    pending.error(wiring.module, Some(record.location()), &e);
                    continue;
                }
                if let Some(delegate) = host_revision.delegate() {
                    let extra = self.build_tables(&record.revision(), wiring, &[]);
                    let merged = Arc::new(delegate.merged(extra));
                    for supplier in merged.suppliers() {
                        if let Some(supplier_revision) = self.registry.revision(supplier) {
                            supplier_revision.add_user(host_id);
                        }
                    }
                    host_revision.set_delegate(merged);
                }
            }
            record.revision().set_host(Some(host_id));

            match record.set_state(ModuleState::Resolved) {
                Ok(_) => {
                    info!(module_id = %wiring.module, host = %host_id, "片段已附着");
                    pending.module(ModuleEventKind::Resolved, &record);
                }
                Err(e) => warn!(module_id = %wiring.module, error = %e, "解析后状态转换失败"),
            }
        }
    }

    /// 由接线结果构建查找表；提供者引用其当前修订
    ///
    /// 片段的接线属于宿主，按宿主过滤自身导入。
    fn build_tables(
        &self,
        revision: &Revision,
        wiring: &ResolvedWiring,
        fragments: &[Arc<ModuleDescriptor>],
    ) -> DelegateTables {
        let descriptor = revision.descriptor();
        let current = |id: ModuleId| self.registry.get(id).map(|r| r.revision().supplier_ref());

        let owner = wiring.host.unwrap_or(wiring.module);
        let imports = wiring
            .imports
            .iter()
            .filter(|(_, supplier)| *supplier != owner)
            .filter_map(|(package, supplier)| current(*supplier).map(|s| (package.clone(), s)))
            .collect();

        let required = wiring
            .requires
            .iter()
            .filter_map(|(supplier, reexport)| {
                current(*supplier).map(|supplier| RequiredSupplier {
                    supplier,
                    reexport: *reexport,
                })
            })
            .collect();

        let mut dynamic = PackagePatterns::from_patterns(&descriptor.dynamic_imports);
        for fragment in fragments {
            dynamic.extend(&PackagePatterns::from_patterns(&fragment.dynamic_imports));
        }

        let exports = descriptor
            .exports
            .iter()
            .chain(fragments.iter().flat_map(|f| f.exports.iter()))
            .map(|e| e.name.clone())
            .collect();

        DelegateTables {
            imports,
            dynamic,
            required,
            exports,
        }
    }

    /// 拆除修订的接线，并从提供者的使用者集合中注销
    pub(crate) fn unwire(&self, revision: &Revision) {
        if let Some(host) = revision.host().and_then(|h| self.registry.get(h)) {
            host.revision().detach_fragment(revision.module());
        }
        if let Some(delegate) = revision.teardown() {
            delegate.clear_caches();
            for supplier in delegate.suppliers() {
                if let Some(supplier_revision) = self.registry.revision(supplier) {
                    supplier_revision.remove_user(revision.module());
                }
            }
        }
        trace!(module_id = %revision.module(), revision = revision.number(), "接线已拆除");
    }

    // ==================== 依赖查询 ====================

    /// 模块的所有修订：当前修订和待移除的旧修订
    pub(crate) fn revisions_of(&self, module: ModuleId) -> Vec<Arc<Revision>> {
        let mut revisions: Vec<Arc<Revision>> = self
            .registry
            .get(module)
            .map(|r| r.revision())
            .into_iter()
            .collect();
        revisions.extend(
            self.registry
                .removal_pending()
                .into_iter()
                .filter(|r| r.module() == module),
        );
        revisions
    }

    /// 直接依赖此模块的模块（接线使用者和已附着的片段）
    pub fn dependents(&self, module: ModuleId) -> Vec<ModuleId> {
        let mut set = BTreeSet::new();
        for revision in self.revisions_of(module) {
            set.extend(revision.users());
            set.extend(revision.fragments());
        }
        set.remove(&module);
        set.into_iter().collect()
    }

    /// 按 (启动级别, 依赖顺序, ID) 排序
    pub(crate) fn resume_order(&self, records: Vec<Arc<ModuleRecord>>) -> Vec<Arc<ModuleRecord>> {
        let mut by_level: BTreeMap<u32, Vec<Arc<ModuleRecord>>> = BTreeMap::new();
        for record in records {
            by_level.entry(record.start_level()).or_default().push(record);
        }
        by_level
            .into_values()
            .flat_map(|group| self.dependency_sorted(group))
            .collect()
    }

    /// 同组模块按依赖排序：提供者在使用者之前，无关模块按 ID
    pub(crate) fn dependency_sorted(&self, mut group: Vec<Arc<ModuleRecord>>) -> Vec<Arc<ModuleRecord>> {
        group.sort_by_key(|r| r.id());
        let ids: Vec<ModuleId> = group.iter().map(|r| r.id()).collect();
        let members: BTreeSet<ModuleId> = ids.iter().copied().collect();

        let mut edges = Vec::new();
        for record in &group {
            let revision = record.revision();
            if let Some(delegate) = revision.delegate() {
                for supplier in delegate.suppliers() {
                    if members.contains(&supplier.module) && supplier.module != record.id() {
                        edges.push((record.id(), supplier.module));
                    }
                }
            }
            if let Some(host) = revision.host() {
                if members.contains(&host) {
                    edges.push((record.id(), host));
                }
            }
        }

        let order = self.resolver.dependency_sort(&ids, &edges);
        let mut by_id: HashMap<ModuleId, Arc<ModuleRecord>> =
            group.into_iter().map(|r| (r.id(), r)).collect();
        order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
    }

    // ==================== 持久化 ====================

    fn persisted_state(&self) -> PersistedState {
        let modules = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| !r.id().is_system())
            .map(|record| {
                let descriptor = record.descriptor();
                PersistedModule {
                    id: record.id(),
                    location: record.location().to_string(),
                    symbolic_name: descriptor.symbolic_name.clone(),
                    version: descriptor.version.clone(),
                    start_level: record.start_level(),
                    status: record.persistent_status(),
                    descriptor: (*descriptor).clone(),
                }
            })
            .collect();
        PersistedState {
            next_id: self.registry.next_id(),
            initial_module_level: Some(self.initial_module_level()),
            modules,
        }
    }

    /// 保存模块记录；失败只记录并产生 ERROR 事件，内存状态保持更新后的值
    pub(crate) async fn persist(&self, module: ModuleId, pending: &mut PendingEvents) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_with(|| self.persisted_state()).await {
            error!(module_id = %module, error = %e, "保存模块记录失败");
            pending.error(module, None, &e);
        }
    }

    /// 从持久化记录恢复已安装的模块（保持原 ID、级别和持久状态）
    async fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(state) = store.load().await? else {
            return Ok(());
        };

        if let Some(level) = state.initial_module_level {
            self.initial_level.store(level, Ordering::SeqCst);
        }
        let mut restored = 0usize;
        for module in &state.modules {
            if module.id.is_system() {
                continue;
            }
            let record = Arc::new(ModuleRecord::new(
                module.id,
                module.location.clone(),
                module.descriptor.clone(),
                module.start_level,
            ));
            let status = module.status;
            record.update_status(|s| *s = status);
            match self.registry.add(record) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(module_id = %module.id, location = module.location.as_str(), error = %e, "恢复模块记录失败");
                }
            }
        }
        self.registry.resume_ids_after(state.max_used_id());
        info!(
            path = %store.path().display(),
            modules = restored,
            next_id = self.registry.next_id(),
            "已恢复模块记录"
        );
        Ok(())
    }
}

/// 系统模块描述：给定描述（或默认描述）加上配置中的系统包
fn system_descriptor_for(config: &RuntimeConfig, given: Option<ModuleDescriptor>) -> ModuleDescriptor {
    let mut descriptor = given.unwrap_or_else(|| {
        let version = Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0));
        ModuleDescriptor::new(SYSTEM_SYMBOLIC_NAME, version)
    });
    for package in &config.modules.system_packages {
        if descriptor.exports_package(&package.name).is_none() {
            descriptor = descriptor.export(package.name.clone(), package.version.clone());
        }
    }
    descriptor.fragment_host = None;
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SystemPackage;

    #[test]
    fn test_system_descriptor_includes_system_packages() {
        let mut config = RuntimeConfig::default();
        config
            .modules
            .system_packages
            .push(SystemPackage::new("chips.sdk", Version::new(1, 2, 0)));

        let descriptor = system_descriptor_for(&config, None);
        assert_eq!(descriptor.symbolic_name.as_deref(), Some(SYSTEM_SYMBOLIC_NAME));
        assert_eq!(
            descriptor.exports_package("chips.sdk").map(|e| e.version.clone()),
            Some(Version::new(1, 2, 0))
        );
    }

    #[test]
    fn test_pending_events_publish_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_sync(
            crate::event::EventFilter::all(),
            Arc::new(move |e: &ModuleEvent| sink.lock().push(e.kind)),
        );

        let record = ModuleRecord::new(ModuleId(1), "mem:a", ModuleDescriptor::default(), 1);
        let mut pending = PendingEvents::new();
        pending.module(ModuleEventKind::Unresolved, &record);
        pending.module(ModuleEventKind::Resolved, &record);
        assert!(seen.lock().is_empty());

        pending.publish(&bus);
        assert_eq!(
            *seen.lock(),
            vec![ModuleEventKind::Unresolved, ModuleEventKind::Resolved]
        );
    }
}
