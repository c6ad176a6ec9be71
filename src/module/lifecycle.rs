//! 模块生命周期
//!
//! 单个模块的安装、启动、停止、更新、卸载和类加载。每个操作的形式相同：
//! 检查模块未卸载，获取状态变更锁（有界等待），执行工作流程，释放锁，最后发布事件。
//! STARTING、STOPPING、LAZY_ACTIVATION 在状态变更过程中内联发布给同步监听器。
//!
//! 工作流程（`start_worker`、`stop_worker`）在目标状态已达成时是空操作，
//! 也被启动级别调度和刷新复用。

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::delegate::FoundEntry;
use super::manager::{ModuleManager, PendingEvents};
use super::metadata::{
    ModuleDescriptor, ModuleId, ModuleState, PersistentStatus, StartOptions, StopOptions,
};
use super::parser::ModuleParser;
use super::record::{ModuleRecord, Revision};
use super::resolver::{ResolveCandidate, ResolveRequest};
use super::runtime::ActivatorContext;
use crate::event::{ModuleEvent, ModuleEventKind};
use crate::utils::{Result, RuntimeError};

impl ModuleManager {
    // ==================== 安装 ====================

    /// 安装模块
    ///
    /// 同一位置已安装时返回已有模块。并发安装同一位置的其他执行者等待先到者完成。
    pub async fn install(
        self: &Arc<Self>,
        location: &str,
        descriptor: ModuleDescriptor,
    ) -> Result<ModuleId> {
        ModuleParser::validate(&descriptor)?;
        if let Some(existing) = self.registry().find_by_location(location) {
            debug!(module_id = %existing.id(), location, "位置已安装");
            return Ok(existing.id());
        }

        let actor = super::state_lock::ActorId::current_or_fresh();
        let reservation = self
            .registry()
            .reserve_location(location, actor, self.timeout())
            .await?;
        if let Some(existing) = self.registry().find_by_location(location) {
            return Ok(existing.id());
        }

        self.registry().check_identity(&descriptor, None)?;
        let id = self.registry().allocate_id();
        let record = Arc::new(ModuleRecord::new(
            id,
            location,
            descriptor,
            self.initial_module_level(),
        ));
        self.registry().add(record.clone())?;

        let mut pending = PendingEvents::new();
        pending.module(ModuleEventKind::Installed, &record);
        self.persist(id, &mut pending).await;
        drop(reservation);

        info!(
            module_id = %id,
            location,
            symbolic_name = ?record.symbolic_name(),
            start_level = record.start_level(),
            "模块已安装"
        );
        pending.publish(self.events());
        Ok(id)
    }

    // ==================== 启动与停止 ====================

    /// 启动模块
    pub async fn start(self: &Arc<Self>, id: ModuleId, options: StartOptions) -> Result<()> {
        if id.is_system() {
            return Err(RuntimeError::SystemModuleOperation("启动（请使用 launch）".to_string()));
        }
        let record = self.registry().require(id)?;
        let mut pending = PendingEvents::new();
        let result = {
            let _guard = self.lock_module(&record).await?;
            self.start_worker(&record, options, false, &mut pending).await
        };
        pending.publish(self.events());
        result
    }

    /// 停止模块
    pub async fn stop(self: &Arc<Self>, id: ModuleId, options: StopOptions) -> Result<()> {
        if id.is_system() {
            return Err(RuntimeError::SystemModuleOperation("停止（请使用 shutdown）".to_string()));
        }
        let record = self.registry().require(id)?;
        if record.is_fragment() {
            return Err(illegal(&record, ModuleState::Stopping));
        }
        let mut pending = PendingEvents::new();
        let result = {
            let _guard = self.lock_module(&record).await?;
            if !options.contains(StopOptions::TRANSIENT)
                && record.update_status(|s| s.remove(PersistentStatus::all()))
            {
                self.persist(id, &mut pending).await;
            }
            self.stop_worker(&record, &mut pending).await
        };
        pending.publish(self.events());
        result
    }

    /// 启动流程，调用方持有状态变更锁
    ///
    /// - 未解析时先解析，失败返回 `ResolutionFailure`，状态不变
    /// - 启动级别高于活动级别时只记录持久启动
    /// - 惰性激活时停在 STARTING，发布 LAZY_ACTIVATION 后返回
    /// - 激活钩子失败时回到 RESOLVED，返回 `ActivationFailure`
    pub(crate) async fn start_worker(
        self: &Arc<Self>,
        record: &Arc<ModuleRecord>,
        options: StartOptions,
        trigger: bool,
        pending: &mut PendingEvents,
    ) -> Result<()> {
        let id = record.id();
        if record.is_fragment() {
            return Err(illegal(record, ModuleState::Starting));
        }

        if !options.contains(StartOptions::TRANSIENT) {
            let policy = options.contains(StartOptions::USE_ACTIVATION_POLICY);
            let changed = record.update_status(|s| {
                s.insert(PersistentStatus::STARTED);
                s.set(PersistentStatus::ACTIVATION_POLICY, policy);
            });
            if changed {
                self.persist(id, pending).await;
            }
        }

        match record.state() {
            ModuleState::Active | ModuleState::Stopping => return Ok(()),
            ModuleState::Uninstalled => return Err(RuntimeError::ModuleUninstalled(id)),
            ModuleState::Starting if self.defers_activation(record, options, trigger) => {
                return Ok(())
            }
            _ => {}
        }

        if !record.state().is_resolved() {
            let delta = self.resolve_modules(&[id], false, pending).await?;
            if !record.state().is_resolved() {
                let reason = delta
                    .failure(id)
                    .unwrap_or("依赖约束无法满足")
                    .to_string();
                return Err(RuntimeError::ResolutionFailure { module: id, reason });
            }
        }

        if !id.is_system() && record.start_level() > self.active_level() {
            debug!(
                module_id = %id,
                start_level = record.start_level(),
                active_level = self.active_level(),
                "启动级别高于活动级别，推迟激活"
            );
            return Ok(());
        }

        if record.state() == ModuleState::Resolved {
            record.set_state(ModuleState::Starting)?;
            if self.defers_activation(record, options, trigger) {
                info!(module_id = %id, "惰性激活，等待首次加载");
                self.publish_inline(ModuleEventKind::LazyActivation, record);
                return Ok(());
            }
        }

        if trigger {
            record.update_status(|s| s.insert(PersistentStatus::LAZY_TRIGGER));
        }
        self.publish_inline(ModuleEventKind::Starting, record);

        match self.activate(record).await {
            Ok(()) => {
                record.set_state(ModuleState::Active)?;
                info!(module_id = %id, location = record.location(), "模块已启动");
                pending.module(ModuleEventKind::Started, record);
                Ok(())
            }
            Err(source) => {
                record.set_state(ModuleState::Stopping)?;
                self.publish_inline(ModuleEventKind::Stopping, record);
                self.services().release_module(id);
                record.update_status(|s| s.remove(PersistentStatus::LAZY_TRIGGER));
                record.set_state(ModuleState::Resolved)?;
                pending.module(ModuleEventKind::Stopped, record);
                error!(module_id = %id, error = %source, "激活钩子失败");
                Err(RuntimeError::ActivationFailure { module: id, source })
            }
        }
    }

    /// 停止流程，调用方持有状态变更锁
    ///
    /// 停用钩子失败时仍完成清理并回到 RESOLVED，之后才返回 `DeactivationFailure`。
    pub(crate) async fn stop_worker(
        self: &Arc<Self>,
        record: &Arc<ModuleRecord>,
        pending: &mut PendingEvents,
    ) -> Result<()> {
        let state = record.state();
        if !matches!(state, ModuleState::Active | ModuleState::Starting) {
            return Ok(());
        }
        let id = record.id();

        record.set_state(ModuleState::Stopping)?;
        self.publish_inline(ModuleEventKind::Stopping, record);

        // 惰性等待中的模块从未运行过激活钩子
        let result = if state == ModuleState::Active {
            self.deactivate(record).await
        } else {
            Ok(())
        };

        self.services().release_module(id);
        record.update_status(|s| s.remove(PersistentStatus::LAZY_TRIGGER));
        record.set_state(ModuleState::Resolved)?;
        pending.module(ModuleEventKind::Stopped, record);

        match result {
            Ok(()) => {
                info!(module_id = %id, "模块已停止");
                Ok(())
            }
            Err(source) => {
                warn!(module_id = %id, error = %source, "停用钩子失败");
                Err(RuntimeError::DeactivationFailure { module: id, source })
            }
        }
    }

    /// 是否推迟激活：按激活策略启动、声明了惰性激活且尚未触发
    fn defers_activation(&self, record: &ModuleRecord, options: StartOptions, trigger: bool) -> bool {
        !trigger
            && options.contains(StartOptions::USE_ACTIVATION_POLICY)
            && record.descriptor().lazy_activation
            && !record
                .persistent_status()
                .contains(PersistentStatus::LAZY_TRIGGER)
    }

    /// 调度器恢复模块时使用的启动选项
    pub(crate) fn resume_options(&self, record: &ModuleRecord) -> StartOptions {
        let mut options = StartOptions::TRANSIENT;
        if record
            .persistent_status()
            .contains(PersistentStatus::ACTIVATION_POLICY)
        {
            options |= StartOptions::USE_ACTIVATION_POLICY;
        }
        options
    }

    async fn activate(self: &Arc<Self>, record: &ModuleRecord) -> anyhow::Result<()> {
        let Some(activator) = self.activator_for(record) else {
            return Ok(());
        };
        let ctx = ActivatorContext {
            module: record.id(),
            runtime: self.runtime_handle(),
        };
        activator.start(&ctx).await
    }

    async fn deactivate(self: &Arc<Self>, record: &ModuleRecord) -> anyhow::Result<()> {
        let Some(activator) = self.activator_for(record) else {
            return Ok(());
        };
        let ctx = ActivatorContext {
            module: record.id(),
            runtime: self.runtime_handle(),
        };
        activator.stop(&ctx).await
    }

    fn publish_inline(&self, kind: ModuleEventKind, record: &ModuleRecord) {
        self.events().publish(ModuleEvent::new(
            kind,
            record.id(),
            Some(record.location().to_string()),
        ));
    }

    /// 按持久状态恢复模块（批量操作使用，错误转为 ERROR 事件）
    pub(crate) async fn resume_module(self: &Arc<Self>, record: &Arc<ModuleRecord>) {
        let mut pending = PendingEvents::new();
        let result: Result<()> = async {
            let _guard = self.lock_module(record).await?;
            let options = self.resume_options(record);
            self.start_worker(record, options, false, &mut pending).await
        }
        .await;
        if let Err(e) = result {
            warn!(module_id = %record.id(), error = %e, "恢复模块失败");
            pending.error(record.id(), Some(record.location()), &e);
        }
        pending.publish(self.events());
    }

    /// 暂停模块，不改变持久状态（批量操作使用，错误转为 ERROR 事件）
    pub(crate) async fn suspend_module(self: &Arc<Self>, record: &Arc<ModuleRecord>) {
        let mut pending = PendingEvents::new();
        let result: Result<()> = async {
            let _guard = self.lock_module(record).await?;
            self.stop_worker(record, &mut pending).await
        }
        .await;
        if let Err(e) = result {
            warn!(module_id = %record.id(), error = %e, "暂停模块失败");
            pending.error(record.id(), Some(record.location()), &e);
        }
        pending.publish(self.events());
    }

    // ==================== 更新与卸载 ====================

    /// 用新描述更新模块
    ///
    /// 模块已解析时先检查新描述能否解析，失败则什么都不改变并返回 `ResolutionFailure`。
    /// 旧修订仍被使用时保留为待移除，直到下一次刷新。
    pub async fn update(self: &Arc<Self>, id: ModuleId, descriptor: ModuleDescriptor) -> Result<()> {
        if id.is_system() {
            return Err(RuntimeError::SystemModuleOperation("更新".to_string()));
        }
        ModuleParser::validate(&descriptor)?;
        let record = self.registry().require(id)?;

        let mut pending = PendingEvents::new();
        let result = self.update_locked(&record, descriptor, &mut pending).await;
        pending.publish(self.events());
        result
    }

    async fn update_locked(
        self: &Arc<Self>,
        record: &Arc<ModuleRecord>,
        descriptor: ModuleDescriptor,
        pending: &mut PendingEvents,
    ) -> Result<()> {
        let id = record.id();
        let _guard = self.lock_module(record).await?;
        self.registry().check_identity(&descriptor, Some(id))?;

        let state = record.state();
        let was_started = matches!(state, ModuleState::Active | ModuleState::Starting);
        if state.is_resolved() {
            self.check_resolvable(record, &descriptor)?;
        }

        if was_started {
            if let Err(e) = self.stop_worker(record, pending).await {
                pending.error(id, Some(record.location()), &e);
            }
        }

        let old = record.install_revision(descriptor);
        let new_name = record.symbolic_name();
        self.registry().reindex_name(
            id,
            old.descriptor().symbolic_name.as_deref(),
            new_name.as_deref(),
        );

        if record.state().is_resolved() {
            record.set_state(ModuleState::Installed)?;
            self.retire_revision(&old);
            pending.module(ModuleEventKind::Unresolved, record);
        }

        info!(
            module_id = %id,
            revision = record.revision().number(),
            version = %record.descriptor().version,
            "模块已更新"
        );
        pending.module(ModuleEventKind::Updated, record);
        self.persist(id, pending).await;

        if was_started {
            let options = self.resume_options(record);
            self.start_worker(record, options, false, pending).await?;
        }
        Ok(())
    }

    /// 在不改变任何状态的前提下检查新描述能否解析
    fn check_resolvable(&self, record: &ModuleRecord, descriptor: &ModuleDescriptor) -> Result<()> {
        let id = record.id();
        let candidates = self
            .registry()
            .snapshot()
            .into_iter()
            .filter(|r| r.state() != ModuleState::Uninstalled)
            .map(|r| {
                if r.id() == id {
                    ResolveCandidate {
                        id,
                        descriptor: Arc::new(descriptor.clone()),
                        resolved: false,
                    }
                } else {
                    ResolveCandidate {
                        id: r.id(),
                        descriptor: r.descriptor(),
                        resolved: r.state().is_resolved(),
                    }
                }
            })
            .collect();

        let delta = self.resolver().resolve(&ResolveRequest {
            candidates,
            targets: vec![id],
            force_full: false,
        })?;
        if delta.is_resolved(id) {
            return Ok(());
        }
        let reason = delta
            .failure(id)
            .unwrap_or("新描述无法解析")
            .to_string();
        warn!(module_id = %id, reason = reason.as_str(), "更新被拒绝：新描述无法解析");
        Err(RuntimeError::ResolutionFailure { module: id, reason })
    }

    /// 退役旧修订：仍被使用时标记为待移除，否则立即拆除接线
    fn retire_revision(&self, revision: &Arc<Revision>) {
        let in_use =
            revision.has_users() || revision.host().is_some() || !revision.fragments().is_empty();
        if in_use {
            self.registry().mark_removal_pending(revision.clone());
        } else {
            self.unwire(revision);
        }
    }

    /// 卸载模块
    ///
    /// 运行中的模块先停止；已解析且仍被使用的修订保留为待移除。
    pub async fn uninstall(self: &Arc<Self>, id: ModuleId) -> Result<()> {
        if id.is_system() {
            return Err(RuntimeError::SystemModuleOperation("卸载".to_string()));
        }
        let record = self.registry().require(id)?;
        let mut pending = PendingEvents::new();
        {
            let _guard = self.lock_module(&record).await?;
            if let Err(e) = self.stop_worker(&record, &mut pending).await {
                pending.error(id, Some(record.location()), &e);
            }

            if record.state().is_resolved() {
                self.retire_revision(&record.revision());
            }
            record.set_state(ModuleState::Uninstalled)?;
            self.registry().remove(id);
            self.persist(id, &mut pending).await;

            info!(
                module_id = %id,
                location = record.location(),
                removal_pending = self.registry().is_removal_pending(id),
                "模块已卸载"
            );
            pending.module(ModuleEventKind::Uninstalled, &record);
        }
        pending.publish(self.events());
        Ok(())
    }

    // ==================== 解析与加载 ====================

    /// 解析指定模块；为空时解析所有可解析的模块。返回目标是否全部已解析
    pub async fn resolve(self: &Arc<Self>, ids: &[ModuleId]) -> Result<bool> {
        let mut pending = PendingEvents::new();
        let result = self.resolve_modules(ids, ids.is_empty(), &mut pending).await;
        pending.publish(self.events());
        result?;

        let resolved = |record: &ModuleRecord| record.state().is_resolved();
        Ok(if ids.is_empty() {
            self.registry().snapshot().iter().all(|r| resolved(r))
        } else {
            ids.iter()
                .all(|id| self.registry().get(*id).map(|r| resolved(&r)).unwrap_or(false))
        })
    }

    /// 通过模块的加载委派查找条目
    ///
    /// 未解析的模块先解析；片段通过宿主查找。定义条目的模块处于惰性 STARTING 时触发激活。
    pub async fn load_class(self: &Arc<Self>, id: ModuleId, name: &str) -> Result<FoundEntry> {
        let mut record = self.registry().require(id)?;
        if !record.state().is_resolved() {
            let mut pending = PendingEvents::new();
            let result = self.resolve_modules(&[id], false, &mut pending).await;
            pending.publish(self.events());
            let delta = result?;
            if !record.state().is_resolved() {
                let reason = delta.failure(id).unwrap_or("模块未解析").to_string();
                return Err(RuntimeError::ResolutionFailure { module: id, reason });
            }
        }
        if record.is_fragment() {
            let host = record.revision().host().ok_or_else(|| RuntimeError::ResolutionFailure {
                module: id,
                reason: "片段未附着到宿主".to_string(),
            })?;
            record = self.registry().require(host)?;
        }

        let delegate = record
            .revision()
            .delegate()
            .ok_or_else(|| RuntimeError::ResolutionFailure {
                module: record.id(),
                reason: "模块接线已拆除".to_string(),
            })?;
        let found = delegate.find_entry(self.lookup_context(), name)?;
        self.trigger_lazy(found.defined_by).await;
        Ok(found)
    }

    /// 首次加载触发惰性激活
    async fn trigger_lazy(self: &Arc<Self>, module: ModuleId) {
        let Some(record) = self.registry().get(module) else {
            return;
        };
        if record.state() != ModuleState::Starting || module.is_system() {
            return;
        }

        let mut pending = PendingEvents::new();
        let result: Result<()> = async {
            let _guard = self.lock_module(&record).await?;
            if record.state() != ModuleState::Starting {
                return Ok(());
            }
            info!(module_id = %module, "首次加载触发惰性激活");
            let options = self.resume_options(&record);
            self.start_worker(&record, options, true, &mut pending).await
        }
        .await;

        match result {
            Ok(()) => {}
            // 模块自身激活过程中的加载
            Err(RuntimeError::SelfStateChangeRecursion(_)) => {}
            Err(e) => {
                warn!(module_id = %module, error = %e, "惰性激活失败");
                pending.error(module, Some(record.location()), &e);
            }
        }
        pending.publish(self.events());
    }
}

fn illegal(record: &ModuleRecord, to: ModuleState) -> RuntimeError {
    RuntimeError::IllegalTransition {
        module: record.id(),
        from: record.state().to_string(),
        to: to.to_string(),
    }
}
