//! 启动级别调度
//!
//! 活动级别只在批量工作者上改变，重叠的请求按到达顺序逐个完成。
//! 升级时逐级恢复：每一级先惰性模块后普通模块，每一轮按依赖排序；
//! 降级时逐级暂停，同级按 ID 降序。降到 0 级时拆除全部接线并停止系统模块。

use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::manager::{ModuleManager, PendingEvents};
use super::metadata::{ModuleId, ModuleState, PersistentStatus, StartOptions};
use super::record::ModuleRecord;
use super::worker::{Job, JobHandle};
use crate::event::{ModuleEvent, ModuleEventKind};
use crate::utils::{Result, RuntimeError};

impl ModuleManager {
    // ==================== 对外入口 ====================

    /// 启动运行时：启动系统模块，解析所有可解析的模块，升到起始级别
    pub async fn launch(self: &Arc<Self>) -> Result<()> {
        self.ensure_worker();
        self.prepare_launch().await?;
        let level = self.config().modules.beginning_level;
        info!(beginning_level = level, "启动运行时");
        self.submit_and_wait(Job::SetActiveLevel(level)).await
    }

    /// 关闭运行时：降到 0 级，等待事件投递完毕，关闭工作者
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self.worker_actor().is_none() {
            debug!("运行时已关闭");
            return Ok(());
        }
        self.submit_and_wait(Job::SetActiveLevel(0)).await?;
        if !self.events().flush().await {
            warn!("等待事件投递超时");
        }
        self.close_worker().await;
        info!("运行时已关闭");
        Ok(())
    }

    /// 进程内重启并等待完成
    pub async fn restart(&self) -> Result<()> {
        self.submit_and_wait(Job::Restart).await
    }

    /// 请求调整活动级别；0 级只能通过 shutdown 到达
    pub fn set_active_level(&self, level: u32) -> Result<JobHandle> {
        if level == 0 {
            return Err(RuntimeError::InvalidStartLevel(0));
        }
        self.submit(Job::SetActiveLevel(level))
    }

    /// 请求调整单个模块的启动级别
    pub fn set_module_level(&self, module: ModuleId, level: u32) -> Result<JobHandle> {
        if module.is_system() {
            return Err(RuntimeError::SystemModuleOperation("修改启动级别".to_string()));
        }
        if level == 0 {
            return Err(RuntimeError::InvalidStartLevel(0));
        }
        self.registry().require(module)?;
        self.submit(Job::SetModuleLevel { module, level })
    }

    pub fn module_level(&self, module: ModuleId) -> Result<u32> {
        Ok(self.registry().require(module)?.start_level())
    }

    // ==================== 工作者上的作业 ====================

    /// 把活动级别逐级调整到 `target`，完成后发布 LEVEL_CHANGED
    pub(crate) async fn change_level(self: &Arc<Self>, target: u32) -> Result<()> {
        let current = {
            let mut levels = self.levels.lock();
            levels.requested = target;
            levels.active
        };
        info!(from = current, to = target, "调整活动级别");

        if target > current {
            for level in current + 1..=target {
                self.levels.lock().active = level;
                self.resume_level(level).await;
            }
        } else if target < current {
            for level in (target + 1..=current).rev() {
                self.suspend_level(level).await;
                self.levels.lock().active = level - 1;
            }
        }

        if target == 0 {
            self.stop_system().await;
            self.unload_all().await;
        }

        info!(level = target, "活动级别已调整");
        self.events().publish(ModuleEvent::level_changed(target));
        Ok(())
    }

    /// 恢复恰好处于 `level` 的持久启动模块：先惰性后普通
    async fn resume_level(self: &Arc<Self>, level: u32) {
        let members: Vec<Arc<ModuleRecord>> = self
            .registry()
            .snapshot()
            .into_iter()
            .filter(|r| !r.id().is_system() && !r.is_fragment() && r.start_level() == level)
            .filter(|r| r.persistent_status().contains(PersistentStatus::STARTED))
            .collect();
        if members.is_empty() {
            return;
        }

        // 先解析，依赖排序需要接线
        let unresolved: Vec<ModuleId> = members
            .iter()
            .filter(|r| r.state() == ModuleState::Installed)
            .map(|r| r.id())
            .collect();
        if !unresolved.is_empty() {
            let mut pending = PendingEvents::new();
            if let Err(e) = self.resolve_modules(&unresolved, false, &mut pending).await {
                warn!(level, error = %e, "解析级别内模块失败");
                pending.error(ModuleId::SYSTEM, None, &e);
            }
            pending.publish(self.events());
        }

        let (lazy, eager): (Vec<_>, Vec<_>) = members.into_iter().partition(|r| {
            r.descriptor().lazy_activation
                && r.persistent_status()
                    .contains(PersistentStatus::ACTIVATION_POLICY)
        });
        debug!(level, lazy = lazy.len(), eager = eager.len(), "恢复级别");

        for record in self.dependency_sorted(lazy) {
            self.resume_module(&record).await;
        }
        for record in self.dependency_sorted(eager) {
            self.resume_module(&record).await;
        }
    }

    /// 暂停启动级别不低于 `level` 的运行中模块，按 ID 降序
    async fn suspend_level(self: &Arc<Self>, level: u32) {
        let mut members: Vec<Arc<ModuleRecord>> = self
            .registry()
            .snapshot()
            .into_iter()
            .filter(|r| !r.id().is_system() && r.start_level() >= level && r.state().is_started())
            .collect();
        members.sort_by_key(|r| Reverse(r.id()));
        debug!(level, modules = members.len(), "暂停级别");

        for record in members {
            self.suspend_module(&record).await;
        }
    }

    /// 拆除所有模块的接线，丢弃所有待移除修订
    async fn unload_all(self: &Arc<Self>) {
        let mut pending = PendingEvents::new();
        let mut guards = Vec::new();
        let mut locked = Vec::new();

        for record in self.registry().snapshot() {
            match self.lock_module(&record).await {
                Ok(guard) => {
                    guards.push(guard);
                    locked.push(record);
                }
                Err(e) => {
                    warn!(module_id = %record.id(), error = %e, "卸载接线时无法锁定模块");
                    pending.error(record.id(), Some(record.location()), &e);
                }
            }
        }

        {
            let _pass = self.resolve_lock.lock().await;
            for record in &locked {
                if record.state() != ModuleState::Resolved {
                    continue;
                }
                self.unwire(&record.revision());
                if record.set_state(ModuleState::Installed).is_ok() {
                    pending.module(ModuleEventKind::Unresolved, record);
                }
            }
            for revision in self.registry().removal_pending() {
                self.unwire(&revision);
                self.registry().discard_removal_pending(revision.supplier_ref());
            }
        }

        drop(guards);
        info!(modules = locked.len(), "已拆除全部接线");
        pending.publish(self.events());
    }

    /// 调整模块启动级别并按新级别停止或恢复
    pub(crate) async fn apply_module_level(self: &Arc<Self>, module: ModuleId, level: u32) -> Result<()> {
        if module.is_system() {
            return Err(RuntimeError::SystemModuleOperation("修改启动级别".to_string()));
        }
        if level == 0 {
            return Err(RuntimeError::InvalidStartLevel(0));
        }
        let record = self.registry().require(module)?;
        let previous = record.set_start_level(level);
        if previous == level {
            return Ok(());
        }
        info!(module_id = %module, from = previous, to = level, "模块启动级别已调整");

        let mut pending = PendingEvents::new();
        self.persist(module, &mut pending).await;
        pending.publish(self.events());

        let active = self.active_level();
        if level > active && record.state().is_started() {
            self.suspend_module(&record).await;
        } else if level <= active
            && !record.state().is_started()
            && !record.is_fragment()
            && record.persistent_status().contains(PersistentStatus::STARTED)
        {
            self.resume_module(&record).await;
        }
        Ok(())
    }

    /// 降到 0 级再回到之前的级别（在批量工作者上）
    pub(crate) async fn restart_in_place(self: &Arc<Self>) -> Result<()> {
        let level = match self.active_level() {
            0 => self.config().modules.beginning_level,
            level => level,
        };
        info!(level, "进程内重启");
        self.change_level(0).await?;
        self.prepare_launch().await?;
        self.change_level(level).await
    }

    /// 启动系统模块并解析所有可解析的模块
    async fn prepare_launch(self: &Arc<Self>) -> Result<()> {
        let system = self.registry().require(ModuleId::SYSTEM)?;
        let mut pending = PendingEvents::new();
        let result = {
            let _guard = self.lock_module(&system).await?;
            self.start_worker(&system, StartOptions::TRANSIENT, false, &mut pending)
                .await
        };
        pending.publish(self.events());
        result?;

        let mut pending = PendingEvents::new();
        let result = self.resolve_modules(&[], true, &mut pending).await;
        pending.publish(self.events());
        let delta = result?;
        debug!(resolved = delta.resolved.len(), failures = delta.failures.len(), "启动时解析完成");
        Ok(())
    }

    async fn stop_system(self: &Arc<Self>) {
        let Some(system) = self.registry().get(ModuleId::SYSTEM) else {
            return;
        };
        self.suspend_module(&system).await;
    }
}
