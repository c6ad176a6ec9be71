//! 刷新
//!
//! 把更新或卸载留下的旧修订真正移除，并让受影响的模块重新解析到当前修订上。
//! 刷新总在批量工作者上执行：
//!
//! 1. 计算受影响闭包（使用者、片段、宿主，直到不再增长）
//! 2. 按 (启动级别, ID) 逆序暂停闭包内的模块并持有它们的状态变更锁
//! 3. 拆除闭包的接线，丢弃不再被使用的待移除修订
//! 4. 重新解析，按获取顺序释放锁，发布事件
//! 5. 按 (启动级别, 依赖, ID) 恢复之前运行或仍符合条件的模块
//!
//! 单个模块的失败只产生 ERROR 事件，不中断刷新。

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::manager::{ModuleManager, PendingEvents};
use super::metadata::{ModuleId, ModuleState, PersistentStatus};
use super::record::ModuleRecord;
use super::worker::{Job, JobHandle};
use crate::event::ModuleEventKind;
use crate::utils::{Result, RuntimeError};

impl ModuleManager {
    /// 刷新闭包：种子模块及其所有修订的使用者、已附着片段和宿主的传递闭包
    pub fn refresh_closure(&self, seeds: &[ModuleId]) -> BTreeSet<ModuleId> {
        let mut closure: BTreeSet<ModuleId> = seeds.iter().copied().collect();
        let mut queue: Vec<ModuleId> = seeds.to_vec();

        while let Some(id) = queue.pop() {
            for revision in self.revisions_of(id) {
                let related = revision
                    .users()
                    .into_iter()
                    .chain(revision.fragments())
                    .chain(revision.host());
                for other in related {
                    if closure.insert(other) {
                        queue.push(other);
                    }
                }
            }
        }
        closure
    }

    /// 把刷新排入批量工作者；空列表表示所有待移除的模块
    pub fn refresh_async(&self, seeds: Vec<ModuleId>) -> Result<JobHandle> {
        self.submit(Job::Refresh(seeds))
    }

    /// 刷新并等待完成
    pub async fn refresh_sync(&self, seeds: Vec<ModuleId>) -> Result<()> {
        self.submit_and_wait(Job::Refresh(seeds)).await
    }

    /// 执行刷新（在批量工作者上）
    ///
    /// 闭包包含系统模块或扩展模块时不做任何改变，返回 `RestartRequired`。
    pub(crate) async fn refresh(self: &Arc<Self>, seeds: Vec<ModuleId>) -> Result<()> {
        let seeds: Vec<ModuleId> = if seeds.is_empty() {
            self.registry()
                .removal_pending()
                .iter()
                .map(|r| r.module())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            seeds
        };
        if seeds.is_empty() {
            debug!("没有待移除的修订，跳过刷新");
            return Ok(());
        }

        let closure = self.refresh_closure(&seeds);
        if closure.iter().any(|id| self.requires_restart(*id)) {
            return Err(RuntimeError::RestartRequired);
        }
        info!(seeds = ?seeds, closure = ?closure, "开始刷新");

        let mut records: Vec<Arc<ModuleRecord>> = closure
            .iter()
            .filter_map(|id| self.registry().get(*id))
            .collect();
        records.sort_by_key(|r| (r.start_level(), r.id()));

        let mut pending = PendingEvents::new();
        let mut guards = Vec::with_capacity(records.len());
        let mut locked = Vec::with_capacity(records.len());
        let mut was_active = BTreeSet::new();

        for record in records.iter().rev() {
            let guard = match self.lock_module(record).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(module_id = %record.id(), error = %e, "无法锁定模块，跳过");
                    pending.error(record.id(), Some(record.location()), &e);
                    continue;
                }
            };
            if record.state().is_started() {
                was_active.insert(record.id());
                if let Err(e) = self.stop_worker(record, &mut pending).await {
                    pending.error(record.id(), Some(record.location()), &e);
                }
            }
            guards.push(guard);
            locked.push(record.clone());
        }

        {
            let _pass = self.resolve_lock.lock().await;

            for record in &locked {
                if record.state() != ModuleState::Resolved {
                    continue;
                }
                self.unwire(&record.revision());
                match record.set_state(ModuleState::Installed) {
                    Ok(_) => pending.module(ModuleEventKind::Unresolved, record),
                    Err(e) => warn!(module_id = %record.id(), error = %e, "取消解析失败"),
                }
            }

            let retired: Vec<_> = self
                .registry()
                .removal_pending()
                .into_iter()
                .filter(|r| closure.contains(&r.module()))
                .collect();
            for revision in &retired {
                self.unwire(revision);
            }
            for revision in retired {
                if revision.has_users() {
                    let err = RuntimeError::RefreshInternalError(format!(
                        "模块 {} 修订 {} 仍被 {:?} 使用",
                        revision.module(),
                        revision.number(),
                        revision.users()
                    ));
                    error!(module_id = %revision.module(), error = %err, "待移除修订仍有使用者");
                    pending.error(revision.module(), None, &err);
                    continue;
                }
                self.registry().discard_removal_pending(revision.supplier_ref());
                debug!(module_id = %revision.module(), revision = revision.number(), "丢弃旧修订");
            }

            let targets: Vec<ModuleId> = locked.iter().map(|r| r.id()).collect();
            if let Err(e) = self.resolve_pass(&targets, false, &mut pending) {
                warn!(error = %e, "刷新后重新解析失败");
                pending.error(ModuleId::SYSTEM, None, &e);
            }
        }

        // Vec 按元素顺序析构，即按获取顺序释放
        drop(guards);
        pending.publish(self.events());

        let active_level = self.active_level();
        let eligible: Vec<Arc<ModuleRecord>> = locked
            .into_iter()
            .filter(|r| r.state().is_resolved() && !r.is_fragment())
            .filter(|r| {
                was_active.contains(&r.id())
                    || (r.persistent_status().contains(PersistentStatus::STARTED)
                        && r.start_level() <= active_level)
            })
            .collect();
        let resumed = eligible.len();
        for record in self.resume_order(eligible) {
            self.resume_module(&record).await;
        }

        info!(closure = closure.len(), resumed, "刷新完成");
        Ok(())
    }

    /// 模块（任一修订）是系统模块或扩展模块时，只能通过整体重启生效
    fn requires_restart(&self, module: ModuleId) -> bool {
        module.is_system()
            || self
                .revisions_of(module)
                .iter()
                .any(|revision| revision.descriptor().extension)
    }
}
