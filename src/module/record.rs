//! 模块记录
//!
//! [`ModuleRecord`] 是单个模块的身份和生命周期状态机；[`Revision`] 是模块某次安装或更新
//! 对应的内容（描述、加载委派、代码加载器、片段附着和使用者集合）。更新会替换当前修订，
//! 旧修订在仍有使用者时保留在注册表的待移除表中。

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::delegate::LoadDelegate;
use super::metadata::{
    ModuleDescriptor, ModuleId, ModuleKind, ModuleSnapshot, ModuleState, PersistentStatus,
};
use super::runtime::LoaderHandle;
use super::state_lock::StateChangeLock;
use super::wiring::SupplierRef;
use crate::utils::{Result, RuntimeError};

/// 模块修订
#[derive(Debug)]
pub struct Revision {
    module: ModuleId,
    number: u32,
    descriptor: Arc<ModuleDescriptor>,
    delegate: RwLock<Option<Arc<LoadDelegate>>>,
    loader: Mutex<Option<Arc<dyn LoaderHandle>>>,
    /// 加载器实例化过一次后，片段顺序即被固定
    materialized: AtomicBool,
    /// 已附着的片段，按 ID 升序
    fragments: RwLock<Vec<ModuleId>>,
    /// 片段所附着的宿主
    host: RwLock<Option<ModuleId>>,
    /// 接线到此修订的模块
    users: Mutex<BTreeSet<ModuleId>>,
}

impl Revision {
    pub fn new(module: ModuleId, number: u32, descriptor: Arc<ModuleDescriptor>) -> Self {
        Self {
            module,
            number,
            descriptor,
            delegate: RwLock::new(None),
            loader: Mutex::new(None),
            materialized: AtomicBool::new(false),
            fragments: RwLock::new(Vec::new()),
            host: RwLock::new(None),
            users: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn supplier_ref(&self) -> SupplierRef {
        SupplierRef::new(self.module, self.number)
    }

    pub fn descriptor(&self) -> &Arc<ModuleDescriptor> {
        &self.descriptor
    }

    /// 当前加载委派；未解析时为空
    pub fn delegate(&self) -> Option<Arc<LoadDelegate>> {
        self.delegate.read().clone()
    }

    pub fn set_delegate(&self, delegate: Arc<LoadDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// 已实例化的加载器
    pub fn loader(&self) -> Option<Arc<dyn LoaderHandle>> {
        self.loader.lock().clone()
    }

    /// 保存新实例化的加载器
    ///
    /// 并发实例化时先到者胜出，后到者的句柄被关闭。
    pub fn install_loader(&self, handle: Arc<dyn LoaderHandle>) -> Arc<dyn LoaderHandle> {
        let mut slot = self.loader.lock();
        if let Some(existing) = slot.as_ref() {
            handle.close();
            return existing.clone();
        }
        *slot = Some(handle.clone());
        self.materialized.store(true, Ordering::Release);
        handle
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized.load(Ordering::Acquire)
    }

    pub fn fragments(&self) -> Vec<ModuleId> {
        self.fragments.read().clone()
    }

    /// 附着片段
    ///
    /// 片段按 ID 升序排列。加载器实例化之后只能追加到末尾；需要插入到已有片段之前时
    /// 返回 `FragmentOrder`。追加后关闭当前加载器，下一次查找时重新实例化。
    pub fn attach_fragment(&self, fragment: ModuleId) -> Result<()> {
        let mut fragments = self.fragments.write();
        if fragments.contains(&fragment) {
            return Ok(());
        }
        let position = fragments.partition_point(|existing| *existing < fragment);
        if position < fragments.len() && self.is_materialized() {
            return Err(RuntimeError::FragmentOrder {
                host: self.module,
                fragment,
                existing: fragments[position],
            });
        }
        fragments.insert(position, fragment);
        drop(fragments);

        if let Some(old) = self.loader.lock().take() {
            old.close();
        }
        Ok(())
    }

    pub fn detach_fragment(&self, fragment: ModuleId) {
        self.fragments.write().retain(|f| *f != fragment);
    }

    pub fn host(&self) -> Option<ModuleId> {
        *self.host.read()
    }

    pub fn set_host(&self, host: Option<ModuleId>) {
        *self.host.write() = host;
    }

    /// 标记 `user` 正在使用此修订
    pub fn add_user(&self, user: ModuleId) -> bool {
        if user == self.module {
            return false;
        }
        self.users.lock().insert(user)
    }

    pub fn remove_user(&self, user: ModuleId) -> bool {
        self.users.lock().remove(&user)
    }

    pub fn users(&self) -> Vec<ModuleId> {
        self.users.lock().iter().copied().collect()
    }

    pub fn has_users(&self) -> bool {
        !self.users.lock().is_empty()
    }

    /// 拆除接线：清空加载委派、关闭加载器、解除片段附着
    ///
    /// 返回被拆除的委派，调用方据此从提供者的使用者集合中注销。
    pub fn teardown(&self) -> Option<Arc<LoadDelegate>> {
        let delegate = self.delegate.write().take();
        if let Some(loader) = self.loader.lock().take() {
            loader.close();
        }
        self.materialized.store(false, Ordering::Release);
        self.fragments.write().clear();
        *self.host.write() = None;
        delegate
    }
}

/// 模块记录
#[derive(Debug)]
pub struct ModuleRecord {
    id: ModuleId,
    location: String,
    state: RwLock<ModuleState>,
    start_level: AtomicU32,
    status: Mutex<PersistentStatus>,
    lock: Arc<StateChangeLock>,
    current: RwLock<Arc<Revision>>,
    next_revision: AtomicU32,
    last_modified: RwLock<DateTime<Utc>>,
}

impl ModuleRecord {
    /// 创建新记录，状态为 INSTALLED
    pub fn new(
        id: ModuleId,
        location: impl Into<String>,
        descriptor: ModuleDescriptor,
        start_level: u32,
    ) -> Self {
        Self {
            id,
            location: location.into(),
            state: RwLock::new(ModuleState::Installed),
            start_level: AtomicU32::new(start_level),
            status: Mutex::new(PersistentStatus::empty()),
            lock: Arc::new(StateChangeLock::new()),
            current: RwLock::new(Arc::new(Revision::new(id, 0, Arc::new(descriptor)))),
            next_revision: AtomicU32::new(1),
            last_modified: RwLock::new(Utc::now()),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// 模块种类；普通模块由当前描述决定
    pub fn kind(&self) -> ModuleKind {
        if self.id.is_system() {
            ModuleKind::System
        } else {
            self.revision().descriptor().kind()
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.kind() == ModuleKind::Fragment
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }

    /// 状态转换
    ///
    /// 必须在持有状态变更锁时调用；不在转换表中的转换返回 `IllegalTransition`。
    pub fn set_state(&self, next: ModuleState) -> Result<ModuleState> {
        debug_assert!(self.lock.is_held(), "状态转换时未持有状态变更锁");
        let mut state = self.state.write();
        let previous = *state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            return Err(RuntimeError::IllegalTransition {
                module: self.id,
                from: previous.to_string(),
                to: next.to_string(),
            });
        }
        *state = next;
        drop(state);
        *self.last_modified.write() = Utc::now();
        tracing::trace!(module_id = %self.id, from = %previous, to = %next, "状态转换");
        Ok(previous)
    }

    pub fn start_level(&self) -> u32 {
        self.start_level.load(Ordering::SeqCst)
    }

    pub fn set_start_level(&self, level: u32) -> u32 {
        self.start_level.swap(level, Ordering::SeqCst)
    }

    pub fn persistent_status(&self) -> PersistentStatus {
        *self.status.lock()
    }

    /// 修改持久状态，返回是否有变化
    pub fn update_status(&self, f: impl FnOnce(&mut PersistentStatus)) -> bool {
        let mut status = self.status.lock();
        let before = *status;
        f(&mut status);
        before != *status
    }

    pub fn state_lock(&self) -> Arc<StateChangeLock> {
        self.lock.clone()
    }

    /// 当前修订
    pub fn revision(&self) -> Arc<Revision> {
        self.current.read().clone()
    }

    /// 用新描述替换当前修订，返回旧修订
    pub fn install_revision(&self, descriptor: ModuleDescriptor) -> Arc<Revision> {
        let number = self.next_revision.fetch_add(1, Ordering::SeqCst);
        let revision = Arc::new(Revision::new(self.id, number, Arc::new(descriptor)));
        let old = std::mem::replace(&mut *self.current.write(), revision);
        *self.last_modified.write() = Utc::now();
        old
    }

    pub fn descriptor(&self) -> Arc<ModuleDescriptor> {
        self.revision().descriptor().clone()
    }

    pub fn symbolic_name(&self) -> Option<String> {
        self.revision().descriptor().symbolic_name.clone()
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        *self.last_modified.read()
    }

    /// 只读快照
    pub fn snapshot(&self, removal_pending: bool) -> ModuleSnapshot {
        let revision = self.revision();
        ModuleSnapshot {
            id: self.id,
            location: self.location.clone(),
            symbolic_name: revision.descriptor().symbolic_name.clone(),
            version: revision.descriptor().version.clone(),
            kind: self.kind(),
            state: self.state(),
            start_level: self.start_level(),
            persistent_status: self.persistent_status(),
            revision: revision.number(),
            removal_pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::state_lock::ActorId;

    fn record(id: u64) -> ModuleRecord {
        ModuleRecord::new(
            ModuleId(id),
            format!("mem:{}", id),
            ModuleDescriptor::new(format!("m{}", id), semver::Version::new(1, 0, 0)),
            1,
        )
    }

    #[test]
    fn test_state_transitions_under_lock() {
        let record = record(1);
        let actor = ActorId::fresh();
        assert!(record.state_lock().try_begin(record.id(), actor).unwrap());

        record.set_state(ModuleState::Resolved).unwrap();
        record.set_state(ModuleState::Starting).unwrap();
        let err = record.set_state(ModuleState::Installed).unwrap_err();
        assert!(matches!(err, RuntimeError::IllegalTransition { .. }));
        assert_eq!(record.state(), ModuleState::Starting);

        record.state_lock().complete(actor);
    }

    #[test]
    fn test_revision_replacement() {
        let record = record(2);
        let old = record.install_revision(ModuleDescriptor::new("m2", semver::Version::new(2, 0, 0)));
        assert_eq!(old.number(), 0);
        assert_eq!(record.revision().number(), 1);
        assert_eq!(record.snapshot(false).version, semver::Version::new(2, 0, 0));
        assert_eq!(old.descriptor().version, semver::Version::new(1, 0, 0));
    }

    #[test]
    fn test_fragment_order_fixed_after_materialization() {
        let revision = Revision::new(ModuleId(1), 0, Arc::new(ModuleDescriptor::default()));
        revision.attach_fragment(ModuleId(5)).unwrap();
        revision.attach_fragment(ModuleId(3)).unwrap();
        assert_eq!(revision.fragments(), vec![ModuleId(3), ModuleId(5)]);

        let loader = crate::module::runtime::MemoryCodeLoader::new();
        let handle = crate::module::runtime::CodeLoader::materialize(&loader, ModuleId(1), &[]).unwrap();
        revision.install_loader(handle);
        assert!(revision.is_materialized());

        let err = revision.attach_fragment(ModuleId(4)).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::FragmentOrder { existing: ModuleId(5), .. }
        ));

        // 追加到末尾仍然允许，加载器需要重新实例化
        revision.attach_fragment(ModuleId(9)).unwrap();
        assert!(revision.loader().is_none());
        assert_eq!(revision.fragments(), vec![ModuleId(3), ModuleId(5), ModuleId(9)]);
    }

    #[test]
    fn test_users_exclude_self() {
        let revision = Revision::new(ModuleId(1), 0, Arc::new(ModuleDescriptor::default()));
        assert!(!revision.add_user(ModuleId(1)));
        assert!(revision.add_user(ModuleId(2)));
        assert!(revision.has_users());
        revision.remove_user(ModuleId(2));
        assert!(!revision.has_users());
    }
}
