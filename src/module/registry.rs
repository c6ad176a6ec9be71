//! 模块注册表
//!
//! 已安装模块的权威集合，按 ID、安装位置和符号名索引。所有结构性修改（添加、移除）
//! 和整表快照都在同一把锁下进行。注册表同时保存待移除的旧修订。

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::metadata::{ModuleDescriptor, ModuleId};
use super::parser::ModuleParser;
use super::record::{ModuleRecord, Revision};
use super::state_lock::ActorId;
use super::wiring::SupplierRef;
use crate::utils::{IdSequence, Result, RuntimeError};

/// 模块描述文件扩展名
const DESCRIPTOR_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[derive(Debug, Default)]
struct RegistryInner {
    modules: BTreeMap<ModuleId, Arc<ModuleRecord>>,
    by_location: HashMap<String, ModuleId>,
    by_name: HashMap<String, BTreeSet<ModuleId>>,
    removal_pending: BTreeMap<SupplierRef, Arc<Revision>>,
}

/// 模块注册表
#[derive(Debug)]
pub struct ModuleRegistry {
    inner: RwLock<RegistryInner>,
    ids: IdSequence,
    /// 正在安装的位置 -> 执行者
    installing: Mutex<HashMap<String, ActorId>>,
    install_done: Notify,
    allow_duplicates: AtomicBool,
}

impl ModuleRegistry {
    /// 创建注册表；普通模块 ID 从 1 开始（0 保留给系统模块）
    pub fn new(allow_duplicates: bool) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            ids: IdSequence::starting_at(1),
            installing: Mutex::new(HashMap::new()),
            install_done: Notify::new(),
            allow_duplicates: AtomicBool::new(allow_duplicates),
        }
    }

    /// 分配新的模块 ID
    pub fn allocate_id(&self) -> ModuleId {
        ModuleId(self.ids.allocate())
    }

    /// 确保之后分配的 ID 都大于 `used`
    pub fn resume_ids_after(&self, used: u64) {
        self.ids.resume_after(used);
    }

    /// 下一个将被分配的 ID
    pub fn next_id(&self) -> u64 {
        self.ids.peek()
    }

    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates.load(Ordering::Relaxed)
    }

    /// 预留安装位置
    ///
    /// 同一执行者递归安装同一位置返回 `InstallRecursion`；其他执行者正在安装时最多等待
    /// `timeout`。返回的预留在丢弃时释放。
    pub async fn reserve_location(
        &self,
        location: &str,
        actor: ActorId,
        timeout: Duration,
    ) -> Result<LocationReservation<'_>> {
        let deadline = Instant::now() + timeout;
        loop {
            let done = self.install_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();

            {
                let mut installing = self.installing.lock();
                match installing.get(location) {
                    None => {
                        installing.insert(location.to_string(), actor);
                        return Ok(LocationReservation {
                            registry: self,
                            location: location.to_string(),
                        });
                    }
                    Some(owner) if *owner == actor => {
                        return Err(RuntimeError::InstallRecursion(location.to_string()));
                    }
                    Some(_) => {}
                }
            }

            if tokio::time::timeout_at(deadline, done).await.is_err() {
                return Err(RuntimeError::LocationBusy {
                    location: location.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    fn release_location(&self, location: &str) {
        self.installing.lock().remove(location);
        self.install_done.notify_waiters();
    }

    /// 检查符号名 + 版本是否与其他模块冲突
    pub fn check_identity(&self, descriptor: &ModuleDescriptor, except: Option<ModuleId>) -> Result<()> {
        if self.allow_duplicates() {
            return Ok(());
        }
        let Some(name) = descriptor.symbolic_name.as_deref() else {
            return Ok(());
        };
        let inner = self.inner.read();
        Self::check_identity_locked(&inner, name, &descriptor.version, except)
    }

    fn check_identity_locked(
        inner: &RegistryInner,
        name: &str,
        version: &semver::Version,
        except: Option<ModuleId>,
    ) -> Result<()> {
        let Some(ids) = inner.by_name.get(name) else {
            return Ok(());
        };
        for id in ids {
            if Some(*id) == except {
                continue;
            }
            if let Some(record) = inner.modules.get(id) {
                if &record.revision().descriptor().version == version {
                    return Err(RuntimeError::DuplicateModuleIdentity {
                        symbolic_name: name.to_string(),
                        version: version.to_string(),
                        existing: *id,
                    });
                }
            }
        }
        Ok(())
    }

    /// 添加模块记录
    pub fn add(&self, record: Arc<ModuleRecord>) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_location.get(record.location()) {
            return Err(RuntimeError::InvalidDescriptor(format!(
                "位置 '{}' 已由模块 {} 安装",
                record.location(),
                existing
            )));
        }
        let descriptor = record.descriptor();
        if let Some(name) = descriptor.symbolic_name.as_deref() {
            if !self.allow_duplicates() {
                Self::check_identity_locked(&inner, name, &descriptor.version, None)?;
            }
            inner
                .by_name
                .entry(name.to_string())
                .or_default()
                .insert(record.id());
        }
        inner
            .by_location
            .insert(record.location().to_string(), record.id());
        inner.modules.insert(record.id(), record);
        Ok(())
    }

    /// 移除模块记录
    pub fn remove(&self, id: ModuleId) -> Option<Arc<ModuleRecord>> {
        let mut inner = self.inner.write();
        let record = inner.modules.remove(&id)?;
        inner.by_location.remove(record.location());
        if let Some(name) = record.symbolic_name() {
            Self::unindex_name(&mut inner, &name, id);
        }
        Some(record)
    }

    fn unindex_name(inner: &mut RegistryInner, name: &str, id: ModuleId) {
        if let Some(ids) = inner.by_name.get_mut(name) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_name.remove(name);
            }
        }
    }

    /// 更新后重建符号名索引
    pub fn reindex_name(&self, id: ModuleId, old: Option<&str>, new: Option<&str>) {
        let mut inner = self.inner.write();
        if let Some(old) = old {
            Self::unindex_name(&mut inner, old, id);
        }
        if let Some(new) = new {
            inner.by_name.entry(new.to_string()).or_default().insert(id);
        }
    }

    pub fn get(&self, id: ModuleId) -> Option<Arc<ModuleRecord>> {
        self.inner.read().modules.get(&id).cloned()
    }

    /// 获取模块记录，不存在时返回 `ModuleNotFound`
    pub fn require(&self, id: ModuleId) -> Result<Arc<ModuleRecord>> {
        self.get(id).ok_or(RuntimeError::ModuleNotFound(id))
    }

    pub fn find_by_location(&self, location: &str) -> Option<Arc<ModuleRecord>> {
        let inner = self.inner.read();
        inner
            .by_location
            .get(location)
            .and_then(|id| inner.modules.get(id))
            .cloned()
    }

    pub fn find_by_symbolic_name(&self, name: &str) -> Vec<Arc<ModuleRecord>> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.modules.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 所有模块，按 ID 升序
    pub fn snapshot(&self) -> Vec<Arc<ModuleRecord>> {
        self.inner.read().modules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().modules.is_empty()
    }

    /// 按引用查找修订：当前修订或待移除的旧修订
    pub fn revision(&self, supplier: SupplierRef) -> Option<Arc<Revision>> {
        let inner = self.inner.read();
        if let Some(record) = inner.modules.get(&supplier.module) {
            let current = record.revision();
            if current.number() == supplier.revision {
                return Some(current);
            }
        }
        inner.removal_pending.get(&supplier).cloned()
    }

    /// 将旧修订标记为待移除
    pub fn mark_removal_pending(&self, revision: Arc<Revision>) {
        tracing::debug!(
            module_id = %revision.module(),
            revision = revision.number(),
            users = ?revision.users(),
            "旧修订仍被使用，标记为待移除"
        );
        self.inner
            .write()
            .removal_pending
            .insert(revision.supplier_ref(), revision);
    }

    /// 所有待移除的修订
    pub fn removal_pending(&self) -> Vec<Arc<Revision>> {
        self.inner.read().removal_pending.values().cloned().collect()
    }

    /// 模块是否有待移除的修订
    pub fn is_removal_pending(&self, module: ModuleId) -> bool {
        self.inner
            .read()
            .removal_pending
            .keys()
            .any(|key| key.module == module)
    }

    /// 丢弃待移除的修订
    pub fn discard_removal_pending(&self, supplier: SupplierRef) -> Option<Arc<Revision>> {
        self.inner.write().removal_pending.remove(&supplier)
    }

    /// 当前最佳导出者：已解析模块中导出该包的最高版本，同版本取最小 ID
    ///
    /// 已附着片段导出的包算作宿主导出。
    pub fn best_exporter(&self, package: &str, exclude: ModuleId) -> Option<SupplierRef> {
        let inner = self.inner.read();
        let mut best: Option<(semver::Version, SupplierRef)> = None;
        for record in inner.modules.values() {
            if record.id() == exclude || !record.state().is_resolved() || record.is_fragment() {
                continue;
            }
            let revision = record.revision();
            let version = revision
                .descriptor()
                .exports_package(package)
                .map(|e| e.version.clone())
                .or_else(|| {
                    revision
                        .fragments()
                        .iter()
                        .filter_map(|f| inner.modules.get(f))
                        .find_map(|f| f.descriptor().exports_package(package).map(|e| e.version.clone()))
                });
            let Some(version) = version else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => version > *current,
            };
            if better {
                best = Some((version, revision.supplier_ref()));
            }
        }
        best.map(|(_, supplier)| supplier)
    }
}

/// 安装位置预留，丢弃时释放并唤醒等待者
#[derive(Debug)]
pub struct LocationReservation<'a> {
    registry: &'a ModuleRegistry,
    location: String,
}

impl Drop for LocationReservation<'_> {
    fn drop(&mut self) {
        self.registry.release_location(&self.location);
    }
}

/// 扫描描述目录，返回 `(位置, 描述)` 列表
///
/// 位置使用 `file:` 前缀加文件路径。解析失败的文件被跳过并记录警告。
pub async fn discover_descriptors(dirs: &[PathBuf]) -> Vec<(String, ModuleDescriptor)> {
    let mut found = Vec::new();

    for dir in dirs {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "描述目录不存在，跳过");
            continue;
        }

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "无法读取描述目录");
                continue;
            }
        };

        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_descriptor_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            match ModuleParser::parse_file(&path).await {
                Ok(descriptor) => {
                    found.push((format!("file:{}", path.display()), descriptor));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "解析模块描述失败");
                }
            }
        }
    }

    found
}

fn is_descriptor_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| DESCRIPTOR_EXTENSIONS.contains(&e))
            .unwrap_or(false)
}
