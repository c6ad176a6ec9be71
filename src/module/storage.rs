//! 模块记录持久化
//!
//! 把已安装模块的身份、启动级别、持久状态和描述保存到 `<data_dir>/modules.yaml`，
//! 进程重启后按原 ID 恢复。写入先落到临时文件再重命名，避免留下半个文件。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::metadata::{ModuleDescriptor, ModuleId, PersistentStatus};
use crate::utils::{Result, RuntimeError};

/// 记录文件名
pub const RECORD_FILE: &str = "modules.yaml";

/// 单个模块的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedModule {
    pub id: ModuleId,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbolic_name: Option<String>,
    pub version: semver::Version,
    pub start_level: u32,
    #[serde(default)]
    pub status: PersistentStatus,
    pub descriptor: ModuleDescriptor,
}

/// 持久化的运行时状态
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// 下一个将被分配的模块 ID
    pub next_id: u64,
    /// 新安装模块的启动级别
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_module_level: Option<u32>,
    #[serde(default)]
    pub modules: Vec<PersistedModule>,
}

impl PersistedState {
    /// 已使用的最大模块 ID
    pub fn max_used_id(&self) -> u64 {
        self.modules
            .iter()
            .map(|m| m.id.0)
            .max()
            .unwrap_or(0)
            .max(self.next_id.saturating_sub(1))
    }
}

/// 模块记录存储
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    /// 串行化写入：快照在持锁期间生成，后写入的一定是更新的状态
    write_lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(RECORD_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取持久化状态；文件不存在时返回 `None`
    pub async fn load(&self) -> Result<Option<PersistedState>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RuntimeError::PersistenceError(format!(
                    "读取 {} 失败: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let state: PersistedState = serde_yaml::from_str(&content).map_err(|e| {
            RuntimeError::PersistenceError(format!("解析 {} 失败: {}", self.path.display(), e))
        })?;
        tracing::debug!(
            path = %self.path.display(),
            modules = state.modules.len(),
            "读取模块记录"
        );
        Ok(Some(state))
    }

    /// 在写锁内生成快照并保存
    pub async fn save_with<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> PersistedState,
    {
        let _guard = self.write_lock.lock().await;
        let state = snapshot();
        self.write(&state).await
    }

    async fn write(&self, state: &PersistedState) -> Result<()> {
        let content = serde_yaml::to_string(state)
            .map_err(|e| RuntimeError::PersistenceError(format!("序列化模块记录失败: {}", e)))?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                RuntimeError::PersistenceError(format!("创建 {} 失败: {}", dir.display(), e))
            })?;
        }

        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, content).await.map_err(|e| {
            RuntimeError::PersistenceError(format!("写入 {} 失败: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            RuntimeError::PersistenceError(format!("替换 {} 失败: {}", self.path.display(), e))
        })?;

        tracing::trace!(path = %self.path.display(), modules = state.modules.len(), "保存模块记录");
        Ok(())
    }
}
