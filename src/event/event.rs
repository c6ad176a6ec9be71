//! 生命周期事件
//!
//! 定义模块生命周期通知的数据结构。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::module::ModuleId;
use crate::utils::{generate_uuid, RuntimeError};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleEventKind {
    Installed,
    Resolved,
    Unresolved,
    Starting,
    LazyActivation,
    Started,
    Stopping,
    Stopped,
    Updated,
    Uninstalled,
    LevelChanged,
    Error,
}

impl ModuleEventKind {
    /// 只投递给同步监听器、并在状态变更过程中内联投递的事件
    pub fn is_synchronous(self) -> bool {
        matches!(
            self,
            ModuleEventKind::Starting | ModuleEventKind::Stopping | ModuleEventKind::LazyActivation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleEventKind::Installed => "INSTALLED",
            ModuleEventKind::Resolved => "RESOLVED",
            ModuleEventKind::Unresolved => "UNRESOLVED",
            ModuleEventKind::Starting => "STARTING",
            ModuleEventKind::LazyActivation => "LAZY_ACTIVATION",
            ModuleEventKind::Started => "STARTED",
            ModuleEventKind::Stopping => "STOPPING",
            ModuleEventKind::Stopped => "STOPPED",
            ModuleEventKind::Updated => "UPDATED",
            ModuleEventKind::Uninstalled => "UNINSTALLED",
            ModuleEventKind::LevelChanged => "LEVEL_CHANGED",
            ModuleEventKind::Error => "ERROR",
        }
    }
}

impl fmt::Display for ModuleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模块事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEvent {
    /// 事件唯一标识
    pub event_id: String,

    /// 事件类型
    pub kind: ModuleEventKind,

    /// 相关模块（运行时级事件为系统模块）
    pub module: ModuleId,

    /// 模块安装位置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// 事件时间戳
    pub timestamp: DateTime<Utc>,

    /// 错误信息（ERROR 事件）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// 错误码（ERROR 事件）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// 启动级别（LEVEL_CHANGED 事件）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

impl ModuleEvent {
    /// 创建新事件
    pub fn new(kind: ModuleEventKind, module: ModuleId, location: Option<String>) -> Self {
        Self {
            event_id: generate_uuid(),
            kind,
            module,
            location,
            timestamp: Utc::now(),
            error: None,
            error_code: None,
            level: None,
        }
    }

    /// 运行时错误事件
    pub fn error(module: ModuleId, location: Option<String>, error: &RuntimeError) -> Self {
        let mut event = Self::new(ModuleEventKind::Error, module, location);
        event.error = Some(error.to_string());
        event.error_code = Some(error.error_code().to_string());
        event
    }

    /// 活动级别变更事件
    pub fn level_changed(level: u32) -> Self {
        let mut event = Self::new(ModuleEventKind::LevelChanged, ModuleId::SYSTEM, None);
        event.level = Some(level);
        event
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<ModuleEventKind>>,
    modules: Option<HashSet<ModuleId>>,
}

impl EventFilter {
    /// 匹配全部事件
    pub fn all() -> Self {
        Self::default()
    }

    /// 只匹配指定类型
    pub fn kinds(kinds: impl IntoIterator<Item = ModuleEventKind>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            modules: None,
        }
    }

    /// 只匹配指定模块
    pub fn for_module(mut self, module: ModuleId) -> Self {
        self.modules.get_or_insert_with(HashSet::new).insert(module);
        self
    }

    pub fn matches(&self, event: &ModuleEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(modules) = &self.modules {
            if !modules.contains(&event.module) {
                return false;
            }
        }
        true
    }
}
