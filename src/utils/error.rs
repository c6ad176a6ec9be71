//! 运行时错误类型定义
//!
//! 本模块定义了模块运行时中使用的所有错误类型。

use thiserror::Error;

use crate::module::ModuleId;

/// 模块运行时核心错误类型
#[derive(Error, Debug)]
pub enum RuntimeError {
    // ==================== 生命周期错误 ====================

    /// 状态变更锁等待超时（可重试）
    #[error("模块 {module} 状态变更等待超时: {timeout_ms}ms 后仍被其他执行者占用")]
    StateChangeTimeout {
        module: ModuleId,
        timeout_ms: u64,
    },

    /// 同一执行者重入状态变更（编程错误）
    #[error("模块 {0} 的状态变更被同一执行者递归进入")]
    SelfStateChangeRecursion(ModuleId),

    /// 同一执行者递归安装同一位置
    #[error("递归安装同一位置: '{0}'")]
    InstallRecursion(String),

    /// 同一位置正在被其他执行者安装
    #[error("位置 '{location}' 正在安装，等待 {timeout_ms}ms 后超时")]
    LocationBusy {
        location: String,
        timeout_ms: u64,
    },

    /// 非法状态转换
    #[error("模块 {module} 非法状态转换: {from} -> {to}")]
    IllegalTransition {
        module: ModuleId,
        from: String,
        to: String,
    },

    /// 模块已卸载
    #[error("模块 {0} 已卸载")]
    ModuleUninstalled(ModuleId),

    /// 激活钩子失败
    #[error("模块 {module} 激活失败: {source}")]
    ActivationFailure {
        module: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    /// 停用钩子失败
    #[error("模块 {module} 停用失败: {source}")]
    DeactivationFailure {
        module: ModuleId,
        #[source]
        source: anyhow::Error,
    },

    // ==================== 模块管理错误 ====================

    /// 模块未找到
    #[error("模块未找到: {0}")]
    ModuleNotFound(ModuleId),

    /// 符号名 + 版本冲突
    #[error("模块标识冲突: '{symbolic_name}' {version} 已由模块 {existing} 安装")]
    DuplicateModuleIdentity {
        symbolic_name: String,
        version: String,
        existing: ModuleId,
    },

    /// 无效的模块描述
    #[error("无效的模块描述: {0}")]
    InvalidDescriptor(String),

    /// 无效的启动级别
    #[error("无效的启动级别: {0}")]
    InvalidStartLevel(i64),

    /// 系统模块不允许此操作
    #[error("系统模块不允许此操作: {0}")]
    SystemModuleOperation(String),

    // ==================== 解析与加载错误 ====================

    /// 依赖约束无法满足
    #[error("模块 {module} 解析失败: {reason}")]
    ResolutionFailure {
        module: ModuleId,
        reason: String,
    },

    /// 导入包的提供者找不到条目（接线已损坏）
    #[error("模块 {module} 从 {supplier} 导入的包 '{package}' 中找不到 '{name}'")]
    ImportedEntryMissing {
        module: ModuleId,
        supplier: ModuleId,
        package: String,
        name: String,
    },

    /// 模块本地找不到条目
    #[error("模块 {module} 找不到 '{name}'")]
    EntryNotFound {
        module: ModuleId,
        name: String,
    },

    /// 片段附着顺序错误
    #[error("片段 {fragment} 无法附着到宿主 {host}: 代码加载器已实例化，不能插入到片段 {existing} 之前")]
    FragmentOrder {
        host: ModuleId,
        fragment: ModuleId,
        existing: ModuleId,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    /// 代码加载器失败
    #[error("模块 {module} 代码加载器实例化失败: {reason}")]
    CodeLoader {
        module: ModuleId,
        reason: String,
    },

    // ==================== 批量操作错误 ====================

    /// 刷新内部不变量被破坏
    #[error("刷新内部错误: {0}")]
    RefreshInternalError(String),

    /// 需要整体重启
    #[error("刷新闭包包含系统模块或扩展模块，需要整体重启")]
    RestartRequired,

    /// 批量工作者已关闭
    #[error("批量操作工作者已关闭")]
    WorkerClosed,

    // ==================== 持久化与配置错误 ====================

    /// 持久化失败
    #[error("持久化失败: {0}")]
    PersistenceError(String),

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// 错误码常量
pub mod error_code {
    // 生命周期错误 (LIFECYCLE-xxx)
    pub const LIFECYCLE_TIMEOUT: &str = "LIFECYCLE-001";
    pub const LIFECYCLE_RECURSION: &str = "LIFECYCLE-002";
    pub const LIFECYCLE_ILLEGAL_TRANSITION: &str = "LIFECYCLE-003";
    pub const LIFECYCLE_ACTIVATION: &str = "LIFECYCLE-004";
    pub const LIFECYCLE_UNINSTALLED: &str = "LIFECYCLE-005";
    pub const LIFECYCLE_LOCATION_BUSY: &str = "LIFECYCLE-006";

    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_DUPLICATE: &str = "MODULE-002";
    pub const MODULE_INVALID_DESCRIPTOR: &str = "MODULE-003";
    pub const MODULE_INSTALL_RECURSION: &str = "MODULE-004";
    pub const MODULE_INVALID_LEVEL: &str = "MODULE-005";

    // 解析错误 (RESOLVE-xxx)
    pub const RESOLVE_FAILED: &str = "RESOLVE-001";
    pub const RESOLVE_IMPORTED_MISSING: &str = "RESOLVE-002";
    pub const RESOLVE_NOT_FOUND: &str = "RESOLVE-003";
    pub const RESOLVE_FRAGMENT_ORDER: &str = "RESOLVE-004";
    pub const RESOLVE_CIRCULAR: &str = "RESOLVE-005";
    pub const RESOLVE_CODE_LOADER: &str = "RESOLVE-006";

    // 刷新错误 (REFRESH-xxx)
    pub const REFRESH_INTERNAL: &str = "REFRESH-001";
    pub const REFRESH_RESTART: &str = "REFRESH-002";

    // 持久化错误 (STORAGE-xxx)
    pub const STORAGE_FAILED: &str = "STORAGE-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
}

impl RuntimeError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::StateChangeTimeout { .. } => error_code::LIFECYCLE_TIMEOUT,
            RuntimeError::SelfStateChangeRecursion(_) => error_code::LIFECYCLE_RECURSION,
            RuntimeError::IllegalTransition { .. } => error_code::LIFECYCLE_ILLEGAL_TRANSITION,
            RuntimeError::ActivationFailure { .. } | RuntimeError::DeactivationFailure { .. } => {
                error_code::LIFECYCLE_ACTIVATION
            }
            RuntimeError::ModuleUninstalled(_) => error_code::LIFECYCLE_UNINSTALLED,
            RuntimeError::LocationBusy { .. } => error_code::LIFECYCLE_LOCATION_BUSY,
            RuntimeError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            RuntimeError::DuplicateModuleIdentity { .. } => error_code::MODULE_DUPLICATE,
            RuntimeError::InvalidDescriptor(_) => error_code::MODULE_INVALID_DESCRIPTOR,
            RuntimeError::InstallRecursion(_) => error_code::MODULE_INSTALL_RECURSION,
            RuntimeError::InvalidStartLevel(_) => error_code::MODULE_INVALID_LEVEL,
            RuntimeError::ResolutionFailure { .. } => error_code::RESOLVE_FAILED,
            RuntimeError::ImportedEntryMissing { .. } => error_code::RESOLVE_IMPORTED_MISSING,
            RuntimeError::EntryNotFound { .. } => error_code::RESOLVE_NOT_FOUND,
            RuntimeError::FragmentOrder { .. } => error_code::RESOLVE_FRAGMENT_ORDER,
            RuntimeError::CircularDependency(_) => error_code::RESOLVE_CIRCULAR,
            RuntimeError::CodeLoader { .. } => error_code::RESOLVE_CODE_LOADER,
            RuntimeError::RefreshInternalError(_) => error_code::REFRESH_INTERNAL,
            RuntimeError::RestartRequired => error_code::REFRESH_RESTART,
            RuntimeError::PersistenceError(_) => error_code::STORAGE_FAILED,
            RuntimeError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            RuntimeError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 是否可由调用方重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::StateChangeTimeout { .. } | RuntimeError::LocationBusy { .. }
        )
    }

    /// 是否为查找类失败（包括导入缺失和本地未找到）
    pub fn is_lookup_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::ImportedEntryMissing { .. } | RuntimeError::EntryNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::ModuleNotFound(ModuleId(7));
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_error_code() {
        let err = RuntimeError::StateChangeTimeout {
            module: ModuleId(1),
            timeout_ms: 5000,
        };
        assert_eq!(err.error_code(), error_code::LIFECYCLE_TIMEOUT);
        assert!(err.is_retryable());

        let err = RuntimeError::SelfStateChangeRecursion(ModuleId(1));
        assert_eq!(err.error_code(), error_code::LIFECYCLE_RECURSION);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_lookup_failures_are_distinguishable() {
        let missing = RuntimeError::ImportedEntryMissing {
            module: ModuleId(2),
            supplier: ModuleId(1),
            package: "p".to_string(),
            name: "p.A".to_string(),
        };
        let not_found = RuntimeError::EntryNotFound {
            module: ModuleId(2),
            name: "q.B".to_string(),
        };
        assert!(missing.is_lookup_failure());
        assert!(not_found.is_lookup_failure());
        assert_ne!(missing.error_code(), not_found.error_code());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RuntimeError = io_err.into();
        assert!(matches!(err, RuntimeError::Io(_)));
    }
}
