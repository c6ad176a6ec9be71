//! 模块元数据定义
//!
//! 定义模块描述（module.yaml）中的数据结构，以及模块标识、状态和状态标志。

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 模块 ID
///
/// 安装时分配，整个安装周期内稳定，卸载后永不复用。系统模块固定为 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(pub u64);

impl ModuleId {
    /// 系统模块
    pub const SYSTEM: ModuleId = ModuleId(0);

    /// 是否为系统模块
    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ModuleId {
    fn from(value: u64) -> Self {
        ModuleId(value)
    }
}

/// 模块种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// 普通宿主模块
    Host,
    /// 片段，附着在宿主上，不能独立启动
    Fragment,
    /// 系统模块
    System,
}

/// 模块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// 已安装，未解析
    Installed,
    /// 已解析
    Resolved,
    /// 正在启动（惰性激活的模块会停留在此状态）
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载（终态）
    Uninstalled,
}

impl Default for ModuleState {
    fn default() -> Self {
        ModuleState::Installed
    }
}

impl ModuleState {
    /// 状态转换表
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Installed, Resolved)
                | (Resolved, Installed)
                | (Resolved, Starting)
                | (Starting, Active)
                | (Starting, Stopping)
                | (Active, Stopping)
                | (Stopping, Resolved)
                | (Installed, Uninstalled)
                | (Resolved, Uninstalled)
        )
    }

    /// 是否已解析（RESOLVED 及之后的运行态）
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            ModuleState::Resolved
                | ModuleState::Starting
                | ModuleState::Active
                | ModuleState::Stopping
        )
    }

    /// 是否处于启动宏状态
    pub fn is_started(self) -> bool {
        matches!(self, ModuleState::Starting | ModuleState::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags::bitflags! {
    /// 持久化状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PersistentStatus: u32 {
        /// 持久启动
        const STARTED = 1 << 0;
        /// 请求按激活策略（惰性）启动
        const ACTIVATION_POLICY = 1 << 1;
        /// 惰性触发已发生
        const LAZY_TRIGGER = 1 << 2;
    }
}

bitflags::bitflags! {
    /// 启动选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StartOptions: u32 {
        /// 不修改持久启动标志
        const TRANSIENT = 1 << 0;
        /// 遵循模块声明的激活策略
        const USE_ACTIVATION_POLICY = 1 << 1;
    }
}

bitflags::bitflags! {
    /// 停止选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StopOptions: u32 {
        /// 不清除持久启动标志
        const TRANSIENT = 1 << 0;
    }
}

fn any_version() -> VersionReq {
    VersionReq::STAR
}

fn zero_version() -> Version {
    Version::new(0, 0, 0)
}

/// 导出包声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSpec {
    /// 包名
    pub name: String,

    /// 包版本
    #[serde(default = "zero_version")]
    pub version: Version,
}

impl ExportSpec {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// 导入包声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    /// 包名
    pub name: String,

    /// 版本要求
    #[serde(default = "any_version")]
    pub version: VersionReq,

    /// 是否可选
    #[serde(default)]
    pub optional: bool,
}

impl ImportSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: any_version(),
            optional: false,
        }
    }

    /// 设置版本要求
    pub fn version(mut self, req: VersionReq) -> Self {
        self.version = req;
        self
    }

    /// 设置为可选导入
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// 模块依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequireSpec {
    /// 被依赖模块的符号名
    pub symbolic_name: String,

    /// 版本要求
    #[serde(default = "any_version")]
    pub version: VersionReq,

    /// 是否再导出被依赖模块的包
    #[serde(default)]
    pub reexport: bool,

    /// 是否可选
    #[serde(default)]
    pub optional: bool,
}

impl RequireSpec {
    pub fn new(symbolic_name: impl Into<String>) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version: any_version(),
            reexport: false,
            optional: false,
        }
    }

    /// 设置为再导出
    pub fn reexport(mut self) -> Self {
        self.reexport = true;
        self
    }

    /// 设置版本要求
    pub fn version(mut self, req: VersionReq) -> Self {
        self.version = req;
        self
    }

    /// 设置为可选依赖
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// 片段的宿主声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// 宿主符号名
    pub symbolic_name: String,

    /// 宿主版本要求
    #[serde(default = "any_version")]
    pub version: VersionReq,
}

/// 模块描述
///
/// 对应 module.yaml 文件中的内容。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// 符号名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbolic_name: Option<String>,

    /// 模块版本
    #[serde(default = "zero_version")]
    pub version: Version,

    /// 片段宿主（存在即为片段）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_host: Option<HostSpec>,

    /// 导出的包
    #[serde(default)]
    pub exports: Vec<ExportSpec>,

    /// 静态导入的包
    #[serde(default)]
    pub imports: Vec<ImportSpec>,

    /// 动态导入模式：`*`、`a.b.*` 或精确包名
    #[serde(default)]
    pub dynamic_imports: Vec<String>,

    /// 依赖的模块
    #[serde(default)]
    pub requires: Vec<RequireSpec>,

    /// 是否声明惰性激活
    #[serde(default)]
    pub lazy_activation: bool,

    /// 激活器名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activator: Option<String>,

    /// 类路径
    #[serde(default)]
    pub classpath: Vec<String>,

    /// 是否为系统模块扩展（只在进程启动时生效）
    #[serde(default)]
    pub extension: bool,

    /// 本地条目（名称 -> 内容）
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
}

impl Default for ModuleDescriptor {
    fn default() -> Self {
        Self {
            symbolic_name: None,
            version: zero_version(),
            fragment_host: None,
            exports: vec![],
            imports: vec![],
            dynamic_imports: vec![],
            requires: vec![],
            lazy_activation: false,
            activator: None,
            classpath: vec![],
            extension: false,
            entries: BTreeMap::new(),
        }
    }
}

impl ModuleDescriptor {
    /// 创建新的模块描述
    pub fn new(symbolic_name: impl Into<String>, version: Version) -> Self {
        Self {
            symbolic_name: Some(symbolic_name.into()),
            version,
            ..Default::default()
        }
    }

    /// 添加导出包
    pub fn export(mut self, name: impl Into<String>, version: Version) -> Self {
        self.exports.push(ExportSpec::new(name, version));
        self
    }

    /// 添加导入包
    pub fn import(mut self, spec: ImportSpec) -> Self {
        self.imports.push(spec);
        self
    }

    /// 添加动态导入模式
    pub fn dynamic_import(mut self, pattern: impl Into<String>) -> Self {
        self.dynamic_imports.push(pattern.into());
        self
    }

    /// 添加模块依赖
    pub fn require(mut self, spec: RequireSpec) -> Self {
        self.requires.push(spec);
        self
    }

    /// 声明为片段
    pub fn fragment_of(mut self, host: impl Into<String>) -> Self {
        self.fragment_host = Some(HostSpec {
            symbolic_name: host.into(),
            version: any_version(),
        });
        self
    }

    /// 声明惰性激活
    pub fn lazy(mut self) -> Self {
        self.lazy_activation = true;
        self
    }

    /// 设置激活器
    pub fn activator(mut self, name: impl Into<String>) -> Self {
        self.activator = Some(name.into());
        self
    }

    /// 添加本地条目
    pub fn entry(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.entries.insert(name.into(), content.into());
        self
    }

    /// 声明为系统模块扩展
    pub fn extension(mut self) -> Self {
        self.extension = true;
        self
    }

    /// 由描述推导出的模块种类
    pub fn kind(&self) -> ModuleKind {
        if self.fragment_host.is_some() {
            ModuleKind::Fragment
        } else {
            ModuleKind::Host
        }
    }

    /// 是否导出指定包
    pub fn exports_package(&self, package: &str) -> Option<&ExportSpec> {
        self.exports.iter().find(|e| e.name == package)
    }

    /// 验证描述的结构有效性
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];

        if let Some(name) = &self.symbolic_name {
            if name.trim().is_empty() {
                errors.push("符号名不能为空".to_string());
            }
        }

        if self.fragment_host.is_some() {
            if self.activator.is_some() {
                errors.push("片段不能声明激活器".to_string());
            }
            if self.lazy_activation {
                errors.push("片段不能声明惰性激活".to_string());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for export in &self.exports {
            if export.name.is_empty() {
                errors.push("导出包名不能为空".to_string());
            } else if !seen.insert(export.name.as_str()) {
                errors.push(format!("重复导出包: {}", export.name));
            }
        }

        for import in &self.imports {
            if import.name.is_empty() {
                errors.push("导入包名不能为空".to_string());
            }
        }

        for require in &self.requires {
            if Some(&require.symbolic_name) == self.symbolic_name.as_ref() {
                errors.push(format!("模块不能依赖自身: {}", require.symbolic_name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// 包名：条目名中最后一个 `.` 之前的部分；没有 `.` 时为默认包（空串）
pub fn package_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => "",
    }
}

/// 模块只读快照
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    pub id: ModuleId,
    pub location: String,
    pub symbolic_name: Option<String>,
    pub version: Version,
    pub kind: ModuleKind,
    pub state: ModuleState,
    pub start_level: u32,
    pub persistent_status: PersistentStatus,
    pub revision: u32,
    /// 是否有旧修订仍在等待移除
    pub removal_pending: bool,
}

impl ModuleSnapshot {
    /// 是否处于运行中
    pub fn is_active(&self) -> bool {
        self.state == ModuleState::Active
    }
}
