//! 模块描述解析器
//!
//! 负责从 module.yaml / module.json 文件解析模块描述。

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::module::metadata::ModuleDescriptor;
use crate::utils::{Result, RuntimeError};

/// 符号名：点分标识符，各段允许连字符
static SYMBOLIC_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*(\.[A-Za-z_][A-Za-z0-9_\-]*)*$")
        .expect("Invalid symbolic name regex")
});

/// 包名：点分标识符
static PACKAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("Invalid package regex")
});

/// 动态导入模式：`*`、`a.b.*` 或精确包名
static DYNAMIC_IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*|[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*(\.\*)?)$")
        .expect("Invalid dynamic import regex")
});

/// 模块描述解析器
///
/// 提供从文件或字符串解析模块描述的功能。
#[derive(Debug, Clone, Default)]
pub struct ModuleParser;

impl ModuleParser {
    /// 创建新的解析器实例
    pub fn new() -> Self {
        Self
    }

    /// 从文件解析模块描述
    ///
    /// `.json` 扩展名按 JSON 解析，其余按 YAML 解析。
    ///
    /// # Errors
    ///
    /// - 文件不存在或无法读取时返回 IO 错误
    /// - 内容格式错误时返回 `Yaml`/`Json` 错误
    /// - 验证失败时返回 `InvalidDescriptor` 错误
    pub async fn parse_file(path: &Path) -> Result<ModuleDescriptor> {
        let content = tokio::fs::read_to_string(path).await?;
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            Self::parse_json(&content)
        } else {
            Self::parse_str(&content)
        }
    }

    /// 从 YAML 字符串解析模块描述
    pub fn parse_str(content: &str) -> Result<ModuleDescriptor> {
        let descriptor: ModuleDescriptor = serde_yaml::from_str(content)?;
        Self::validate(&descriptor)?;
        Ok(descriptor)
    }

    /// 从 JSON 字符串解析模块描述
    pub fn parse_json(content: &str) -> Result<ModuleDescriptor> {
        let descriptor: ModuleDescriptor = serde_json::from_str(content)?;
        Self::validate(&descriptor)?;
        Ok(descriptor)
    }

    /// 验证模块描述
    ///
    /// 在结构校验之外检查：
    /// - 符号名格式（点分标识符，允许连字符）
    /// - 导出、导入包名格式
    /// - 动态导入模式（`*`、`a.b.*` 或精确包名）
    /// - 依赖和宿主的符号名格式
    pub fn validate(descriptor: &ModuleDescriptor) -> Result<()> {
        let mut errors = match descriptor.validate() {
            Ok(()) => vec![],
            Err(errors) => errors,
        };

        if let Some(name) = &descriptor.symbolic_name {
            if !Self::is_valid_symbolic_name(name) {
                errors.push(format!("符号名 '{}' 格式无效", name));
            }
        }

        for export in &descriptor.exports {
            if !export.name.is_empty() && !Self::is_valid_package(&export.name) {
                errors.push(format!("导出包名 '{}' 格式无效", export.name));
            }
        }

        for import in &descriptor.imports {
            if !import.name.is_empty() && !Self::is_valid_package(&import.name) {
                errors.push(format!("导入包名 '{}' 格式无效", import.name));
            }
        }

        for pattern in &descriptor.dynamic_imports {
            if !DYNAMIC_IMPORT_REGEX.is_match(pattern) {
                errors.push(format!("动态导入模式 '{}' 格式无效", pattern));
            }
        }

        for require in &descriptor.requires {
            if !Self::is_valid_symbolic_name(&require.symbolic_name) {
                errors.push(format!(
                    "依赖的符号名 '{}' 格式无效",
                    require.symbolic_name
                ));
            }
        }

        if let Some(host) = &descriptor.fragment_host {
            if !Self::is_valid_symbolic_name(&host.symbolic_name) {
                errors.push(format!("宿主符号名 '{}' 格式无效", host.symbolic_name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::InvalidDescriptor(errors.join("; ")))
        }
    }

    /// 检查符号名格式
    pub fn is_valid_symbolic_name(name: &str) -> bool {
        SYMBOLIC_NAME_REGEX.is_match(name)
    }

    /// 检查包名格式
    pub fn is_valid_package(name: &str) -> bool {
        PACKAGE_REGEX.is_match(name)
    }
}
