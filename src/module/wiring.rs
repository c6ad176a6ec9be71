//! 接线数据结构
//!
//! 依赖边以标识（模块 ID + 修订号）保存，通过注册表解析，不直接持有提供者。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::module::metadata::ModuleId;

/// 指向某个模块某个修订的引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SupplierRef {
    pub module: ModuleId,
    pub revision: u32,
}

impl SupplierRef {
    pub fn new(module: ModuleId, revision: u32) -> Self {
        Self { module, revision }
    }
}

impl fmt::Display for SupplierRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@r{}", self.module, self.revision)
    }
}

/// 包的提供者
///
/// 按包名缓存在每个模块上，包括显式的否定结果（`None`），避免重复遍历依赖图。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// 没有提供者
    None,
    /// 单一提供者
    Single(SupplierRef),
    /// 多个提供者，按查找顺序排列（再导出的依赖在前）
    Multiple(Vec<SupplierRef>),
}

impl PackageSource {
    /// 由提供者列表构造
    pub fn from_suppliers(mut suppliers: Vec<SupplierRef>) -> Self {
        match suppliers.len() {
            0 => PackageSource::None,
            1 => PackageSource::Single(suppliers.remove(0)),
            _ => PackageSource::Multiple(suppliers),
        }
    }

    /// 按查找顺序列出提供者
    pub fn suppliers(&self) -> &[SupplierRef] {
        match self {
            PackageSource::None => &[],
            PackageSource::Single(supplier) => std::slice::from_ref(supplier),
            PackageSource::Multiple(suppliers) => suppliers,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, PackageSource::None)
    }
}

/// 依赖的模块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredSupplier {
    pub supplier: SupplierRef,
    /// 是否再导出该模块的包
    pub reexport: bool,
}

/// 包名模式集合
///
/// 用于动态导入和启动委派：`*` 匹配全部，`a.b.*` 匹配 `a.b` 及其子包，其余为精确匹配。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackagePatterns {
    all: bool,
    exact: BTreeSet<String>,
    stems: Vec<String>,
}

impl PackagePatterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由模式字符串解析
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = Self::new();
        for pattern in patterns {
            result.add(pattern.as_ref());
        }
        result
    }

    /// 添加一个模式
    pub fn add(&mut self, pattern: &str) {
        let pattern = pattern.trim();
        if pattern == "*" {
            self.all = true;
        } else if let Some(stem) = pattern.strip_suffix(".*") {
            if !self.stems.iter().any(|s| s == stem) {
                self.stems.push(stem.to_string());
            }
        } else if !pattern.is_empty() {
            self.exact.insert(pattern.to_string());
        }
    }

    /// 合并另一组模式
    pub fn extend(&mut self, other: &PackagePatterns) {
        self.all |= other.all;
        self.exact.extend(other.exact.iter().cloned());
        for stem in &other.stems {
            if !self.stems.contains(stem) {
                self.stems.push(stem.clone());
            }
        }
    }

    /// 包名是否匹配
    pub fn matches(&self, package: &str) -> bool {
        if self.all || self.exact.contains(package) {
            return true;
        }
        self.stems.iter().any(|stem| {
            package == stem
                || (package.starts_with(stem.as_str())
                    && package.as_bytes().get(stem.len()) == Some(&b'.'))
        })
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.exact.is_empty() && self.stems.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_source_from_suppliers() {
        let a = SupplierRef::new(ModuleId(1), 0);
        let b = SupplierRef::new(ModuleId(2), 0);

        assert!(PackageSource::from_suppliers(vec![]).is_none());
        assert_eq!(PackageSource::from_suppliers(vec![a]), PackageSource::Single(a));
        let multiple = PackageSource::from_suppliers(vec![a, b]);
        assert_eq!(multiple.suppliers(), &[a, b]);
    }

    #[test]
    fn test_pattern_matching() {
        let patterns = PackagePatterns::from_patterns(["org.acme.*", "exact.pkg"]);

        assert!(patterns.matches("org.acme"));
        assert!(patterns.matches("org.acme.util"));
        assert!(!patterns.matches("org.acmeutil"));
        assert!(patterns.matches("exact.pkg"));
        assert!(!patterns.matches("exact.pkg.sub"));
        assert!(!patterns.matches("other"));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let patterns = PackagePatterns::from_patterns(["*"]);
        assert!(patterns.matches("anything.at.all"));
        assert!(PackagePatterns::new().is_empty());
    }
}
