//! 加载委派
//!
//! 每个已解析模块的包、条目查找表：静态导入表、动态导入模式、依赖模块列表（带再导出标记）
//! 和依赖提供者缓存。查找名称 `N`（包 `P`）的顺序：
//!
//! 1. `P` 为默认包或匹配启动委派：委派给系统模块本地查找
//! 2. `P` 已导入（静态或已绑定的动态导入）：只委派给记录的导出者；导出者找不到时
//!    返回 `ImportedEntryMissing`，不再继续后续步骤
//! 3. `P` 可动态导入且尚未绑定：从注册表找到当前最佳导出者，绑定后按第 2 步委派
//! 4. 查询依赖提供者缓存（缺失时沿再导出链遍历并缓存，包括否定结果），依次尝试提供者
//! 5. 模块本地查找；仍找不到返回 `EntryNotFound`

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::metadata::{package_of, ModuleId};
use super::record::Revision;
use super::registry::ModuleRegistry;
use super::runtime::{ClasspathSegment, CodeLoader};
use super::wiring::{PackagePatterns, PackageSource, RequiredSupplier, SupplierRef};
use crate::utils::{Result, RuntimeError};

/// 查找所需的外部环境
#[derive(Clone, Copy)]
pub struct LookupContext<'a> {
    pub registry: &'a ModuleRegistry,
    pub code_loader: &'a dyn CodeLoader,
}

/// 查找结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundEntry {
    pub content: Vec<u8>,
    /// 定义该条目的模块（其加载器找到了条目）
    pub defined_by: ModuleId,
}

/// 解析时构建的查找表
#[derive(Debug, Clone, Default)]
pub struct DelegateTables {
    /// 静态导入：包名 -> 导出者
    pub imports: Vec<(String, SupplierRef)>,
    /// 动态导入模式
    pub dynamic: PackagePatterns,
    /// 依赖的模块，按声明顺序
    pub required: Vec<RequiredSupplier>,
    /// 导出的包（含已附着片段的导出）
    pub exports: BTreeSet<String>,
}

/// 模块加载委派
#[derive(Debug)]
pub struct LoadDelegate {
    module: ModuleId,
    revision: u32,
    imported: RwLock<HashMap<String, SupplierRef>>,
    dynamic: PackagePatterns,
    required: Vec<RequiredSupplier>,
    provider_cache: RwLock<HashMap<String, PackageSource>>,
    exports: BTreeSet<String>,
    boot: Arc<PackagePatterns>,
}

impl LoadDelegate {
    pub fn new(
        module: ModuleId,
        revision: u32,
        tables: DelegateTables,
        boot: Arc<PackagePatterns>,
    ) -> Self {
        Self {
            module,
            revision,
            imported: RwLock::new(tables.imports.into_iter().collect()),
            dynamic: tables.dynamic,
            required: tables.required,
            provider_cache: RwLock::new(HashMap::new()),
            exports: tables.exports,
            boot,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// 包的导入绑定
    pub fn imported(&self, package: &str) -> Option<SupplierRef> {
        self.imported.read().get(package).copied()
    }

    pub fn required(&self) -> &[RequiredSupplier] {
        &self.required
    }

    pub fn exports_package(&self, package: &str) -> bool {
        self.exports.contains(package)
    }

    /// 所有接线到的提供者（去重）
    pub fn suppliers(&self) -> Vec<SupplierRef> {
        let mut set: BTreeSet<SupplierRef> = self.imported.read().values().copied().collect();
        set.extend(self.required.iter().map(|r| r.supplier));
        set.into_iter().collect()
    }

    /// 追加附着片段后的委派
    ///
    /// 片段的静态导入只补充宿主尚未导入的包，依赖模块追加在宿主的依赖之后，
    /// 动态导入模式和导出集合取并集。新委派的提供者缓存为空。
    pub fn merged(&self, extra: DelegateTables) -> Self {
        let mut imported = self.imported.read().clone();
        for (package, supplier) in extra.imports {
            imported.entry(package).or_insert(supplier);
        }

        let mut required = self.required.clone();
        for candidate in extra.required {
            if !required.iter().any(|r| r.supplier == candidate.supplier) {
                required.push(candidate);
            }
        }

        let mut dynamic = self.dynamic.clone();
        dynamic.extend(&extra.dynamic);

        let mut exports = self.exports.clone();
        exports.extend(extra.exports);

        Self {
            module: self.module,
            revision: self.revision,
            imported: RwLock::new(imported),
            dynamic,
            required,
            provider_cache: RwLock::new(HashMap::new()),
            exports,
            boot: self.boot.clone(),
        }
    }

    /// 清空依赖提供者缓存
    pub fn clear_caches(&self) {
        self.provider_cache.write().clear();
    }

    /// 查找条目
    pub fn find_entry(&self, ctx: LookupContext<'_>, name: &str) -> Result<FoundEntry> {
        let package = package_of(name);

        // 1. 默认包和启动委派
        if package.is_empty() || self.boot.matches(package) {
            if let Some(found) = self.system_lookup(ctx, name)? {
                return Ok(found);
            }
            if package.is_empty() {
                return self.local_or_not_found(ctx, name);
            }
            return Err(RuntimeError::EntryNotFound {
                module: self.module,
                name: name.to_string(),
            });
        }

        // 2. 已导入的包
        if let Some(supplier) = self.imported(package) {
            return self.imported_lookup(ctx, supplier, package, name);
        }

        // 3. 动态导入
        if self.dynamic.matches(package) {
            if let Some(supplier) = self.bind_dynamic(ctx, package) {
                return self.imported_lookup(ctx, supplier, package, name);
            }
        }

        // 4. 依赖模块提供者
        let source = self.package_source(ctx, package);
        for supplier in source.suppliers() {
            if let Some(revision) = ctx.registry.revision(*supplier) {
                if let Some(content) = local_lookup(ctx, &revision, name)? {
                    return Ok(FoundEntry {
                        content,
                        defined_by: supplier.module,
                    });
                }
            }
        }

        // 5. 本地
        self.local_or_not_found(ctx, name)
    }

    /// 谁提供包 `package`（依赖模块链上），结果带否定缓存
    pub fn package_source(&self, ctx: LookupContext<'_>, package: &str) -> PackageSource {
        if let Some(cached) = self.provider_cache.read().get(package) {
            return cached.clone();
        }
        let source = self.compute_providers(ctx, package);
        // 并发填充时后写者胜出，结果相同
        self.provider_cache
            .write()
            .insert(package.to_string(), source.clone());
        source
    }

    fn compute_providers(&self, ctx: LookupContext<'_>, package: &str) -> PackageSource {
        if self.required.is_empty() {
            return PackageSource::None;
        }
        let mut visited = HashSet::from([self.module]);
        let mut result = Vec::new();

        let ordered = self
            .required
            .iter()
            .filter(|r| r.reexport)
            .chain(self.required.iter().filter(|r| !r.reexport));
        for required in ordered {
            collect_providers(ctx, required.supplier, package, &mut visited, &mut result);
        }
        PackageSource::from_suppliers(result)
    }

    fn bind_dynamic(&self, ctx: LookupContext<'_>, package: &str) -> Option<SupplierRef> {
        let supplier = ctx.registry.best_exporter(package, self.module)?;
        let revision = ctx.registry.revision(supplier)?;
        revision.add_user(self.module);
        self.imported
            .write()
            .entry(package.to_string())
            .or_insert(supplier);
        tracing::debug!(
            module_id = %self.module,
            package = package,
            supplier = %supplier,
            "绑定动态导入"
        );
        self.imported(package)
    }

    fn imported_lookup(
        &self,
        ctx: LookupContext<'_>,
        supplier: SupplierRef,
        package: &str,
        name: &str,
    ) -> Result<FoundEntry> {
        let missing = || RuntimeError::ImportedEntryMissing {
            module: self.module,
            supplier: supplier.module,
            package: package.to_string(),
            name: name.to_string(),
        };
        let revision = ctx.registry.revision(supplier).ok_or_else(missing)?;
        match local_lookup(ctx, &revision, name)? {
            Some(content) => Ok(FoundEntry {
                content,
                defined_by: supplier.module,
            }),
            None => Err(missing()),
        }
    }

    fn system_lookup(&self, ctx: LookupContext<'_>, name: &str) -> Result<Option<FoundEntry>> {
        let Some(system) = ctx.registry.get(ModuleId::SYSTEM) else {
            return Ok(None);
        };
        let revision = system.revision();
        Ok(local_lookup(ctx, &revision, name)?.map(|content| FoundEntry {
            content,
            defined_by: ModuleId::SYSTEM,
        }))
    }

    fn local_or_not_found(&self, ctx: LookupContext<'_>, name: &str) -> Result<FoundEntry> {
        let own = ctx
            .registry
            .revision(SupplierRef::new(self.module, self.revision));
        if let Some(revision) = own {
            if let Some(content) = local_lookup(ctx, &revision, name)? {
                return Ok(FoundEntry {
                    content,
                    defined_by: self.module,
                });
            }
        }
        Err(RuntimeError::EntryNotFound {
            module: self.module,
            name: name.to_string(),
        })
    }
}

fn collect_providers(
    ctx: LookupContext<'_>,
    supplier: SupplierRef,
    package: &str,
    visited: &mut HashSet<ModuleId>,
    result: &mut Vec<SupplierRef>,
) {
    if !visited.insert(supplier.module) {
        return;
    }
    let Some(revision) = ctx.registry.revision(supplier) else {
        return;
    };
    let delegate = revision.delegate();
    let exports = match &delegate {
        Some(delegate) => delegate.exports_package(package),
        None => revision.descriptor().exports_package(package).is_some(),
    };
    if exports {
        result.push(supplier);
    }
    if let Some(delegate) = delegate {
        for required in delegate.required().iter().filter(|r| r.reexport) {
            collect_providers(ctx, required.supplier, package, visited, result);
        }
    }
}

/// 在修订本地（含已附着片段）查找条目，按需实例化代码加载器
pub fn local_lookup(
    ctx: LookupContext<'_>,
    revision: &Revision,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let loader = match revision.loader() {
        Some(loader) => loader,
        None => {
            let classpath = classpath_of(ctx.registry, revision);
            let handle = ctx
                .code_loader
                .materialize(revision.module(), &classpath)
                .map_err(|e| RuntimeError::CodeLoader {
                    module: revision.module(),
                    reason: e.to_string(),
                })?;
            revision.install_loader(handle)
        }
    };
    Ok(loader.find_local(name))
}

/// 类路径：宿主自身，随后是按 ID 升序附着的片段
pub fn classpath_of(registry: &ModuleRegistry, revision: &Revision) -> Vec<ClasspathSegment> {
    let mut classpath = vec![ClasspathSegment {
        module: revision.module(),
        descriptor: revision.descriptor().clone(),
    }];
    for fragment in revision.fragments() {
        if let Some(record) = registry.get(fragment) {
            classpath.push(ClasspathSegment {
                module: fragment,
                descriptor: record.descriptor(),
            });
        }
    }
    classpath
}
