//! 解析器
//!
//! [`Resolver`] 判断一组模块描述能否相互满足并给出接线结果。内核只消费它的输出：
//! 新解析模块的接线和新失效的模块。[`BasicResolver`] 是一个参考实现：
//!
//! 1. 不动点消除：反复移除必需导入、必需依赖或宿主无法满足的候选
//! 2. 贪心接线：已解析的提供者优先，其次版本最高，最后 ID 最小
//! 3. 片段附着到可解析的宿主，片段的导入和依赖合并进宿主；片段导出的包视为宿主导出
//! 4. 只返回目标及其传递需要的模块（`force_full` 时返回全部可解析模块）

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use semver::VersionReq;

use super::dependency::DependencyGraph;
use super::metadata::{ModuleDescriptor, ModuleId, ModuleKind};
use crate::utils::Result;

/// 解析候选
#[derive(Debug, Clone)]
pub struct ResolveCandidate {
    pub id: ModuleId,
    pub descriptor: Arc<ModuleDescriptor>,
    /// 当前是否已解析
    pub resolved: bool,
}

/// 解析请求
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// 全部候选（含已解析的模块和系统模块）
    pub candidates: Vec<ResolveCandidate>,
    /// 需要解析的模块
    pub targets: Vec<ModuleId>,
    /// 尝试解析所有未解析的候选
    pub force_full: bool,
}

/// 单个模块的接线结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWiring {
    pub module: ModuleId,
    /// 导入包 -> 导出者
    pub imports: Vec<(String, ModuleId)>,
    /// 依赖模块和再导出标记，按声明顺序
    pub requires: Vec<(ModuleId, bool)>,
    /// 片段附着的宿主
    pub host: Option<ModuleId>,
}

impl ResolvedWiring {
    pub fn new(module: ModuleId) -> Self {
        Self {
            module,
            imports: Vec::new(),
            requires: Vec::new(),
            host: None,
        }
    }

    /// 接线到的提供者（不含宿主）
    pub fn suppliers(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.imports
            .iter()
            .map(|(_, supplier)| *supplier)
            .chain(self.requires.iter().map(|(supplier, _)| *supplier))
    }
}

/// 解析结果增量
#[derive(Debug, Clone, Default)]
pub struct WiringDelta {
    /// 新解析的模块
    pub resolved: Vec<ResolvedWiring>,
    /// 新失效的模块
    pub unresolved: Vec<ModuleId>,
    /// 无法解析的模块及原因
    pub failures: BTreeMap<ModuleId, String>,
}

impl WiringDelta {
    pub fn is_resolved(&self, module: ModuleId) -> bool {
        self.resolved.iter().any(|w| w.module == module)
    }

    pub fn failure(&self, module: ModuleId) -> Option<&str> {
        self.failures.get(&module).map(String::as_str)
    }
}

/// 解析器接口
pub trait Resolver: Send + Sync {
    /// 计算接线增量
    fn resolve(&self, request: &ResolveRequest) -> Result<WiringDelta>;

    /// 依赖排序：提供者在使用者之前，`edges` 为 `(使用者, 提供者)`
    fn dependency_sort(&self, ids: &[ModuleId], edges: &[(ModuleId, ModuleId)]) -> Vec<ModuleId> {
        DependencyGraph::from_edges(ids, edges).dependency_order()
    }
}

/// 参考解析器
#[derive(Debug, Clone, Default)]
pub struct BasicResolver;

struct Pool<'a> {
    candidates: BTreeMap<ModuleId, &'a ResolveCandidate>,
    resolved: BTreeSet<ModuleId>,
    alive: BTreeSet<ModuleId>,
}

impl<'a> Pool<'a> {
    fn available(&self, id: ModuleId) -> bool {
        self.resolved.contains(&id) || self.alive.contains(&id)
    }

    fn available_candidates(&self) -> impl Iterator<Item = &'a ResolveCandidate> + '_ {
        self.candidates
            .values()
            .copied()
            .filter(|c| self.available(c.id))
    }

    /// 提供者优先级：已解析在前，版本高在前，ID 小在前
    fn prefer(&self, a: &ResolveCandidate, a_version: &semver::Version, b: &ResolveCandidate, b_version: &semver::Version) -> Ordering {
        self.resolved
            .contains(&b.id)
            .cmp(&self.resolved.contains(&a.id))
            .then_with(|| b_version.cmp(a_version))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// 包的最佳导出者；片段导出的包由其宿主提供
    fn best_exporter(&self, package: &str, req: &VersionReq, exclude: ModuleId) -> Option<ModuleId> {
        let mut matches: Vec<(&ResolveCandidate, &semver::Version)> = Vec::new();
        for candidate in self.available_candidates() {
            if candidate.id == exclude {
                continue;
            }
            let Some(export) = candidate
                .descriptor
                .exports_package(package)
                .filter(|e| req.matches(&e.version))
            else {
                continue;
            };
            let exporter = match &candidate.descriptor.fragment_host {
                Some(host) => match self
                    .best_module(&host.symbolic_name, &host.version, candidate.id)
                    .and_then(|id| self.candidates.get(&id).copied())
                {
                    Some(host) => host,
                    None => continue,
                },
                None => candidate,
            };
            if exporter.id != exclude {
                matches.push((exporter, &export.version));
            }
        }
        matches.sort_by(|(a, av), (b, bv)| self.prefer(a, av, b, bv));
        matches.first().map(|(c, _)| c.id)
    }

    fn best_module(&self, name: &str, req: &VersionReq, exclude: ModuleId) -> Option<ModuleId> {
        let mut matches: Vec<&ResolveCandidate> = self
            .available_candidates()
            .filter(|c| c.id != exclude && c.descriptor.kind() != ModuleKind::Fragment)
            .filter(|c| c.descriptor.symbolic_name.as_deref() == Some(name))
            .filter(|c| req.matches(&c.descriptor.version))
            .collect();
        matches.sort_by(|a, b| self.prefer(a, &a.descriptor.version, b, &b.descriptor.version));
        matches.first().map(|c| c.id)
    }

    /// 检查候选的必需项能否满足，返回第一个无法满足的原因
    fn check(&self, candidate: &ResolveCandidate) -> std::result::Result<(), String> {
        let descriptor = &candidate.descriptor;

        if let Some(host) = &descriptor.fragment_host {
            if self
                .best_module(&host.symbolic_name, &host.version, candidate.id)
                .is_none()
            {
                return Err(format!("宿主 '{}' ({}) 不可用", host.symbolic_name, host.version));
            }
        }

        for import in descriptor.imports.iter().filter(|i| !i.optional) {
            let self_export = descriptor.exports_package(&import.name).is_some();
            if !self_export
                && self
                    .best_exporter(&import.name, &import.version, candidate.id)
                    .is_none()
            {
                return Err(format!("缺少导入包 '{}' ({})", import.name, import.version));
            }
        }

        for require in descriptor.requires.iter().filter(|r| !r.optional) {
            if self
                .best_module(&require.symbolic_name, &require.version, candidate.id)
                .is_none()
            {
                return Err(format!(
                    "缺少依赖模块 '{}' ({})",
                    require.symbolic_name, require.version
                ));
            }
        }

        Ok(())
    }

    fn wire(&self, candidate: &ResolveCandidate) -> ResolvedWiring {
        let descriptor = &candidate.descriptor;
        let mut wiring = ResolvedWiring::new(candidate.id);

        if let Some(host) = &descriptor.fragment_host {
            // 片段自身的导入和依赖按宿主接线，供宿主已解析时追加附着
            wiring.host = self.best_module(&host.symbolic_name, &host.version, candidate.id);
            if let Some(host) = wiring.host {
                self.wire_requirements(descriptor, host, &mut wiring);
            }
            return wiring;
        }
        self.wire_requirements(descriptor, candidate.id, &mut wiring);
        wiring
    }

    fn wire_requirements(&self, descriptor: &ModuleDescriptor, owner: ModuleId, wiring: &mut ResolvedWiring) {
        for import in &descriptor.imports {
            if wiring.imports.iter().any(|(pkg, _)| pkg == &import.name) {
                continue;
            }
            if let Some(exporter) = self.best_exporter(&import.name, &import.version, owner) {
                wiring.imports.push((import.name.clone(), exporter));
            }
        }
        for require in &descriptor.requires {
            if let Some(supplier) = self.best_module(&require.symbolic_name, &require.version, owner) {
                if !wiring.requires.iter().any(|(id, _)| *id == supplier) {
                    wiring.requires.push((supplier, require.reexport));
                }
            }
        }
    }
}

impl Resolver for BasicResolver {
    fn resolve(&self, request: &ResolveRequest) -> Result<WiringDelta> {
        let mut pool = Pool {
            candidates: request.candidates.iter().map(|c| (c.id, c)).collect(),
            resolved: request
                .candidates
                .iter()
                .filter(|c| c.resolved)
                .map(|c| c.id)
                .collect(),
            alive: request
                .candidates
                .iter()
                .filter(|c| !c.resolved)
                .map(|c| c.id)
                .collect(),
        };

        let mut failures = BTreeMap::new();
        loop {
            let mut eliminated = Vec::new();
            for id in &pool.alive {
                if let Err(reason) = pool.check(pool.candidates[id]) {
                    eliminated.push((*id, reason));
                }
            }
            if eliminated.is_empty() {
                break;
            }
            for (id, reason) in eliminated {
                pool.alive.remove(&id);
                failures.insert(id, reason);
            }
        }

        let mut wirings: BTreeMap<ModuleId, ResolvedWiring> = pool
            .alive
            .iter()
            .map(|id| (*id, pool.wire(pool.candidates[id])))
            .collect();

        // 片段的导入和依赖合并进同批解析的宿主
        let attachments: Vec<(ModuleId, ModuleId)> = wirings
            .values()
            .filter_map(|w| w.host.map(|host| (w.module, host)))
            .collect();
        for (fragment, host) in &attachments {
            if let Some(mut host_wiring) = wirings.remove(host) {
                pool.wire_requirements(&pool.candidates[fragment].descriptor, *host, &mut host_wiring);
                wirings.insert(*host, host_wiring);
            }
        }

        let selected: BTreeSet<ModuleId> = if request.force_full || request.targets.is_empty() {
            pool.alive.clone()
        } else {
            let mut selected = BTreeSet::new();
            let mut stack: Vec<ModuleId> = request
                .targets
                .iter()
                .copied()
                .filter(|id| pool.alive.contains(id))
                .collect();
            while let Some(id) = stack.pop() {
                if !selected.insert(id) {
                    continue;
                }
                if let Some(wiring) = wirings.get(&id) {
                    for supplier in wiring.suppliers().chain(wiring.host) {
                        if pool.alive.contains(&supplier) && !selected.contains(&supplier) {
                            stack.push(supplier);
                        }
                    }
                }
                for (fragment, host) in &attachments {
                    if *host == id && !selected.contains(fragment) {
                        stack.push(*fragment);
                    }
                }
            }
            selected
        };

        let resolved = wirings
            .into_values()
            .filter(|w| selected.contains(&w.module))
            .collect();

        Ok(WiringDelta {
            resolved,
            unresolved: Vec::new(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::{ImportSpec, RequireSpec};
    use semver::Version;

    fn candidate(id: u64, descriptor: ModuleDescriptor, resolved: bool) -> ResolveCandidate {
        ResolveCandidate {
            id: ModuleId(id),
            descriptor: Arc::new(descriptor),
            resolved,
        }
    }

    fn request(candidates: Vec<ResolveCandidate>, targets: &[u64]) -> ResolveRequest {
        ResolveRequest {
            candidates,
            targets: targets.iter().map(|id| ModuleId(*id)).collect(),
            force_full: false,
        }
    }

    #[test]
    fn test_import_wired_to_exporter() {
        let a = ModuleDescriptor::new("a", Version::new(1, 0, 0)).export("p", Version::new(1, 0, 0));
        let b = ModuleDescriptor::new("b", Version::new(1, 0, 0)).import(ImportSpec::new("p"));

        let delta = BasicResolver
            .resolve(&request(vec![candidate(1, a, false), candidate(2, b, false)], &[2]))
            .unwrap();

        assert!(delta.is_resolved(ModuleId(1)));
        let b_wiring = delta.resolved.iter().find(|w| w.module == ModuleId(2)).unwrap();
        assert_eq!(b_wiring.imports, vec![("p".to_string(), ModuleId(1))]);
    }

    #[test]
    fn test_missing_import_fails_transitively() {
        let a = ModuleDescriptor::new("a", Version::new(1, 0, 0))
            .export("p", Version::new(1, 0, 0))
            .import(ImportSpec::new("missing"));
        let b = ModuleDescriptor::new("b", Version::new(1, 0, 0)).import(ImportSpec::new("p"));

        let delta = BasicResolver
            .resolve(&request(vec![candidate(1, a, false), candidate(2, b, false)], &[2]))
            .unwrap();

        assert!(delta.resolved.is_empty());
        assert!(delta.failure(ModuleId(1)).unwrap().contains("missing"));
        assert!(delta.failure(ModuleId(2)).unwrap().contains('p'));
    }

    #[test]
    fn test_prefers_resolved_then_highest_version() {
        let old = ModuleDescriptor::new("old", Version::new(1, 0, 0)).export("p", Version::new(1, 0, 0));
        let new = ModuleDescriptor::new("new", Version::new(1, 0, 0)).export("p", Version::new(1, 5, 0));
        let newer = ModuleDescriptor::new("newer", Version::new(1, 0, 0)).export("p", Version::new(2, 0, 0));
        let user = ModuleDescriptor::new("user", Version::new(1, 0, 0))
            .import(ImportSpec::new("p").version(VersionReq::parse("^1").unwrap()));

        let delta = BasicResolver
            .resolve(&request(
                vec![
                    candidate(1, old.clone(), true),
                    candidate(2, new.clone(), false),
                    candidate(3, newer, false),
                    candidate(4, user.clone(), false),
                ],
                &[4],
            ))
            .unwrap();
        let wiring = delta.resolved.iter().find(|w| w.module == ModuleId(4)).unwrap();
        assert_eq!(wiring.imports[0].1, ModuleId(1));

        let delta = BasicResolver
            .resolve(&request(
                vec![
                    candidate(1, old, false),
                    candidate(2, new, false),
                    candidate(4, user, false),
                ],
                &[4],
            ))
            .unwrap();
        let wiring = delta.resolved.iter().find(|w| w.module == ModuleId(4)).unwrap();
        assert_eq!(wiring.imports[0].1, ModuleId(2));
        // 只解析目标需要的模块
        assert!(!delta.is_resolved(ModuleId(1)));
    }

    #[test]
    fn test_requires_keep_declared_order() {
        let a = ModuleDescriptor::new("a", Version::new(1, 0, 0));
        let a2 = ModuleDescriptor::new("a2", Version::new(1, 1, 0));
        let c = ModuleDescriptor::new("c", Version::new(1, 0, 0))
            .require(RequireSpec::new("a").reexport())
            .require(RequireSpec::new("a2"));

        let delta = BasicResolver
            .resolve(&request(
                vec![candidate(1, a, true), candidate(2, a2, true), candidate(3, c, false)],
                &[3],
            ))
            .unwrap();
        let wiring = &delta.resolved[0];
        assert_eq!(wiring.requires, vec![(ModuleId(1), true), (ModuleId(2), false)]);
    }

    #[test]
    fn test_fragment_attaches_and_merges_into_host() {
        let host = ModuleDescriptor::new("host", Version::new(1, 0, 0));
        let exporter = ModuleDescriptor::new("x", Version::new(1, 0, 0)).export("q", Version::new(1, 0, 0));
        let fragment = ModuleDescriptor::new("frag", Version::new(1, 0, 0))
            .fragment_of("host")
            .import(ImportSpec::new("q"));

        let delta = BasicResolver
            .resolve(&request(
                vec![
                    candidate(1, host, false),
                    candidate(2, exporter, true),
                    candidate(3, fragment, false),
                ],
                &[1],
            ))
            .unwrap();

        let host_wiring = delta.resolved.iter().find(|w| w.module == ModuleId(1)).unwrap();
        assert_eq!(host_wiring.imports, vec![("q".to_string(), ModuleId(2))]);
        let fragment_wiring = delta.resolved.iter().find(|w| w.module == ModuleId(3)).unwrap();
        assert_eq!(fragment_wiring.host, Some(ModuleId(1)));
    }

    #[test]
    fn test_late_fragment_carries_own_wiring() {
        let host = ModuleDescriptor::new("host", Version::new(1, 0, 0));
        let exporter = ModuleDescriptor::new("x", Version::new(1, 0, 0)).export("q", Version::new(1, 0, 0));
        let fragment = ModuleDescriptor::new("frag", Version::new(1, 0, 0))
            .fragment_of("host")
            .import(ImportSpec::new("q"))
            .require(RequireSpec::new("x"));

        let delta = BasicResolver
            .resolve(&request(
                vec![
                    candidate(1, host, true),
                    candidate(2, exporter, true),
                    candidate(3, fragment, false),
                ],
                &[3],
            ))
            .unwrap();

        assert_eq!(delta.resolved.len(), 1);
        let wiring = &delta.resolved[0];
        assert_eq!(wiring.host, Some(ModuleId(1)));
        assert_eq!(wiring.imports, vec![("q".to_string(), ModuleId(2))]);
        assert_eq!(wiring.requires, vec![(ModuleId(2), false)]);
    }

    #[test]
    fn test_fragment_export_is_provided_by_host() {
        let host = ModuleDescriptor::new("host", Version::new(1, 0, 0));
        let fragment = ModuleDescriptor::new("frag", Version::new(1, 0, 0))
            .fragment_of("host")
            .export("extra", Version::new(1, 0, 0));
        let user = ModuleDescriptor::new("user", Version::new(1, 0, 0)).import(ImportSpec::new("extra"));

        let delta = BasicResolver
            .resolve(&request(
                vec![
                    candidate(1, host, false),
                    candidate(2, fragment, false),
                    candidate(3, user, false),
                ],
                &[3],
            ))
            .unwrap();

        let wiring = delta.resolved.iter().find(|w| w.module == ModuleId(3)).unwrap();
        assert_eq!(wiring.imports, vec![("extra".to_string(), ModuleId(1))]);
        // 宿主和提供该包的片段一起解析
        assert!(delta.is_resolved(ModuleId(1)));
        assert!(delta.is_resolved(ModuleId(2)));
    }

    #[test]
    fn test_force_full_resolves_everything_possible() {
        let a = ModuleDescriptor::new("a", Version::new(1, 0, 0));
        let b = ModuleDescriptor::new("b", Version::new(1, 0, 0)).import(ImportSpec::new("nope"));
        let mut req = request(vec![candidate(1, a, false), candidate(2, b, false)], &[]);
        req.force_full = true;

        let delta = BasicResolver.resolve(&req).unwrap();
        assert!(delta.is_resolved(ModuleId(1)));
        assert!(!delta.is_resolved(ModuleId(2)));
        assert!(delta.failure(ModuleId(2)).is_some());
    }

    #[test]
    fn test_default_dependency_sort() {
        let order = BasicResolver.dependency_sort(
            &[ModuleId(1), ModuleId(2), ModuleId(3)],
            &[(ModuleId(1), ModuleId(3))],
        );
        assert_eq!(order, vec![ModuleId(2), ModuleId(3), ModuleId(1)]);
    }
}
