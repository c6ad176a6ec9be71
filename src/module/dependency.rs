//! 模块依赖图
//!
//! 由接线关系构建的有向图：边 `A -> B` 表示 A 依赖 B（A 从 B 导入包或依赖 B）。
//! 用于启动顺序排序和刷新闭包计算。
//!
//! # 示例
//!
//! ```rust
//! use chips_runtime::module::dependency::DependencyGraph;
//! use chips_runtime::module::ModuleId;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency(ModuleId(2), ModuleId(1));
//!
//! assert_eq!(graph.get_dependencies(ModuleId(2)), vec![ModuleId(1)]);
//! assert_eq!(graph.dependency_order(), vec![ModuleId(1), ModuleId(2)]);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::module::metadata::ModuleId;
use crate::utils::{Result, RuntimeError};

/// 模块依赖关系图
///
/// 节点和边都按模块 ID 有序存储，排序结果是确定的。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 正向边：模块 -> 该模块依赖的模块
    edges: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
    /// 反向边：模块 -> 依赖该模块的模块
    reverse_edges: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
}

impl DependencyGraph {
    /// 创建一个空的依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 由节点集合和 `(依赖方, 被依赖方)` 边构建
    ///
    /// 端点不在节点集合中的边被忽略。
    pub fn from_edges(nodes: &[ModuleId], edges: &[(ModuleId, ModuleId)]) -> Self {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_module(*node);
        }
        for (dependent, supplier) in edges {
            if graph.contains_module(*dependent) && graph.contains_module(*supplier) {
                graph.add_dependency(*dependent, *supplier);
            }
        }
        graph
    }

    /// 添加模块节点；已存在时不重复添加
    pub fn add_module(&mut self, module: ModuleId) {
        self.edges.entry(module).or_default();
        self.reverse_edges.entry(module).or_default();
    }

    /// 添加依赖关系：`module` 依赖 `dependency`
    ///
    /// 自环被忽略（模块从自身导入不构成排序约束）。
    pub fn add_dependency(&mut self, module: ModuleId, dependency: ModuleId) {
        self.add_module(module);
        self.add_module(dependency);
        if module == dependency {
            return;
        }
        self.edges.entry(module).or_default().insert(dependency);
        self.reverse_edges.entry(dependency).or_default().insert(module);
    }

    /// 移除模块及其所有边
    pub fn remove_module(&mut self, module: ModuleId) {
        if let Some(deps) = self.edges.remove(&module) {
            for dep in deps {
                if let Some(rev) = self.reverse_edges.get_mut(&dep) {
                    rev.remove(&module);
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(&module) {
            for dependent in dependents {
                if let Some(deps) = self.edges.get_mut(&dependent) {
                    deps.remove(&module);
                }
            }
        }
    }

    /// 直接依赖
    pub fn get_dependencies(&self, module: ModuleId) -> Vec<ModuleId> {
        self.edges
            .get(&module)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 直接依赖方
    pub fn get_dependents(&self, module: ModuleId) -> Vec<ModuleId> {
        self.reverse_edges
            .get(&module)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 传递依赖方（不含自身）
    pub fn get_all_dependents(&self, module: ModuleId) -> BTreeSet<ModuleId> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![module];
        while let Some(current) = stack.pop() {
            for dependent in self.get_dependents(current) {
                if dependent != module && visited.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        visited
    }

    /// 是否存在循环依赖
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// 查找一个循环依赖路径
    pub fn find_cycle(&self) -> Option<Vec<ModuleId>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        let mut on_stack = HashSet::new();

        for node in self.edges.keys() {
            if !visited.contains(node) {
                if let Some(cycle) =
                    self.find_cycle_util(*node, &mut visited, &mut stack, &mut on_stack)
                {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn find_cycle_util(
        &self,
        node: ModuleId,
        visited: &mut HashSet<ModuleId>,
        stack: &mut Vec<ModuleId>,
        on_stack: &mut HashSet<ModuleId>,
    ) -> Option<Vec<ModuleId>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        for dep in self.edges.get(&node).into_iter().flatten() {
            if on_stack.contains(dep) {
                let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(*dep);
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = self.find_cycle_util(*dep, visited, stack, on_stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        on_stack.remove(&node);
        None
    }

    /// 严格拓扑排序：被依赖的模块在前，同层按 ID 升序
    ///
    /// 存在循环时返回 `CircularDependency`。
    pub fn topological_sort(&self) -> Result<Vec<ModuleId>> {
        if let Some(cycle) = self.find_cycle() {
            let path: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
            return Err(RuntimeError::CircularDependency(path.join(" -> ")));
        }
        Ok(self.dependency_order())
    }

    /// 宽松的依赖顺序：被依赖的模块在前，同层按 ID 升序
    ///
    /// 循环中的模块无法排序，按 ID 升序追加在末尾。
    pub fn dependency_order(&self) -> Vec<ModuleId> {
        let mut remaining: HashMap<ModuleId, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (*node, deps.len()))
            .collect();

        let mut ready: BTreeSet<ModuleId> = remaining
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut result = Vec::with_capacity(self.edges.len());
        while let Some(node) = ready.pop_first() {
            remaining.remove(&node);
            result.push(node);
            for dependent in self.get_dependents(node) {
                if let Some(degree) = remaining.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        let mut cyclic: Vec<ModuleId> = remaining.into_keys().collect();
        cyclic.sort();
        result.extend(cyclic);
        result
    }

    /// 检查是否包含指定模块
    pub fn contains_module(&self, module: ModuleId) -> bool {
        self.edges.contains_key(&module)
    }

    /// 图中模块数量
    pub fn module_count(&self) -> usize {
        self.edges.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ModuleId {
        ModuleId(n)
    }

    #[test]
    fn test_add_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id(1), id(2));

        assert_eq!(graph.get_dependencies(id(1)), vec![id(2)]);
        assert_eq!(graph.get_dependents(id(2)), vec![id(1)]);
        assert_eq!(graph.module_count(), 2);
    }

    #[test]
    fn test_self_loop_ignored() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id(1), id(1));
        assert!(graph.get_dependencies(id(1)).is_empty());
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_remove_module() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id(1), id(2));
        graph.add_dependency(id(3), id(2));
        graph.remove_module(id(2));

        assert!(!graph.contains_module(id(2)));
        assert!(graph.get_dependencies(id(1)).is_empty());
        assert!(graph.get_dependencies(id(3)).is_empty());
    }

    #[test]
    fn test_all_dependents() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id(2), id(1));
        graph.add_dependency(id(3), id(2));
        graph.add_dependency(id(4), id(1));

        let all: Vec<ModuleId> = graph.get_all_dependents(id(1)).into_iter().collect();
        assert_eq!(all, vec![id(2), id(3), id(4)]);
    }

    #[test]
    fn test_topological_sort_diamond() {
        // 4 -> 2 -> 1, 4 -> 3 -> 1
        let graph = DependencyGraph::from_edges(
            &[id(4), id(3), id(2), id(1)],
            &[(id(4), id(2)), (id(4), id(3)), (id(2), id(1)), (id(3), id(1))],
        );
        assert_eq!(graph.topological_sort().unwrap(), vec![id(1), id(2), id(3), id(4)]);
    }

    #[test]
    fn test_provider_sorted_before_consumer_with_higher_id() {
        let graph = DependencyGraph::from_edges(&[id(1), id(5)], &[(id(1), id(5))]);
        assert_eq!(graph.dependency_order(), vec![id(5), id(1)]);
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id(1), id(2));
        graph.add_dependency(id(2), id(3));
        graph.add_dependency(id(3), id(1));
        graph.add_module(id(9));

        assert!(graph.has_cycle());
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(matches!(
            graph.topological_sort(),
            Err(RuntimeError::CircularDependency(_))
        ));

        // 宽松排序仍然给出全部节点
        assert_eq!(graph.dependency_order(), vec![id(9), id(1), id(2), id(3)]);
    }

    #[test]
    fn test_from_edges_ignores_unknown_nodes() {
        let graph = DependencyGraph::from_edges(&[id(1)], &[(id(1), id(7))]);
        assert_eq!(graph.module_count(), 1);
        assert!(graph.get_dependencies(id(1)).is_empty());
    }
}
