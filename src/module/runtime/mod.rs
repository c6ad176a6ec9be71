//! 模块运行时协作者
//!
//! 定义代码加载、激活钩子和服务目录接口，以及用于测试和启动器的内存实现。

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::metadata::{ModuleDescriptor, ModuleId};
use crate::api::ModuleRuntime;

/// 类路径中的一段：宿主在前，随后是按 ID 升序附着的片段
#[derive(Debug, Clone)]
pub struct ClasspathSegment {
    pub module: ModuleId,
    pub descriptor: Arc<ModuleDescriptor>,
}

/// 已实例化的代码加载器
pub trait LoaderHandle: Send + Sync + fmt::Debug {
    /// 在模块本地（含已附着的片段）查找条目
    fn find_local(&self, name: &str) -> Option<Vec<u8>>;

    /// 释放加载器持有的资源
    fn close(&self) {}
}

/// 代码加载能力
pub trait CodeLoader: Send + Sync {
    /// 为模块实例化加载器
    fn materialize(
        &self,
        module: ModuleId,
        classpath: &[ClasspathSegment],
    ) -> anyhow::Result<Arc<dyn LoaderHandle>>;
}

/// 内存代码加载器
///
/// 按类路径顺序提供描述中的 `entries`。
#[derive(Debug, Clone, Default)]
pub struct MemoryCodeLoader;

impl MemoryCodeLoader {
    pub fn new() -> Self {
        Self
    }
}

impl CodeLoader for MemoryCodeLoader {
    fn materialize(
        &self,
        module: ModuleId,
        classpath: &[ClasspathSegment],
    ) -> anyhow::Result<Arc<dyn LoaderHandle>> {
        let segments = classpath
            .iter()
            .map(|segment| (segment.module, segment.descriptor.entries.clone()))
            .collect();
        tracing::trace!(module_id = %module, segments = classpath.len(), "实例化内存加载器");
        Ok(Arc::new(MemoryLoaderHandle {
            segments,
            closed: AtomicBool::new(false),
        }))
    }
}

/// 内存加载器句柄
#[derive(Debug)]
pub struct MemoryLoaderHandle {
    segments: Vec<(ModuleId, BTreeMap<String, String>)>,
    closed: AtomicBool,
}

impl MemoryLoaderHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl LoaderHandle for MemoryLoaderHandle {
    fn find_local(&self, name: &str) -> Option<Vec<u8>> {
        if self.is_closed() {
            return None;
        }
        self.segments
            .iter()
            .find_map(|(_, entries)| entries.get(name))
            .map(|content| content.as_bytes().to_vec())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// 激活钩子上下文
#[derive(Clone)]
pub struct ActivatorContext {
    /// 被激活的模块
    pub module: ModuleId,
    /// 运行时句柄，钩子可以重入 API
    pub runtime: ModuleRuntime,
}

impl fmt::Debug for ActivatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivatorContext")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// 模块激活钩子
///
/// 按名称注册在运行时上，由描述的 `activator` 字段选择。
#[async_trait]
pub trait ModuleActivator: Send + Sync {
    /// 模块启动
    async fn start(&self, ctx: &ActivatorContext) -> anyhow::Result<()>;

    /// 模块停止
    async fn stop(&self, ctx: &ActivatorContext) -> anyhow::Result<()>;
}

type Callback = Arc<dyn Fn(&ActivatorContext) -> anyhow::Result<()> + Send + Sync>;

/// 由同步回调构成的激活钩子
#[derive(Clone)]
pub struct CallbackActivator {
    on_start: Callback,
    on_stop: Callback,
}

impl CallbackActivator {
    pub fn new<S, T>(on_start: S, on_stop: T) -> Self
    where
        S: Fn(&ActivatorContext) -> anyhow::Result<()> + Send + Sync + 'static,
        T: Fn(&ActivatorContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            on_start: Arc::new(on_start),
            on_stop: Arc::new(on_stop),
        }
    }

    /// 只关心启动的钩子
    pub fn on_start<S>(on_start: S) -> Self
    where
        S: Fn(&ActivatorContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(on_start, |_| Ok(()))
    }
}

#[async_trait]
impl ModuleActivator for CallbackActivator {
    async fn start(&self, ctx: &ActivatorContext) -> anyhow::Result<()> {
        (self.on_start)(ctx)
    }

    async fn stop(&self, ctx: &ActivatorContext) -> anyhow::Result<()> {
        (self.on_stop)(ctx)
    }
}

/// 服务目录
///
/// 内核不检查其内容，只在模块停止后要求撤回它发布的服务。
pub trait ServiceDirectory: Send + Sync {
    fn release_module(&self, module: ModuleId);
}

/// 空服务目录
#[derive(Debug, Default)]
pub struct NoopServiceDirectory;

impl ServiceDirectory for NoopServiceDirectory {
    fn release_module(&self, _module: ModuleId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: u64, entries: &[(&str, &str)]) -> ClasspathSegment {
        let mut descriptor = ModuleDescriptor::default();
        for (name, content) in entries {
            descriptor.entries.insert(name.to_string(), content.to_string());
        }
        ClasspathSegment {
            module: ModuleId(id),
            descriptor: Arc::new(descriptor),
        }
    }

    #[test]
    fn test_memory_loader_classpath_order() {
        let loader = MemoryCodeLoader::new();
        let handle = loader
            .materialize(
                ModuleId(1),
                &[segment(1, &[("p.A", "host")]), segment(4, &[("p.A", "frag"), ("p.B", "b")])],
            )
            .unwrap();

        assert_eq!(handle.find_local("p.A"), Some(b"host".to_vec()));
        assert_eq!(handle.find_local("p.B"), Some(b"b".to_vec()));
        assert_eq!(handle.find_local("p.C"), None);

        handle.close();
        assert_eq!(handle.find_local("p.A"), None);
    }
}
