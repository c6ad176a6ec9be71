//! 批量操作工作者
//!
//! 活动级别变更、模块级别调整、刷新和整体重启都排进同一个队列，由一个任务按到达顺序
//! 逐个执行完毕。调用方入队后即可返回；需要同步等待时持有返回的 [`JobHandle`]。

use std::sync::Weak;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::manager::ModuleManager;
use super::metadata::ModuleId;
use super::state_lock::{scoped_actor, ActorId};
use crate::utils::{Result, RuntimeError};

/// 批量作业
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// 把活动级别调整到目标值
    SetActiveLevel(u32),
    /// 调整单个模块的启动级别
    SetModuleLevel { module: ModuleId, level: u32 },
    /// 刷新；空列表表示所有待移除的模块
    Refresh(Vec<ModuleId>),
    /// 进程内重启：降到 0 级再回到原级别
    Restart,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::SetActiveLevel(_) => "set_active_level",
            Job::SetModuleLevel { .. } => "set_module_level",
            Job::Refresh(_) => "refresh",
            Job::Restart => "restart",
        }
    }
}

#[derive(Debug)]
struct Envelope {
    job: Job,
    reply: oneshot::Sender<Result<()>>,
}

/// 已入队作业的完成通知
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl JobHandle {
    /// 等待作业执行完毕
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| RuntimeError::WorkerClosed)?
    }
}

/// 工作者句柄
#[derive(Debug)]
pub struct Worker {
    tx: mpsc::UnboundedSender<Envelope>,
    task: JoinHandle<()>,
    actor: ActorId,
}

impl Worker {
    /// 启动工作者任务
    ///
    /// 工作者只持有管理器的弱引用；管理器释放后队列自然结束。工作者使用固定的执行者身份，
    /// 以便识别在工作者内同步等待自身作业的调用。
    pub fn spawn(manager: Weak<ModuleManager>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let actor = ActorId::fresh();

        let task = tokio::spawn(scoped_actor(actor, async move {
            while let Some(envelope) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    let _ = envelope.reply.send(Err(RuntimeError::WorkerClosed));
                    break;
                };
                let name = envelope.job.name();
                debug!(job = name, "执行批量作业");
                let result = manager.run_job(envelope.job).await;
                if let Err(e) = &result {
                    warn!(job = name, error = %e, "批量作业失败");
                }
                let _ = envelope.reply.send(result);
            }
            debug!("批量工作者退出");
        }));

        Self { tx, task, actor }
    }

    /// 工作者的执行者身份
    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// 入队
    pub fn submit(&self, job: Job) -> Result<JobHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { job, reply })
            .map_err(|_| RuntimeError::WorkerClosed)?;
        Ok(JobHandle { rx })
    }

    /// 关闭队列并等待已入队的作业执行完
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!(error = %e, "批量工作者异常退出");
        }
    }
}

/// 在工作者内同步等待会永远阻塞队列
pub(crate) fn ensure_not_worker(worker_actor: Option<ActorId>) -> Result<()> {
    match (worker_actor, ActorId::current()) {
        (Some(worker), Some(current)) if worker == current => Err(RuntimeError::Internal(
            "不能在批量工作者内同步等待批量作业".to_string(),
        )),
        _ => Ok(()),
    }
}
