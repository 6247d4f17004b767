//! 任务调度

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    EventBus, MicroserviceInstanceHeartbeatTask, MicroserviceInstanceRegisterTask,
    MicroserviceInstanceStatusSyncTask, MicroserviceRegisterTask, RegisterTask, SchemaPolicy,
    TaskContext, TaskEvent, TaskStatus,
};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};

/// 单个任务与它的事件接收端
pub struct TaskRunner {
    task: Arc<dyn RegisterTask>,
    events: AsyncMutex<broadcast::Receiver<TaskEvent>>,
}

impl TaskRunner {
    pub fn new(task: Arc<dyn RegisterTask>, bus: &EventBus) -> Self {
        Self {
            task,
            events: AsyncMutex::new(bus.subscribe()),
        }
    }

    pub fn task(&self) -> &Arc<dyn RegisterTask> {
        &self.task
    }

    /// 处理所有已到达的事件
    pub async fn pump(&self) {
        let mut events = self.events.lock().await;
        loop {
            match events.try_recv() {
                Ok(event) => self.task.on_event(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(task = self.task.name(), skipped, "Task event receiver lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    /// 先处理事件再执行一次任务
    pub async fn run_once(&self) -> Result<()> {
        self.pump().await;
        self.task.run().await
    }

    /// 后台循环：定时执行，收到事件后若任务变为 READY 立即执行
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.task.name();
            let mut ticker = tokio::time::interval(self.task.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut events = self.events.lock().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(task = name, "Task loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {}
                    received = events.recv() => match received {
                        Ok(event) => {
                            self.task.on_event(&event);
                            if self.task.status() != TaskStatus::Ready {
                                continue;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(task = name, skipped, "Task event receiver lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }

                if let Err(e) = self.task.run().await {
                    error!(task = name, error = %e, "Register task failed, retry later");
                }
            }
        })
    }
}

/// 注册任务图
///
/// 启动时 [`register_once`](Self::register_once) 按依赖顺序同步执行一轮，
/// 契约冲突等致命错误在这里返回给调用方；之后 [`start`](Self::start) 为每个任务启动后台循环。
/// 后台循环独占各任务的事件接收端，启动后不能再手动执行 [`tick`](Self::tick)。
pub struct RegistrationTaskGraph {
    bus: EventBus,
    runners: Vec<Arc<TaskRunner>>,
    started: AtomicBool,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistrationTaskGraph {
    pub fn new(ctx: TaskContext, config: &RegistryConfig, policy: SchemaPolicy) -> Self {
        let bus = ctx.bus.clone();
        let tasks: Vec<Arc<dyn RegisterTask>> = vec![
            Arc::new(MicroserviceRegisterTask::new(
                ctx.clone(),
                policy,
                config.heartbeat_interval(),
            )),
            Arc::new(MicroserviceInstanceRegisterTask::new(
                ctx.clone(),
                config.heartbeat_interval(),
            )),
            Arc::new(MicroserviceInstanceHeartbeatTask::new(
                ctx.clone(),
                config.heartbeat_interval(),
            )),
            Arc::new(MicroserviceInstanceStatusSyncTask::new(
                ctx,
                config.status_sync_interval(),
            )),
        ];

        let runners = tasks
            .into_iter()
            .map(|task| Arc::new(TaskRunner::new(task, &bus)))
            .collect();

        Self {
            bus,
            runners,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// 按名称查询任务状态
    pub fn task_status(&self, name: &str) -> Option<TaskStatus> {
        self.runners
            .iter()
            .find(|r| r.task().name() == name)
            .map(|r| r.task().status())
    }

    /// 启动时的同步注册
    ///
    /// 只有致命错误（契约冲突、配置错误）会返回，其余错误留给后台循环重试。
    pub async fn register_once(&self) -> Result<()> {
        if self.is_started() {
            return Err(RegistryError::system("registration tasks already running"));
        }
        self.run_round(true).await
    }

    /// 按依赖顺序执行一轮所有任务，错误只记录日志
    pub async fn tick(&self) {
        if self.is_started() {
            debug!("Registration tasks running in background, tick skipped");
            return;
        }
        let _ = self.run_round(false).await;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn run_round(&self, fail_on_fatal: bool) -> Result<()> {
        for runner in &self.runners {
            if let Err(e) = runner.run_once().await {
                if fail_on_fatal && e.is_fatal() {
                    error!(task = runner.task().name(), error = %e, "Registration aborted");
                    return Err(e);
                }
                warn!(task = runner.task().name(), error = %e, "Register task failed, retry later");
            }
        }
        for runner in &self.runners {
            runner.pump().await;
        }
        Ok(())
    }

    /// 为每个任务启动后台循环
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        for runner in &self.runners {
            handles.push(runner.clone().spawn(self.cancel.child_token()));
        }
        info!(tasks = handles.len(), "Registration tasks started");
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for RegistrationTaskGraph {
    fn drop(&mut self) {
        self.stop();
    }
}
