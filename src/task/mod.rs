//! 注册任务图
//!
//! 微服务注册、实例注册、心跳、状态同步是四个独立的状态机，彼此只通过
//! [`EventBus`] 上的 [`TaskEvent`] 交互：
//!
//! ```text
//! MicroserviceRegister --MicroserviceRegistered--> InstanceRegister
//! InstanceRegister --InstanceRegistered--> Heartbeat, StatusSync
//! Heartbeat --InstanceNotRegistered--> MicroserviceRegister (回到 READY)
//! InstanceRegister --InstanceRegistered{false}--> MicroserviceRegister (回到 READY)
//! ```

pub mod event;
pub mod graph;
pub mod heartbeat;
pub mod instance_register;
pub mod microservice_register;
pub mod status_sync;

pub use event::{EventBus, HeartbeatResult, TaskEvent};
pub use graph::{RegistrationTaskGraph, TaskRunner};
pub use heartbeat::MicroserviceInstanceHeartbeatTask;
pub use instance_register::MicroserviceInstanceRegisterTask;
pub use microservice_register::{MicroserviceRegisterTask, SchemaPolicy};
pub use status_sync::MicroserviceInstanceStatusSyncTask;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::ServiceRegistryClient;
use crate::error::Result;
use crate::registry::env_adapter::EnvAdapterManager;
use crate::registry::local::LocalMicroservice;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// 等待前置任务完成
    Init,
    /// 下一次调度时执行
    Ready,
    Running,
    Finished,
}

/// 注册任务 trait
#[async_trait]
pub trait RegisterTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn status(&self) -> TaskStatus;

    /// 处理其他任务发布的事件，只做状态切换
    fn on_event(&self, event: &TaskEvent);

    /// 状态为 READY 时执行一次，其余状态直接返回
    async fn run(&self) -> Result<()>;

    /// 周期调度间隔
    fn interval(&self) -> Duration;
}

/// 任务共享的依赖
#[derive(Clone)]
pub struct TaskContext {
    pub client: Arc<dyn ServiceRegistryClient>,
    pub local: Arc<LocalMicroservice>,
    pub bus: EventBus,
    pub env_adapters: EnvAdapterManager,
}

#[derive(Debug)]
pub(crate) struct TaskState(Mutex<TaskStatus>);

impl TaskState {
    pub(crate) fn new(status: TaskStatus) -> Self {
        Self(Mutex::new(status))
    }

    pub(crate) fn get(&self) -> TaskStatus {
        *self.0.lock()
    }

    pub(crate) fn set(&self, status: TaskStatus) {
        *self.0.lock() = status;
    }

    /// READY 时切到 RUNNING 并返回 true
    pub(crate) fn try_start(&self) -> bool {
        let mut status = self.0.lock();
        if *status == TaskStatus::Ready {
            *status = TaskStatus::Running;
            true
        } else {
            false
        }
    }

    /// 只有仍处于 RUNNING 时才写入结果，执行期间被事件改写的状态保持不变
    pub(crate) fn finish_with(&self, status: TaskStatus) {
        let mut current = self.0.lock();
        if *current == TaskStatus::Running {
            *current = status;
        }
    }
}
