//! 注册任务之间传递的事件

use tokio::sync::broadcast;
use tracing::trace;

use crate::discovery::instance::InstanceStatus;

const DEFAULT_CAPACITY: usize = 64;

/// 心跳结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    Success,
    /// 注册中心没有响应
    Disconnected,
    /// 注册中心可达，但实例记录已经不存在
    InstanceNotRegistered,
}

/// 任务生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    MicroserviceRegistered { success: bool },
    InstanceRegistered { success: bool },
    Heartbeat(HeartbeatResult),
    InstanceStatusSynced { status: InstanceStatus },
    /// 断连之后心跳重新成功
    ConnectionRecovered,
}

/// 事件总线
///
/// 每个注册中心连接一个实例，显式传给需要的任务。
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件，没有订阅者时直接丢弃
    pub fn publish(&self, event: TaskEvent) {
        trace!(?event, "Publishing task event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
