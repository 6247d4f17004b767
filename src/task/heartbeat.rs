//! 实例心跳

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{HeartbeatResult, RegisterTask, TaskContext, TaskEvent, TaskState, TaskStatus};
use crate::error::Result;

/// 心跳任务
///
/// 实例注册成功后周期执行，结果分三种：成功、注册中心不可达、实例已不存在。
/// 不可达时保持 READY 下个周期继续；实例不存在时回到 INIT 等待重新注册。
pub struct MicroserviceInstanceHeartbeatTask {
    ctx: TaskContext,
    interval: Duration,
    state: TaskState,
    disconnected: AtomicBool,
}

impl MicroserviceInstanceHeartbeatTask {
    pub fn new(ctx: TaskContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            state: TaskState::new(TaskStatus::Init),
            disconnected: AtomicBool::new(false),
        }
    }

    async fn heartbeat(&self) -> HeartbeatResult {
        let service_id = self.ctx.local.service_id();
        let instance_id = self.ctx.local.instance_id();
        match self.ctx.client.heartbeat(&service_id, &instance_id).await {
            Ok(true) => HeartbeatResult::Success,
            Ok(false) => {
                warn!(
                    service_id = %service_id,
                    instance_id = %instance_id,
                    "Instance not registered in service center, registering again"
                );
                HeartbeatResult::InstanceNotRegistered
            }
            Err(e) => {
                warn!(
                    service_id = %service_id,
                    instance_id = %instance_id,
                    error = %e,
                    "Heartbeat failed, service center disconnected"
                );
                HeartbeatResult::Disconnected
            }
        }
    }
}

#[async_trait]
impl RegisterTask for MicroserviceInstanceHeartbeatTask {
    fn name(&self) -> &'static str {
        "instance-heartbeat"
    }

    fn status(&self) -> TaskStatus {
        self.state.get()
    }

    fn on_event(&self, event: &TaskEvent) {
        if let TaskEvent::InstanceRegistered { success: true } = event {
            self.state.set(TaskStatus::Ready);
        }
    }

    async fn run(&self) -> Result<()> {
        if !self.state.try_start() {
            return Ok(());
        }

        let result = self.heartbeat().await;
        match result {
            HeartbeatResult::Success => {
                self.state.finish_with(TaskStatus::Ready);
                debug!("Heartbeat succeeded");
            }
            HeartbeatResult::Disconnected => {
                self.disconnected.store(true, Ordering::SeqCst);
                self.state.finish_with(TaskStatus::Ready);
            }
            HeartbeatResult::InstanceNotRegistered => {
                self.state.finish_with(TaskStatus::Init);
            }
        }

        self.ctx.bus.publish(TaskEvent::Heartbeat(result));
        if result == HeartbeatResult::Success && self.disconnected.swap(false, Ordering::SeqCst) {
            info!("Service center connection recovered");
            self.ctx.bus.publish(TaskEvent::ConnectionRecovered);
        }
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
