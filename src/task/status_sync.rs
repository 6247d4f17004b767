//! 实例状态同步

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{HeartbeatResult, RegisterTask, TaskContext, TaskEvent, TaskState, TaskStatus};
use crate::error::Result;

/// 状态同步任务
///
/// 注册中心上的实例状态以运维操作为准（例如摘流），周期拉取并覆盖本地状态。
pub struct MicroserviceInstanceStatusSyncTask {
    ctx: TaskContext,
    interval: Duration,
    state: TaskState,
}

impl MicroserviceInstanceStatusSyncTask {
    pub fn new(ctx: TaskContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            state: TaskState::new(TaskStatus::Init),
        }
    }
}

#[async_trait]
impl RegisterTask for MicroserviceInstanceStatusSyncTask {
    fn name(&self) -> &'static str {
        "instance-status-sync"
    }

    fn status(&self) -> TaskStatus {
        self.state.get()
    }

    fn on_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::InstanceRegistered { success: true } => self.state.set(TaskStatus::Ready),
            TaskEvent::Heartbeat(HeartbeatResult::InstanceNotRegistered) => {
                self.state.set(TaskStatus::Init)
            }
            _ => {}
        }
    }

    async fn run(&self) -> Result<()> {
        if !self.state.try_start() {
            return Ok(());
        }

        let service_id = self.ctx.local.service_id();
        let instance_id = self.ctx.local.instance_id();
        let fetched = self
            .ctx
            .client
            .get_microservice_instance(&service_id, &instance_id)
            .await;
        self.state.finish_with(TaskStatus::Ready);

        match fetched? {
            Some(remote) => {
                let local_status = self.ctx.local.instance().status;
                if remote.status != local_status {
                    info!(
                        instance_id = %instance_id,
                        from = %local_status,
                        to = %remote.status,
                        "Instance status changed in service center"
                    );
                    self.ctx.local.set_instance_status(remote.status);
                    self.ctx.bus.publish(TaskEvent::InstanceStatusSynced {
                        status: remote.status,
                    });
                }
            }
            None => debug!(instance_id = %instance_id, "Instance not found while syncing status"),
        }
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
