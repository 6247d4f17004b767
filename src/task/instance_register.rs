//! 实例注册

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use super::{RegisterTask, TaskContext, TaskEvent, TaskState, TaskStatus};
use crate::error::{RegistryError, Result};

/// 实例注册任务
///
/// 微服务注册成功后进入 READY，注册成功或失败都会发布 `InstanceRegistered`。
pub struct MicroserviceInstanceRegisterTask {
    ctx: TaskContext,
    interval: Duration,
    state: TaskState,
}

impl MicroserviceInstanceRegisterTask {
    pub fn new(ctx: TaskContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval,
            state: TaskState::new(TaskStatus::Init),
        }
    }

    async fn do_register(&self) -> Result<()> {
        // 重新注册时沿用之前的实例 ID
        let mut instance = self.ctx.local.instance();
        instance.service_id = self.ctx.local.service_id();
        self.ctx.env_adapters.process_instance(&mut instance);

        let instance_id = self.ctx.client.register_instance(&instance).await?;
        if instance_id.is_empty() {
            return Err(RegistryError::Rejected(format!(
                "register instance of {} returned empty instance id",
                instance.service_id
            )));
        }

        self.ctx.local.set_instance_id(&instance_id);
        info!(
            service_id = %instance.service_id,
            instance_id = %instance_id,
            endpoints = ?instance.endpoints,
            "Microservice instance registered"
        );
        Ok(())
    }
}

#[async_trait]
impl RegisterTask for MicroserviceInstanceRegisterTask {
    fn name(&self) -> &'static str {
        "instance-register"
    }

    fn status(&self) -> TaskStatus {
        self.state.get()
    }

    fn on_event(&self, event: &TaskEvent) {
        if let TaskEvent::MicroserviceRegistered { success: true } = event {
            self.state.set(TaskStatus::Ready);
        }
    }

    async fn run(&self) -> Result<()> {
        if !self.state.try_start() {
            return Ok(());
        }

        match self.do_register().await {
            Ok(()) => {
                self.state.finish_with(TaskStatus::Finished);
                self.ctx
                    .bus
                    .publish(TaskEvent::InstanceRegistered { success: true });
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Register microservice instance failed");
                // 等待微服务注册任务重新走一遍
                self.state.finish_with(TaskStatus::Init);
                self.ctx
                    .bus
                    .publish(TaskEvent::InstanceRegistered { success: false });
                Err(e)
            }
        }
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
