//! 多注册中心注册管理

use std::sync::Arc;

use tracing::{error, info, warn};

use super::trait_def::Registration;
use crate::discovery::instance::InstanceStatus;
use crate::error::Result;

/// 把注册操作分发给每个启用的注册后端
#[derive(Default, Clone)]
pub struct RegistrationManager {
    registrations: Vec<Arc<dyn Registration>>,
}

impl RegistrationManager {
    pub fn new(registrations: Vec<Arc<dyn Registration>>) -> Self {
        Self { registrations }
    }

    pub fn add(&mut self, registration: Arc<dyn Registration>) {
        self.registrations.push(registration);
    }

    pub fn registrations(&self) -> &[Arc<dyn Registration>] {
        &self.registrations
    }

    fn enabled(&self) -> impl Iterator<Item = &Arc<dyn Registration>> {
        self.registrations.iter().filter(|r| r.enabled())
    }

    pub async fn init(&self) -> Result<()> {
        for registration in self.enabled() {
            registration.init().await?;
        }
        Ok(())
    }

    /// 依次注册，任何一个后端返回错误都中止
    pub async fn run(&self) -> Result<()> {
        for registration in self.enabled() {
            if let Err(e) = registration.run().await {
                error!(registry = registration.name(), error = %e, "Registration failed");
                return Err(e);
            }
            info!(registry = registration.name(), "Registration started");
        }
        Ok(())
    }

    pub async fn destroy(&self) {
        for registration in self.enabled() {
            registration.destroy().await;
        }
    }

    pub fn add_schema(&self, schema_id: &str, content: &str) {
        for registration in self.enabled() {
            registration.add_schema(schema_id, content);
        }
    }

    pub fn add_endpoint(&self, endpoint: &str) {
        for registration in self.enabled() {
            registration.add_endpoint(endpoint);
        }
    }

    pub fn add_property(&self, key: &str, value: &str) {
        for registration in self.enabled() {
            registration.add_property(key, value);
        }
    }

    /// 所有后端都更新成功才返回 true
    pub async fn update_microservice_instance_status(&self, status: InstanceStatus) -> bool {
        let mut all_updated = true;
        for registration in self.enabled() {
            if !registration.update_microservice_instance_status(status).await {
                warn!(registry = registration.name(), %status, "Update instance status failed");
                all_updated = false;
            }
        }
        all_updated
    }
}
