//! 服务中心（poll/heartbeat）注册后端

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::env_adapter::EnvAdapterManager;
use super::local::LocalMicroservice;
use super::microservice::Microservice;
use super::trait_def::Registration;
use crate::client::ServiceRegistryClient;
use crate::config::RegistryConfig;
use crate::discovery::instance::{InstanceStatus, MicroserviceInstance};
use crate::error::Result;
use crate::task::{EventBus, RegistrationTaskGraph, SchemaPolicy, TaskContext};

pub const SERVICE_CENTER_REGISTRY_NAME: &str = "service-center";

/// 服务中心注册
pub struct ServiceCenterRegistration {
    enabled: bool,
    client: Arc<dyn ServiceRegistryClient>,
    local: Arc<LocalMicroservice>,
    graph: RegistrationTaskGraph,
}

impl ServiceCenterRegistration {
    pub fn new(
        config: &RegistryConfig,
        client: Arc<dyn ServiceRegistryClient>,
        local: Arc<LocalMicroservice>,
        env_adapters: EnvAdapterManager,
    ) -> Self {
        Self::with_policy(
            config,
            client,
            local,
            env_adapters,
            SchemaPolicy::from_config(config),
        )
    }

    pub fn with_policy(
        config: &RegistryConfig,
        client: Arc<dyn ServiceRegistryClient>,
        local: Arc<LocalMicroservice>,
        env_adapters: EnvAdapterManager,
        policy: SchemaPolicy,
    ) -> Self {
        let ctx = TaskContext {
            client: client.clone(),
            local: local.clone(),
            bus: EventBus::new(),
            env_adapters,
        };
        Self {
            enabled: config.service_center.as_ref().is_none_or(|sc| sc.enabled),
            client,
            local,
            graph: RegistrationTaskGraph::new(ctx, config, policy),
        }
    }

    /// 注册任务之间的事件总线，发现后端订阅它感知连接恢复
    pub fn event_bus(&self) -> &EventBus {
        self.graph.bus()
    }

    pub fn task_graph(&self) -> &RegistrationTaskGraph {
        &self.graph
    }
}

#[async_trait]
impl Registration for ServiceCenterRegistration {
    fn name(&self) -> &str {
        SERVICE_CENTER_REGISTRY_NAME
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        self.graph.register_once().await?;
        self.graph.start();
        Ok(())
    }

    async fn destroy(&self) {
        self.graph.stop();

        let service_id = self.local.service_id();
        let instance_id = self.local.instance_id();
        if instance_id.is_empty() {
            return;
        }
        match self.client.unregister_instance(&service_id, &instance_id).await {
            Ok(true) => info!(service_id = %service_id, instance_id = %instance_id, "Instance unregistered"),
            Ok(false) => warn!(instance_id = %instance_id, "Unregister instance rejected"),
            Err(e) => warn!(instance_id = %instance_id, error = %e, "Unregister instance failed"),
        }
    }

    fn microservice(&self) -> Microservice {
        self.local.microservice()
    }

    fn microservice_instance(&self) -> MicroserviceInstance {
        self.local.instance()
    }

    fn add_schema(&self, schema_id: &str, content: &str) {
        self.local.add_schema(schema_id, content);
    }

    fn add_endpoint(&self, endpoint: &str) {
        self.local.add_endpoint(endpoint);
    }

    fn add_property(&self, key: &str, value: &str) {
        self.local.add_property(key, value);
    }

    async fn update_microservice_instance_status(&self, status: InstanceStatus) -> bool {
        let service_id = self.local.service_id();
        let instance_id = self.local.instance_id();
        match self
            .client
            .update_instance_status(&service_id, &instance_id, status)
            .await
        {
            Ok(true) => {
                self.local.set_instance_status(status);
                info!(instance_id = %instance_id, %status, "Instance status updated");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Update instance status failed");
                false
            }
        }
    }
}
