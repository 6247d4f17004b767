//! 微服务注册与契约校验

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{RegisterTask, TaskContext, TaskEvent, TaskState, TaskStatus};
use crate::config::RegistryConfig;
use crate::error::{RegistryError, Result};
use crate::registry::microservice::Microservice;
use crate::registry::schema::{
    SchemaComparator, StructuralSchemaComparator, calc_schema_summary, difference,
};
use crate::task::HeartbeatResult;

/// 契约冲突处理策略
#[derive(Clone)]
pub struct SchemaPolicy {
    pub always_override: bool,
    pub ignore_difference: bool,
    pub comparator: Arc<dyn SchemaComparator>,
}

impl SchemaPolicy {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            always_override: config.always_override_schema,
            ignore_difference: config.ignore_schema_difference,
            comparator: Arc::new(StructuralSchemaComparator),
        }
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn SchemaComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    fn is_modifiable(&self, microservice: &Microservice) -> bool {
        microservice.is_development() || self.always_override
    }
}

impl Default for SchemaPolicy {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

/// 微服务注册任务
///
/// 初始即为 READY。完成后只有两种情况会回到 READY：心跳发现实例已不存在，
/// 或者实例注册失败。
pub struct MicroserviceRegisterTask {
    ctx: TaskContext,
    policy: SchemaPolicy,
    interval: Duration,
    state: TaskState,
}

impl MicroserviceRegisterTask {
    pub fn new(ctx: TaskContext, policy: SchemaPolicy, interval: Duration) -> Self {
        Self {
            ctx,
            policy,
            interval,
            state: TaskState::new(TaskStatus::Ready),
        }
    }

    async fn register_microservice(&self) -> Result<String> {
        let client = &self.ctx.client;
        let microservice = self.ctx.local.microservice();

        if let Some(service_id) = client.get_microservice_id(&microservice).await? {
            info!(
                service_id = %service_id,
                microservice = %microservice.display_key(),
                "Microservice exists in service center"
            );
            self.ctx.local.set_service_id(&service_id);
            if let Some(remote) = client.get_microservice(&service_id).await? {
                check_schema_ids(&microservice, &remote);
            }
            return Ok(service_id);
        }

        let mut processed = microservice;
        self.ctx.env_adapters.process_microservice(&mut processed);
        let service_id = client.register_microservice(&processed).await?;
        if service_id.is_empty() {
            error!(
                microservice = %processed.display_key(),
                "Register microservice failed, empty service id"
            );
            return Err(RegistryError::Rejected(format!(
                "register microservice {} returned empty service id",
                processed.display_key()
            )));
        }

        processed.service_id = service_id.clone();
        self.ctx.local.replace_microservice(processed);
        info!(service_id = %service_id, "Microservice registered");
        Ok(service_id)
    }

    async fn reconcile_schemas(&self, service_id: &str) -> Result<()> {
        let microservice = self.ctx.local.microservice();
        let modifiable = self.policy.is_modifiable(&microservice);
        let remote: HashMap<String, Option<String>> = self
            .ctx
            .client
            .get_schemas(service_id)
            .await?
            .into_iter()
            .map(|s| (s.schema_id, s.summary))
            .collect();

        for (schema_id, content) in &microservice.schemas {
            let Some(remote_summary) = remote.get(schema_id) else {
                info!(schema_id = %schema_id, "Schema not exist in service center, registering");
                self.register_schema(service_id, schema_id, content).await?;
                continue;
            };

            let remote_summary = match remote_summary {
                Some(summary) => summary.clone(),
                None => match self.ctx.client.get_schema(service_id, schema_id).await? {
                    Some(remote_content) => calc_schema_summary(&remote_content),
                    None => {
                        self.register_schema(service_id, schema_id, content).await?;
                        continue;
                    }
                },
            };

            if remote_summary == calc_schema_summary(content) {
                continue;
            }

            self.resolve_schema_conflict(service_id, schema_id, content, modifiable)
                .await?;
        }

        for schema_id in remote.keys() {
            if microservice.schemas.contains_key(schema_id) {
                continue;
            }
            if modifiable {
                warn!(
                    schema_id = %schema_id,
                    "Schema exists in service center but not locally, it will not be deleted"
                );
            } else {
                error!(
                    schema_id = %schema_id,
                    environment = %microservice.environment,
                    "Schema exists in service center but not locally"
                );
                return Err(RegistryError::schema_conflict(
                    schema_id,
                    "schema exists in service center but not locally, increase the microservice version",
                ));
            }
        }

        Ok(())
    }

    async fn resolve_schema_conflict(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
        modifiable: bool,
    ) -> Result<()> {
        if modifiable {
            warn!(schema_id = %schema_id, "Schema changed, overwriting service center copy");
            return self.register_schema(service_id, schema_id, content).await;
        }

        let remote_content = self
            .ctx
            .client
            .get_schema(service_id, schema_id)
            .await?
            .unwrap_or_default();
        if self.policy.comparator.is_equivalent(&remote_content, content) {
            info!(schema_id = %schema_id, "Schema text differs but structure is equal");
            return Ok(());
        }

        let diff = difference(&remote_content, content);
        if self.policy.ignore_difference {
            warn!(
                schema_id = %schema_id,
                difference = %diff,
                "Schema differs from service center, ignored by configuration"
            );
            return Ok(());
        }

        error!(
            schema_id = %schema_id,
            difference = %diff,
            "Schema differs from service center and the environment is not modifiable"
        );
        Err(RegistryError::schema_conflict(
            schema_id,
            "schema content differs from service center, increase the microservice version",
        ))
    }

    async fn register_schema(&self, service_id: &str, schema_id: &str, content: &str) -> Result<()> {
        let content = self.ctx.env_adapters.process_schema(schema_id, content);
        if self
            .ctx
            .client
            .register_schema(service_id, schema_id, &content)
            .await?
        {
            info!(schema_id = %schema_id, "Schema registered");
            Ok(())
        } else {
            Err(RegistryError::Rejected(format!(
                "register schema {} rejected",
                schema_id
            )))
        }
    }

    async fn do_register(&self) -> Result<()> {
        let service_id = self.register_microservice().await?;
        self.reconcile_schemas(&service_id).await
    }
}

fn check_schema_ids(local: &Microservice, remote: &Microservice) {
    let local_ids: BTreeSet<&String> = local.schemas.keys().collect();
    let remote_ids: BTreeSet<&String> = remote.schemas.keys().collect();
    if local_ids != remote_ids {
        warn!(
            local = ?local_ids,
            remote = ?remote_ids,
            "Schema ids differ between local and service center"
        );
    }
}

#[async_trait]
impl RegisterTask for MicroserviceRegisterTask {
    fn name(&self) -> &'static str {
        "microservice-register"
    }

    fn status(&self) -> TaskStatus {
        self.state.get()
    }

    fn on_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Heartbeat(HeartbeatResult::InstanceNotRegistered)
            | TaskEvent::InstanceRegistered { success: false } => {
                info!(?event, "Microservice registration restarts");
                self.state.set(TaskStatus::Ready);
            }
            _ => {}
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
                    .publish(TaskEvent::MicroserviceRegistered { success: true });
                Ok(())
            }
            Err(e) => {
                self.state.finish_with(TaskStatus::Ready);
                self.ctx
                    .bus
                    .publish(TaskEvent::MicroserviceRegistered { success: false });
                Err(e)
            }
        }
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}
