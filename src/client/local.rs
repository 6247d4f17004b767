//! 内存注册中心客户端
//!
//! 单机运行和测试时代替真实注册中心，可以从 YAML 预置其他服务：
//!
//! ```yaml
//! ms2:
//!   - appid: default
//!     version: 1.0.0
//!     schemaIds: [hello]
//!     instances:
//!       - endpoints: ["rest://127.0.0.1:8080"]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::ServiceRegistryClient;
use crate::discovery::instance::{InstanceStatus, MicroserviceInstance, MicroserviceInstances};
use crate::error::{RegistryError, Result};
use crate::registry::microservice::Microservice;
use crate::registry::schema::{SchemaSummary, calc_schema_summary};
use crate::version::{Version, VersionRule};

const DEFAULT_APPLICATION_ID: &str = "default";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresetMicroservice {
    #[serde(rename = "appid")]
    app_id: Option<String>,
    version: String,
    id: Option<String>,
    #[serde(default)]
    schema_ids: Vec<String>,
    #[serde(default)]
    instances: Vec<PresetInstance>,
}

#[derive(Debug, Deserialize)]
struct PresetInstance {
    #[serde(default)]
    endpoints: Vec<String>,
}

#[derive(Default)]
struct LocalState {
    microservices: HashMap<String, Microservice>,
    /// serviceId -> instanceId -> instance
    instances: HashMap<String, BTreeMap<String, MicroserviceInstance>>,
}

/// 内存注册中心客户端
#[derive(Default)]
pub struct LocalServiceRegistryClient {
    state: RwLock<LocalState>,
    revision: AtomicU64,
}

impl LocalServiceRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 YAML 预置数据创建
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let data: BTreeMap<String, Vec<PresetMicroservice>> = serde_yaml::from_str(content)
            .map_err(|e| RegistryError::configuration(format!("Invalid local registry data: {}", e)))?;

        let client = Self::new();
        {
            let mut state = client.state.write();
            for (service_name, presets) in data {
                for preset in presets {
                    let service_id = preset.id.unwrap_or_else(|| Uuid::new_v4().to_string());
                    let mut microservice = Microservice::new(
                        preset.app_id.as_deref().unwrap_or(DEFAULT_APPLICATION_ID),
                        service_name.clone(),
                        preset.version,
                    );
                    microservice.service_id = service_id.clone();
                    for schema_id in preset.schema_ids {
                        microservice.schemas.insert(schema_id, String::new());
                    }

                    let instances = preset
                        .instances
                        .into_iter()
                        .map(|preset| {
                            let instance = MicroserviceInstance {
                                instance_id: Uuid::new_v4().to_string(),
                                service_id: service_id.clone(),
                                endpoints: preset.endpoints,
                                ..Default::default()
                            };
                            (instance.instance_id.clone(), instance)
                        })
                        .collect();

                    state.microservices.insert(service_id.clone(), microservice);
                    state.instances.insert(service_id, instances);
                }
            }
            if !state.microservices.is_empty() {
                client.revision.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(client)
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::configuration(format!("Failed to read local registry {}: {}", path, e))
        })?;
        Self::from_yaml_str(&content)
    }

    fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn find_latest<'a>(
        state: &'a LocalState,
        app_id: &str,
        service_name: &str,
        rule: &VersionRule,
    ) -> Option<(&'a Microservice, Version)> {
        state
            .microservices
            .values()
            .filter(|ms| ms.app_id == app_id && ms.service_name == service_name)
            .filter_map(|ms| ms.parsed_version().ok().map(|v| (ms, v)))
            .filter(|(_, v)| rule.is_accept(v))
            .max_by_key(|(_, v)| *v)
    }

    fn unknown_service(service_id: &str) -> RegistryError {
        RegistryError::Rejected(format!("Invalid serviceId, serviceId={}", service_id))
    }
}

#[async_trait]
impl ServiceRegistryClient for LocalServiceRegistryClient {
    async fn get_microservice_id(&self, microservice: &Microservice) -> Result<Option<String>> {
        let rule = VersionRule::parse(&microservice.version)?;
        let state = self.state.read();
        Ok(state
            .microservices
            .values()
            .filter(|ms| ms.environment == microservice.environment)
            .filter(|ms| ms.app_id == microservice.app_id)
            .filter(|ms| ms.service_name == microservice.service_name)
            .filter_map(|ms| ms.parsed_version().ok().map(|v| (ms, v)))
            .filter(|(_, v)| rule.is_accept(v))
            .max_by_key(|(_, v)| *v)
            .map(|(ms, _)| ms.service_id.clone()))
    }

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>> {
        Ok(self.state.read().microservices.get(service_id).cloned())
    }

    async fn register_microservice(&self, microservice: &Microservice) -> Result<String> {
        let service_id = if microservice.service_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            microservice.service_id.clone()
        };

        let mut stored = microservice.clone();
        stored.service_id = service_id.clone();
        // 注册微服务只登记契约 ID，内容通过 register_schema 上传
        for content in stored.schemas.values_mut() {
            content.clear();
        }

        {
            let mut state = self.state.write();
            state.microservices.insert(service_id.clone(), stored);
            state.instances.entry(service_id.clone()).or_default();
        }
        self.bump_revision();
        debug!(service_id = %service_id, "Local microservice registered");
        Ok(service_id)
    }

    async fn get_schemas(&self, service_id: &str) -> Result<Vec<SchemaSummary>> {
        let state = self.state.read();
        let microservice = state
            .microservices
            .get(service_id)
            .ok_or_else(|| Self::unknown_service(service_id))?;
        Ok(microservice
            .schemas
            .iter()
            .map(|(schema_id, content)| SchemaSummary {
                schema_id: schema_id.clone(),
                summary: (!content.is_empty()).then(|| calc_schema_summary(content)),
            })
            .collect())
    }

    async fn get_schema(&self, service_id: &str, schema_id: &str) -> Result<Option<String>> {
        let state = self.state.read();
        let microservice = state
            .microservices
            .get(service_id)
            .ok_or_else(|| Self::unknown_service(service_id))?;
        Ok(microservice
            .schemas
            .get(schema_id)
            .filter(|content| !content.is_empty())
            .cloned())
    }

    async fn register_schema(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
    ) -> Result<bool> {
        let mut state = self.state.write();
        let microservice = state
            .microservices
            .get_mut(service_id)
            .ok_or_else(|| Self::unknown_service(service_id))?;
        microservice
            .schemas
            .insert(schema_id.to_string(), content.to_string());
        Ok(true)
    }

    async fn register_instance(&self, instance: &MicroserviceInstance) -> Result<String> {
        let instance_id = if instance.instance_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            instance.instance_id.clone()
        };

        {
            let mut state = self.state.write();
            let instances = state
                .instances
                .get_mut(&instance.service_id)
                .ok_or_else(|| Self::unknown_service(&instance.service_id))?;
            let mut stored = instance.clone();
            stored.instance_id = instance_id.clone();
            instances.insert(instance_id.clone(), stored);
        }
        self.bump_revision();
        Ok(instance_id)
    }

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        let removed = self
            .state
            .write()
            .instances
            .get_mut(service_id)
            .and_then(|instances| instances.remove(instance_id))
            .is_some();
        if removed {
            self.bump_revision();
        }
        Ok(true)
    }

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        Ok(self
            .state
            .read()
            .instances
            .get(service_id)
            .is_some_and(|instances| instances.contains_key(instance_id)))
    }

    async fn find_service_instances(
        &self,
        _consumer_id: &str,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        revision: Option<&str>,
    ) -> Result<MicroserviceInstances> {
        let current = self.revision.load(Ordering::SeqCst).to_string();
        if revision == Some(current.as_str()) {
            return Ok(MicroserviceInstances::unchanged(Some(current)));
        }

        let rule = VersionRule::parse(version_rule)?;
        let state = self.state.read();
        let Some((_, latest)) = Self::find_latest(&state, app_id, service_name, &rule) else {
            return Ok(MicroserviceInstances::not_exist());
        };

        let mut instances: Vec<MicroserviceInstance> = state
            .microservices
            .values()
            .filter(|ms| ms.app_id == app_id && ms.service_name == service_name)
            .filter(|ms| {
                ms.parsed_version()
                    .map(|v| rule.is_match(&v, &latest))
                    .unwrap_or(false)
            })
            .filter_map(|ms| state.instances.get(&ms.service_id))
            .flat_map(|instances| instances.values().cloned())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        Ok(MicroserviceInstances::changed(instances, Some(current)))
    }

    async fn get_microservice_instance(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<Option<MicroserviceInstance>> {
        Ok(self
            .state
            .read()
            .instances
            .get(service_id)
            .and_then(|instances| instances.get(instance_id))
            .cloned())
    }

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<bool> {
        let updated = {
            let mut state = self.state.write();
            match state
                .instances
                .get_mut(service_id)
                .and_then(|instances| instances.get_mut(instance_id))
            {
                Some(instance) => {
                    instance.status = status;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.bump_revision();
        }
        Ok(updated)
    }

    async fn get_all_microservices(&self) -> Result<Vec<Microservice>> {
        Ok(self.state.read().microservices.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESET: &str = r#"
ms2:
  - appid: default
    version: 1.0.0
    id: ms2-v1
    schemaIds: [hello]
    instances:
      - endpoints: ["rest://127.0.0.1:8080"]
  - version: 2.0.0
    id: ms2-v2
    instances:
      - endpoints: ["rest://127.0.0.1:8081"]
"#;

    #[tokio::test]
    async fn preset_services_are_discoverable() {
        let client = LocalServiceRegistryClient::from_yaml_str(PRESET).unwrap();

        let all = client
            .find_service_instances("c", "default", "ms2", "0.0.0.0+", None)
            .await
            .unwrap();
        assert!(all.need_refresh);
        assert_eq!(all.instances.len(), 2);

        let latest = client
            .find_service_instances("c", "default", "ms2", "latest", None)
            .await
            .unwrap();
        assert_eq!(latest.instances.len(), 1);
        assert_eq!(latest.instances[0].service_id, "ms2-v2");

        let again = client
            .find_service_instances("c", "default", "ms2", "latest", latest.revision.as_deref())
            .await
            .unwrap();
        assert!(!again.need_refresh);

        let missing = client
            .find_service_instances("c", "default", "unknown", "0+", None)
            .await
            .unwrap();
        assert!(missing.microservice_not_exist);
    }

    #[tokio::test]
    async fn preset_schema_ids_have_no_content() {
        let client = LocalServiceRegistryClient::from_yaml_str(PRESET).unwrap();
        let schemas = client.get_schemas("ms2-v1").await.unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].summary, None);
        assert_eq!(client.get_schema("ms2-v1", "hello").await.unwrap(), None);
        assert!(client.get_schemas("nope").await.is_err());
    }
}
