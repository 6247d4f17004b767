//! 服务中心 HTTP 客户端（v4 REST 接口）

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::ServiceRegistryClient;
use crate::config::ServiceCenterConfig;
use crate::discovery::instance::{InstanceStatus, MicroserviceInstance, MicroserviceInstances};
use crate::error::{RegistryError, Result};
use crate::registry::microservice::{Microservice, MicroserviceStatus};
use crate::registry::schema::SchemaSummary;

const REGISTRY_PATH: &str = "/v4/default/registry";
const HEADER_CONSUMER_ID: &str = "X-ConsumerId";
const HEADER_REVISION: &str = "X-Resource-Revision";

/// 服务中心的微服务结构：契约只有 ID 列表
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMicroservice {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    service_id: String,
    app_id: String,
    service_name: String,
    version: String,
    #[serde(default)]
    environment: String,
    #[serde(default)]
    schemas: Vec<String>,
    #[serde(default)]
    status: MicroserviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    properties: std::collections::HashMap<String, String>,
}

impl From<&Microservice> for WireMicroservice {
    fn from(ms: &Microservice) -> Self {
        Self {
            service_id: ms.service_id.clone(),
            app_id: ms.app_id.clone(),
            service_name: ms.service_name.clone(),
            version: ms.version.clone(),
            environment: ms.environment.clone(),
            schemas: ms.schemas.keys().cloned().collect(),
            status: ms.status,
            description: ms.description.clone(),
            properties: ms.properties.clone(),
        }
    }
}

impl From<WireMicroservice> for Microservice {
    fn from(wire: WireMicroservice) -> Self {
        Self {
            app_id: wire.app_id,
            service_name: wire.service_name,
            version: wire.version,
            environment: wire.environment,
            service_id: wire.service_id,
            schemas: wire.schemas.into_iter().map(|id| (id, String::new())).collect(),
            status: wire.status,
            description: wire.description,
            properties: wire.properties,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceIdResponse {
    service_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceIdResponse {
    instance_id: String,
}

#[derive(Deserialize)]
struct GetServiceResponse {
    service: WireMicroservice,
}

#[derive(Deserialize)]
struct GetServicesResponse {
    #[serde(default)]
    services: Vec<WireMicroservice>,
}

#[derive(Deserialize)]
struct GetSchemasResponse {
    #[serde(default)]
    schemas: Vec<SchemaSummary>,
}

#[derive(Deserialize)]
struct GetSchemaResponse {
    #[serde(default)]
    schema: Option<String>,
}

#[derive(Deserialize)]
struct GetInstanceResponse {
    instance: MicroserviceInstance,
}

/// 实例逐条解码，单条格式错误不影响其余实例
#[derive(Deserialize)]
struct FindInstancesResponse {
    #[serde(default)]
    instances: Vec<serde_json::Value>,
}

impl FindInstancesResponse {
    fn decode(self, app_id: &str, service_name: &str) -> Vec<MicroserviceInstance> {
        self.instances
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<MicroserviceInstance>(raw) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    warn!(
                        app_id,
                        service_name,
                        error = %e,
                        "Failed to decode instance from service center, skipped"
                    );
                    None
                }
            })
            .collect()
    }
}

/// 服务中心 HTTP 客户端
///
/// 配置多个地址时，连接失败会切换到下一个地址。
pub struct HttpServiceRegistryClient {
    http: Client,
    addresses: Vec<String>,
    current: AtomicUsize,
}

impl HttpServiceRegistryClient {
    pub fn new(config: &ServiceCenterConfig) -> Result<Self> {
        if config.addresses.is_empty() {
            return Err(RegistryError::configuration(
                "service center addresses not configured",
            ));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            addresses: config
                .addresses
                .iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
        })
    }

    fn url(&self, path: &str) -> String {
        let idx = self.current.load(Ordering::Relaxed) % self.addresses.len();
        format!("{}{}{}", self.addresses[idx], REGISTRY_PATH, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        match builder.send().await {
            Ok(resp) if resp.status().is_server_error() => {
                Err(RegistryError::disconnected(format!(
                    "service center returned {}",
                    resp.status()
                )))
            }
            Ok(resp) => Ok(resp),
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    let next = self.current.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        error = %e,
                        next_address = %self.addresses[next % self.addresses.len()],
                        "Service center request failed, switching address"
                    );
                }
                Err(e.into())
            }
        }
    }

    async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn unexpected(resp: Response, action: &str) -> RegistryError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        RegistryError::Rejected(format!("{} failed, status={}, body={}", action, status, body))
    }
}

fn is_not_found(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST
}

#[async_trait]
impl ServiceRegistryClient for HttpServiceRegistryClient {
    async fn get_microservice_id(&self, microservice: &Microservice) -> Result<Option<String>> {
        let builder = self.request(Method::GET, "/existence").query(&[
            ("type", "microservice"),
            ("appId", microservice.app_id.as_str()),
            ("serviceName", microservice.service_name.as_str()),
            ("version", microservice.version.as_str()),
            ("env", microservice.environment.as_str()),
        ]);
        let resp = self.send(builder).await?;
        match resp.status() {
            s if s.is_success() => {
                let body: ServiceIdResponse = Self::read_json(resp).await?;
                Ok(Some(body.service_id).filter(|id| !id.is_empty()))
            }
            s if is_not_found(s) => Ok(None),
            _ => Err(Self::unexpected(resp, "get microservice id").await),
        }
    }

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>> {
        let path = format!("/microservices/{}", service_id);
        let resp = self.send(self.request(Method::GET, &path)).await?;
        match resp.status() {
            s if s.is_success() => {
                let body: GetServiceResponse = Self::read_json(resp).await?;
                Ok(Some(body.service.into()))
            }
            s if is_not_found(s) => Ok(None),
            _ => Err(Self::unexpected(resp, "get microservice").await),
        }
    }

    async fn register_microservice(&self, microservice: &Microservice) -> Result<String> {
        let body = json!({ "service": WireMicroservice::from(microservice) });
        let resp = self
            .send(self.request(Method::POST, "/microservices").json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp, "register microservice").await);
        }
        let body: ServiceIdResponse = Self::read_json(resp).await?;
        Ok(body.service_id)
    }

    async fn get_schemas(&self, service_id: &str) -> Result<Vec<SchemaSummary>> {
        let path = format!("/microservices/{}/schemas", service_id);
        let resp = self.send(self.request(Method::GET, &path)).await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp, "get schemas").await);
        }
        let body: GetSchemasResponse = Self::read_json(resp).await?;
        Ok(body.schemas)
    }

    async fn get_schema(&self, service_id: &str, schema_id: &str) -> Result<Option<String>> {
        let path = format!("/microservices/{}/schemas/{}", service_id, schema_id);
        let resp = self.send(self.request(Method::GET, &path)).await?;
        match resp.status() {
            s if s.is_success() => {
                let body: GetSchemaResponse = Self::read_json(resp).await?;
                Ok(body.schema.filter(|s| !s.is_empty()))
            }
            s if is_not_found(s) => Ok(None),
            _ => Err(Self::unexpected(resp, "get schema").await),
        }
    }

    async fn register_schema(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
    ) -> Result<bool> {
        let path = format!("/microservices/{}/schemas/{}", service_id, schema_id);
        let body = json!({
            "schema": content,
            "summary": crate::registry::schema::calc_schema_summary(content),
        });
        let resp = self
            .send(self.request(Method::PUT, &path).json(&body))
            .await?;
        if resp.status().is_success() {
            debug!(service_id, schema_id, "Schema registered");
            Ok(true)
        } else {
            warn!(
                service_id,
                schema_id,
                status = %resp.status(),
                "Register schema rejected"
            );
            Ok(false)
        }
    }

    async fn register_instance(&self, instance: &MicroserviceInstance) -> Result<String> {
        let path = format!("/microservices/{}/instances", instance.service_id);
        let body = json!({ "instance": instance });
        let resp = self
            .send(self.request(Method::POST, &path).json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp, "register instance").await);
        }
        let body: InstanceIdResponse = Self::read_json(resp).await?;
        Ok(body.instance_id)
    }

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        let path = format!("/microservices/{}/instances/{}", service_id, instance_id);
        let resp = self.send(self.request(Method::DELETE, &path)).await?;
        Ok(resp.status().is_success())
    }

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        let path = format!(
            "/microservices/{}/instances/{}/heartbeat",
            service_id, instance_id
        );
        let resp = self.send(self.request(Method::PUT, &path)).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            s if is_not_found(s) => Ok(false),
            _ => Err(Self::unexpected(resp, "heartbeat").await),
        }
    }

    async fn find_service_instances(
        &self,
        consumer_id: &str,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        revision: Option<&str>,
    ) -> Result<MicroserviceInstances> {
        let builder = self
            .request(Method::GET, "/instances")
            .header(HEADER_CONSUMER_ID, consumer_id)
            .query(&[
                ("appId", app_id),
                ("serviceName", service_name),
                ("version", version_rule),
                ("rev", revision.unwrap_or_default()),
            ]);
        let resp = self.send(builder).await?;
        let new_revision = resp
            .headers()
            .get(HEADER_REVISION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match resp.status() {
            StatusCode::NOT_MODIFIED => Ok(MicroserviceInstances::unchanged(
                new_revision.or_else(|| revision.map(str::to_string)),
            )),
            s if s.is_success() => {
                let body: FindInstancesResponse = Self::read_json(resp).await?;
                Ok(MicroserviceInstances::changed(
                    body.decode(app_id, service_name),
                    new_revision,
                ))
            }
            s if is_not_found(s) => {
                debug!(app_id, service_name, "Microservice not exist in service center");
                Ok(MicroserviceInstances::not_exist())
            }
            _ => Err(Self::unexpected(resp, "find instances").await),
        }
    }

    async fn get_microservice_instance(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<Option<MicroserviceInstance>> {
        let path = format!("/microservices/{}/instances/{}", service_id, instance_id);
        let resp = self
            .send(self.request(Method::GET, &path).header(HEADER_CONSUMER_ID, service_id))
            .await?;
        match resp.status() {
            s if s.is_success() => {
                let body: GetInstanceResponse = Self::read_json(resp).await?;
                Ok(Some(body.instance))
            }
            s if is_not_found(s) => Ok(None),
            _ => Err(Self::unexpected(resp, "get instance").await),
        }
    }

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<bool> {
        let path = format!(
            "/microservices/{}/instances/{}/status",
            service_id, instance_id
        );
        let resp = self
            .send(
                self.request(Method::PUT, &path)
                    .query(&[("value", status.as_str())]),
            )
            .await?;
        Ok(resp.status().is_success())
    }

    async fn get_all_microservices(&self) -> Result<Vec<Microservice>> {
        let resp = self
            .send(self.request(Method::GET, "/microservices"))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp, "get all microservices").await);
        }
        let body: GetServicesResponse = Self::read_json(resp).await?;
        Ok(body.services.into_iter().map(Microservice::from).collect())
    }
}
