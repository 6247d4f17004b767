//! etcd（watch/lease）注册后端
//!
//! 实例文档以 JSON 写入 `<root>/<environment>/<app>/<service>/<instanceId>`，
//! 绑定 TTL lease，后台按 TTL/12 续约。进程异常退出时 key 在一个 TTL 内自动删除。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, PutOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::local::LocalMicroservice;
use super::microservice::Microservice;
use super::trait_def::Registration;
use crate::config::EtcdConfig;
use crate::discovery::instance::{InstanceStatus, MicroserviceInstance};
use crate::error::{RegistryError, Result};
use crate::retry::{BackoffPolicy, ExponentialBackoff};

pub const ETCD_REGISTRY_NAME: &str = "etcd";

/// 未配置环境时使用的路径段
pub const ETCD_DEFAULT_ENVIRONMENT: &str = "production";

/// etcd 中保存的实例文档
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EtcdInstance {
    pub service_id: String,
    pub instance_id: String,
    pub environment: String,
    pub application: String,
    pub service_name: String,
    pub version: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub status: InstanceStatus,
    /// schemaId -> 内容
    #[serde(default)]
    pub schemas: BTreeMap<String, String>,
}

impl EtcdInstance {
    pub fn from_local(microservice: &Microservice, instance: &MicroserviceInstance) -> Self {
        Self {
            service_id: microservice.service_id.clone(),
            instance_id: instance.instance_id.clone(),
            environment: microservice.environment.clone(),
            application: microservice.app_id.clone(),
            service_name: microservice.service_name.clone(),
            version: microservice.version.clone(),
            endpoints: instance.endpoints.clone(),
            properties: instance.properties.clone(),
            status: instance.status,
            schemas: microservice.schemas.clone(),
        }
    }

    pub fn to_instance(&self) -> MicroserviceInstance {
        MicroserviceInstance {
            instance_id: self.instance_id.clone(),
            service_id: self.service_id.clone(),
            host_name: String::new(),
            endpoints: self.endpoints.clone(),
            properties: self.properties.clone(),
            status: self.status,
            health_check: None,
        }
    }

    pub fn to_microservice(&self) -> Microservice {
        Microservice {
            app_id: self.application.clone(),
            service_name: self.service_name.clone(),
            version: self.version.clone(),
            environment: self.environment.clone(),
            service_id: self.service_id.clone(),
            schemas: self.schemas.clone(),
            ..Default::default()
        }
    }
}

/// key 路径规则
#[derive(Debug, Clone)]
pub struct EtcdPaths {
    base: String,
}

impl EtcdPaths {
    pub fn new(root_path: &str, environment: &str) -> Self {
        let environment = if environment.is_empty() {
            ETCD_DEFAULT_ENVIRONMENT
        } else {
            environment
        };
        Self {
            base: format!("{}/{}", root_path.trim_end_matches('/'), environment),
        }
    }

    /// 应用前缀，带结尾 `/`
    pub fn app_prefix(&self, app_id: &str) -> String {
        format!("{}/{}/", self.base, app_id)
    }

    /// 服务前缀，带结尾 `/`
    pub fn service_prefix(&self, app_id: &str, service_name: &str) -> String {
        format!("{}/{}/{}/", self.base, app_id, service_name)
    }

    pub fn instance_key(&self, app_id: &str, service_name: &str, instance_id: &str) -> String {
        format!("{}{}", self.service_prefix(app_id, service_name), instance_id)
    }

    /// 从完整 key 中取出应用前缀之后的服务名
    pub fn service_name_of<'a>(&self, app_prefix: &str, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(app_prefix)?;
        let (service_name, instance_id) = rest.split_once('/')?;
        (!service_name.is_empty() && !instance_id.is_empty()).then_some(service_name)
    }
}

/// 按配置连接 etcd
pub async fn connect(config: &EtcdConfig) -> Result<Client> {
    let options = config
        .credentials()?
        .map(|(user, password)| ConnectOptions::new().with_user(user, password));
    let client = Client::connect(config.endpoints.clone(), options).await?;
    info!(endpoints = ?config.endpoints, "Connected to etcd");
    Ok(client)
}

enum KeepAliveExit {
    Cancelled,
    Expired,
}

struct EtcdRegistrationInner {
    config: EtcdConfig,
    paths: EtcdPaths,
    local: Arc<LocalMicroservice>,
    client: OnceCell<Client>,
    lease_id: Mutex<Option<i64>>,
}

impl EtcdRegistrationInner {
    fn client(&self) -> Result<Client> {
        self.client
            .get()
            .cloned()
            .ok_or_else(|| RegistryError::system("etcd registration not initialized"))
    }

    fn instance_key(&self) -> String {
        let microservice = self.local.microservice();
        self.paths.instance_key(
            &microservice.app_id,
            &microservice.service_name,
            &self.local.instance_id(),
        )
    }

    async fn put_document(&self, lease_id: i64) -> Result<()> {
        let document =
            EtcdInstance::from_local(&self.local.microservice(), &self.local.instance());
        let value = serde_json::to_vec(&document)?;
        let mut client = self.client()?;
        client
            .put(
                self.instance_key(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await?;
        Ok(())
    }

    /// 申请新 lease 并写入实例文档
    async fn register(&self) -> Result<i64> {
        let mut client = self.client()?;
        let lease = client.lease_grant(self.config.lease_ttl_secs, None).await?;
        let lease_id = lease.id();
        self.put_document(lease_id).await?;
        *self.lease_id.lock() = Some(lease_id);
        info!(
            key = %self.instance_key(),
            lease_id,
            ttl = self.config.lease_ttl_secs,
            "Instance registered to etcd"
        );
        Ok(lease_id)
    }

    async fn keep_alive_once(&self, cancel: &CancellationToken) -> Result<KeepAliveExit> {
        let current = *self.lease_id.lock();
        let Some(lease_id) = current else {
            return Ok(KeepAliveExit::Expired);
        };

        let mut client = self.client()?;
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let mut ticker = tokio::time::interval(self.config.keep_alive_interval());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(KeepAliveExit::Cancelled),
                _ = ticker.tick() => {
                    keeper.keep_alive().await?;
                    match stream.message().await? {
                        Some(resp) if resp.ttl() <= 0 => return Ok(KeepAliveExit::Expired),
                        Some(resp) => trace!(lease_id, ttl = resp.ttl(), "Lease renewed"),
                        None => {
                            return Err(RegistryError::disconnected("lease keep-alive stream closed"));
                        }
                    }
                }
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>, cancel: CancellationToken) {
        let backoff = ExponentialBackoff::default();
        let mut attempt = 0;

        loop {
            match self.keep_alive_once(&cancel).await {
                Ok(KeepAliveExit::Cancelled) => break,
                Ok(KeepAliveExit::Expired) => {
                    warn!(key = %self.instance_key(), "Lease expired, registering again");
                    match self.register().await {
                        Ok(_) => {
                            attempt = 0;
                            continue;
                        }
                        Err(e) => error!(error = %e, "Register to etcd again failed"),
                    }
                }
                Err(e) => warn!(error = %e, "Lease keep-alive failed"),
            }

            let delay = backoff.backoff_duration(attempt);
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Lease keep-alive stopped");
    }
}

/// etcd 注册
pub struct EtcdRegistration {
    inner: Arc<EtcdRegistrationInner>,
    cancel: CancellationToken,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdRegistration {
    pub fn new(config: EtcdConfig, environment: &str, local: Arc<LocalMicroservice>) -> Self {
        let paths = EtcdPaths::new(&config.root_path, environment);
        Self {
            inner: Arc::new(EtcdRegistrationInner {
                config,
                paths,
                local,
                client: OnceCell::new(),
                lease_id: Mutex::new(None),
            }),
            cancel: CancellationToken::new(),
            keep_alive: Mutex::new(None),
        }
    }

    /// 当前实例的 key
    pub fn instance_key(&self) -> String {
        self.inner.instance_key()
    }

    pub fn lease_id(&self) -> Option<i64> {
        *self.inner.lease_id.lock()
    }
}

#[async_trait]
impl Registration for EtcdRegistration {
    fn name(&self) -> &str {
        ETCD_REGISTRY_NAME
    }

    fn enabled(&self) -> bool {
        self.inner.config.enabled
    }

    async fn init(&self) -> Result<()> {
        self.inner
            .client
            .get_or_try_init(|| connect(&self.inner.config))
            .await?;
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let local = &self.inner.local;
        if local.service_id().is_empty() {
            let microservice = local.microservice();
            local.set_service_id(&format!(
                "{}:{}:{}",
                microservice.app_id, microservice.service_name, microservice.version
            ));
        }
        if local.instance_id().is_empty() {
            local.set_instance_id(&Uuid::new_v4().to_string());
        }

        self.inner.register().await?;

        let mut keep_alive = self.keep_alive.lock();
        if keep_alive.is_none() {
            *keep_alive = Some(tokio::spawn(
                self.inner.clone().keep_alive_loop(self.cancel.child_token()),
            ));
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }

        let Ok(mut client) = self.inner.client() else {
            return;
        };
        let lease_id = self.inner.lease_id.lock().take();
        if let Some(lease_id) = lease_id {
            if let Err(e) = client.lease_revoke(lease_id).await {
                warn!(lease_id, error = %e, "Revoke lease failed");
            }
        }
        let key = self.inner.instance_key();
        match client.delete(key.clone(), None).await {
            Ok(_) => info!(key = %key, "Instance unregistered from etcd"),
            Err(e) => warn!(key = %key, error = %e, "Delete instance key failed"),
        }
    }

    fn microservice(&self) -> Microservice {
        self.inner.local.microservice()
    }

    fn microservice_instance(&self) -> MicroserviceInstance {
        self.inner.local.instance()
    }

    fn add_schema(&self, schema_id: &str, content: &str) {
        self.inner.local.add_schema(schema_id, content);
    }

    fn add_endpoint(&self, endpoint: &str) {
        self.inner.local.add_endpoint(endpoint);
    }

    fn add_property(&self, key: &str, value: &str) {
        self.inner.local.add_property(key, value);
    }

    async fn update_microservice_instance_status(&self, status: InstanceStatus) -> bool {
        let Some(lease_id) = self.lease_id() else {
            warn!("Instance not registered to etcd yet");
            return false;
        };

        let previous = self.inner.local.instance().status;
        self.inner.local.set_instance_status(status);
        match self.inner.put_document(lease_id).await {
            Ok(()) => {
                info!(%status, "Instance status updated in etcd");
                true
            }
            Err(e) => {
                self.inner.local.set_instance_status(previous);
                warn!(%status, error = %e, "Update instance status in etcd failed");
                false
            }
        }
    }
}
