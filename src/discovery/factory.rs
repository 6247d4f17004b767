//! 注册发现工厂
//!
//! 按 [`RegistryConfig`] 构建启用的注册与发现后端，组装成一个可以整体启动、停止的 [`RegistryStack`]。

use std::sync::Arc;

use tracing::info;

use super::aggregate::AggregateDiscovery;
#[cfg(feature = "etcd")]
use super::backend::EtcdDiscovery;
use super::backend::ServiceCenterDiscovery;
use super::instance::MicroserviceInstance;
use super::{Discovery, WatchManager};
use crate::client::ServiceRegistryClient;
#[cfg(feature = "service-center")]
use crate::client::http::HttpServiceRegistryClient;
use crate::config::{RegistryConfig, ServiceCenterConfig};
use crate::consumer::{AppManager, EmptyInstanceProtection, InstancePing};
use crate::error::{RegistryError, Result};
#[cfg(feature = "etcd")]
use crate::registry::etcd::EtcdRegistration;
use crate::registry::{
    EnvAdapterManager, LocalMicroservice, Microservice, RegistrationManager,
    ServiceCenterRegistration,
};
use crate::task::SchemaPolicy;

/// 构建完成的注册发现组件
pub struct RegistryStack {
    pub local: Arc<LocalMicroservice>,
    pub registrations: RegistrationManager,
    pub discovery: Arc<AggregateDiscovery>,
    pub app_manager: Arc<AppManager>,
    config: RegistryConfig,
}

impl RegistryStack {
    /// 初始化并启动所有后端，然后启动消费端缓存的刷新任务
    pub async fn start(&self) -> Result<()> {
        self.registrations.init().await?;
        self.discovery.init().await?;
        self.registrations.run().await?;
        self.discovery.run().await?;
        self.app_manager
            .start(self.discovery.subscribe(), self.config.instance_pull_interval());
        info!(
            service = %self.local.microservice().display_key(),
            "Registry stack started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.app_manager.stop();
        self.discovery.destroy().await;
        self.registrations.destroy().await;
        info!("Registry stack stopped");
    }
}

/// 注册发现工厂
pub struct RegistryFactory {
    config: RegistryConfig,
    env_adapters: EnvAdapterManager,
    schema_policy: Option<SchemaPolicy>,
    service_center_client: Option<Arc<dyn ServiceRegistryClient>>,
    instance_ping: Option<Arc<dyn InstancePing>>,
    watches: Arc<WatchManager>,
}

impl RegistryFactory {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            env_adapters: EnvAdapterManager::new(),
            schema_policy: None,
            service_center_client: None,
            instance_ping: None,
            watches: Arc::new(WatchManager::new()),
        }
    }

    pub fn with_env_adapters(mut self, env_adapters: EnvAdapterManager) -> Self {
        self.env_adapters = env_adapters;
        self
    }

    pub fn with_schema_policy(mut self, policy: SchemaPolicy) -> Self {
        self.schema_policy = Some(policy);
        self
    }

    /// 使用指定的服务中心客户端，而不是按地址创建 HTTP 客户端
    pub fn with_service_center_client(mut self, client: Arc<dyn ServiceRegistryClient>) -> Self {
        self.service_center_client = Some(client);
        self
    }

    /// 空实例保护使用的探活方式，默认认为旧实例全部存活
    pub fn with_instance_ping(mut self, ping: Arc<dyn InstancePing>) -> Self {
        self.instance_ping = Some(ping);
        self
    }

    /// 在同一进程内共享 etcd watch
    pub fn with_watch_manager(mut self, watches: Arc<WatchManager>) -> Self {
        self.watches = watches;
        self
    }

    pub fn build(
        self,
        mut microservice: Microservice,
        instance: MicroserviceInstance,
    ) -> Result<RegistryStack> {
        self.config.validate()?;
        if microservice.environment.is_empty() {
            microservice.environment = self.config.environment.clone();
        }
        let local = Arc::new(LocalMicroservice::new(microservice, instance));

        let mut registrations = RegistrationManager::new(Vec::new());
        let mut discoveries: Vec<Arc<dyn Discovery>> = Vec::new();

        if let Some(sc_config) = self.config.service_center.as_ref().filter(|c| c.enabled) {
            let client = self.service_center_client(sc_config)?;
            let policy = self
                .schema_policy
                .clone()
                .unwrap_or_else(|| SchemaPolicy::from_config(&self.config));
            let registration = ServiceCenterRegistration::with_policy(
                &self.config,
                client.clone(),
                local.clone(),
                self.env_adapters.clone(),
                policy,
            );
            let discovery = ServiceCenterDiscovery::new(
                client,
                self.config.instance_pull_interval(),
                true,
            )
            .with_consumer(local.clone())
            .with_recovery_events(registration.event_bus().clone());

            registrations.add(Arc::new(registration));
            discoveries.push(Arc::new(discovery));
        }

        if let Some(etcd_config) = self.config.etcd.as_ref().filter(|c| c.enabled) {
            self.add_etcd(etcd_config, &local, &mut registrations, &mut discoveries)?;
        }

        if discoveries.is_empty() {
            return Err(RegistryError::configuration("no registry backend enabled"));
        }

        let discovery = AggregateDiscovery::new(discoveries);
        let mut app_manager = AppManager::new(discovery.clone(), self.config.use_up_instances_only);
        if self.config.empty_instance_protection {
            let protection = match &self.instance_ping {
                Some(ping) => EmptyInstanceProtection::new(ping.clone()),
                None => EmptyInstanceProtection::default(),
            };
            app_manager = app_manager.with_empty_instance_protection(protection);
        }
        let app_manager = Arc::new(app_manager);

        Ok(RegistryStack {
            local,
            registrations,
            discovery,
            app_manager,
            config: self.config,
        })
    }

    fn service_center_client(
        &self,
        sc_config: &ServiceCenterConfig,
    ) -> Result<Arc<dyn ServiceRegistryClient>> {
        if let Some(client) = &self.service_center_client {
            return Ok(client.clone());
        }
        #[cfg(feature = "service-center")]
        {
            Ok(Arc::new(HttpServiceRegistryClient::new(sc_config)?))
        }
        #[cfg(not(feature = "service-center"))]
        {
            let _ = sc_config;
            Err(RegistryError::configuration(
                "service center enabled but the `service-center` feature is off",
            ))
        }
    }

    #[cfg(feature = "etcd")]
    fn add_etcd(
        &self,
        etcd_config: &crate::config::EtcdConfig,
        local: &Arc<LocalMicroservice>,
        registrations: &mut RegistrationManager,
        discoveries: &mut Vec<Arc<dyn Discovery>>,
    ) -> Result<()> {
        registrations.add(Arc::new(EtcdRegistration::new(
            etcd_config.clone(),
            &self.config.environment,
            local.clone(),
        )));
        discoveries.push(Arc::new(EtcdDiscovery::with_watch_manager(
            etcd_config.clone(),
            &self.config.environment,
            self.watches.clone(),
        )));
        Ok(())
    }

    #[cfg(not(feature = "etcd"))]
    fn add_etcd(
        &self,
        _etcd_config: &crate::config::EtcdConfig,
        _local: &Arc<LocalMicroservice>,
        _registrations: &mut RegistrationManager,
        _discoveries: &mut Vec<Arc<dyn Discovery>>,
    ) -> Result<()> {
        Err(RegistryError::configuration(
            "etcd enabled but the `etcd` feature is off",
        ))
    }
}
