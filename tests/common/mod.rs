//! 集成测试公共工具
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use flare_registry_core::client::{LocalServiceRegistryClient, ServiceRegistryClient};
use flare_registry_core::discovery::{
    InstanceSource, InstanceStatus, MicroserviceInstance, MicroserviceInstances,
};
use flare_registry_core::error::{RegistryError, Result};
use flare_registry_core::registry::{Microservice, SchemaSummary};

/// 安装测试用日志，重复调用无副作用
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn microservice(app_id: &str, service_name: &str, version: &str, service_id: &str) -> Microservice {
    let mut microservice = Microservice::new(app_id, service_name, version);
    microservice.service_id = service_id.to_string();
    microservice
}

pub fn instance(service_id: &str, instance_id: &str) -> MicroserviceInstance {
    MicroserviceInstance {
        instance_id: instance_id.to_string(),
        service_id: service_id.to_string(),
        endpoints: vec![format!("rest://{}:8080", instance_id)],
        ..Default::default()
    }
}

pub fn ids(instances: &[MicroserviceInstance]) -> Vec<&str> {
    instances.iter().map(|i| i.instance_id.as_str()).collect()
}

/// 包装内存客户端，记录契约注册调用并可以模拟断连
#[derive(Default)]
pub struct MockRegistryClient {
    pub inner: LocalServiceRegistryClient,
    schema_registrations: Mutex<Vec<(String, String)>>,
    disconnected: AtomicBool,
}

impl MockRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// (schemaId, content)
    pub fn schema_registrations(&self) -> Vec<(String, String)> {
        self.schema_registrations.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(RegistryError::disconnected("mock service center offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistryClient for MockRegistryClient {
    async fn get_microservice_id(&self, microservice: &Microservice) -> Result<Option<String>> {
        self.check()?;
        self.inner.get_microservice_id(microservice).await
    }

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>> {
        self.check()?;
        self.inner.get_microservice(service_id).await
    }

    async fn register_microservice(&self, microservice: &Microservice) -> Result<String> {
        self.check()?;
        self.inner.register_microservice(microservice).await
    }

    async fn get_schemas(&self, service_id: &str) -> Result<Vec<SchemaSummary>> {
        self.check()?;
        self.inner.get_schemas(service_id).await
    }

    async fn get_schema(&self, service_id: &str, schema_id: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get_schema(service_id, schema_id).await
    }

    async fn register_schema(
        &self,
        service_id: &str,
        schema_id: &str,
        content: &str,
    ) -> Result<bool> {
        self.check()?;
        self.schema_registrations
            .lock()
            .push((schema_id.to_string(), content.to_string()));
        self.inner.register_schema(service_id, schema_id, content).await
    }

    async fn register_instance(&self, instance: &MicroserviceInstance) -> Result<String> {
        self.check()?;
        self.inner.register_instance(instance).await
    }

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        self.check()?;
        self.inner.unregister_instance(service_id, instance_id).await
    }

    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        self.check()?;
        self.inner.heartbeat(service_id, instance_id).await
    }

    async fn find_service_instances(
        &self,
        consumer_id: &str,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        revision: Option<&str>,
    ) -> Result<MicroserviceInstances> {
        self.check()?;
        self.inner
            .find_service_instances(consumer_id, app_id, service_name, version_rule, revision)
            .await
    }

    async fn get_microservice_instance(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<Option<MicroserviceInstance>> {
        self.check()?;
        self.inner
            .get_microservice_instance(service_id, instance_id)
            .await
    }

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<bool> {
        self.check()?;
        self.inner
            .update_instance_status(service_id, instance_id, status)
            .await
    }

    async fn get_all_microservices(&self) -> Result<Vec<Microservice>> {
        self.check()?;
        self.inner.get_all_microservices().await
    }
}

#[derive(Default)]
struct FakeState {
    microservices: HashMap<String, Microservice>,
    instances: Vec<MicroserviceInstance>,
    revision: Option<String>,
    not_exist: bool,
    disconnected: bool,
    microservice_lookup_fails: bool,
}

/// 可编程的实例来源
#[derive(Default)]
pub struct FakeInstanceSource {
    state: Mutex<FakeState>,
    pulls: AtomicUsize,
    microservice_lookups: AtomicUsize,
}

impl FakeInstanceSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_microservice(&self, microservice: Microservice) {
        self.state
            .lock()
            .microservices
            .insert(microservice.service_id.clone(), microservice);
    }

    pub fn set_instances(&self, instances: Vec<MicroserviceInstance>, revision: &str) {
        let mut state = self.state.lock();
        state.instances = instances;
        state.revision = Some(revision.to_string());
        state.not_exist = false;
    }

    pub fn set_not_exist(&self) {
        let mut state = self.state.lock();
        state.instances.clear();
        state.revision = None;
        state.not_exist = true;
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    pub fn set_microservice_lookup_fails(&self, fails: bool) {
        self.state.lock().microservice_lookup_fails = fails;
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn microservice_lookups(&self) -> usize {
        self.microservice_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceSource for FakeInstanceSource {
    async fn find_service_instances(
        &self,
        _app_id: &str,
        _service_name: &str,
        revision: Option<&str>,
    ) -> Result<MicroserviceInstances> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if state.disconnected {
            return Err(RegistryError::disconnected("fake registry offline"));
        }
        if state.not_exist {
            return Ok(MicroserviceInstances::not_exist());
        }
        if revision.is_some() && revision == state.revision.as_deref() {
            return Ok(MicroserviceInstances::unchanged(state.revision.clone()));
        }
        Ok(MicroserviceInstances::changed(
            state.instances.clone(),
            state.revision.clone(),
        ))
    }

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>> {
        self.microservice_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if state.microservice_lookup_fails {
            return Err(RegistryError::disconnected("fake registry offline"));
        }
        Ok(state.microservices.get(service_id).cloned())
    }
}
