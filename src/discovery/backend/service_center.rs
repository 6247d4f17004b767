//! 服务中心（poll/heartbeat）服务发现后端
//!
//! 按需查询并缓存 revision，后台按间隔轮询已查询过的服务，revision 变化时通知监听器。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ServiceRegistryClient;
use crate::discovery::{Discovery, InstanceChangedListener, MicroserviceInstance};
use crate::error::{RegistryError, Result};
use crate::registry::local::LocalMicroservice;
use crate::registry::microservice::Microservice;
use crate::registry::service_center::SERVICE_CENTER_REGISTRY_NAME;
use crate::retry::{BackoffPolicy, ExponentialBackoff};
use crate::task::{EventBus, TaskEvent};
use crate::version::VERSION_RULE_ALL;

#[derive(Debug, Clone, Default)]
struct CachedInstances {
    revision: Option<String>,
    instances: Vec<MicroserviceInstance>,
}

struct ServiceCenterDiscoveryInner {
    enabled: bool,
    client: Arc<dyn ServiceRegistryClient>,
    consumer: RwLock<Option<Arc<LocalMicroservice>>>,
    pull_interval: Duration,
    cache: DashMap<(String, String), CachedInstances>,
    listener: RwLock<Option<Arc<dyn InstanceChangedListener>>>,
}

impl ServiceCenterDiscoveryInner {
    fn consumer_id(&self) -> String {
        self.consumer
            .read()
            .as_ref()
            .map(|local| local.service_id())
            .unwrap_or_default()
    }

    fn listener(&self) -> Option<Arc<dyn InstanceChangedListener>> {
        self.listener.read().clone()
    }

    /// 查询一次，返回实例列表以及是否发生变化
    async fn pull(&self, app_id: &str, service_name: &str) -> Result<(Vec<MicroserviceInstance>, bool)> {
        let key = (app_id.to_string(), service_name.to_string());
        let revision = self.cache.get(&key).and_then(|c| c.revision.clone());

        let result = self
            .client
            .find_service_instances(
                &self.consumer_id(),
                app_id,
                service_name,
                VERSION_RULE_ALL,
                revision.as_deref(),
            )
            .await?;

        if result.microservice_not_exist {
            self.cache.remove(&key);
            return Err(RegistryError::MicroserviceNotFound {
                app_id: app_id.to_string(),
                service_name: service_name.to_string(),
            });
        }

        if !result.need_refresh {
            let instances = self
                .cache
                .get(&key)
                .map(|c| c.instances.clone())
                .unwrap_or_default();
            return Ok((instances, false));
        }

        let mut instances = result.instances;
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        self.cache.insert(
            key,
            CachedInstances {
                revision: result.revision,
                instances: instances.clone(),
            },
        );
        Ok((instances, true))
    }

    /// 轮询一轮，返回是否全部成功
    async fn poll_round(&self) -> bool {
        let keys: Vec<(String, String)> = self.cache.iter().map(|e| e.key().clone()).collect();
        let mut healthy = true;

        for (app_id, service_name) in keys {
            match self.pull(&app_id, &service_name).await {
                Ok((instances, true)) => {
                    debug!(app_id = %app_id, service_name = %service_name, count = instances.len(), "Instances changed");
                    if let Some(listener) = self.listener() {
                        listener.on_instance_changed(
                            SERVICE_CENTER_REGISTRY_NAME,
                            &app_id,
                            &service_name,
                            instances,
                        );
                    }
                }
                Ok((_, false)) => {}
                Err(e) if e.is_not_found() => {
                    info!(app_id = %app_id, service_name = %service_name, "Microservice removed from service center");
                }
                Err(e) => {
                    warn!(app_id = %app_id, service_name = %service_name, error = %e, "Pull instances failed");
                    healthy = false;
                }
            }
        }
        healthy
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), self.pull_interval);
        let mut failures = 0;

        loop {
            let delay = if failures == 0 {
                self.pull_interval
            } else {
                backoff.backoff_duration(failures - 1)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if self.poll_round().await {
                if failures > 0 {
                    info!("Service center reachable again");
                    if let Some(listener) = self.listener() {
                        listener.on_connection_recovered(SERVICE_CENTER_REGISTRY_NAME);
                    }
                }
                failures = 0;
            } else {
                failures += 1;
            }
        }
    }

    async fn forward_recovery(self: Arc<Self>, bus: EventBus, cancel: CancellationToken) {
        let mut events = bus.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(TaskEvent::ConnectionRecovered) => {
                        if let Some(listener) = self.listener() {
                            listener.on_connection_recovered(SERVICE_CENTER_REGISTRY_NAME);
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

/// 服务中心服务发现
pub struct ServiceCenterDiscovery {
    inner: Arc<ServiceCenterDiscoveryInner>,
    recovery_bus: Option<EventBus>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceCenterDiscovery {
    pub fn new(
        client: Arc<dyn ServiceRegistryClient>,
        pull_interval: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceCenterDiscoveryInner {
                enabled,
                client,
                consumer: RwLock::new(None),
                pull_interval,
                cache: DashMap::new(),
                listener: RwLock::new(None),
            }),
            recovery_bus: None,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 以本地微服务作为查询的消费者
    pub fn with_consumer(self, local: Arc<LocalMicroservice>) -> Self {
        *self.inner.consumer.write() = Some(local);
        self
    }

    /// 订阅注册任务的心跳恢复事件
    pub fn with_recovery_events(mut self, bus: EventBus) -> Self {
        self.recovery_bus = Some(bus);
        self
    }
}

#[async_trait]
impl Discovery for ServiceCenterDiscovery {
    fn name(&self) -> &str {
        SERVICE_CENTER_REGISTRY_NAME
    }

    fn enabled(&self) -> bool {
        self.inner.enabled
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }
        handles.push(tokio::spawn(
            self.inner.clone().poll_loop(self.cancel.child_token()),
        ));
        if let Some(bus) = &self.recovery_bus {
            handles.push(tokio::spawn(
                self.inner
                    .clone()
                    .forward_recovery(bus.clone(), self.cancel.child_token()),
            ));
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.cancel.cancel();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> Result<Vec<MicroserviceInstance>> {
        let (instances, _) = self.inner.pull(app_id, service_name).await?;
        Ok(instances)
    }

    async fn find_services(&self, app_id: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .inner
            .client
            .get_all_microservices()
            .await?
            .into_iter()
            .filter(|ms| ms.app_id == app_id)
            .map(|ms| ms.service_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn set_instance_changed_listener(&self, listener: Arc<dyn InstanceChangedListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>> {
        self.inner.client.get_microservice(service_id).await
    }
}
