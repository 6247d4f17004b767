//! 消费端缓存入口
//!
//! 按 appId 组织 `MicroserviceManager`，订阅汇总层的变化通知，
//! 并按 `instance_pull_interval` 周期性刷新已访问过的服务。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::microservice_manager::MicroserviceManager;
use super::protection::EmptyInstanceProtection;
use super::version_rule::MicroserviceVersionRule;
use crate::discovery::{DiscoveryEvent, InstanceSource, MicroserviceInstance};
use crate::error::Result;

pub struct AppManager {
    source: Arc<dyn InstanceSource>,
    use_up_instances_only: bool,
    protection: Option<EmptyInstanceProtection>,
    apps: DashMap<String, Arc<MicroserviceManager>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AppManager {
    pub fn new(source: Arc<dyn InstanceSource>, use_up_instances_only: bool) -> Self {
        Self {
            source,
            use_up_instances_only,
            protection: None,
            apps: DashMap::new(),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 开启空实例保护，对之后创建的服务缓存生效
    pub fn with_empty_instance_protection(mut self, protection: EmptyInstanceProtection) -> Self {
        self.protection = Some(protection);
        self
    }

    pub fn get_or_create_microservice_manager(&self, app_id: &str) -> Arc<MicroserviceManager> {
        self.apps
            .entry(app_id.to_string())
            .or_insert_with(|| {
                Arc::new(
                    MicroserviceManager::new(app_id, self.source.clone(), self.use_up_instances_only)
                        .with_empty_instance_protection(self.protection.clone()),
                )
            })
            .clone()
    }

    pub fn microservice_manager(&self, app_id: &str) -> Option<Arc<MicroserviceManager>> {
        self.apps.get(app_id).map(|m| m.clone())
    }

    /// 获取某个服务在给定版本规则下的缓存
    pub async fn get_or_create_microservice_version_rule(
        &self,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
    ) -> Result<Arc<MicroserviceVersionRule>> {
        let versions = self
            .get_or_create_microservice_manager(app_id)
            .get_or_create_microservice_versions(service_name)
            .await;
        versions.get_or_create_rule(version_rule)
    }

    /// 查询实例；服务在注册中心不存在时返回 `None`
    pub async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
    ) -> Result<Option<Vec<MicroserviceInstance>>> {
        let versions = self
            .get_or_create_microservice_manager(app_id)
            .get_or_create_microservice_versions(service_name)
            .await;
        let rule = versions.get_or_create_rule(version_rule)?;
        if versions.is_microservice_not_exist() {
            return Ok(None);
        }
        Ok(Some(rule.instance_list()))
    }

    pub async fn on_instances_changed(&self, app_id: &str, service_name: &str) {
        if let Some(manager) = self.microservice_manager(app_id) {
            manager.pull_instances(service_name, false).await;
        }
    }

    /// 注册中心重连后忽略 revision 全量刷新
    pub async fn on_connection_recovered(&self) {
        self.pull_all(true).await;
    }

    pub async fn pull_all(&self, force: bool) {
        let managers: Vec<Arc<MicroserviceManager>> =
            self.apps.iter().map(|e| e.value().clone()).collect();
        for manager in managers {
            manager.pull_all(force).await;
        }
    }

    pub async fn handle_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::InstancesChanged {
                app_id,
                service_name,
            } => {
                debug!(app_id = %app_id, service_name = %service_name, "Instances changed, pulling");
                self.on_instances_changed(&app_id, &service_name).await;
            }
            DiscoveryEvent::Recovered { registry_name } => {
                info!(registry = %registry_name, "Registry recovered, refreshing all caches");
                self.on_connection_recovered().await;
            }
        }
    }

    /// 启动事件订阅与周期刷新
    pub fn start(
        self: &Arc<Self>,
        events: broadcast::Receiver<DiscoveryEvent>,
        pull_interval: Duration,
    ) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        handles.push(tokio::spawn(
            self.clone().event_loop(events, self.cancel.child_token()),
        ));
        handles.push(tokio::spawn(
            self.clone().pull_loop(pull_interval, self.cancel.child_token()),
        ));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    async fn event_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<DiscoveryEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Discovery events lagged, refreshing all caches");
                        self.pull_all(false).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn pull_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.pull_all(false).await,
            }
        }
    }
}

impl Drop for AppManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
