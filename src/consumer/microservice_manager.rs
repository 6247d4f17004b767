use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::warn;

use super::protection::EmptyInstanceProtection;
use super::versions::MicroserviceVersions;
use crate::discovery::InstanceSource;

/// 一个应用下全部服务的缓存
pub struct MicroserviceManager {
    app_id: String,
    source: Arc<dyn InstanceSource>,
    use_up_instances_only: bool,
    protection: Option<EmptyInstanceProtection>,
    versions: DashMap<String, Arc<MicroserviceVersions>>,
}

impl MicroserviceManager {
    pub fn new(
        app_id: impl Into<String>,
        source: Arc<dyn InstanceSource>,
        use_up_instances_only: bool,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            source,
            use_up_instances_only,
            protection: None,
            versions: DashMap::new(),
        }
    }

    pub fn with_empty_instance_protection(mut self, protection: Option<EmptyInstanceProtection>) -> Self {
        self.protection = protection;
        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// 获取服务缓存，不存在时创建并完成首次拉取
    pub async fn get_or_create_microservice_versions(
        &self,
        service_name: &str,
    ) -> Arc<MicroserviceVersions> {
        let versions = self
            .versions
            .entry(service_name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    MicroserviceVersions::new(
                        self.app_id.clone(),
                        service_name,
                        self.source.clone(),
                        self.use_up_instances_only,
                    )
                    .with_empty_instance_protection(self.protection.clone()),
                )
            })
            .clone();

        versions.ensure_initialized().await;
        self.remove_if_waiting_delete(&versions);
        versions
    }

    pub fn microservice_versions(&self, service_name: &str) -> Option<Arc<MicroserviceVersions>> {
        self.versions.get(service_name).map(|v| v.clone())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.versions.iter().map(|e| e.key().clone()).collect()
    }

    /// 刷新单个服务
    pub async fn pull_instances(&self, service_name: &str, force: bool) {
        let Some(versions) = self.microservice_versions(service_name) else {
            return;
        };
        if let Err(e) = versions.pull_instances(force).await {
            warn!(
                app_id = %self.app_id,
                service_name,
                error = %e,
                "Pull instances failed"
            );
        }
        self.remove_if_waiting_delete(&versions);
    }

    /// 并发刷新全部服务
    pub async fn pull_all(&self, force: bool) {
        let names = self.service_names();
        join_all(names.iter().map(|name| self.pull_instances(name, force))).await;
    }

    fn remove_if_waiting_delete(&self, versions: &Arc<MicroserviceVersions>) {
        if versions.is_waiting_delete() {
            self.versions
                .remove_if(versions.service_name(), |_, current| Arc::ptr_eq(current, versions));
        }
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
