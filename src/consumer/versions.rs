//! 单个服务的版本与实例缓存

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use super::microservice_version::MicroserviceVersion;
use super::protection::EmptyInstanceProtection;
use super::version_rule::MicroserviceVersionRule;
use crate::discovery::{InstanceSource, MicroserviceInstance};
use crate::error::{RegistryError, Result};
use crate::version::VersionRule;

/// 某一时刻的完整缓存状态
#[derive(Debug, Default)]
pub struct VersionsState {
    pub revision: Option<String>,
    /// serviceId -> 版本
    pub versions: HashMap<String, Arc<MicroserviceVersion>>,
    /// 按实例 ID 排序
    pub instances: Arc<Vec<MicroserviceInstance>>,
}

/// 单个 (appId, serviceName) 的缓存
///
/// 拉取由 `pull_lock` 串行化；状态以写时复制的方式整体替换，
/// 各版本规则缓存在 `rules` 的写锁下一并重建，读者不会看到半更新的结果。
pub struct MicroserviceVersions {
    app_id: String,
    service_name: String,
    source: Arc<dyn InstanceSource>,
    use_up_instances_only: bool,
    protection: Option<EmptyInstanceProtection>,
    state: RwLock<Arc<VersionsState>>,
    rules: RwLock<HashMap<String, Arc<MicroserviceVersionRule>>>,
    pull_lock: Mutex<()>,
    initialized: OnceCell<()>,
    not_exist: AtomicBool,
    waiting_delete: AtomicBool,
}

impl MicroserviceVersions {
    pub fn new(
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        source: Arc<dyn InstanceSource>,
        use_up_instances_only: bool,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            source,
            use_up_instances_only,
            protection: None,
            state: RwLock::new(Arc::new(VersionsState::default())),
            rules: RwLock::new(HashMap::new()),
            pull_lock: Mutex::new(()),
            initialized: OnceCell::new(),
            not_exist: AtomicBool::new(false),
            waiting_delete: AtomicBool::new(false),
        }
    }

    /// 拉到空列表时保留仍然存活的旧实例
    pub fn with_empty_instance_protection(mut self, protection: Option<EmptyInstanceProtection>) -> Self {
        self.protection = protection;
        self
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn state(&self) -> Arc<VersionsState> {
        self.state.read().clone()
    }

    pub fn revision(&self) -> Option<String> {
        self.state.read().revision.clone()
    }

    /// 最近一次拉取时注册中心报告服务不存在
    pub fn is_microservice_not_exist(&self) -> bool {
        self.not_exist.load(Ordering::SeqCst)
    }

    /// 缓存已失效，应由上层移除
    pub fn is_waiting_delete(&self) -> bool {
        self.waiting_delete.load(Ordering::SeqCst)
    }

    /// 首次访问时拉取一次；之后由事件和周期任务刷新
    pub async fn ensure_initialized(&self) {
        self.initialized
            .get_or_init(|| async {
                if let Err(e) = self.pull_instances(false).await {
                    warn!(
                        app_id = %self.app_id,
                        service_name = %self.service_name,
                        error = %e,
                        "Initial pull failed"
                    );
                }
            })
            .await;
    }

    /// 获取或创建版本规则缓存，新建的规则立即按当前状态计算
    pub fn get_or_create_rule(&self, spec: &str) -> Result<Arc<MicroserviceVersionRule>> {
        let rule = VersionRule::parse(spec)?;
        if let Some(existing) = self.rules.read().get(rule.spec()) {
            return Ok(existing.clone());
        }

        let mut rules = self.rules.write();
        if let Some(existing) = rules.get(rule.spec()) {
            return Ok(existing.clone());
        }
        let key = rule.spec().to_string();
        let created = Arc::new(MicroserviceVersionRule::new(rule));
        let state = self.state.read().clone();
        created.set_instances(&state.versions, &state.instances);
        rules.insert(key, created.clone());
        Ok(created)
    }

    pub fn rules(&self) -> Vec<Arc<MicroserviceVersionRule>> {
        self.rules.read().values().cloned().collect()
    }

    /// 从注册中心拉取实例
    ///
    /// `force` 为 true 时忽略已缓存的 revision 全量重建。
    /// 只有连接类错误会返回 `Err`，此时缓存保持不变。
    pub async fn pull_instances(&self, force: bool) -> Result<()> {
        let _guard = self.pull_lock.lock().await;
        let revision = if force { None } else { self.revision() };

        let pulled = self
            .source
            .find_service_instances(&self.app_id, &self.service_name, revision.as_deref())
            .await;

        match pulled {
            Ok(result) if result.microservice_not_exist => {
                self.clear_not_exist();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.clear_not_exist();
                Ok(())
            }
            Err(e) => {
                debug!(
                    app_id = %self.app_id,
                    service_name = %self.service_name,
                    error = %e,
                    "Pull instances failed, cache kept"
                );
                Err(e)
            }
            Ok(result) if !result.need_refresh => Ok(()),
            Ok(result) => {
                self.apply_instances(result.instances, result.revision, force)
                    .await
            }
        }
    }

    /// 用一份完整的实例列表更新缓存；revision 与当前相同时不做任何事
    pub async fn safe_set_instances(
        &self,
        pulled: Vec<MicroserviceInstance>,
        revision: Option<String>,
    ) -> Result<()> {
        let _guard = self.pull_lock.lock().await;
        self.apply_instances(pulled, revision, false).await
    }

    async fn apply_instances(
        &self,
        mut pulled: Vec<MicroserviceInstance>,
        revision: Option<String>,
        force: bool,
    ) -> Result<()> {
        let current = self.state();
        if !force && revision.is_some() && revision == current.revision {
            return Ok(());
        }

        if pulled.is_empty() && !current.instances.is_empty() {
            if let Some(protection) = &self.protection {
                pulled = protection
                    .retain_alive(&self.service_name, &current.instances)
                    .await;
            }
        }
        if self.use_up_instances_only {
            pulled.retain(|instance| instance.is_up());
        }
        pulled.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let mut versions: HashMap<String, Arc<MicroserviceVersion>> = HashMap::new();
        for instance in &pulled {
            if versions.contains_key(&instance.service_id) {
                continue;
            }
            let version = match current.versions.get(&instance.service_id) {
                Some(known) => known.clone(),
                None => self.fetch_version(&instance.service_id).await?,
            };
            versions.insert(instance.service_id.clone(), version);
        }

        let instances = Arc::new(pulled);
        {
            let rules = self.rules.write();
            for rule in rules.values() {
                rule.set_instances(&versions, &instances);
            }
            *self.state.write() = Arc::new(VersionsState {
                revision: revision.clone(),
                versions,
                instances: instances.clone(),
            });
        }
        self.not_exist.store(false, Ordering::SeqCst);

        debug!(
            app_id = %self.app_id,
            service_name = %self.service_name,
            revision = ?revision,
            count = instances.len(),
            "Instances cache rebuilt"
        );
        Ok(())
    }

    /// 获取未知 serviceId 的版本信息，失败时整个缓存失效
    async fn fetch_version(&self, service_id: &str) -> Result<Arc<MicroserviceVersion>> {
        let fetched = match self.source.get_microservice(service_id).await {
            Ok(Some(microservice)) => MicroserviceVersion::new(microservice),
            Ok(None) => Err(RegistryError::system(format!(
                "microservice {service_id} not found"
            ))),
            Err(e) => Err(e),
        };
        match fetched {
            Ok(version) => Ok(Arc::new(version)),
            Err(e) => {
                error!(
                    app_id = %self.app_id,
                    service_name = %self.service_name,
                    service_id,
                    error = %e,
                    "Failed to load microservice version, dropping cache"
                );
                self.waiting_delete.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn clear_not_exist(&self) {
        let empty = Arc::new(VersionsState::default());
        {
            let rules = self.rules.write();
            for rule in rules.values() {
                rule.set_instances(&empty.versions, &empty.instances);
            }
            *self.state.write() = empty;
        }
        if !self.not_exist.swap(true, Ordering::SeqCst) {
            info!(
                app_id = %self.app_id,
                service_name = %self.service_name,
                "Microservice not exist, cache cleared"
            );
        }
        self.waiting_delete.store(true, Ordering::SeqCst);
    }
}
