//! etcd 服务发现后端
//!
//! 首次查询时读取一次前缀并为该前缀建立唯一的 watch；之后每次 watch 事件都重新读取整个前缀，
//! 通过 [`WatchHandle`] 把完整内容推给共享这条 watch 的所有发现实例。单条记录解码失败只记录日志并跳过。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{Client, GetOptions, WatchOptions};
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EtcdConfig;
use crate::discovery::{
    Discovery, InstanceChangedListener, MicroserviceInstance, WatchFeed, WatchHandle,
    WatchManager, WatchUpdate,
};
use crate::error::{RegistryError, Result};
use crate::registry::etcd::{ETCD_REGISTRY_NAME, EtcdInstance, EtcdPaths, connect};
use crate::registry::microservice::Microservice;
use crate::retry::{BackoffPolicy, ExponentialBackoff};

/// 本实例对一条共享 watch 的引用
struct OwnedWatch {
    _handle: Arc<WatchHandle>,
    forward: CancellationToken,
}

struct EtcdDiscoveryInner {
    config: EtcdConfig,
    paths: EtcdPaths,
    client: OnceCell<Client>,
    watches: Arc<WatchManager>,
    owned: DashMap<String, OwnedWatch>,
    microservices: DashMap<String, Microservice>,
    listener: RwLock<Option<Arc<dyn InstanceChangedListener>>>,
}

impl EtcdDiscoveryInner {
    fn client(&self) -> Result<Client> {
        self.client
            .get()
            .cloned()
            .ok_or_else(|| RegistryError::system("etcd discovery not started"))
    }

    /// 读取前缀下的全部记录，实例按 ID 排序
    async fn load(&self, prefix: &str) -> Result<WatchUpdate> {
        let mut client = self.client()?;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut update = WatchUpdate::default();
        let mut seen = HashSet::new();
        for kv in resp.kvs() {
            match serde_json::from_slice::<EtcdInstance>(kv.value()) {
                Ok(document) => {
                    if seen.insert(document.service_id.clone()) {
                        update.microservices.push(document.to_microservice());
                    }
                    update.instances.push(document.to_instance());
                }
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(kv.key()),
                    error = %e,
                    "Failed to decode instance from etcd, skipped"
                ),
            }
        }
        update
            .instances
            .sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(update)
    }

    fn remember(&self, microservices: &[Microservice]) {
        for microservice in microservices {
            self.microservices
                .entry(microservice.service_id.clone())
                .or_insert_with(|| microservice.clone());
        }
    }

    async fn read_prefix(&self, prefix: &str) -> Result<Vec<MicroserviceInstance>> {
        let update = self.load(prefix).await?;
        self.remember(&update.microservices);
        Ok(update.instances)
    }

    fn notify(&self, app_id: &str, service_name: &str, instances: Vec<MicroserviceInstance>) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_instance_changed(ETCD_REGISTRY_NAME, app_id, service_name, instances);
        }
    }

    fn ensure_watch(self: &Arc<Self>, app_id: &str, service_name: &str, prefix: &str) {
        self.owned.entry(prefix.to_string()).or_insert_with(|| {
            let handle = self.watches.acquire(prefix, |prefix, feed| {
                tokio::spawn(self.clone().watch_loop(prefix.to_string(), feed));
            });
            let forward = CancellationToken::new();
            tokio::spawn(self.clone().forward_updates(
                app_id.to_string(),
                service_name.to_string(),
                prefix.to_string(),
                handle.subscribe(),
                forward.clone(),
            ));
            OwnedWatch {
                _handle: handle,
                forward,
            }
        });
    }

    /// 把共享 watch 的推送转给本实例的监听器
    async fn forward_updates(
        self: Arc<Self>,
        app_id: String,
        service_name: String,
        prefix: String,
        mut updates: broadcast::Receiver<Arc<WatchUpdate>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = updates.recv() => match received {
                    Ok(update) => {
                        self.remember(&update.microservices);
                        self.notify(&app_id, &service_name, update.instances.clone());
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(prefix = %prefix, skipped, "Watch updates lagged, reloading");
                        match self.read_prefix(&prefix).await {
                            Ok(instances) => self.notify(&app_id, &service_name, instances),
                            Err(e) => warn!(prefix = %prefix, error = %e, "Reload instances from etcd failed"),
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn refresh(&self, prefix: &str, feed: &WatchFeed) {
        match self.load(prefix).await {
            Ok(update) => {
                let receivers = feed.publish(update);
                debug!(prefix = %prefix, receivers, "Watch update published");
            }
            Err(e) => warn!(prefix = %prefix, error = %e, "Refresh instances from etcd failed"),
        }
    }

    async fn watch_once(&self, prefix: &str, feed: &WatchFeed, attempt: &mut usize) -> Result<()> {
        let cancel = feed.cancellation();
        let mut client = self.client()?;
        let (_watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;
        *attempt = 0;
        debug!(prefix = %prefix, "Watch stream established");

        // 重连期间可能错过事件
        self.refresh(prefix, feed).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = stream.message() => match message? {
                    Some(resp) if resp.canceled() => {
                        return Err(RegistryError::disconnected("watch canceled by etcd"));
                    }
                    Some(resp) => {
                        if !resp.events().is_empty() {
                            self.refresh(prefix, feed).await;
                        }
                    }
                    None => return Err(RegistryError::disconnected("watch stream closed")),
                },
            }
        }
    }

    async fn watch_loop(self: Arc<Self>, prefix: String, feed: WatchFeed) {
        let cancel = feed.cancellation();
        let backoff = ExponentialBackoff::default();
        let mut attempt = 0;

        while !cancel.is_cancelled() {
            match self.watch_once(&prefix, &feed, &mut attempt).await {
                Ok(()) => break,
                Err(e) => warn!(prefix = %prefix, error = %e, "Watch interrupted, reconnecting"),
            }

            let delay = backoff.backoff_duration(attempt);
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(prefix = %prefix, "Watch stopped");
    }
}

/// etcd 服务发现
pub struct EtcdDiscovery {
    inner: Arc<EtcdDiscoveryInner>,
}

impl EtcdDiscovery {
    pub fn new(config: EtcdConfig, environment: &str) -> Self {
        Self::with_watch_manager(config, environment, Arc::new(WatchManager::new()))
    }

    /// 与其他发现实例共享 watch 管理器
    pub fn with_watch_manager(
        config: EtcdConfig,
        environment: &str,
        watches: Arc<WatchManager>,
    ) -> Self {
        let paths = EtcdPaths::new(&config.root_path, environment);
        Self {
            inner: Arc::new(EtcdDiscoveryInner {
                config,
                paths,
                client: OnceCell::new(),
                watches,
                owned: DashMap::new(),
                microservices: DashMap::new(),
                listener: RwLock::new(None),
            }),
        }
    }

    pub fn watch_manager(&self) -> &Arc<WatchManager> {
        &self.inner.watches
    }
}

#[async_trait]
impl Discovery for EtcdDiscovery {
    fn name(&self) -> &str {
        ETCD_REGISTRY_NAME
    }

    fn enabled(&self) -> bool {
        self.inner.config.enabled
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        self.inner
            .client
            .get_or_try_init(|| connect(&self.inner.config))
            .await?;
        Ok(())
    }

    async fn destroy(&self) {
        let prefixes: Vec<String> = self.inner.owned.iter().map(|e| e.key().clone()).collect();
        for prefix in prefixes {
            if let Some((_, owned)) = self.inner.owned.remove(&prefix) {
                owned.forward.cancel();
                self.inner.watches.release(&prefix);
            }
        }
        info!("etcd discovery destroyed");
    }

    async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> Result<Vec<MicroserviceInstance>> {
        let prefix = self.inner.paths.service_prefix(app_id, service_name);
        self.inner.client()?;
        self.inner.ensure_watch(app_id, service_name, &prefix);

        let instances = self.inner.read_prefix(&prefix).await?;
        if instances.is_empty() {
            return Err(RegistryError::MicroserviceNotFound {
                app_id: app_id.to_string(),
                service_name: service_name.to_string(),
            });
        }
        Ok(instances)
    }

    async fn find_services(&self, app_id: &str) -> Result<Vec<String>> {
        let app_prefix = self.inner.paths.app_prefix(app_id);
        let mut client = self.inner.client()?;
        let resp = client
            .get(
                app_prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;

        let mut names: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok())
            .filter_map(|key| self.inner.paths.service_name_of(&app_prefix, key))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn set_instance_changed_listener(&self, listener: Arc<dyn InstanceChangedListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>> {
        Ok(self
            .inner
            .microservices
            .get(service_id)
            .map(|entry| entry.value().clone()))
    }
}
