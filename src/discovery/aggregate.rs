//! 多注册中心汇总
//!
//! 同一个服务可能同时出现在多个注册中心。按实例 ID 合并各后端的结果：
//! 优先取未过期的后端，其次取最近一次刷新的后端。后端断连时保留它上一次的结果并标记过期，
//! 宁可返回旧数据也不返回空列表。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Discovery, InstanceChangedListener, InstanceSource, MicroserviceInstance, MicroserviceInstances};
use crate::error::{RegistryError, Result};
use crate::registry::microservice::Microservice;

/// 汇总层发给消费端缓存的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    InstancesChanged { app_id: String, service_name: String },
    /// 某个注册中心连接恢复，消费端需要忽略 revision 全量刷新
    Recovered { registry_name: String },
}

#[derive(Debug, Clone)]
struct SourceSnapshot {
    instances: Vec<MicroserviceInstance>,
    refreshed_at: DateTime<Utc>,
    stale: bool,
    not_found: bool,
}

#[derive(Debug, Default)]
struct ServiceSnapshots {
    sources: HashMap<String, SourceSnapshot>,
    merged: Vec<MicroserviceInstance>,
    revision: Option<String>,
}

impl ServiceSnapshots {
    fn has_data(&self) -> bool {
        self.sources.values().any(|s| !s.not_found)
    }

    fn all_not_found(&self) -> bool {
        !self.sources.is_empty() && self.sources.values().all(|s| s.not_found)
    }

    /// 重新合并，结果变化时返回 true
    fn remerge(&mut self, counter: &AtomicU64) -> bool {
        let merged = merge_sources(&self.sources);
        if self.revision.is_some() && merged == self.merged {
            return false;
        }
        self.merged = merged;
        self.revision = Some(counter.fetch_add(1, Ordering::SeqCst).to_string());
        true
    }
}

fn merge_sources(sources: &HashMap<String, SourceSnapshot>) -> Vec<MicroserviceInstance> {
    let mut best: BTreeMap<&str, (&SourceSnapshot, &MicroserviceInstance)> = BTreeMap::new();
    for snapshot in sources.values().filter(|s| !s.not_found) {
        for instance in &snapshot.instances {
            match best.get(instance.instance_id.as_str()) {
                Some((current, _)) if !prefer(snapshot, current) => {}
                _ => {
                    best.insert(instance.instance_id.as_str(), (snapshot, instance));
                }
            }
        }
    }
    best.into_values().map(|(_, i)| i.clone()).collect()
}

/// `candidate` 是否比 `current` 更可信
fn prefer(candidate: &SourceSnapshot, current: &SourceSnapshot) -> bool {
    match (candidate.stale, current.stale) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.refreshed_at > current.refreshed_at,
    }
}

/// 汇总发现
pub struct AggregateDiscovery {
    discoveries: Vec<Arc<dyn Discovery>>,
    services: DashMap<(String, String), ServiceSnapshots>,
    revision_counter: AtomicU64,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl AggregateDiscovery {
    /// 创建并注册为每个后端的实例变化监听器
    ///
    /// 后端只持有汇总层的弱引用，汇总层释放后推送被丢弃。
    pub fn new(discoveries: Vec<Arc<dyn Discovery>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let aggregate = Arc::new(Self {
            discoveries,
            services: DashMap::new(),
            revision_counter: AtomicU64::new(1),
            events,
        });
        let listener = Arc::new(WeakListener(Arc::downgrade(&aggregate)));
        for discovery in &aggregate.discoveries {
            discovery.set_instance_changed_listener(listener.clone());
        }
        aggregate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    fn enabled_discoveries(&self) -> impl Iterator<Item = &Arc<dyn Discovery>> {
        self.discoveries.iter().filter(|d| d.enabled())
    }

    pub async fn init(&self) -> Result<()> {
        for discovery in self.enabled_discoveries() {
            discovery.init().await?;
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<()> {
        for discovery in self.enabled_discoveries() {
            discovery.run().await?;
            info!(registry = discovery.name(), "Discovery started");
        }
        Ok(())
    }

    pub async fn destroy(&self) {
        for discovery in self.enabled_discoveries() {
            discovery.destroy().await;
        }
    }

    /// 应用下全部服务名（去重排序）
    pub async fn find_services(&self, app_id: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for discovery in self.enabled_discoveries() {
            match discovery.find_services(app_id).await {
                Ok(found) => names.extend(found),
                Err(e) => warn!(registry = discovery.name(), error = %e, "Find services failed"),
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn update_source(
        &self,
        key: (String, String),
        registry_name: &str,
        snapshot: Option<SourceSnapshot>,
    ) -> bool {
        let mut services = self.services.entry(key).or_default();
        match snapshot {
            Some(snapshot) => {
                services.sources.insert(registry_name.to_string(), snapshot);
            }
            None => match services.sources.get_mut(registry_name) {
                Some(existing) => existing.stale = true,
                None => return false,
            },
        }
        services.remerge(&self.revision_counter)
    }
}

#[async_trait]
impl InstanceSource for AggregateDiscovery {
    async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
        revision: Option<&str>,
    ) -> Result<MicroserviceInstances> {
        let key = (app_id.to_string(), service_name.to_string());
        let mut disconnected = Vec::new();

        for discovery in self.enabled_discoveries() {
            let snapshot = match discovery.find_service_instances(app_id, service_name).await {
                Ok(instances) => Some(SourceSnapshot {
                    instances,
                    refreshed_at: Utc::now(),
                    stale: false,
                    not_found: false,
                }),
                Err(e) if e.is_not_found() => Some(SourceSnapshot {
                    instances: Vec::new(),
                    refreshed_at: Utc::now(),
                    stale: false,
                    not_found: true,
                }),
                Err(e) => {
                    warn!(
                        registry = discovery.name(),
                        app_id,
                        service_name,
                        error = %e,
                        "Find service instances failed, keeping last result"
                    );
                    disconnected.push(format!("{}: {}", discovery.name(), e));
                    None
                }
            };
            self.update_source(key.clone(), discovery.name(), snapshot);
        }

        let unavailable = || {
            if disconnected.is_empty() {
                RegistryError::disconnected("no registry available")
            } else {
                RegistryError::disconnected(disconnected.join("; "))
            }
        };

        let Some(services) = self.services.get(&key) else {
            return Err(unavailable());
        };

        if !services.has_data() {
            if services.all_not_found() && disconnected.is_empty() {
                return Ok(MicroserviceInstances::not_exist());
            }
            return Err(unavailable());
        }

        if revision.is_some() && revision == services.revision.as_deref() {
            return Ok(MicroserviceInstances::unchanged(services.revision.clone()));
        }
        Ok(MicroserviceInstances::changed(
            services.merged.clone(),
            services.revision.clone(),
        ))
    }

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>> {
        let mut last_error = None;
        for discovery in self.enabled_discoveries() {
            match discovery.get_microservice(service_id).await {
                Ok(Some(microservice)) => return Ok(Some(microservice)),
                Ok(None) => {}
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

struct WeakListener(Weak<AggregateDiscovery>);

impl InstanceChangedListener for WeakListener {
    fn on_instance_changed(
        &self,
        registry_name: &str,
        app_id: &str,
        service_name: &str,
        instances: Vec<MicroserviceInstance>,
    ) {
        if let Some(aggregate) = self.0.upgrade() {
            aggregate.on_instance_changed(registry_name, app_id, service_name, instances);
        }
    }

    fn on_connection_recovered(&self, registry_name: &str) {
        if let Some(aggregate) = self.0.upgrade() {
            aggregate.on_connection_recovered(registry_name);
        }
    }
}

impl InstanceChangedListener for AggregateDiscovery {
    fn on_instance_changed(
        &self,
        registry_name: &str,
        app_id: &str,
        service_name: &str,
        instances: Vec<MicroserviceInstance>,
    ) {
        let snapshot = SourceSnapshot {
            instances,
            refreshed_at: Utc::now(),
            stale: false,
            not_found: false,
        };
        let key = (app_id.to_string(), service_name.to_string());
        if self.update_source(key, registry_name, Some(snapshot)) {
            debug!(registry = registry_name, app_id, service_name, "Instances changed");
            let _ = self.events.send(DiscoveryEvent::InstancesChanged {
                app_id: app_id.to_string(),
                service_name: service_name.to_string(),
            });
        }
    }

    fn on_connection_recovered(&self, registry_name: &str) {
        info!(registry = registry_name, "Registry connection recovered");
        let _ = self.events.send(DiscoveryEvent::Recovered {
            registry_name: registry_name.to_string(),
        });
    }
}
