//! 按版本规则划分的实例子缓存

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use super::microservice_version::MicroserviceVersion;
use crate::discovery::instance::MicroserviceInstance;
use crate::version::VersionRule;

/// 规则缓存的一份不可变快照
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    pub latest: Option<Arc<MicroserviceVersion>>,
    pub versions: Vec<Arc<MicroserviceVersion>>,
    pub instances: Arc<HashMap<String, MicroserviceInstance>>,
}

/// 版本规则缓存
///
/// 每次重建生成新的快照整体替换，读者拿到的始终是完整的一份。
#[derive(Debug)]
pub struct MicroserviceVersionRule {
    rule: VersionRule,
    snapshot: RwLock<Arc<RuleSnapshot>>,
}

impl MicroserviceVersionRule {
    pub fn new(rule: VersionRule) -> Self {
        Self {
            rule,
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
        }
    }

    pub fn rule(&self) -> &VersionRule {
        &self.rule
    }

    pub fn spec(&self) -> &str {
        self.rule.spec()
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.read().clone()
    }

    /// instanceId -> 实例
    pub fn instances(&self) -> Arc<HashMap<String, MicroserviceInstance>> {
        self.snapshot.read().instances.clone()
    }

    /// 按实例 ID 排序的实例列表
    pub fn instance_list(&self) -> Vec<MicroserviceInstance> {
        let instances = self.instances();
        let mut list: Vec<MicroserviceInstance> = instances.values().cloned().collect();
        list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        list
    }

    pub fn latest_microservice_version(&self) -> Option<Arc<MicroserviceVersion>> {
        self.snapshot.read().latest.clone()
    }

    /// 按规则重新过滤完整的实例列表
    pub(crate) fn set_instances(
        &self,
        versions: &HashMap<String, Arc<MicroserviceVersion>>,
        instances: &[MicroserviceInstance],
    ) {
        let top = versions.values().map(|v| v.version()).max();
        let matched: Vec<Arc<MicroserviceVersion>> = match top {
            Some(top) => versions
                .values()
                .filter(|v| self.rule.is_match(&v.version(), &top))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let latest = matched.iter().max_by_key(|v| v.version()).cloned();
        let service_ids: HashSet<&str> = matched.iter().map(|v| v.service_id()).collect();
        let filtered: HashMap<String, MicroserviceInstance> = instances
            .iter()
            .filter(|i| service_ids.contains(i.service_id.as_str()))
            .map(|i| (i.instance_id.clone(), i.clone()))
            .collect();

        *self.snapshot.write() = Arc::new(RuleSnapshot {
            latest,
            versions: matched,
            instances: Arc::new(filtered),
        });
    }
}
