//! 空实例保护
//!
//! 注册中心偶发返回空列表时（例如服务中心自身故障后刚重启），
//! 保留上一次仍然可达的实例，而不是把消费端的缓存一次清空。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::discovery::MicroserviceInstance;

/// 实例探活
#[async_trait]
pub trait InstancePing: Send + Sync {
    async fn ping(&self, instance: &MicroserviceInstance) -> bool;
}

/// 不做探测，认为旧实例全部存活
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeAlive;

#[async_trait]
impl InstancePing for AssumeAlive {
    async fn ping(&self, _instance: &MicroserviceInstance) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct EmptyInstanceProtection {
    ping: Arc<dyn InstancePing>,
}

impl EmptyInstanceProtection {
    pub fn new(ping: Arc<dyn InstancePing>) -> Self {
        Self { ping }
    }

    /// 拉取结果为空时，从正在使用的实例中挑出仍然存活的
    pub async fn retain_alive(
        &self,
        service_name: &str,
        in_use: &[MicroserviceInstance],
    ) -> Vec<MicroserviceInstance> {
        let mut kept = Vec::with_capacity(in_use.len());
        for instance in in_use {
            if self.ping.ping(instance).await {
                kept.push(instance.clone());
            } else {
                debug!(service_name, instance_id = %instance.instance_id, "Instance ping failed, dropped");
            }
        }
        warn!(
            service_name,
            kept = kept.len(),
            in_use = in_use.len(),
            "Registry returned no instances, keeping reachable ones"
        );
        kept
    }
}

impl Default for EmptyInstanceProtection {
    fn default() -> Self {
        Self::new(Arc::new(AssumeAlive))
    }
}
