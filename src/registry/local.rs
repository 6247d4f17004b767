//! 本进程对外注册的微服务与实例

use parking_lot::RwLock;

use crate::discovery::instance::{InstanceStatus, MicroserviceInstance};
use crate::registry::microservice::Microservice;

/// 本地微服务上下文
///
/// 注册任务和注册后端共享同一份数据，后端分配的 ID 和远端同步回来的状态都写在这里。
#[derive(Debug)]
pub struct LocalMicroservice {
    microservice: RwLock<Microservice>,
    instance: RwLock<MicroserviceInstance>,
}

impl LocalMicroservice {
    pub fn new(microservice: Microservice, instance: MicroserviceInstance) -> Self {
        Self {
            microservice: RwLock::new(microservice),
            instance: RwLock::new(instance),
        }
    }

    /// 当前微服务定义的副本
    pub fn microservice(&self) -> Microservice {
        self.microservice.read().clone()
    }

    /// 当前实例的副本
    pub fn instance(&self) -> MicroserviceInstance {
        self.instance.read().clone()
    }

    pub fn service_id(&self) -> String {
        self.microservice.read().service_id.clone()
    }

    pub fn instance_id(&self) -> String {
        self.instance.read().instance_id.clone()
    }

    /// 整体替换微服务定义（环境适配器处理之后）
    pub fn replace_microservice(&self, microservice: Microservice) {
        let service_id = microservice.service_id.clone();
        *self.microservice.write() = microservice;
        self.instance.write().service_id = service_id;
    }

    /// 记录后端分配的服务 ID，实例跟随同一个 ID
    pub fn set_service_id(&self, service_id: &str) {
        self.microservice.write().service_id = service_id.to_string();
        self.instance.write().service_id = service_id.to_string();
    }

    pub fn set_instance_id(&self, instance_id: &str) {
        self.instance.write().instance_id = instance_id.to_string();
    }

    pub fn set_instance_status(&self, status: InstanceStatus) {
        self.instance.write().status = status;
    }

    pub fn add_schema(&self, schema_id: &str, content: &str) {
        self.microservice
            .write()
            .schemas
            .insert(schema_id.to_string(), content.to_string());
    }

    pub fn add_endpoint(&self, endpoint: &str) {
        let mut instance = self.instance.write();
        if !instance.endpoints.iter().any(|e| e == endpoint) {
            instance.endpoints.push(endpoint.to_string());
        }
    }

    pub fn add_property(&self, key: &str, value: &str) {
        self.instance
            .write()
            .properties
            .insert(key.to_string(), value.to_string());
    }
}
