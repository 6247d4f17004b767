//! 注册中心客户端
//!
//! poll/heartbeat 型注册中心的 RPC 抽象。注册任务、服务中心发现后端都只依赖这个 trait，
//! 生产环境使用 HTTP 实现，测试和单机运行使用内存实现。

#[cfg(feature = "service-center")]
pub mod http;
pub mod local;

#[cfg(feature = "service-center")]
pub use http::HttpServiceRegistryClient;
pub use local::LocalServiceRegistryClient;

use async_trait::async_trait;

use crate::discovery::instance::{InstanceStatus, MicroserviceInstance, MicroserviceInstances};
use crate::error::Result;
use crate::registry::microservice::Microservice;
use crate::registry::schema::SchemaSummary;

/// 注册中心客户端 trait
///
/// 约定：
/// - `Err` 表示注册中心不可达或返回了意外响应
/// - `Ok(None)` / `Ok(false)` 表示注册中心可达但目标不存在或拒绝
#[async_trait]
pub trait ServiceRegistryClient: Send + Sync {
    /// 按 (appId, serviceName, version, environment) 查找已注册的微服务 ID
    async fn get_microservice_id(&self, microservice: &Microservice) -> Result<Option<String>>;

    /// 获取微服务定义
    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>>;

    /// 注册微服务，返回后端分配的服务 ID
    async fn register_microservice(&self, microservice: &Microservice) -> Result<String>;

    /// 获取微服务的全部契约概要
    async fn get_schemas(&self, service_id: &str) -> Result<Vec<SchemaSummary>>;

    /// 获取单个契约内容
    async fn get_schema(&self, service_id: &str, schema_id: &str) -> Result<Option<String>>;

    /// 注册（或覆盖）契约
    async fn register_schema(&self, service_id: &str, schema_id: &str, content: &str)
    -> Result<bool>;

    /// 注册实例，返回后端分配的实例 ID
    async fn register_instance(&self, instance: &MicroserviceInstance) -> Result<String>;

    async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> Result<bool>;

    /// 心跳
    ///
    /// `Ok(false)` 表示注册中心已经没有这个实例，需要重新注册。
    async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<bool>;

    /// 查询目标服务的实例
    ///
    /// `revision` 与注册中心当前版本相同时返回 `need_refresh = false`。
    async fn find_service_instances(
        &self,
        consumer_id: &str,
        app_id: &str,
        service_name: &str,
        version_rule: &str,
        revision: Option<&str>,
    ) -> Result<MicroserviceInstances>;

    async fn get_microservice_instance(
        &self,
        service_id: &str,
        instance_id: &str,
    ) -> Result<Option<MicroserviceInstance>>;

    async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<bool>;

    /// 列出全部微服务
    async fn get_all_microservices(&self) -> Result<Vec<Microservice>>;
}
