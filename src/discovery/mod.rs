//! 服务发现模块
//!
//! 每个注册中心后端实现 [`Discovery`]，[`AggregateDiscovery`] 汇总所有启用的后端，
//! 对消费端缓存暴露 [`InstanceSource`]。

pub mod aggregate;
pub mod backend;
pub mod factory;
pub mod instance;
pub mod watch;

pub use aggregate::{AggregateDiscovery, DiscoveryEvent};
pub use factory::{RegistryFactory, RegistryStack};
pub use instance::{
    HealthCheck, HealthCheckMode, InstanceStatus, MicroserviceInstance, MicroserviceInstances,
};
pub use watch::{WatchFeed, WatchHandle, WatchManager, WatchUpdate};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::registry::microservice::Microservice;

/// 服务发现 trait
///
/// 所有注册中心后端（etcd、服务中心）都需要实现这个 trait
#[async_trait]
pub trait Discovery: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// 初始化（建立连接等）
    async fn init(&self) -> Result<()>;

    /// 启动后台任务
    async fn run(&self) -> Result<()>;

    async fn destroy(&self);

    /// 查询目标服务的全部实例
    ///
    /// 服务不存在时返回 [`RegistryError::MicroserviceNotFound`](crate::error::RegistryError::MicroserviceNotFound)，
    /// 注册中心不可达时返回其他错误。
    async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
    ) -> Result<Vec<MicroserviceInstance>>;

    /// 列出应用下的全部服务名
    async fn find_services(&self, app_id: &str) -> Result<Vec<String>>;

    fn set_instance_changed_listener(&self, listener: Arc<dyn InstanceChangedListener>);

    /// 按服务 ID 获取微服务定义
    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>>;
}

/// 实例变化监听器
pub trait InstanceChangedListener: Send + Sync {
    /// 后端推送了某个服务的完整实例列表
    fn on_instance_changed(
        &self,
        registry_name: &str,
        app_id: &str,
        service_name: &str,
        instances: Vec<MicroserviceInstance>,
    );

    /// 与注册中心的连接恢复
    fn on_connection_recovered(&self, _registry_name: &str) {}
}

/// 消费端缓存的实例来源
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// 查询实例，`revision` 与当前版本相同时返回 `need_refresh = false`
    async fn find_service_instances(
        &self,
        app_id: &str,
        service_name: &str,
        revision: Option<&str>,
    ) -> Result<MicroserviceInstances>;

    async fn get_microservice(&self, service_id: &str) -> Result<Option<Microservice>>;
}
