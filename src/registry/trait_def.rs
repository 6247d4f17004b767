//! 服务注册 Trait 定义

use async_trait::async_trait;

use crate::discovery::instance::{InstanceStatus, MicroserviceInstance};
use crate::error::Result;
use crate::registry::microservice::Microservice;

/// 服务注册 Trait
///
/// `add_*` 只修改本地定义，需要在 `run` 之前调用。
#[async_trait]
pub trait Registration: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// 初始化（建立连接等）
    async fn init(&self) -> Result<()>;

    /// 注册并启动后台任务
    ///
    /// 契约冲突等致命错误在这里返回，调用方应中止启动。
    async fn run(&self) -> Result<()>;

    /// 注销并停止后台任务
    async fn destroy(&self);

    fn microservice(&self) -> Microservice;

    fn microservice_instance(&self) -> MicroserviceInstance;

    fn add_schema(&self, schema_id: &str, content: &str);

    fn add_endpoint(&self, endpoint: &str);

    fn add_property(&self, key: &str, value: &str);

    /// 修改注册中心上的实例状态，成功后同步到本地
    async fn update_microservice_instance_status(&self, status: InstanceStatus) -> bool;
}
