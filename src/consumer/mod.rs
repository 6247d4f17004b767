//! 消费端版本缓存
//!
//! `AppManager` -> `MicroserviceManager` -> `MicroserviceVersions` -> `MicroserviceVersionRule`，
//! 逐层按需创建。实例数据来自 [`InstanceSource`](crate::discovery::InstanceSource)。

pub mod app_manager;
pub mod microservice_manager;
pub mod microservice_version;
pub mod protection;
pub mod version_rule;
pub mod versions;

pub use app_manager::AppManager;
pub use microservice_manager::MicroserviceManager;
pub use microservice_version::MicroserviceVersion;
pub use protection::{AssumeAlive, EmptyInstanceProtection, InstancePing};
pub use version_rule::{MicroserviceVersionRule, RuleSnapshot};
pub use versions::{MicroserviceVersions, VersionsState};
