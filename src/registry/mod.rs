//! 服务注册模块
//!
//! 支持两类注册中心后端：服务中心（poll/heartbeat）和 etcd（watch/lease）

pub mod env_adapter;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod local;
pub mod manager;
pub mod microservice;
pub mod schema;
pub mod service_center;
pub mod trait_def;

pub use env_adapter::{EnvAdapter, EnvAdapterManager, EnvVariablesAdapter};
#[cfg(feature = "etcd")]
pub use etcd::EtcdRegistration;
pub use local::LocalMicroservice;
pub use manager::RegistrationManager;
pub use microservice::{DEVELOPMENT_ENVIRONMENT, Microservice, MicroserviceStatus};
pub use schema::{SchemaComparator, SchemaSummary, StructuralSchemaComparator, calc_schema_summary};
pub use service_center::{SERVICE_CENTER_REGISTRY_NAME, ServiceCenterRegistration};
pub use trait_def::Registration;
