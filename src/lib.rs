//! Flare Registry Core Library
//!
//! 微服务客户端侧的注册与发现：契约校验、注册任务编排、多注册中心汇总，
//! 以及按版本规则划分的消费端实例缓存。

pub mod client;
pub mod config;
pub mod consumer;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod retry;
pub mod task;
pub mod version;

// Re-exports
pub use client::{LocalServiceRegistryClient, ServiceRegistryClient};
#[cfg(feature = "service-center")]
pub use client::HttpServiceRegistryClient;
pub use config::{EtcdConfig, RegistryConfig, ServiceCenterConfig};
pub use consumer::{
    AppManager, MicroserviceManager, MicroserviceVersion, MicroserviceVersionRule,
    MicroserviceVersions,
};
pub use discovery::{
    AggregateDiscovery, Discovery, DiscoveryEvent, InstanceChangedListener, InstanceSource,
    InstanceStatus, MicroserviceInstance, MicroserviceInstances, RegistryFactory, RegistryStack,
    WatchManager,
};
pub use error::{ErrorCategory, ErrorCode, RegistryError, Result};
pub use registry::{
    EnvAdapter, EnvAdapterManager, LocalMicroservice, Microservice, Registration,
    RegistrationManager, SchemaComparator,
};
pub use retry::{BackoffPolicy, ExponentialBackoff};
pub use task::{EventBus, RegistrationTaskGraph, SchemaPolicy, TaskEvent, TaskStatus};
pub use version::{Version, VersionRule};
