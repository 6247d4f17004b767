//! 服务发现后端实现

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod service_center;

#[cfg(feature = "etcd")]
pub use etcd::EtcdDiscovery;
pub use service_center::ServiceCenterDiscovery;
