//! 注册发现错误处理模块
//!
//! 所有后端 I/O、任务和缓存操作共用一个错误类型，按错误代码区分
//! 瞬时不可用、后端确认的不一致、契约冲突和数据格式错误。

pub mod code;

pub use code::{ErrorCategory, ErrorCode};

use thiserror::Error;

/// 注册发现统一错误类型
#[derive(Error, Debug)]
pub enum RegistryError {
    /// 注册中心不可达（超时、连接失败、5xx）
    #[error("注册中心不可达: {0}")]
    Disconnected(String),

    /// 注册中心明确返回目标微服务不存在
    #[error("微服务不存在: {app_id}/{service_name}")]
    MicroserviceNotFound {
        app_id: String,
        service_name: String,
    },

    /// 注册中心可达，但实例记录已经不存在
    #[error("实例未注册: {service_id}/{instance_id}")]
    InstanceNotRegistered {
        service_id: String,
        instance_id: String,
    },

    /// 注册中心拒绝了注册请求
    #[error("注册被拒绝: {0}")]
    Rejected(String),

    /// 本地契约与注册中心契约不一致，且当前环境不允许覆盖
    #[error("契约冲突 [{schema_id}]: {reason}")]
    SchemaConflict { schema_id: String, reason: String },

    /// 版本号或版本规则格式错误
    #[error("版本格式错误: {0}")]
    InvalidVersion(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Configuration(String),

    /// JSON 序列化 / 反序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// etcd 客户端错误
    #[cfg(feature = "etcd")]
    #[error("etcd 错误: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// HTTP 客户端错误
    #[cfg(feature = "service-center")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 系统错误（用于内部错误）
    #[error("系统错误: {0}")]
    System(String),
}

impl RegistryError {
    /// 创建连接错误
    pub fn disconnected(reason: impl Into<String>) -> Self {
        RegistryError::Disconnected(reason.into())
    }

    /// 创建配置错误
    pub fn configuration(reason: impl Into<String>) -> Self {
        RegistryError::Configuration(reason.into())
    }

    /// 创建系统错误
    pub fn system(reason: impl Into<String>) -> Self {
        RegistryError::System(reason.into())
    }

    /// 创建契约冲突错误
    pub fn schema_conflict(schema_id: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::SchemaConflict {
            schema_id: schema_id.into(),
            reason: reason.into(),
        }
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::Disconnected(_) => ErrorCode::BackendUnavailable,
            RegistryError::MicroserviceNotFound { .. } => ErrorCode::MicroserviceNotFound,
            RegistryError::InstanceNotRegistered { .. } => ErrorCode::InstanceNotRegistered,
            RegistryError::Rejected(_) => ErrorCode::RegistrationRejected,
            RegistryError::SchemaConflict { .. } => ErrorCode::SchemaConflict,
            RegistryError::InvalidVersion(_) => ErrorCode::InvalidVersion,
            RegistryError::Configuration(_) => ErrorCode::ConfigurationError,
            RegistryError::Serialization(e) if e.is_data() || e.is_syntax() || e.is_eof() => {
                ErrorCode::DeserializationError
            }
            RegistryError::Serialization(_) => ErrorCode::SerializationError,
            #[cfg(feature = "etcd")]
            RegistryError::Etcd(_) => ErrorCode::ConnectionFailed,
            #[cfg(feature = "service-center")]
            RegistryError::Http(e) if e.is_timeout() => ErrorCode::ConnectionTimeout,
            #[cfg(feature = "service-center")]
            RegistryError::Http(e) if e.is_decode() => ErrorCode::DeserializationError,
            #[cfg(feature = "service-center")]
            RegistryError::Http(_) => ErrorCode::ConnectionFailed,
            RegistryError::System(_) => ErrorCode::InternalError,
        }
    }

    /// 判断是否为可在下一个周期重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// 判断是否为必须中止启动的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RegistryError::SchemaConflict { .. } | RegistryError::Configuration(_)
        )
    }

    /// 是否为"服务不存在"
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::MicroserviceNotFound { .. })
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RegistryError>;
