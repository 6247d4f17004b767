//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接相关错误（瞬时，可重试）
/// - 2000-2999: 注册相关错误（后端确认的不一致）
/// - 3000-3999: 契约相关错误（不可重试）
/// - 6000-6999: 系统 / 配置错误
/// - 8000-8999: 序列化相关错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    ConnectionTimeout = 1001,
    BackendUnavailable = 1002,

    // ============================================================
    // 注册相关错误 (2000-2999)
    // ============================================================
    MicroserviceNotFound = 2000,
    InstanceNotRegistered = 2001,
    RegistrationRejected = 2002,

    // ============================================================
    // 契约相关错误 (3000-3999)
    // ============================================================
    SchemaConflict = 3000,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    InternalError = 6000,
    ConfigurationError = 6003,
    InvalidVersion = 6004,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    SerializationError = 8000,
    DeserializationError = 8001,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Registration,
    Schema,
    System,
    Serialization,
}

impl ErrorCode {
    /// 错误代码的数值
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// 错误代码的字符串形式
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorCode::MicroserviceNotFound => "MICROSERVICE_NOT_FOUND",
            ErrorCode::InstanceNotRegistered => "INSTANCE_NOT_REGISTERED",
            ErrorCode::RegistrationRejected => "REGISTRATION_REJECTED",
            ErrorCode::SchemaConflict => "SCHEMA_CONFLICT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::InvalidVersion => "INVALID_VERSION",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
        }
    }

    /// 错误所属类别
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Registration,
            3000..=3999 => ErrorCategory::Schema,
            8000..=8999 => ErrorCategory::Serialization,
            _ => ErrorCategory::System,
        }
    }

    /// 是否可以在下一个周期重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ConnectionTimeout
                | ErrorCode::BackendUnavailable
                | ErrorCode::InstanceNotRegistered
                | ErrorCode::RegistrationRejected
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.as_u32())
    }
}
