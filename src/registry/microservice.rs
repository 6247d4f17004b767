//! 微服务定义

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::version::Version;

/// 开发环境名称，该环境下允许覆盖注册中心中的契约
pub const DEVELOPMENT_ENVIRONMENT: &str = "development";

/// 微服务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicroserviceStatus {
    #[default]
    Up,
    Down,
}

/// 微服务定义
///
/// 启动时在本地创建，`service_id` 在首次注册时由后端分配，此后除 `status` 外不再变化。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Microservice {
    pub app_id: String,

    pub service_name: String,

    pub version: String,

    #[serde(default)]
    pub environment: String,

    #[serde(default)]
    pub service_id: String,

    /// schemaId -> 契约内容；注册中心返回的副本可能只有 schemaId，内容为空
    #[serde(default)]
    pub schemas: BTreeMap<String, String>,

    #[serde(default)]
    pub status: MicroserviceStatus,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Microservice {
    /// 创建新的微服务定义
    pub fn new(
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// 设置环境
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// 添加契约
    pub fn with_schema(mut self, schema_id: impl Into<String>, content: impl Into<String>) -> Self {
        self.schemas.insert(schema_id.into(), content.into());
        self
    }

    /// 解析版本号
    pub fn parsed_version(&self) -> Result<Version> {
        Version::parse(&self.version)
    }

    /// 是否与另一个定义描述同一个微服务（appId、名称、版本、环境全部相同）
    pub fn is_same_microservice(&self, other: &Microservice) -> bool {
        self.app_id == other.app_id
            && self.service_name == other.service_name
            && self.environment == other.environment
            && match (self.parsed_version(), other.parsed_version()) {
                (Ok(a), Ok(b)) => a == b,
                _ => self.version == other.version,
            }
    }

    /// 是否处于开发环境
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEVELOPMENT_ENVIRONMENT)
    }

    /// 日志里使用的简短标识
    pub fn display_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.app_id, self.service_name, self.version, self.environment
        )
    }
}
