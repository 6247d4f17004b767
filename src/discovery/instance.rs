//! 微服务实例定义

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 实例状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    #[serde(rename = "OUTOFSERVICE")]
    OutOfService,
    Testing,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUTOFSERVICE",
            InstanceStatus::Testing => "TESTING",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "STARTING" => Ok(InstanceStatus::Starting),
            "OUTOFSERVICE" | "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            "TESTING" => Ok(InstanceStatus::Testing),
            _ => Err(format!("Unknown instance status: {}", s)),
        }
    }
}

/// 健康检查模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// 实例主动心跳
    #[default]
    Push,
    /// 注册中心主动探测
    Pull,
}

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub mode: HealthCheckMode,

    /// 心跳间隔（秒）
    pub interval: u32,

    /// 允许连续丢失的心跳次数
    pub times: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            mode: HealthCheckMode::Push,
            interval: 30,
            times: 3,
        }
    }
}

/// 微服务实例
///
/// 由注册中心持有，本地副本只读，每次发现都会整体替换。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceInstance {
    /// 实例 ID（注册后由后端分配）
    #[serde(default)]
    pub instance_id: String,

    /// 所属微服务 ID
    #[serde(default)]
    pub service_id: String,

    /// 主机名
    #[serde(default)]
    pub host_name: String,

    /// 访问地址（如 "rest://127.0.0.1:8080"）
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// 自定义属性
    #[serde(default)]
    pub properties: HashMap<String, String>,

    #[serde(default)]
    pub status: InstanceStatus,

    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

impl MicroserviceInstance {
    /// 创建新的本地实例
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            health_check: Some(HealthCheck::default()),
            ..Default::default()
        }
    }

    /// 添加访问地址
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// 添加属性
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// 设置状态
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }
}

/// 一次实例查询的结果
///
/// `revision` 是后端给出的不透明令牌，只做相等比较。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MicroserviceInstances {
    pub instances: Vec<MicroserviceInstance>,
    pub revision: Option<String>,
    /// `false` 表示与调用方持有的 revision 相同，`instances` 为空且无意义
    pub need_refresh: bool,
    pub microservice_not_exist: bool,
}

impl MicroserviceInstances {
    /// 实例集合发生变化
    pub fn changed(instances: Vec<MicroserviceInstance>, revision: Option<String>) -> Self {
        Self {
            instances,
            revision,
            need_refresh: true,
            microservice_not_exist: false,
        }
    }

    /// 与请求中的 revision 相同
    pub fn unchanged(revision: Option<String>) -> Self {
        Self {
            instances: Vec::new(),
            revision,
            need_refresh: false,
            microservice_not_exist: false,
        }
    }

    /// 目标微服务不存在
    pub fn not_exist() -> Self {
        Self {
            instances: Vec::new(),
            revision: None,
            need_refresh: false,
            microservice_not_exist: true,
        }
    }
}
