use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RegistryError, Result};
use crate::registry::microservice::DEVELOPMENT_ENVIRONMENT;

/// 注册发现配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 运行环境（如 "development", "production"）
    #[serde(default)]
    pub environment: String,

    /// 无论环境如何都允许覆盖注册中心中的契约（仅限开发测试使用）
    #[serde(default)]
    pub always_override_schema: bool,

    /// 忽略契约差异（规避开关，生产环境不建议打开）
    #[serde(default)]
    pub ignore_schema_difference: bool,

    /// 只缓存 UP 状态的实例
    #[serde(default)]
    pub use_up_instances_only: bool,

    /// 注册中心返回空实例列表时保留仍然存活的旧实例
    #[serde(default = "default_true")]
    pub empty_instance_protection: bool,

    #[serde(default = "default_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_interval")]
    pub status_sync_interval_secs: u64,

    #[serde(default = "default_interval")]
    pub instance_pull_interval_secs: u64,

    pub service_center: Option<ServiceCenterConfig>,
    pub etcd: Option<EtcdConfig>,
}

/// poll/heartbeat 后端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceCenterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub addresses: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// watch/lease 后端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EtcdConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub endpoints: Vec<String>,
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
    /// "user:password"
    pub authentication: Option<String>,
}

fn default_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

fn default_root_path() -> String {
    "/flare/registry".to_string()
}

fn default_lease_ttl() -> i64 {
    60
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            environment: String::new(),
            always_override_schema: false,
            ignore_schema_difference: false,
            use_up_instances_only: false,
            empty_instance_protection: true,
            heartbeat_interval_secs: default_interval(),
            status_sync_interval_secs: default_interval(),
            instance_pull_interval_secs: default_interval(),
            service_center: None,
            etcd: None,
        }
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            root_path: default_root_path(),
            lease_ttl_secs: default_lease_ttl(),
            authentication: None,
        }
    }
}

impl EtcdConfig {
    /// 续约间隔：TTL 的 1/12，至少 1 秒
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs((self.lease_ttl_secs / 12).max(1) as u64)
    }

    /// 解析 "user:password" 认证信息
    pub fn credentials(&self) -> Result<Option<(String, String)>> {
        match self.authentication.as_deref() {
            None | Some("") => Ok(None),
            Some(auth) => auth
                .split_once(':')
                .map(|(user, password)| Some((user.to_string(), password.to_string())))
                .ok_or_else(|| {
                    RegistryError::configuration("etcd authentication must be \"user:password\"")
                }),
        }
    }
}

impl RegistryConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::configuration(format!("Failed to read config {}: {}", path, e))
        })?;
        let mut config: RegistryConfig = toml::from_str(&content).map_err(|e| {
            RegistryError::configuration(format!("Failed to parse config {}: {}", path, e))
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// 使用环境变量覆盖配置
    ///
    /// - `REGISTRY_ENVIRONMENT`: 运行环境
    /// - `SERVICE_HEARTBEAT_INTERVAL`: 心跳间隔（秒）
    /// - `ETCD_TTL_SECONDS`: etcd lease TTL（秒）
    pub fn apply_env_overrides(&mut self) {
        if let Ok(env) = std::env::var("REGISTRY_ENVIRONMENT") {
            self.environment = env;
        }
        if let Some(interval) = env_number::<u64>("SERVICE_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval_secs = interval;
        }
        if let Some(ttl) = env_number::<i64>("ETCD_TTL_SECONDS") {
            if let Some(etcd) = self.etcd.as_mut() {
                etcd.lease_ttl_secs = ttl;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0
            || self.status_sync_interval_secs == 0
            || self.instance_pull_interval_secs == 0
        {
            return Err(RegistryError::configuration("intervals must be greater than zero"));
        }
        if let Some(etcd) = &self.etcd {
            if etcd.lease_ttl_secs <= 0 {
                return Err(RegistryError::configuration("etcd lease ttl must be positive"));
            }
            if etcd.enabled && etcd.endpoints.is_empty() {
                return Err(RegistryError::configuration("etcd endpoints not configured"));
            }
            etcd.credentials()?;
        }
        if let Some(sc) = &self.service_center {
            if sc.enabled && sc.addresses.is_empty() {
                return Err(RegistryError::configuration(
                    "service center addresses not configured",
                ));
            }
        }
        Ok(())
    }

    /// 注册中心中的契约是否允许被覆盖
    pub fn is_schema_modifiable(&self, environment: &str) -> bool {
        environment.eq_ignore_ascii_case(DEVELOPMENT_ENVIRONMENT) || self.always_override_schema
    }

    /// 未经校验的配置也至少返回 1 秒
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn status_sync_interval(&self) -> Duration {
        Duration::from_secs(self.status_sync_interval_secs.max(1))
    }

    pub fn instance_pull_interval(&self) -> Duration {
        Duration::from_secs(self.instance_pull_interval_secs.max(1))
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring non-numeric environment override");
            None
        }
    }
}
