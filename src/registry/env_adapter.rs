//! 环境适配器
//!
//! 在微服务、契约和实例发往注册中心之前做环境相关的加工，例如补充部署平台注入的属性。

use std::sync::Arc;

use tracing::debug;

use crate::discovery::instance::MicroserviceInstance;
use crate::registry::microservice::Microservice;

/// 环境适配器 trait
pub trait EnvAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    fn process_microservice(&self, _microservice: &mut Microservice) {}

    fn process_schema(&self, _schema_id: &str, content: String) -> String {
        content
    }

    fn process_instance(&self, _instance: &mut MicroserviceInstance) {}
}

/// 按注册顺序执行所有启用的适配器
#[derive(Default, Clone)]
pub struct EnvAdapterManager {
    adapters: Vec<Arc<dyn EnvAdapter>>,
}

impl EnvAdapterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn EnvAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn EnvAdapter>) {
        self.adapters.push(adapter);
    }

    fn enabled_adapters(&self) -> impl Iterator<Item = &Arc<dyn EnvAdapter>> {
        self.adapters.iter().filter(|a| a.enabled())
    }

    pub fn process_microservice(&self, microservice: &mut Microservice) {
        for adapter in self.enabled_adapters() {
            debug!(adapter = adapter.name(), service_name = %microservice.service_name, "Processing microservice");
            adapter.process_microservice(microservice);
        }
    }

    pub fn process_schema(&self, schema_id: &str, content: &str) -> String {
        self.enabled_adapters()
            .fold(content.to_string(), |acc, adapter| adapter.process_schema(schema_id, acc))
    }

    pub fn process_instance(&self, instance: &mut MicroserviceInstance) {
        for adapter in self.enabled_adapters() {
            adapter.process_instance(instance);
        }
    }
}

/// 把进程环境变量写入实例属性
///
/// `prefix` 开头的环境变量会去掉前缀、转为小写后作为属性名。
pub struct EnvVariablesAdapter {
    prefix: String,
}

impl EnvVariablesAdapter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl EnvAdapter for EnvVariablesAdapter {
    fn name(&self) -> &str {
        "env-variables"
    }

    fn process_instance(&self, instance: &mut MicroserviceInstance) {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(&self.prefix) {
                if !name.is_empty() {
                    instance.properties.insert(name.to_lowercase(), value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagging;

    impl EnvAdapter for Tagging {
        fn name(&self) -> &str {
            "tagging"
        }

        fn process_microservice(&self, microservice: &mut Microservice) {
            microservice
                .properties
                .insert("tagged".to_string(), "true".to_string());
        }

        fn process_schema(&self, _schema_id: &str, content: String) -> String {
            format!("{}\n", content)
        }
    }

    struct Disabled;

    impl EnvAdapter for Disabled {
        fn name(&self) -> &str {
            "disabled"
        }

        fn enabled(&self) -> bool {
            false
        }

        fn process_schema(&self, _schema_id: &str, _content: String) -> String {
            String::new()
        }
    }

    #[test]
    fn runs_enabled_adapters_in_order() {
        let manager = EnvAdapterManager::new()
            .with_adapter(Arc::new(Tagging))
            .with_adapter(Arc::new(Disabled))
            .with_adapter(Arc::new(Tagging));

        let mut ms = Microservice::new("app", "svc", "1.0");
        manager.process_microservice(&mut ms);
        assert_eq!(ms.properties.get("tagged").map(String::as_str), Some("true"));
        assert_eq!(manager.process_schema("s", "x"), "x\n\n");
    }
}
