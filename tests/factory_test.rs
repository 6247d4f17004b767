//! 注册发现组装测试

mod common;

use std::sync::Arc;

use common::{MockRegistryClient, ids, init_tracing};
use flare_registry_core::client::{LocalServiceRegistryClient, ServiceRegistryClient};
use flare_registry_core::config::{RegistryConfig, ServiceCenterConfig};
use flare_registry_core::discovery::{InstanceStatus, MicroserviceInstance, RegistryFactory};
use flare_registry_core::registry::Microservice;

const PRESET: &str = r#"
ms3:
  - version: 1.0.0
    id: ms3-v1
    instances:
      - endpoints: ["rest://10.0.0.1:8080"]
  - version: 2.0.0
    id: ms3-v2
    instances:
      - endpoints: ["rest://10.0.0.2:8080"]
      - endpoints: ["rest://10.0.0.3:8080"]
"#;

fn config() -> RegistryConfig {
    RegistryConfig {
        service_center: Some(ServiceCenterConfig {
            enabled: true,
            addresses: vec!["http://127.0.0.1:30100".to_string()],
            request_timeout_secs: 10,
        }),
        ..Default::default()
    }
}

fn own_microservice() -> (Microservice, MicroserviceInstance) {
    (
        Microservice::new("default", "ms2", "1.0.0").with_schema("hello", "openapi: 3.0.0\n"),
        MicroserviceInstance::new("test-host").with_endpoint("rest://127.0.0.1:8080"),
    )
}

/// 测试：启动后本服务可以被自己发现，停止后实例被注销
#[tokio::test]
async fn stack_registers_and_discovers_itself() {
    init_tracing();
    let client = Arc::new(MockRegistryClient::new());
    let (microservice, instance) = own_microservice();
    let stack = RegistryFactory::new(config())
        .with_service_center_client(client.clone())
        .build(microservice, instance)
        .unwrap();

    stack.start().await.unwrap();
    let service_id = stack.local.service_id();
    let instance_id = stack.local.instance_id();

    let found = stack
        .app_manager
        .find_service_instances("default", "ms2", "0.0.0.0+")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ids(&found), vec![instance_id.as_str()]);

    stack.stop().await;
    assert!(!client.inner.heartbeat(&service_id, &instance_id).await.unwrap());
}

/// 测试：从预置数据中按版本规则发现其他服务
#[tokio::test]
async fn stack_resolves_preset_services() {
    let client = Arc::new(LocalServiceRegistryClient::from_yaml_str(PRESET).unwrap());
    let (microservice, instance) = own_microservice();
    let stack = RegistryFactory::new(config())
        .with_service_center_client(client.clone())
        .build(microservice, instance)
        .unwrap();
    stack.start().await.unwrap();

    let latest = stack
        .app_manager
        .get_or_create_microservice_version_rule("default", "ms3", "latest")
        .await
        .unwrap();
    assert_eq!(latest.instance_list().len(), 2);
    assert_eq!(
        latest.latest_microservice_version().unwrap().service_id(),
        "ms3-v2"
    );

    let fixed = stack
        .app_manager
        .find_service_instances("default", "ms3", "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fixed.len(), 1);
    assert_eq!(fixed[0].endpoints, vec!["rest://10.0.0.1:8080"]);

    let missing = stack
        .app_manager
        .find_service_instances("default", "ms9", "latest")
        .await
        .unwrap();
    assert!(missing.is_none());

    stack.stop().await;
}

/// 测试：实例状态更新经由注册管理器写入注册中心
#[tokio::test]
async fn stack_updates_instance_status() {
    let client = Arc::new(MockRegistryClient::new());
    let (microservice, instance) = own_microservice();
    let stack = RegistryFactory::new(config())
        .with_service_center_client(client.clone())
        .build(microservice, instance)
        .unwrap();
    stack.start().await.unwrap();

    assert!(
        stack
            .registrations
            .update_microservice_instance_status(InstanceStatus::Down)
            .await
    );
    let remote = client
        .get_microservice_instance(&stack.local.service_id(), &stack.local.instance_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.status, InstanceStatus::Down);

    stack.stop().await;
}

/// 测试：没有启用任何后端时构建失败
#[test]
fn build_without_backend_fails() {
    let (microservice, instance) = own_microservice();
    let result = RegistryFactory::new(RegistryConfig::default()).build(microservice, instance);

    assert!(matches!(result, Err(ref e) if e.is_fatal()));
}
