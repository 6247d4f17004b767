//! 注册任务集成测试

mod common;

use std::sync::Arc;

use common::{MockRegistryClient, init_tracing};
use flare_registry_core::client::ServiceRegistryClient;
use flare_registry_core::config::RegistryConfig;
use flare_registry_core::discovery::{InstanceStatus, MicroserviceInstance};
use flare_registry_core::error::RegistryError;
use flare_registry_core::registry::{
    EnvAdapterManager, LocalMicroservice, Microservice, Registration, ServiceCenterRegistration,
};
use flare_registry_core::task::{HeartbeatResult, TaskEvent, TaskStatus};
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep, timeout};
use tokio_test::{assert_err, assert_ok};

const HELLO_SCHEMA: &str = "openapi: 3.0.0\npaths:\n  /hello:\n    get: {}\n";
const WORLD_SCHEMA: &str = "openapi: 3.0.0\npaths:\n  /world:\n    get: {}\n";

fn registration(
    client: &Arc<MockRegistryClient>,
    microservice: Microservice,
) -> (ServiceCenterRegistration, Arc<LocalMicroservice>) {
    let local = Arc::new(LocalMicroservice::new(
        microservice,
        MicroserviceInstance::new("test-host").with_endpoint("rest://127.0.0.1:8080"),
    ));
    let registration = ServiceCenterRegistration::new(
        &RegistryConfig::default(),
        client.clone(),
        local.clone(),
        EnvAdapterManager::new(),
    );
    (registration, local)
}

fn drain(events: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

/// 在注册中心预置一个带契约的微服务
async fn preset_remote(client: &MockRegistryClient, environment: &str, schema: &str) -> String {
    let remote = Microservice::new("default", "ms1", "1.0.0")
        .with_environment(environment)
        .with_schema("A", "");
    let service_id = client.inner.register_microservice(&remote).await.unwrap();
    client
        .inner
        .register_schema(&service_id, "A", schema)
        .await
        .unwrap();
    service_id
}

/// 测试：开发环境下契约不一致时直接覆盖注册中心中的契约
#[tokio::test]
async fn development_overwrites_changed_schema() {
    init_tracing();
    let client = Arc::new(MockRegistryClient::new());
    let service_id = preset_remote(&client, "development", "y: 1").await;

    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms1", "1.0.0")
            .with_environment("development")
            .with_schema("A", "x: 1"),
    );
    registration.task_graph().register_once().await.unwrap();

    assert_eq!(local.service_id(), service_id);
    assert_eq!(
        client.schema_registrations(),
        vec![("A".to_string(), "x: 1".to_string())]
    );
    assert_eq!(
        client.inner.get_schema(&service_id, "A").await.unwrap().as_deref(),
        Some("x: 1")
    );
}

/// 测试：生产环境下契约结构不同是致命错误，且不会覆盖
#[tokio::test]
async fn production_rejects_different_schema() {
    init_tracing();
    let client = Arc::new(MockRegistryClient::new());
    let service_id = preset_remote(&client, "production", HELLO_SCHEMA).await;

    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms1", "1.0.0")
            .with_environment("production")
            .with_schema("A", WORLD_SCHEMA),
    );
    let err = assert_err!(registration.run().await);

    assert!(matches!(err, RegistryError::SchemaConflict { ref schema_id, .. } if schema_id == "A"));
    assert!(err.is_fatal());
    assert!(client.schema_registrations().is_empty());
    assert!(local.instance_id().is_empty());
    assert_eq!(
        client.inner.get_schema(&service_id, "A").await.unwrap().as_deref(),
        Some(HELLO_SCHEMA)
    );
}

/// 测试：生产环境下契约只有格式差异时视为一致
#[tokio::test]
async fn production_accepts_structurally_equal_schema() {
    let client = Arc::new(MockRegistryClient::new());
    preset_remote(&client, "production", "openapi: 3.0.0\npaths: {/hello: {get: {}}}\n").await;

    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms1", "1.0.0")
            .with_environment("production")
            .with_schema("A", HELLO_SCHEMA),
    );
    registration.task_graph().register_once().await.unwrap();

    assert!(client.schema_registrations().is_empty());
    assert!(!local.instance_id().is_empty());
}

/// 测试：注册中心多出本地没有的契约时，生产环境拒绝启动
#[tokio::test]
async fn production_rejects_remote_only_schema() {
    let client = Arc::new(MockRegistryClient::new());
    preset_remote(&client, "production", HELLO_SCHEMA).await;

    let (registration, _) = registration(
        &client,
        Microservice::new("default", "ms1", "1.0.0").with_environment("production"),
    );
    let err = assert_err!(registration.task_graph().register_once().await);

    assert!(err.is_fatal());
}

/// 测试：空注册中心上完成注册，心跳发现实例丢失后自动重新注册
#[tokio::test]
async fn end_to_end_registration_recovers_lost_instance() {
    init_tracing();
    let client = Arc::new(MockRegistryClient::new());
    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms2", "1.0.0.0")
            .with_schema("hello", HELLO_SCHEMA)
            .with_schema("world", WORLD_SCHEMA),
    );
    let graph = registration.task_graph();
    let mut events = graph.bus().subscribe();

    assert_ok!(graph.register_once().await);

    let service_id = local.service_id();
    let instance_id = local.instance_id();
    assert!(!service_id.is_empty());
    assert!(!instance_id.is_empty());
    let registered: Vec<String> = client
        .schema_registrations()
        .into_iter()
        .map(|(schema_id, _)| schema_id)
        .collect();
    assert_eq!(registered, vec!["hello", "world"]);
    assert_eq!(graph.task_status("instance-register"), Some(TaskStatus::Finished));
    assert_eq!(
        graph.task_status("microservice-register"),
        Some(TaskStatus::Finished)
    );
    assert!(client.inner.heartbeat(&service_id, &instance_id).await.unwrap());
    assert_eq!(
        events.recv().await.unwrap(),
        TaskEvent::MicroserviceRegistered { success: true }
    );

    // 注册中心丢失实例
    client
        .inner
        .unregister_instance(&service_id, &instance_id)
        .await
        .unwrap();
    graph.tick().await;
    assert_eq!(
        graph.task_status("microservice-register"),
        Some(TaskStatus::Ready)
    );

    graph.tick().await;
    assert_eq!(local.service_id(), service_id);
    assert_eq!(local.instance_id(), instance_id);
    assert!(client.inner.heartbeat(&service_id, &instance_id).await.unwrap());
    assert_eq!(graph.task_status("instance-register"), Some(TaskStatus::Finished));
    assert_eq!(client.schema_registrations().len(), 2);
}

/// 测试：注册中心断连时启动不报错，恢复后由后台任务完成注册
#[tokio::test]
async fn disconnected_startup_is_retried() {
    let client = Arc::new(MockRegistryClient::new());
    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms3", "1.0.0").with_schema("hello", HELLO_SCHEMA),
    );
    let graph = registration.task_graph();

    client.set_disconnected(true);
    assert_ok!(graph.register_once().await);
    assert!(local.service_id().is_empty());
    assert_eq!(
        graph.task_status("microservice-register"),
        Some(TaskStatus::Ready)
    );

    client.set_disconnected(false);
    graph.tick().await;
    assert!(!local.service_id().is_empty());
    assert!(!local.instance_id().is_empty());
}

/// 测试：状态同步任务把注册中心中的实例状态同步到本地
#[tokio::test]
async fn status_sync_pulls_remote_status() {
    let client = Arc::new(MockRegistryClient::new());
    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms4", "1.0.0"),
    );
    let graph = registration.task_graph();
    assert_ok!(graph.register_once().await);

    client
        .inner
        .update_instance_status(
            &local.service_id(),
            &local.instance_id(),
            InstanceStatus::Down,
        )
        .await
        .unwrap();
    graph.tick().await;

    assert_eq!(local.instance().status, InstanceStatus::Down);
}

/// 测试：更新实例状态同时写入注册中心和本地
#[tokio::test]
async fn update_instance_status_round_trips() {
    let client = Arc::new(MockRegistryClient::new());
    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms5", "1.0.0"),
    );
    registration.task_graph().register_once().await.unwrap();

    assert!(
        registration
            .update_microservice_instance_status(InstanceStatus::OutOfService)
            .await
    );
    assert_eq!(local.instance().status, InstanceStatus::OutOfService);

    let remote = client
        .inner
        .get_microservice_instance(&local.service_id(), &local.instance_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.status, InstanceStatus::OutOfService);
}

/// 测试：心跳断连只发布断连事件，不触发重新注册；恢复后发布连接恢复事件
#[tokio::test]
async fn heartbeat_disconnect_then_recover() {
    let client = Arc::new(MockRegistryClient::new());
    let (registration, local) = registration(
        &client,
        Microservice::new("default", "ms6", "1.0.0"),
    );
    let graph = registration.task_graph();
    assert_ok!(graph.register_once().await);
    let instance_id = local.instance_id();
    let mut events = graph.bus().subscribe();

    client.set_disconnected(true);
    graph.tick().await;
    let received = drain(&mut events);
    assert!(received.contains(&TaskEvent::Heartbeat(HeartbeatResult::Disconnected)));
    assert!(!received.contains(&TaskEvent::ConnectionRecovered));
    assert_eq!(
        graph.task_status("microservice-register"),
        Some(TaskStatus::Finished)
    );
    assert_eq!(graph.task_status("instance-heartbeat"), Some(TaskStatus::Ready));

    client.set_disconnected(false);
    graph.tick().await;
    let received = drain(&mut events);
    assert!(received.contains(&TaskEvent::Heartbeat(HeartbeatResult::Success)));
    assert!(received.contains(&TaskEvent::ConnectionRecovered));
    assert_eq!(
        graph.task_status("microservice-register"),
        Some(TaskStatus::Finished)
    );
    assert_eq!(local.instance_id(), instance_id);
}

/// 测试：后台任务循环发现实例丢失后自动重新注册
#[tokio::test(start_paused = true)]
async fn background_loops_recover_lost_instance() {
    let client = Arc::new(MockRegistryClient::new());
    let config = RegistryConfig {
        heartbeat_interval_secs: 1,
        status_sync_interval_secs: 1,
        ..Default::default()
    };
    let local = Arc::new(LocalMicroservice::new(
        Microservice::new("default", "ms7", "1.0.0").with_schema("hello", HELLO_SCHEMA),
        MicroserviceInstance::new("test-host").with_endpoint("rest://127.0.0.1:8080"),
    ));
    let registration = ServiceCenterRegistration::new(
        &config,
        client.clone(),
        local.clone(),
        EnvAdapterManager::new(),
    );
    assert_ok!(registration.run().await);
    let graph = registration.task_graph();
    assert!(graph.is_started());

    let service_id = local.service_id();
    let instance_id = local.instance_id();
    client
        .inner
        .unregister_instance(&service_id, &instance_id)
        .await
        .unwrap();

    timeout(Duration::from_secs(10), async {
        loop {
            let remote = client
                .inner
                .get_microservice_instance(&service_id, &instance_id)
                .await
                .unwrap();
            if remote.is_some() {
                break;
            }
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("instance was not registered again");

    assert_eq!(local.service_id(), service_id);
    assert_eq!(local.instance_id(), instance_id);

    // 后台循环运行期间不能再手动驱动
    graph.tick().await;
    assert_err!(graph.register_once().await);

    registration.destroy().await;
    assert!(
        client
            .inner
            .get_microservice_instance(&service_id, &instance_id)
            .await
            .unwrap()
            .is_none()
    );
}
