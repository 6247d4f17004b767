//! 消费端版本缓存测试

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{FakeInstanceSource, ids, init_tracing, instance, microservice};
use flare_registry_core::consumer::{
    AppManager, EmptyInstanceProtection, InstancePing, MicroserviceVersions,
};
use flare_registry_core::discovery::{InstanceStatus, MicroserviceInstance};
use tokio_test::assert_err;

const APP: &str = "default";
const SERVICE: &str = "ms2";

/// 三个版本，每个版本一个实例
fn three_versions() -> Arc<FakeInstanceSource> {
    let source = FakeInstanceSource::new();
    source.add_microservice(microservice(APP, SERVICE, "1.0.0", "sid-1"));
    source.add_microservice(microservice(APP, SERVICE, "1.5.0", "sid-15"));
    source.add_microservice(microservice(APP, SERVICE, "2.0.0", "sid-2"));
    source.set_instances(
        vec![
            instance("sid-2", "i-2"),
            instance("sid-1", "i-1"),
            instance("sid-15", "i-15"),
        ],
        "r1",
    );
    source
}

fn versions(source: &Arc<FakeInstanceSource>) -> MicroserviceVersions {
    MicroserviceVersions::new(APP, SERVICE, source.clone(), false)
}

/// 测试：范围规则只包含区间内版本的实例
#[tokio::test]
async fn range_rule_selects_versions_in_range() {
    init_tracing();
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();

    let range = versions.get_or_create_rule("1.0.0-2.0.0").unwrap();
    assert_eq!(ids(&range.instance_list()), vec!["i-1", "i-15"]);
    assert_eq!(
        range.latest_microservice_version().unwrap().service_id(),
        "sid-15"
    );

    let start_from = versions.get_or_create_rule("1.5.0+").unwrap();
    assert_eq!(ids(&start_from.instance_list()), vec!["i-15", "i-2"]);

    let fixed = versions.get_or_create_rule("1.0.0").unwrap();
    assert_eq!(ids(&fixed.instance_list()), vec!["i-1"]);

    let all = versions.get_or_create_rule("0.0.0.0+").unwrap();
    assert_eq!(ids(&all.instance_list()), vec!["i-1", "i-15", "i-2"]);
}

/// 测试：latest 规则只包含最高版本，版本升级后跟随变化
#[tokio::test]
async fn latest_rule_follows_highest_version() {
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();

    let latest = versions.get_or_create_rule("latest").unwrap();
    assert_eq!(ids(&latest.instance_list()), vec!["i-2"]);

    source.add_microservice(microservice(APP, SERVICE, "3.0.0", "sid-3"));
    source.set_instances(
        vec![instance("sid-2", "i-2"), instance("sid-3", "i-3")],
        "r2",
    );
    versions.pull_instances(false).await.unwrap();

    assert_eq!(ids(&latest.instance_list()), vec!["i-3"]);
    assert_eq!(
        latest.latest_microservice_version().unwrap().version().major(),
        3
    );
}

/// 测试：相同 revision 重复写入不会重建缓存
#[tokio::test]
async fn same_revision_is_noop() {
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();
    let before = versions.state();
    let lookups = source.microservice_lookups();
    assert_eq!(lookups, 3);

    versions
        .safe_set_instances(vec![instance("sid-1", "other")], Some("r1".to_string()))
        .await
        .unwrap();
    versions.pull_instances(false).await.unwrap();

    assert!(Arc::ptr_eq(&before, &versions.state()));
    assert_eq!(source.microservice_lookups(), lookups);
}

/// 测试：强制刷新忽略 revision 重建，已知版本不会重新查询
#[tokio::test]
async fn forced_pull_rebuilds_with_known_versions() {
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();
    let before = versions.state();

    versions.pull_instances(true).await.unwrap();

    assert!(!Arc::ptr_eq(&before, &versions.state()));
    assert_eq!(versions.revision().as_deref(), Some("r1"));
    assert_eq!(source.microservice_lookups(), 3);
}

/// 测试：实例下线后旧版本不会残留在缓存和规则中
#[tokio::test]
async fn removed_version_leaves_no_residue() {
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();
    let all = versions.get_or_create_rule("0+").unwrap();

    source.set_instances(vec![instance("sid-2", "i-2")], "r2");
    versions.pull_instances(false).await.unwrap();

    let state = versions.state();
    assert_eq!(state.versions.len(), 1);
    assert!(state.versions.contains_key("sid-2"));
    assert_eq!(ids(&all.instance_list()), vec!["i-2"]);
    assert_eq!(all.snapshot().versions.len(), 1);
}

/// 测试：服务不存在时清空缓存并等待删除
#[tokio::test]
async fn not_found_clears_cache() {
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();
    let all = versions.get_or_create_rule("0+").unwrap();
    assert_eq!(all.instance_list().len(), 3);

    source.set_not_exist();
    versions.pull_instances(false).await.unwrap();

    assert!(versions.is_microservice_not_exist());
    assert!(versions.is_waiting_delete());
    assert!(versions.state().instances.is_empty());
    assert!(versions.revision().is_none());
    assert!(all.instance_list().is_empty());
}

/// 测试：注册中心断连时保留旧缓存
#[tokio::test]
async fn disconnect_preserves_cache() {
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();
    let all = versions.get_or_create_rule("0+").unwrap();
    let before = versions.state();

    source.set_disconnected(true);
    let err = assert_err!(versions.pull_instances(true).await);

    assert!(err.is_retryable());
    assert!(Arc::ptr_eq(&before, &versions.state()));
    assert_eq!(all.instance_list().len(), 3);
    assert!(!versions.is_waiting_delete());
}

/// 测试：只保留 UP 状态的实例
#[tokio::test]
async fn up_instances_only_filters_status() {
    let source = three_versions();
    source.set_instances(
        vec![
            instance("sid-1", "i-1"),
            instance("sid-1", "i-down").with_status(InstanceStatus::Down),
        ],
        "r1",
    );
    let versions = MicroserviceVersions::new(APP, SERVICE, source.clone(), true);
    versions.pull_instances(false).await.unwrap();

    assert_eq!(ids(&versions.state().instances), vec!["i-1"]);
}

/// 测试：查询版本信息失败时整个服务缓存被丢弃，下次访问重新创建
#[tokio::test]
async fn version_lookup_failure_drops_entry() {
    init_tracing();
    let source = three_versions();
    source.set_microservice_lookup_fails(true);
    let manager = AppManager::new(source.clone(), false);

    let rule = manager
        .get_or_create_microservice_version_rule(APP, SERVICE, "0+")
        .await
        .unwrap();
    assert!(rule.instance_list().is_empty());
    let services = manager.microservice_manager(APP).unwrap();
    assert!(services.microservice_versions(SERVICE).is_none());

    source.set_microservice_lookup_fails(false);
    let found = manager
        .find_service_instances(APP, SERVICE, "0+")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ids(&found), vec!["i-1", "i-15", "i-2"]);
    assert!(services.microservice_versions(SERVICE).is_some());
}

/// 测试：未知服务返回 None，且不保留缓存条目
#[tokio::test]
async fn unknown_service_returns_none() {
    let source = FakeInstanceSource::new();
    source.set_not_exist();
    let manager = AppManager::new(source.clone(), false);

    let found = manager
        .find_service_instances(APP, "missing", "latest")
        .await
        .unwrap();

    assert!(found.is_none());
    assert!(manager
        .microservice_manager(APP)
        .unwrap()
        .microservice_versions("missing")
        .is_none());
}

/// 测试：同一服务的规则缓存复用，首次拉取只发生一次
#[tokio::test]
async fn rules_are_shared_per_service() {
    let source = three_versions();
    let manager = AppManager::new(source.clone(), false);

    let first = manager
        .get_or_create_microservice_version_rule(APP, SERVICE, "1.0.0+")
        .await
        .unwrap();
    let second = manager
        .get_or_create_microservice_version_rule(APP, SERVICE, " 1.0.0+ ")
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(source.pulls(), 1);
}

/// 测试：非法版本规则返回错误
#[tokio::test]
async fn invalid_rule_is_rejected() {
    let source = three_versions();
    let manager = AppManager::new(source, false);

    let result = manager
        .get_or_create_microservice_version_rule(APP, SERVICE, "not-a-version")
        .await;

    assert!(result.is_err());
}

/// 测试：变化事件触发增量拉取，恢复事件触发强制拉取
#[tokio::test]
async fn events_trigger_pulls() {
    use flare_registry_core::discovery::DiscoveryEvent;

    let source = three_versions();
    let manager = AppManager::new(source.clone(), false);
    let rule = manager
        .get_or_create_microservice_version_rule(APP, SERVICE, "0+")
        .await
        .unwrap();

    source.set_instances(vec![instance("sid-1", "i-1")], "r2");
    manager
        .handle_event(DiscoveryEvent::InstancesChanged {
            app_id: APP.to_string(),
            service_name: SERVICE.to_string(),
        })
        .await;
    assert_eq!(ids(&rule.instance_list()), vec!["i-1"]);

    let pulls = source.pulls();
    manager
        .handle_event(DiscoveryEvent::Recovered {
            registry_name: "service-center".to_string(),
        })
        .await;
    assert_eq!(source.pulls(), pulls + 1);
}

/// 指定实例探测失败
struct Unreachable(&'static str);

#[async_trait]
impl InstancePing for Unreachable {
    async fn ping(&self, instance: &MicroserviceInstance) -> bool {
        instance.instance_id != self.0
    }
}

/// 测试：拉到空列表时保留探测存活的旧实例
#[tokio::test]
async fn empty_pull_keeps_reachable_instances() {
    let source = three_versions();
    let versions = versions(&source).with_empty_instance_protection(Some(
        EmptyInstanceProtection::new(Arc::new(Unreachable("i-15"))),
    ));
    versions.pull_instances(false).await.unwrap();
    let all = versions.get_or_create_rule("0+").unwrap();

    source.set_instances(Vec::new(), "r2");
    versions.pull_instances(false).await.unwrap();

    assert_eq!(ids(&versions.state().instances), vec!["i-1", "i-2"]);
    assert_eq!(versions.revision().as_deref(), Some("r2"));
    assert_eq!(ids(&all.instance_list()), vec!["i-1", "i-2"]);
    assert!(!versions.state().versions.contains_key("sid-15"));
}

/// 测试：默认探测认为旧实例全部存活；关闭保护时空列表直接生效
#[tokio::test]
async fn empty_pull_with_and_without_protection() {
    let source = three_versions();
    let protected = versions(&source)
        .with_empty_instance_protection(Some(EmptyInstanceProtection::default()));
    let unprotected = versions(&source);
    protected.pull_instances(false).await.unwrap();
    unprotected.pull_instances(false).await.unwrap();

    source.set_instances(Vec::new(), "r2");
    protected.pull_instances(false).await.unwrap();
    unprotected.pull_instances(false).await.unwrap();

    assert_eq!(protected.state().instances.len(), 3);
    assert!(unprotected.state().instances.is_empty());
    assert_eq!(unprotected.revision().as_deref(), Some("r2"));
}

/// 测试：写法不同但含义相同的规则共用一份缓存
#[tokio::test]
async fn equivalent_rules_share_cache() {
    let source = three_versions();
    let versions = versions(&source);
    versions.pull_instances(false).await.unwrap();

    let short = versions.get_or_create_rule("1+").unwrap();
    let long = versions.get_or_create_rule("1.0.0.0+").unwrap();

    assert!(Arc::ptr_eq(&short, &long));
    assert_eq!(versions.rules().len(), 1);
    assert_eq!(short.spec(), "1.0.0.0+");
}
