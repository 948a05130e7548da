//! 客户端连接管理测试

use beacon_core::client::{
    ClientFactory, ClientManager, ClientOptions, FailoverConfig, LoadBalanceStrategy,
    LoadBalancer,
};
use beacon_core::error::DiscoveryError;
use beacon_core::registry::{Discovery, MemoryRegistry, RegistrationHandle};
use beacon_core::types::ServiceInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn test_instance(name: &str, id: &str, port: u16) -> ServiceInfo {
    ServiceInfo::new(name, format!("127.0.0.1:{port}")).with_id(id)
}

/// 注册 n 个实例的内存注册中心
async fn seeded_registry(
    name: &str,
    count: u16,
) -> (Arc<MemoryRegistry>, Vec<RegistrationHandle>) {
    let registry = Arc::new(MemoryRegistry::new());
    let mut handles = Vec::new();
    for i in 0..count {
        handles.push(
            registry
                .register(test_instance(name, &format!("node-{i}"), 9100 + i))
                .await
                .expect("Failed to register instance"),
        );
    }
    (registry, handles)
}

async fn manager_with(
    registry: &Arc<MemoryRegistry>,
    name: &str,
    opts: ClientOptions,
) -> Arc<ClientManager> {
    let discovery: Arc<dyn Discovery> = registry.clone();
    Arc::new(
        ClientManager::new(discovery, name, opts)
            .await
            .expect("Failed to create client manager"),
    )
}

/// 测试：轮询在稳定的 3 实例集合上 300 次选择均匀分布为 100/100/100
#[tokio::test]
async fn test_round_robin_is_exactly_fair_on_stable_set() {
    let (registry, _handles) = seeded_registry("echo", 3).await;
    let manager = manager_with(&registry, "echo", ClientOptions::default()).await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..300 {
        let service = manager.select().await.expect("Failed to select");
        *counts.entry(service.id).or_insert(0) += 1;
    }

    assert_eq!(counts.len(), 3);
    for (id, count) in counts {
        assert_eq!(count, 100, "instance {id} expected exactly 100 selections");
    }
}

/// 测试：随机策略只返回集合内的实例
#[tokio::test]
async fn test_random_stays_within_set() {
    let (registry, _handles) = seeded_registry("echo", 3).await;
    let opts = ClientOptions {
        strategy: LoadBalanceStrategy::Random,
        ..Default::default()
    };
    let manager = manager_with(&registry, "echo", opts).await;

    for _ in 0..100 {
        let service = manager.select().await.expect("Failed to select");
        assert!(service.id.starts_with("node-"));
    }
}

/// 测试：加权轮询按权重比例分布（100:200 → 100:200）
#[tokio::test]
async fn test_weighted_round_robin_follows_weights() {
    let registry = Arc::new(MemoryRegistry::new());
    let _light = registry
        .register(test_instance("echo", "node-light", 9100))
        .await
        .expect("Failed to register");
    let _heavy = registry
        .register(test_instance("echo", "node-heavy", 9101).with_weight(200))
        .await
        .expect("Failed to register");

    let opts = ClientOptions {
        strategy: LoadBalanceStrategy::WeightedRoundRobin,
        ..Default::default()
    };
    let manager = manager_with(&registry, "echo", opts).await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..300 {
        let service = manager.select().await.expect("Failed to select");
        *counts.entry(service.id).or_insert(0) += 1;
    }

    assert_eq!(counts["node-light"], 100);
    assert_eq!(counts["node-heavy"], 200);
}

/// 测试：最少连接策略优先选在途请求最少的实例
#[tokio::test]
async fn test_least_connections_prefers_idle_instance() {
    let balancer = LoadBalancer::new(LoadBalanceStrategy::LeastConnections);
    let services = vec![
        test_instance("echo", "node-0", 9100),
        test_instance("echo", "node-1", 9101),
        test_instance("echo", "node-2", 9102),
    ];

    balancer.acquire("node-0").await;
    balancer.acquire("node-0").await;
    balancer.acquire("node-1").await;

    let chosen = balancer.select(&services).await.expect("Failed to select");
    assert_eq!(chosen.id, "node-2");

    // 调用结束后计数回落
    balancer.release("node-0").await;
    balancer.release("node-0").await;
    assert_eq!(balancer.inflight("node-0").await, 0);
}

/// 测试：无实例时返回明确的 NoInstances 错误
#[tokio::test]
async fn test_no_instances_error() {
    let registry = Arc::new(MemoryRegistry::new());
    let manager = manager_with(&registry, "missing", ClientOptions::default()).await;

    let err = manager.select().await.expect_err("select must fail");
    assert!(matches!(err, DiscoveryError::NoInstances(name) if name == "missing"));
}

/// 测试：故障转移 —— 前两次失败、第三次成功
#[tokio::test]
async fn test_failover_succeeds_after_two_failures() {
    let (registry, _handles) = seeded_registry("echo", 1).await;
    let opts = ClientOptions {
        failover: Some(FailoverConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
        }),
        ..Default::default()
    };
    let manager = manager_with(&registry, "echo", opts).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let result = manager
        .call(move |_channel, _service| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(std::io::Error::other("simulated failure"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

    assert_eq!(result.expect("call should eventually succeed"), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

/// 测试：故障转移 —— 全部失败后恰好尝试 max_retries 次并报告次数
#[tokio::test]
async fn test_failover_exhaustion_reports_attempt_count() {
    let (registry, _handles) = seeded_registry("echo", 1).await;
    let opts = ClientOptions {
        failover: Some(FailoverConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
        }),
        ..Default::default()
    };
    let manager = manager_with(&registry, "echo", opts).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let result: Result<u32, _> = manager
        .call(move |_channel, _service| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<u32, _>(std::io::Error::other("boom")) }
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match result.expect_err("call must fail") {
        DiscoveryError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
}

/// 测试：未启用故障转移时单次尝试，错误原样传出
#[tokio::test]
async fn test_single_attempt_without_failover() {
    let (registry, _handles) = seeded_registry("echo", 1).await;
    let manager = manager_with(&registry, "echo", ClientOptions::default()).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let result: Result<u32, _> = manager
        .call(move |_channel, _service| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<u32, _>(std::io::Error::other("boom")) }
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let err = result.expect_err("call must fail");
    assert_eq!(err.to_string(), "boom");
}

/// 测试：连接缓存单例 —— 50 个并发取同一地址只建一条连接
#[tokio::test]
async fn test_channel_cache_builds_exactly_one_connection() {
    let (registry, _handles) = seeded_registry("echo", 1).await;
    let manager = manager_with(&registry, "echo", ClientOptions::default()).await;

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.channel_for("127.0.0.1:9100").await
        }));
    }
    for task in tasks {
        task.await
            .expect("task panicked")
            .expect("Failed to get channel");
    }

    assert_eq!(manager.stats().dials(), 1, "exactly one dial expected");
    assert_eq!(manager.cached_channels().await, 1);
}

/// 测试：watch 更新拆除离场地址的连接
#[tokio::test]
async fn test_watch_update_tears_down_departed_connections() {
    let registry = Arc::new(MemoryRegistry::new());
    let _stay = registry
        .register(test_instance("echo", "node-stay", 9100))
        .await
        .expect("Failed to register");
    let leave = registry
        .register(test_instance("echo", "node-leave", 9101))
        .await
        .expect("Failed to register");

    let manager = manager_with(&registry, "echo", ClientOptions::default()).await;
    sleep(Duration::from_millis(50)).await;

    manager
        .channel_for("127.0.0.1:9100")
        .await
        .expect("Failed to get channel");
    manager
        .channel_for("127.0.0.1:9101")
        .await
        .expect("Failed to get channel");
    assert_eq!(manager.cached_channels().await, 2);

    leave.deregister().await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.cached_channels().await, 1);
    assert_eq!(manager.instances().await.len(), 1);
    assert!(manager.stats().evictions() >= 1);
}

/// 测试：工厂按服务名复用客户端管理器
#[tokio::test]
async fn test_factory_memoizes_per_service_name() {
    let (registry, _handles) = seeded_registry("echo", 1).await;
    let discovery: Arc<dyn Discovery> = registry.clone();
    let factory = ClientFactory::new(discovery);

    let first = factory.get_client("echo").await.expect("Failed to get client");
    let second = factory.get_client("echo").await.expect("Failed to get client");
    assert!(Arc::ptr_eq(&first, &second));

    factory.remove("echo").await;
    let third = factory.get_client("echo").await.expect("Failed to get client");
    assert!(!Arc::ptr_eq(&first, &third));
}

/// 测试：标签选择器参与客户端实例过滤
#[tokio::test]
async fn test_client_applies_label_selector() {
    let registry = Arc::new(MemoryRegistry::new());
    let _prod = registry
        .register(test_instance("echo", "node-prod", 9100).with_metadata("env", "prod"))
        .await
        .expect("Failed to register");
    let _dev = registry
        .register(test_instance("echo", "node-dev", 9101).with_metadata("env", "dev"))
        .await
        .expect("Failed to register");

    let opts = ClientOptions {
        selector: beacon_core::LabelSelector::new().with_label("env", "prod"),
        ..Default::default()
    };
    let manager = manager_with(&registry, "echo", opts).await;

    let instances = manager.instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id, "node-prod");
}
