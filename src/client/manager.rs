//! 客户端连接管理器
//!
//! 维护单个服务名的实例列表与连接缓存：初始 Find + 后台 Watch 刷新成员，
//! 每次调用按策略选取实例；连接按地址复用，支持故障转移与健康摘除

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::client::balance::{LoadBalanceStrategy, LoadBalancer};
use crate::error::{BoxError, DiscoveryError, Result};
use crate::registry::{Discovery, WatchSupervisor};
use crate::selector::LabelSelector;
use crate::types::ServiceInfo;

/// 故障转移配置
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// 最大尝试次数（含首次）
    pub max_retries: usize,

    /// 两次尝试之间的固定等待
    pub retry_delay: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// 客户端选项
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub strategy: LoadBalanceStrategy,
    pub selector: LabelSelector,
    pub failover: Option<FailoverConfig>,

    /// 连接健康巡检间隔
    pub health_check_interval: Duration,

    /// 健康探测单次超时
    pub health_probe_timeout: Duration,

    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            strategy: LoadBalanceStrategy::RoundRobin,
            selector: LabelSelector::default(),
            failover: None,
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// 运行计数（观测与测试用）
#[derive(Debug, Default)]
pub struct ClientStats {
    dials: AtomicU64,
    evictions: AtomicU64,
}

impl ClientStats {
    /// 已创建的连接数
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// 已摘除的连接数（成员离场 + 健康摘除）
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// 单个服务名的客户端连接管理器
pub struct ClientManager {
    name: String,
    opts: ClientOptions,
    instances: Arc<RwLock<Vec<ServiceInfo>>>,
    channels: Arc<RwLock<HashMap<String, Channel>>>,
    balancer: LoadBalancer,
    stats: Arc<ClientStats>,
    token: CancellationToken,
}

impl ClientManager {
    /// 创建管理器：先 Find 取得初始实例集，再启动后台 watch 与健康巡检
    pub async fn new(
        discovery: Arc<dyn Discovery>,
        name: impl Into<String>,
        opts: ClientOptions,
    ) -> Result<Self> {
        let name = name.into();
        let initial = discovery.find(&name).await?;
        let filtered = opts.selector.filter(&initial);
        debug!(service = %name, instances = filtered.len(), "client manager created");

        let instances = Arc::new(RwLock::new(filtered));
        let channels = Arc::new(RwLock::new(HashMap::new()));
        let stats = Arc::new(ClientStats::default());
        let token = CancellationToken::new();

        tokio::spawn(Self::watch_loop(
            discovery,
            name.clone(),
            opts.selector.clone(),
            instances.clone(),
            channels.clone(),
            stats.clone(),
            token.clone(),
        ));
        tokio::spawn(Self::health_loop(
            name.clone(),
            channels.clone(),
            stats.clone(),
            opts.health_check_interval,
            opts.health_probe_timeout,
            token.clone(),
        ));

        Ok(Self {
            name,
            balancer: LoadBalancer::new(opts.strategy),
            opts,
            instances,
            channels,
            stats,
            token,
        })
    }

    /// 后台 watch：成员变化时替换实例列表，并拆除离场地址的连接
    async fn watch_loop(
        discovery: Arc<dyn Discovery>,
        name: String,
        selector: LabelSelector,
        instances: Arc<RwLock<Vec<ServiceInfo>>>,
        channels: Arc<RwLock<HashMap<String, Channel>>>,
        stats: Arc<ClientStats>,
        token: CancellationToken,
    ) {
        let (set_tx, mut set_rx) = mpsc::unbounded_channel::<Vec<ServiceInfo>>();
        let supervisor = WatchSupervisor::forever();
        let watch_token = token.child_token();
        let watch_name = name.clone();
        let watcher = tokio::spawn(async move {
            let notify = Box::new(move |services: Vec<ServiceInfo>| {
                let _ = set_tx.send(services);
            });
            if let Err(e) = supervisor
                .run(discovery, &watch_name, watch_token, notify)
                .await
            {
                warn!(service = %watch_name, error = %e, "membership watch terminated");
            }
        });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                set = set_rx.recv() => match set {
                    Some(services) => {
                        let filtered = selector.filter(&services);
                        let keep: HashSet<String> =
                            filtered.iter().map(|i| i.addr.clone()).collect();
                        *instances.write().await = filtered;

                        // watch 驱动的摘除是主机制，健康巡检只是兜底
                        let mut cache = channels.write().await;
                        let before = cache.len();
                        cache.retain(|addr, _| keep.contains(addr));
                        let evicted = before - cache.len();
                        if evicted > 0 {
                            stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                            debug!(service = %name, evicted, "dropped connections for departed addresses");
                        }
                    }
                    None => break,
                }
            }
        }
        watcher.abort();
    }

    /// 健康巡检：摘除已终止的连接，下次使用时惰性重建
    async fn health_loop(
        name: String,
        channels: Arc<RwLock<HashMap<String, Channel>>>,
        stats: Arc<ClientStats>,
        interval: Duration,
        probe_timeout: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot: Vec<(String, Channel)> = {
                        let cache = channels.read().await;
                        cache.iter().map(|(addr, ch)| (addr.clone(), ch.clone())).collect()
                    };
                    for (addr, channel) in snapshot {
                        if Self::probe(channel, probe_timeout).await {
                            continue;
                        }
                        channels.write().await.remove(&addr);
                        stats.evictions.fetch_add(1, Ordering::Relaxed);
                        warn!(service = %name, addr = %addr, "evicted shut-down connection");
                    }
                }
            }
        }
    }

    /// 探测连接是否仍然可用
    ///
    /// 就绪探测立刻报错说明底层通道已终止；超时只代表暂时未就绪，不摘除
    async fn probe(mut channel: Channel, probe_timeout: Duration) -> bool {
        !matches!(
            tokio::time::timeout(probe_timeout, channel.ready()).await,
            Ok(Err(_))
        )
    }

    /// 服务名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 运行计数
    pub fn stats(&self) -> Arc<ClientStats> {
        self.stats.clone()
    }

    /// 当前实例列表（已过滤、已排序）
    pub async fn instances(&self) -> Vec<ServiceInfo> {
        self.instances.read().await.clone()
    }

    /// 当前缓存的连接数
    pub async fn cached_channels(&self) -> usize {
        self.channels.read().await.len()
    }

    /// 按负载均衡策略选择一个实例
    pub async fn select(&self) -> Result<ServiceInfo> {
        let instances = self.instances.read().await.clone();
        self.balancer
            .select(&instances)
            .await
            .ok_or_else(|| DiscoveryError::NoInstances(self.name.clone()))
    }

    /// 取指定地址的连接；同地址并发取用只会建一条（双检锁）
    pub async fn channel_for(&self, addr: &str) -> Result<Channel> {
        {
            let cache = self.channels.read().await;
            if let Some(channel) = cache.get(addr) {
                return Ok(channel.clone());
            }
        }

        let mut cache = self.channels.write().await;
        if let Some(channel) = cache.get(addr) {
            return Ok(channel.clone());
        }
        // 惰性连接：拨号推迟到首个请求，创建本身不做 IO
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))?
            .connect_timeout(self.opts.connect_timeout)
            .timeout(self.opts.request_timeout);
        let channel = endpoint.connect_lazy();
        self.stats.dials.fetch_add(1, Ordering::Relaxed);
        cache.insert(addr.to_string(), channel.clone());
        debug!(service = %self.name, addr = %addr, "channel created");
        Ok(channel)
    }

    /// 选择实例并返回其连接
    pub async fn pick(&self) -> Result<(ServiceInfo, Channel)> {
        let service = self.select().await?;
        let channel = self.channel_for(&service.addr).await?;
        Ok((service, channel))
    }

    /// 发起一次调用
    ///
    /// 配置了故障转移时：失败后等待固定间隔、重新选择实例重试，直至尝试
    /// 次数耗尽，返回携带尝试次数的最后一个错误；未配置时单次尝试，错误
    /// 原样传出
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Channel, ServiceInfo) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let failover = self.opts.failover.clone();
        let max_attempts = failover
            .as_ref()
            .map(|f| f.max_retries.max(1))
            .unwrap_or(1);
        let mut last_err: Option<BoxError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                if let Some(failover) = &failover {
                    tokio::time::sleep(failover.retry_delay).await;
                }
            }

            let (service, channel) = match self.pick().await {
                Ok(pair) => pair,
                Err(e) => {
                    if failover.is_none() {
                        return Err(e);
                    }
                    last_err = Some(Box::new(e));
                    continue;
                }
            };

            self.balancer.acquire(&service.id).await;
            let outcome = op(channel, service.clone()).await;
            self.balancer.release(&service.id).await;

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let e: BoxError = e.into();
                    warn!(
                        service = %self.name,
                        instance = %service.id,
                        attempt,
                        error = %e,
                        "call attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        let source = last_err
            .unwrap_or_else(|| Box::new(DiscoveryError::NoInstances(self.name.clone())));
        if max_attempts > 1 {
            Err(DiscoveryError::Exhausted {
                attempts: max_attempts,
                source,
            })
        } else {
            Err(DiscoveryError::Call(source))
        }
    }

    /// 停止后台任务并清空连接缓存
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.channels.write().await.clear();
        info!(service = %self.name, "client manager stopped");
    }
}

impl Drop for ClientManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
