//! etcd 服务注册发现后端
//!
//! 注册键为 `/{namespace}/{name}/{id}`，值是 JSON 编码的 ServiceInfo，
//! 绑定租约；续期流断开时用新租约对同一个键透明重注册，实例存在性对
//! 调用方自愈

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistryUrl;
use crate::error::{DiscoveryError, Result};
use crate::registry::{Discovery, Notify, RegistrationHandle};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::types::{sort_services, ServiceInfo, KIND_RPC};

/// 注销清理的时间上限
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// etcd 后端
pub struct EtcdRegistry {
    client: Client,
    namespace: String,
    kind: String,
    ttl: i64,
}

impl std::fmt::Debug for EtcdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdRegistry")
            .field("namespace", &self.namespace)
            .field("kind", &self.kind)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl EtcdRegistry {
    /// 按已解析的连接 URL 建立 etcd 后端
    pub async fn connect(url: &RegistryUrl) -> Result<Self> {
        let mut options = ConnectOptions::new();
        if let (Some(user), Some(password)) = (url.user(), url.password()) {
            options = options.with_user(user, password);
        }
        let client = Client::connect(url.endpoints.clone(), Some(options)).await?;

        Ok(Self {
            client,
            namespace: url.namespace.clone(),
            kind: url.kind().to_string(),
            ttl: url.ttl() as i64,
        })
    }

    /// 直接按端点列表建立（测试与内嵌场景）
    pub async fn new(
        endpoints: Vec<String>,
        namespace: impl Into<String>,
        ttl: i64,
    ) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            kind: KIND_RPC.to_string(),
            ttl,
        })
    }

    fn service_prefix(&self, name: &str) -> String {
        format!("/{}/{}/", self.namespace, name)
    }

    fn service_key(&self, name: &str, id: &str) -> String {
        format!("/{}/{}/{}", self.namespace, name, id)
    }

    /// 解码注册条目，过滤掉协议标记不符的条目（混用命名空间的防御）
    fn decode(&self, value: &[u8]) -> Option<ServiceInfo> {
        match serde_json::from_slice::<ServiceInfo>(value) {
            Ok(info) if info.kind == self.kind => Some(info),
            Ok(info) => {
                debug!(kind = %info.kind, expected = %self.kind, "skipping entry of foreign kind");
                None
            }
            Err(e) => {
                warn!(error = %e, "skipping undecodable registry entry");
                None
            }
        }
    }

    /// 租约授予 + 键写入，单次尝试
    async fn lease_and_put(client: &mut Client, key: &str, value: &str, ttl: i64) -> Result<i64> {
        let lease = client.lease_grant(ttl, None).await?;
        let lease_id = lease.id();
        let opts = PutOptions::new().with_lease(lease_id);
        client
            .put(key.to_string(), value.to_string(), Some(opts))
            .await?;
        Ok(lease_id)
    }

    /// 带退避的重注册（存活循环断流恢复用）
    ///
    /// 返回 None 表示等待期间被取消
    async fn reregister_with_backoff(
        client: &mut Client,
        key: &str,
        value: &str,
        ttl: i64,
        token: &CancellationToken,
    ) -> Option<i64> {
        let policy = ExponentialBackoffPolicy::register_default();
        let mut attempt = 0usize;
        loop {
            match Self::lease_and_put(client, key, value, ttl).await {
                Ok(lease_id) => {
                    info!(key = %key, lease_id, "service re-registered with fresh lease");
                    return Some(lease_id);
                }
                Err(e) => {
                    let backoff = policy.backoff_duration(attempt);
                    warn!(
                        key = %key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "re-registration attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// 存活循环：维持租约续期；续期流断开或租约失效时透明重注册
    ///
    /// 只有 token 取消才会退出，退出前限时删除注册键并释放租约
    async fn liveness_loop(
        mut client: Client,
        key: String,
        value: String,
        ttl: i64,
        mut lease_id: i64,
        token: CancellationToken,
    ) {
        let keepalive_interval = Duration::from_secs((ttl as u64 / 3).max(1));

        'session: loop {
            let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(key = %key, error = %e, "keep-alive channel failed, re-registering");
                    match Self::reregister_with_backoff(&mut client, &key, &value, ttl, &token)
                        .await
                    {
                        Some(id) => {
                            lease_id = id;
                            continue 'session;
                        }
                        None => break 'session,
                    }
                }
            };

            let mut ticker = tokio::time::interval(keepalive_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break 'session,
                    _ = ticker.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            warn!(key = %key, error = %e, "lease renewal failed, re-registering");
                            break;
                        }
                    }
                    msg = stream.message() => match msg {
                        Ok(Some(resp)) if resp.ttl() > 0 => {
                            debug!(key = %key, lease_id, ttl = resp.ttl(), "lease renewed");
                        }
                        Ok(Some(_)) => {
                            warn!(key = %key, lease_id, "lease expired on the store side, re-registering");
                            break;
                        }
                        Ok(None) | Err(_) => {
                            warn!(key = %key, lease_id, "keep-alive stream closed, re-registering");
                            break;
                        }
                    }
                }
            }

            if token.is_cancelled() {
                break 'session;
            }
            match Self::reregister_with_backoff(&mut client, &key, &value, ttl, &token).await {
                Some(id) => lease_id = id,
                None => break 'session,
            }
        }

        // 尽力清理：删除注册键并释放租约，各自限时
        let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, client.delete(key.clone(), None)).await;
        let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, client.lease_revoke(lease_id)).await;
        info!(key = %key, "🛑 service deregistered");
    }
}

#[async_trait]
impl Discovery for EtcdRegistry {
    async fn register(&self, service: ServiceInfo) -> Result<RegistrationHandle> {
        if service.name.is_empty() {
            return Err(DiscoveryError::MissingField("name"));
        }
        if service.addr.is_empty() {
            return Err(DiscoveryError::MissingField("addr"));
        }

        let key = self.service_key(&service.name, &service.id);
        let value = serde_json::to_string(&service)?;
        let mut client = self.client.clone();

        // 同步注册：至少一次 lease+put 成功后才返回；drop future 即取消
        let policy = ExponentialBackoffPolicy::register_default();
        let mut attempt = 0usize;
        let lease_id = loop {
            match Self::lease_and_put(&mut client, &key, &value, self.ttl).await {
                Ok(lease_id) => break lease_id,
                Err(e) => {
                    let backoff = policy.backoff_duration(attempt);
                    warn!(
                        key = %key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "initial registration failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        };
        info!(key = %key, lease_id, addr = %service.addr, "✅ service registered");

        let token = CancellationToken::new();
        let task = tokio::spawn(Self::liveness_loop(
            client,
            key,
            value,
            self.ttl,
            lease_id,
            token.clone(),
        ));
        Ok(RegistrationHandle::new(token, task))
    }

    async fn find(&self, name: &str) -> Result<Vec<ServiceInfo>> {
        let mut client = self.client.clone();
        let prefix = self.service_prefix(name);
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut services: Vec<ServiceInfo> = resp
            .kvs()
            .iter()
            .filter_map(|kv| self.decode(kv.value()))
            .collect();
        sort_services(&mut services);
        Ok(services)
    }

    async fn watch(
        &self,
        name: &str,
        token: CancellationToken,
        notify: &mut Notify,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let prefix = self.service_prefix(name);

        // 快照：读取当前全集并记录 revision
        let resp = client
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let mut endpoints: HashMap<String, ServiceInfo> = HashMap::new();
        for kv in resp.kvs() {
            if let Some(info) = self.decode(kv.value()) {
                endpoints.insert(info.id.clone(), info);
            }
        }
        notify(snapshot_of(&endpoints));

        // 从快照 revision 之后开启增量流，不漏不重
        let opts = WatchOptions::new()
            .with_prefix()
            .with_start_revision(revision + 1);
        let (mut watcher, mut stream) = client.watch(prefix.clone(), Some(opts)).await?;
        debug!(prefix = %prefix, revision, "watch stream established");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = watcher.cancel().await;
                    return Ok(());
                }
                msg = stream.message() => match msg {
                    Ok(Some(resp)) => {
                        if resp.events().is_empty() {
                            continue;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            match event.event_type() {
                                EventType::Put => match self.decode(kv.value()) {
                                    Some(info) => {
                                        endpoints.insert(info.id.clone(), info);
                                    }
                                    // 更新把条目改出过滤范围时，移除旧条目
                                    None => {
                                        if let Some(id) = id_from_key(kv.key()) {
                                            endpoints.remove(&id);
                                        }
                                    }
                                },
                                EventType::Delete => {
                                    if let Some(id) = id_from_key(kv.key()) {
                                        endpoints.remove(&id);
                                    }
                                }
                            }
                        }
                        notify(snapshot_of(&endpoints));
                    }
                    Ok(None) => {
                        return Err(DiscoveryError::WatchClosed(format!(
                            "watch stream for `{name}` ended"
                        )));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

/// 当前成员全集的排序快照
fn snapshot_of(endpoints: &HashMap<String, ServiceInfo>) -> Vec<ServiceInfo> {
    let mut list: Vec<ServiceInfo> = endpoints.values().cloned().collect();
    sort_services(&mut list);
    list
}

/// 从注册键解析实例 ID（键的末段）
fn id_from_key(key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    key.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
