//! 进程内服务注册发现后端
//!
//! 不依赖外部存储，供本地开发和测试使用；watch 语义与 etcd 后端一致：
//! 先推全量快照，之后按变化推送完整集合

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RegistryUrl;
use crate::error::{DiscoveryError, Result};
use crate::registry::{Discovery, Notify, RegistrationHandle};
use crate::types::{sort_services, ServiceInfo, KIND_RPC};

/// 变化事件缓冲（落后超过缓冲的订阅者会收到 Lagged 并由外层重新 watch）
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Event {
    Put(ServiceInfo),
    Delete { name: String, id: String },
}

type Store = Arc<RwLock<HashMap<String, HashMap<String, ServiceInfo>>>>;

/// 内存后端
#[derive(Debug)]
pub struct MemoryRegistry {
    kind: String,
    store: Store,
    events: broadcast::Sender<Event>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_kind(KIND_RPC)
    }

    pub fn with_kind(kind: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind: kind.into(),
            store: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn from_url(url: &RegistryUrl) -> Self {
        Self::with_kind(url.kind())
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for MemoryRegistry {
    async fn register(&self, service: ServiceInfo) -> Result<RegistrationHandle> {
        if service.name.is_empty() {
            return Err(DiscoveryError::MissingField("name"));
        }
        if service.addr.is_empty() {
            return Err(DiscoveryError::MissingField("addr"));
        }

        {
            let mut store = self.store.write().await;
            store
                .entry(service.name.clone())
                .or_default()
                .insert(service.id.clone(), service.clone());
        }
        let _ = self.events.send(Event::Put(service.clone()));
        info!(name = %service.name, id = %service.id, addr = %service.addr, "service registered (memory)");

        // 没有租约要维持，存活任务只负责在取消时注销
        let token = CancellationToken::new();
        let store = self.store.clone();
        let events = self.events.clone();
        let cleanup_token = token.clone();
        let task = tokio::spawn(async move {
            cleanup_token.cancelled().await;
            let removed = {
                let mut store = store.write().await;
                store
                    .get_mut(&service.name)
                    .and_then(|entries| entries.remove(&service.id))
                    .is_some()
            };
            if removed {
                let _ = events.send(Event::Delete {
                    name: service.name.clone(),
                    id: service.id.clone(),
                });
                info!(name = %service.name, id = %service.id, "service deregistered (memory)");
            }
        });

        Ok(RegistrationHandle::new(token, task))
    }

    async fn find(&self, name: &str) -> Result<Vec<ServiceInfo>> {
        let store = self.store.read().await;
        let mut services: Vec<ServiceInfo> = store
            .get(name)
            .map(|entries| {
                entries
                    .values()
                    .filter(|info| info.kind == self.kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_services(&mut services);
        Ok(services)
    }

    async fn watch(
        &self,
        name: &str,
        token: CancellationToken,
        notify: &mut Notify,
    ) -> Result<()> {
        // 先订阅再读快照，避免中间的变化丢失；重复事件幂等
        let mut rx = self.events.subscribe();

        let mut endpoints: HashMap<String, ServiceInfo> = {
            let store = self.store.read().await;
            store
                .get(name)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|(_, info)| info.kind == self.kind)
                        .map(|(id, info)| (id.clone(), info.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        notify(snapshot_of(&endpoints));

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = rx.recv() => match event {
                    Ok(Event::Put(info)) if info.name == name => {
                        if info.kind == self.kind {
                            endpoints.insert(info.id.clone(), info);
                        } else {
                            endpoints.remove(&info.id);
                        }
                        notify(snapshot_of(&endpoints));
                    }
                    Ok(Event::Delete { name: event_name, id }) if event_name == name => {
                        endpoints.remove(&id);
                        notify(snapshot_of(&endpoints));
                    }
                    // 其他服务名的事件
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Err(DiscoveryError::WatchClosed(format!(
                            "memory watch lagged by {skipped} events"
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(DiscoveryError::WatchClosed(
                            "memory event channel closed".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

fn snapshot_of(endpoints: &HashMap<String, ServiceInfo>) -> Vec<ServiceInfo> {
    let mut list: Vec<ServiceInfo> = endpoints.values().cloned().collect();
    sort_services(&mut list);
    list
}
