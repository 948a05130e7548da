//! gRPC 客户端模块
//!
//! 客户端工厂：按服务名缓存连接管理器，相同服务名共享同一个实例

pub mod balance;
pub mod manager;

pub use balance::{LoadBalanceStrategy, LoadBalancer};
pub use manager::{ClientManager, ClientOptions, ClientStats, FailoverConfig};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::registry::Discovery;

/// 客户端工厂
///
/// 每个服务名只构造一个 [`ClientManager`]（工厂锁内双检），重复获取
/// 共享同一实例
pub struct ClientFactory {
    discovery: Arc<dyn Discovery>,
    defaults: ClientOptions,
    clients: Mutex<HashMap<String, Arc<ClientManager>>>,
}

impl ClientFactory {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self::with_options(discovery, ClientOptions::default())
    }

    /// 指定默认客户端选项
    pub fn with_options(discovery: Arc<dyn Discovery>, defaults: ClientOptions) -> Self {
        Self {
            discovery,
            defaults,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// 获取（或创建）目标服务的客户端管理器
    pub async fn get_client(&self, name: &str) -> Result<Arc<ClientManager>> {
        self.get_client_with(name, self.defaults.clone()).await
    }

    /// 以指定选项获取客户端管理器
    ///
    /// 已存在的实例直接复用，本次传入的选项不生效
    pub async fn get_client_with(
        &self,
        name: &str,
        opts: ClientOptions,
    ) -> Result<Arc<ClientManager>> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(name) {
            debug!(service = name, "reusing cached client manager");
            return Ok(existing.clone());
        }
        let manager = Arc::new(ClientManager::new(self.discovery.clone(), name, opts).await?);
        clients.insert(name.to_string(), manager.clone());
        Ok(manager)
    }

    /// 移除并停止某个服务的客户端管理器
    pub async fn remove(&self, name: &str) {
        if let Some(manager) = self.clients.lock().await.remove(name) {
            manager.shutdown().await;
        }
    }
}
