//! 注册中心工厂
//!
//! scheme → 构造函数的显式注册表（不是进程级全局状态）：按连接 URL 构造
//! 具体后端；相同规范化配置复用同一个实例，避免重复建立存储连接

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::RegistryUrl;
use crate::error::{DiscoveryError, Result};
use crate::registry::{Discovery, EtcdRegistry, MemoryRegistry, NoopRegistry};

/// 后端构造函数
pub type Constructor =
    Box<dyn Fn(RegistryUrl) -> BoxFuture<'static, Result<Arc<dyn Discovery>>> + Send + Sync>;

fn etcd_constructor(url: RegistryUrl) -> BoxFuture<'static, Result<Arc<dyn Discovery>>> {
    Box::pin(async move {
        let backend = EtcdRegistry::connect(&url).await?;
        Ok(Arc::new(backend) as Arc<dyn Discovery>)
    })
}

fn memory_constructor(url: RegistryUrl) -> BoxFuture<'static, Result<Arc<dyn Discovery>>> {
    Box::pin(async move { Ok(Arc::new(MemoryRegistry::from_url(&url)) as Arc<dyn Discovery>) })
}

fn noop_constructor(_url: RegistryUrl) -> BoxFuture<'static, Result<Arc<dyn Discovery>>> {
    Box::pin(async move { Ok(Arc::new(NoopRegistry::new()) as Arc<dyn Discovery>) })
}

/// 注册中心工厂
///
/// 重复注册 scheme 属于启动期配置错误，立即返回错误，调用方应当视为致命
pub struct RegistryFactory {
    constructors: HashMap<String, Constructor>,
    instances: Mutex<HashMap<String, Arc<dyn Discovery>>>,
}

impl RegistryFactory {
    /// 创建空工厂
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// 创建带内置后端（etcd、memory、noop）的工厂
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory
            .constructors
            .insert("etcd".to_string(), Box::new(etcd_constructor));
        factory
            .constructors
            .insert("memory".to_string(), Box::new(memory_constructor));
        factory
            .constructors
            .insert("noop".to_string(), Box::new(noop_constructor));
        factory
    }

    /// 注册后端构造函数
    ///
    /// scheme 为空或已存在时返回错误
    pub fn register_scheme<F>(&mut self, scheme: impl Into<String>, constructor: F) -> Result<()>
    where
        F: Fn(RegistryUrl) -> BoxFuture<'static, Result<Arc<dyn Discovery>>>
            + Send
            + Sync
            + 'static,
    {
        let scheme = scheme.into();
        if scheme.is_empty() {
            return Err(DiscoveryError::MissingField("scheme"));
        }
        if self.constructors.contains_key(&scheme) {
            return Err(DiscoveryError::DuplicateScheme(scheme));
        }
        self.constructors.insert(scheme, Box::new(constructor));
        Ok(())
    }

    /// 可用 scheme 列表（排序，便于错误提示）
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.constructors.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// 按连接 URL 创建（或复用）注册中心实例
    pub async fn create(&self, target: &str) -> Result<Arc<dyn Discovery>> {
        let url: RegistryUrl = target.parse()?;
        let constructor =
            self.constructors
                .get(&url.scheme)
                .ok_or_else(|| DiscoveryError::UnknownScheme {
                    scheme: url.scheme.clone(),
                    available: self.schemes().join(", "),
                })?;

        // 相同规范化配置复用实例；首次构造在工厂锁内完成
        let key = url.canonical();
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&key) {
            debug!(target = %key, "reusing existing registry instance");
            return Ok(existing.clone());
        }
        let instance = constructor(url).await?;
        instances.insert(key, instance.clone());
        Ok(instance)
    }
}

impl Default for RegistryFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}
