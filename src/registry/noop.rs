//! 空注册中心
//!
//! 只记录日志，不做任何注册发现；用于单机运行或显式禁用发现的部署形态

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::registry::{Discovery, Notify, RegistrationHandle};
use crate::types::ServiceInfo;

/// 空后端
#[derive(Debug, Default)]
pub struct NoopRegistry;

impl NoopRegistry {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Discovery for NoopRegistry {
    async fn register(&self, service: ServiceInfo) -> Result<RegistrationHandle> {
        info!(name = %service.name, id = %service.id, addr = %service.addr, "service registration skipped (noop registry)");
        let token = CancellationToken::new();
        let wait_token = token.clone();
        let task = tokio::spawn(async move {
            wait_token.cancelled().await;
        });
        Ok(RegistrationHandle::new(token, task))
    }

    async fn find(&self, _name: &str) -> Result<Vec<ServiceInfo>> {
        Ok(Vec::new())
    }

    async fn watch(
        &self,
        _name: &str,
        token: CancellationToken,
        notify: &mut Notify,
    ) -> Result<()> {
        notify(Vec::new());
        token.cancelled().await;
        Ok(())
    }
}
