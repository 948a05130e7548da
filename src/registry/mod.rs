//! 服务注册发现
//!
//! 定义统一的 Discovery 契约，以及 etcd（canonical）、memory、noop 三种后端

pub mod etcd;
pub mod factory;
pub mod memory;
pub mod noop;
pub mod supervisor;

pub use etcd::EtcdRegistry;
pub use factory::RegistryFactory;
pub use memory::MemoryRegistry;
pub use noop::NoopRegistry;
pub use supervisor::WatchSupervisor;

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::ServiceInfo;

/// watch 回调：每次成员变化收到完整的、已排序的实例集合，而不是增量
pub type Notify = dyn FnMut(Vec<ServiceInfo>) + Send;

/// 服务注册发现契约
///
/// 所有后端实现同一组语义；取消遵循 Rust 惯例：`register` 的初始重试
/// 通过 drop future 取消，`watch` 通过传入的 token 取消
#[async_trait]
pub trait Discovery: Send + Sync + std::fmt::Debug {
    /// 注册服务实例
    ///
    /// 至少一次写入成功后才返回；存储不可用时内部按指数退避重试。
    /// 成功后台维持存活（租约续期），断流时透明重注册
    async fn register(&self, service: ServiceInfo) -> Result<RegistrationHandle>;

    /// 点查询：返回该服务名下当前全部实例（已按 (name, id) 排序）
    async fn find(&self, name: &str) -> Result<Vec<ServiceInfo>>;

    /// 阻塞监听
    ///
    /// 先推送一次全量快照，之后每个变化批次推送最新全量集合。token 取消
    /// 时返回 Ok(())；流异常关闭时返回错误，不在内部重试 —— 重试策略由
    /// 调用方（通常是 [`WatchSupervisor`]）决定
    async fn watch(
        &self,
        name: &str,
        token: CancellationToken,
        notify: &mut Notify,
    ) -> Result<()>;
}

/// 注册句柄
///
/// 持有存活循环的取消令牌；取消后循环停止续期、尽力删除注册键并释放
/// 租约。Drop 时自动取消，清理在后台完成
pub struct RegistrationHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RegistrationHandle {
    pub(crate) fn new(token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            token,
            task: Some(task),
        }
    }

    /// 停止存活循环（不等待清理完成）
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 优雅注销：停止循环并限时等待键删除、租约释放
    pub async fn deregister(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
