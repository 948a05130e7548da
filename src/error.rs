//! 统一错误类型
//!
//! 瞬时存储错误在注册流程内部重试，watch/find 的瞬时错误交由调用方重试；
//! 配置类错误立即失败，不做重试

use thiserror::Error;

/// 盒装错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 注册发现与客户端连接管理的统一错误
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// 配置错误：连接 URL 不合法
    #[error("invalid registry target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    /// 配置错误：未注册的后端 scheme
    #[error("unknown registry scheme `{scheme}`, available schemes: [{available}]")]
    UnknownScheme { scheme: String, available: String },

    /// 配置错误：scheme 重复注册（启动期致命错误）
    #[error("registry scheme `{0}` already registered")]
    DuplicateScheme(String),

    /// 配置错误：必填字段缺失
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// 存储访问失败（瞬时，可重试）
    #[error("store error: {0}")]
    Store(#[from] etcd_client::Error),

    /// watch 流异常关闭（瞬时，可重试）
    #[error("watch stream closed: {0}")]
    WatchClosed(String),

    /// 注册条目反序列化失败
    #[error("decode service info: {0}")]
    Decode(#[from] serde_json::Error),

    /// 当前没有可用实例（区别于后端不可达，调用方可采用不同的兜底策略）
    #[error("no instances available for service `{0}`")]
    NoInstances(String),

    /// 传输层错误
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// 故障转移重试耗尽，携带尝试次数与最后一个错误
    #[error("call failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: BoxError,
    },

    /// 单次调用失败，错误原样传出
    #[error("{0}")]
    Call(BoxError),
}

impl DiscoveryError {
    /// 是否为瞬时错误（可重试）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::WatchClosed(_) | Self::Transport(_)
        )
    }
}

/// 统一结果类型
pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
