//! 服务实例数据模型

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// RPC 协议标记（默认的服务种类）
pub const KIND_RPC: &str = "rpc";

/// 权重元数据键，负载均衡使用
pub const META_WEIGHT: &str = "weight";

/// 默认权重
pub const DEFAULT_WEIGHT: u32 = 100;

/// 服务实例信息
///
/// `(name, id)` 在同一命名空间前缀内全局唯一；`addr` 仅在滚动替换期间
/// 允许被多个实例短暂共用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInfo {
    /// 逻辑服务名（多个实例共享同一个名字）
    pub name: String,

    /// 实例 ID（每次注册唯一）
    pub id: String,

    /// 协议标记（如 "rpc"）
    pub kind: String,

    /// 服务地址（host:port）
    pub addr: String,

    /// 元数据（region、zone、env、weight 及自定义标签）
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInfo {
    /// 创建新的服务实例（自动生成实例 ID）
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4().to_string(),
            kind: KIND_RPC.to_string(),
            addr: addr.into(),
            metadata: HashMap::new(),
        }
    }

    /// 指定实例 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 指定协议标记
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 设置负载均衡权重
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.metadata
            .insert(META_WEIGHT.to_string(), weight.to_string());
        self
    }

    /// 负载均衡权重（取自元数据，缺省为 100）
    pub fn weight(&self) -> u32 {
        self.metadata
            .get(META_WEIGHT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WEIGHT)
    }

    /// 转换为 gRPC URI
    pub fn to_grpc_uri(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// 只读服务能力接口
///
/// 注册发现边界两侧都只依赖这组访问器，不依赖具体结构
pub trait Service {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    fn addr(&self) -> &str;
    fn metadata(&self) -> &HashMap<String, String>;
}

impl Service for ServiceInfo {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// 按 (name, id) 排序
///
/// 成员相同的两次快照排序后逐项相等，下游据此做稳定的差量比较
pub fn sort_services(services: &mut [ServiceInfo]) {
    services.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
}
