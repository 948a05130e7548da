//! 注册中心连接配置
//!
//! 连接 URL 形如 `scheme://host[,host...][/namespace][?key=value&...]`：
//! scheme 通过工厂选择后端；path/query 携带后端参数（命名空间、凭据、TTL）
//! 与标签过滤提示。逗号分隔的多主机不是合法的 RFC URL，这里手工解析

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::DiscoveryError;
use crate::selector::LabelSelector;
use crate::types::KIND_RPC;

/// 默认命名空间
pub const DEFAULT_NAMESPACE: &str = "beacon";

/// 默认租约 TTL（秒）
pub const DEFAULT_TTL_SECONDS: u64 = 30;

/// 保留的查询参数：作为后端配置消费，不透传为标签过滤提示
const RESERVED_PARAMS: &[&str] = &["namespace", "ttl", "kind", "user", "password"];

/// 已解析的注册中心连接 URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryUrl {
    /// 后端 scheme（etcd、memory、noop ...）
    pub scheme: String,

    /// 后端端点列表（host:port）
    pub endpoints: Vec<String>,

    /// 注册键命名空间（path 优先于 `namespace` 参数）
    pub namespace: String,

    /// 查询参数（BTreeMap 保证规范化形式稳定）
    params: BTreeMap<String, String>,
}

impl RegistryUrl {
    /// 查询参数
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// 租约 TTL（秒）
    pub fn ttl(&self) -> u64 {
        self.param("ttl")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECONDS)
    }

    /// 协议标记过滤（混用命名空间时的防御性过滤依据）
    pub fn kind(&self) -> &str {
        self.param("kind").unwrap_or(KIND_RPC)
    }

    /// 后端认证用户名
    pub fn user(&self) -> Option<&str> {
        self.param("user")
    }

    /// 后端认证密码
    pub fn password(&self) -> Option<&str> {
        self.param("password")
    }

    /// 规范化配置串（端点与参数排序）
    ///
    /// 工厂按这个键复用后端实例，等价配置不会重复建立存储连接
    pub fn canonical(&self) -> String {
        let mut endpoints = self.endpoints.clone();
        endpoints.sort();
        let params: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!(
            "{}://{}/{}?{}",
            self.scheme,
            endpoints.join(","),
            self.namespace,
            params.join("&")
        )
    }

    /// URL 中的标签过滤提示
    ///
    /// 非保留查询参数一律作为精确匹配标签透传（env=、region=、任意 key=value）
    pub fn selector_hints(&self) -> LabelSelector {
        let mut selector = LabelSelector::new();
        for (key, value) in &self.params {
            if !RESERVED_PARAMS.contains(&key.as_str()) {
                selector = selector.with_label(key.clone(), value.clone());
            }
        }
        selector
    }
}

impl FromStr for RegistryUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DiscoveryError::InvalidTarget {
            target: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing `://`"))?;
        if scheme.is_empty() {
            return Err(invalid("empty scheme"));
        }

        let (main, query) = match rest.split_once('?') {
            Some((main, query)) => (main, Some(query)),
            None => (rest, None),
        };
        let (hosts, path) = match main.split_once('/') {
            Some((hosts, path)) => (hosts, Some(path)),
            None => (main, None),
        };

        let endpoints: Vec<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(String::from)
            .collect();
        if endpoints.is_empty() {
            return Err(invalid("no endpoints"));
        }

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| invalid("malformed query pair, expected key=value"))?;
                params.insert(key.to_string(), value.to_string());
            }
        }

        let namespace = path
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .or_else(|| params.get("namespace").cloned())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Ok(Self {
            scheme: scheme.to_string(),
            endpoints,
            namespace,
            params,
        })
    }
}
