//! 负载均衡模块
//!
//! 提供多种负载均衡策略，用于从多个服务实例中选择一个

use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::types::ServiceInfo;

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    /// 轮询（Round Robin）
    #[default]
    RoundRobin,
    /// 随机（Random）
    Random,
    /// 加权轮询（Weighted Round Robin）：权重取自实例元数据，默认 100
    WeightedRoundRobin,
    /// 最少连接（Least Connections）：按在途请求数选择
    LeastConnections,
}

impl std::str::FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace("-", "_").as_str() {
            "round_robin" | "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
            "random" => Ok(LoadBalanceStrategy::Random),
            "weighted_round_robin" | "weightedroundrobin" => {
                Ok(LoadBalanceStrategy::WeightedRoundRobin)
            }
            "least_connections" | "leastconnections" | "least_conn" => {
                Ok(LoadBalanceStrategy::LeastConnections)
            }
            _ => Err(format!("Unknown load balance strategy: {}", s)),
        }
    }
}

/// 负载均衡器
pub struct LoadBalancer {
    strategy: LoadBalanceStrategy,
    round_robin_index: AtomicUsize,
    /// 加权轮询的当前有效权重（实例 ID → 累计值）
    current_weights: RwLock<HashMap<String, i64>>,
    /// 在途请求计数（实例 ID → 数量）
    inflight: RwLock<HashMap<String, usize>>,
}

impl LoadBalancer {
    /// 创建新的负载均衡器
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            round_robin_index: AtomicUsize::new(0),
            current_weights: RwLock::new(HashMap::new()),
            inflight: RwLock::new(HashMap::new()),
        }
    }

    /// 从实例集合中选择一个
    ///
    /// 集合为空时返回 None；集合要求已排序，使轮询在稳定集合上可预测。
    /// 成员变化会使轮询的有效相位偏移，不保证跨变化的严格公平
    pub async fn select(&self, services: &[ServiceInfo]) -> Option<ServiceInfo> {
        if services.is_empty() {
            return None;
        }

        match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(services),
            LoadBalanceStrategy::Random => self.select_random(services),
            LoadBalanceStrategy::WeightedRoundRobin => self.select_weighted(services).await,
            LoadBalanceStrategy::LeastConnections => {
                self.select_least_connections(services).await
            }
        }
    }

    /// 轮询选择：单调递增下标对当前实例数取模
    fn select_round_robin(&self, services: &[ServiceInfo]) -> Option<ServiceInfo> {
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        services.get(index % services.len()).cloned()
    }

    /// 随机选择（均匀分布）
    fn select_random(&self, services: &[ServiceInfo]) -> Option<ServiceInfo> {
        let index = rand::thread_rng().gen_range(0..services.len());
        services.get(index).cloned()
    }

    /// 加权轮询：为每个实例累加权重，取当前有效权重最高者并扣减总权重
    async fn select_weighted(&self, services: &[ServiceInfo]) -> Option<ServiceInfo> {
        let mut weights = self.current_weights.write().await;
        // 清掉已离场实例的状态
        weights.retain(|id, _| services.iter().any(|s| &s.id == id));

        let total: i64 = services.iter().map(|s| s.weight() as i64).sum();
        let mut best: Option<usize> = None;
        let mut best_weight = i64::MIN;
        for (index, service) in services.iter().enumerate() {
            let current = weights.entry(service.id.clone()).or_insert(0);
            *current += service.weight() as i64;
            if *current > best_weight {
                best_weight = *current;
                best = Some(index);
            }
        }

        let chosen = services.get(best?)?.clone();
        if let Some(weight) = weights.get_mut(&chosen.id) {
            *weight -= total;
        }
        Some(chosen)
    }

    /// 最少连接：取在途请求数最小的实例
    async fn select_least_connections(&self, services: &[ServiceInfo]) -> Option<ServiceInfo> {
        let counts = self.inflight.read().await;
        services
            .iter()
            .min_by_key(|service| counts.get(&service.id).copied().unwrap_or(0))
            .cloned()
    }

    /// 增加在途请求数（调用开始时）
    pub async fn acquire(&self, service_id: &str) {
        let mut counts = self.inflight.write().await;
        *counts.entry(service_id.to_string()).or_insert(0) += 1;
    }

    /// 减少在途请求数（调用结束时，无论成败）
    pub async fn release(&self, service_id: &str) {
        let mut counts = self.inflight.write().await;
        if let Some(count) = counts.get_mut(service_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(service_id);
            }
        }
    }

    /// 当前在途请求数（观测用）
    pub async fn inflight(&self, service_id: &str) -> usize {
        let counts = self.inflight.read().await;
        counts.get(service_id).copied().unwrap_or(0)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalanceStrategy::RoundRobin)
    }
}
