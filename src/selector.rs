//! 标签选择器
//!
//! Kubernetes 风格的标签匹配引擎，按元数据从实例集合中筛选目标实例

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::types::ServiceInfo;

/// 地域标签键
pub const LABEL_REGION: &str = "region";
/// 可用区标签键
pub const LABEL_ZONE: &str = "zone";
/// 园区标签键
pub const LABEL_CAMPUS: &str = "campus";
/// 环境标签键
pub const LABEL_ENV: &str = "env";

/// 表达式操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    NotExists,
}

/// 匹配表达式：标签键 + 操作符 + 值集合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: Operator, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    /// 精确等于（单值）
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, Operator::Equals, vec![value.into()])
    }

    /// 精确不等于（单值）
    pub fn not_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, Operator::NotEquals, vec![value.into()])
    }

    /// 值在集合内
    pub fn is_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            key,
            Operator::In,
            values.into_iter().map(Into::into).collect(),
        )
    }

    /// 值不在集合内
    pub fn not_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            key,
            Operator::NotIn,
            values.into_iter().map(Into::into).collect(),
        )
    }

    /// 标签存在（忽略值）
    pub fn exists(key: impl Into<String>) -> Self {
        Self::new(key, Operator::Exists, Vec::new())
    }

    /// 标签不存在（忽略值）
    pub fn not_exists(key: impl Into<String>) -> Self {
        Self::new(key, Operator::NotExists, Vec::new())
    }

    /// 单条表达式是否满足
    ///
    /// equals/not-equals 要求恰好一个比较值；缺失的标签永远不满足 in，
    /// 永远满足 not-in
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match self.operator {
            Operator::Equals => self.values.len() == 1 && actual == self.values.first(),
            Operator::NotEquals => self.values.len() == 1 && actual != self.values.first(),
            Operator::In => actual.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotIn => actual.map(|v| !self.values.contains(v)).unwrap_or(true),
            Operator::Exists => actual.is_some(),
            Operator::NotExists => actual.is_none(),
        }
    }
}

/// 标签选择器
///
/// match_labels 全部精确成立且 match_expressions 全部满足才算匹配；
/// 没有任何条件的选择器匹配一切
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加精确匹配标签
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// 添加匹配表达式
    pub fn with_expression(mut self, requirement: Requirement) -> Self {
        self.match_expressions.push(requirement);
        self
    }

    /// 地域维度过滤（展开为 in 表达式）
    pub fn region_in<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_expression(Requirement::is_in(LABEL_REGION, values))
    }

    /// 可用区维度过滤
    pub fn zone_in<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_expression(Requirement::is_in(LABEL_ZONE, values))
    }

    /// 园区维度过滤
    pub fn campus_in<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_expression(Requirement::is_in(LABEL_CAMPUS, values))
    }

    /// 环境维度过滤
    pub fn env_in<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_expression(Requirement::is_in(LABEL_ENV, values))
    }

    /// 是否没有任何条件
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// 是否匹配给定标签集合
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }

    /// 过滤实例集合
    ///
    /// 过滤结果为空时回退为返回未过滤的全集（fail open），避免过度收紧
    /// 的过滤条件造成整个服务不可用
    pub fn filter(&self, instances: &[ServiceInfo]) -> Vec<ServiceInfo> {
        if self.is_empty() {
            return instances.to_vec();
        }

        let matched: Vec<ServiceInfo> = instances
            .iter()
            .filter(|instance| self.matches(&instance.metadata))
            .cloned()
            .collect();

        if matched.is_empty() && !instances.is_empty() {
            warn!(
                total = instances.len(),
                selector = ?self,
                "label selector matched no instances, falling back to the unfiltered set"
            );
            return instances.to_vec();
        }

        matched
    }
}
