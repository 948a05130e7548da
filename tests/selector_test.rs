//! 标签选择器测试

use beacon_core::selector::{LabelSelector, Operator, Requirement};
use beacon_core::types::ServiceInfo;
use std::collections::HashMap;

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn instance(id: &str, pairs: &[(&str, &str)]) -> ServiceInfo {
    let mut info = ServiceInfo::new("test-service", format!("127.0.0.1:80{id}")).with_id(id);
    for (k, v) in pairs {
        info = info.with_metadata(*k, *v);
    }
    info
}

/// 测试：region in 表达式匹配
#[test]
fn test_region_in_matches() {
    let selector = LabelSelector::new().region_in(["us-west-1", "us-east-1"]);
    assert!(selector.matches(&labels(&[("region", "us-west-1")])));
}

/// 测试：region notin 不匹配集合内的值
#[test]
fn test_region_not_in_does_not_match() {
    let selector =
        LabelSelector::new().with_expression(Requirement::not_in("region", ["us-west-1"]));
    assert!(!selector.matches(&labels(&[("region", "us-west-1")])));
}

/// 测试：exists 对缺失标签不满足，not-exists 对缺失标签满足
#[test]
fn test_exists_and_not_exists() {
    let no_canary = labels(&[("region", "us-west-1")]);

    let exists = LabelSelector::new().with_expression(Requirement::exists("canary"));
    assert!(!exists.matches(&no_canary));

    let not_exists = LabelSelector::new().with_expression(Requirement::not_exists("canary"));
    assert!(not_exists.matches(&no_canary));
}

/// 测试：缺失的标签永不满足 in，总是满足 not-in
#[test]
fn test_absent_label_set_membership() {
    let empty = labels(&[]);

    let is_in = LabelSelector::new()
        .with_expression(Requirement::is_in("region", ["us-west-1", "us-east-1"]));
    assert!(!is_in.matches(&empty));

    let not_in = LabelSelector::new()
        .with_expression(Requirement::not_in("region", ["us-west-1", "us-east-1"]));
    assert!(not_in.matches(&empty));
}

/// 测试：equals / not-equals 语义
#[test]
fn test_equals_and_not_equals() {
    let prod = labels(&[("env", "prod")]);
    let dev = labels(&[("env", "dev")]);

    let equals = LabelSelector::new().with_expression(Requirement::equals("env", "prod"));
    assert!(equals.matches(&prod));
    assert!(!equals.matches(&dev));

    let not_equals = LabelSelector::new().with_expression(Requirement::not_equals("env", "prod"));
    assert!(!not_equals.matches(&prod));
    assert!(not_equals.matches(&dev));
    // 缺失的标签满足 not-equals
    assert!(not_equals.matches(&labels(&[])));
}

/// 测试：equals 要求恰好一个比较值，多值视为不满足
#[test]
fn test_equals_requires_exactly_one_value() {
    let selector = LabelSelector::new().with_expression(Requirement::new(
        "env",
        Operator::Equals,
        vec!["prod".to_string(), "dev".to_string()],
    ));
    assert!(!selector.matches(&labels(&[("env", "prod")])));
}

/// 测试：没有任何条件的选择器匹配一切
#[test]
fn test_empty_selector_matches_everything() {
    let selector = LabelSelector::new();
    assert!(selector.matches(&labels(&[])));
    assert!(selector.matches(&labels(&[("env", "prod")])));

    let instances = vec![instance("01", &[]), instance("02", &[("env", "prod")])];
    assert_eq!(selector.filter(&instances).len(), 2);
}

/// 测试：match_labels 全部成立才匹配
#[test]
fn test_match_labels_conjunction() {
    let selector = LabelSelector::new()
        .with_label("env", "prod")
        .with_label("region", "cn-north");

    assert!(selector.matches(&labels(&[("env", "prod"), ("region", "cn-north")])));
    assert!(!selector.matches(&labels(&[("env", "prod"), ("region", "cn-south")])));
    assert!(!selector.matches(&labels(&[("env", "prod")])));
}

/// 测试：过滤命中子集
#[test]
fn test_filter_returns_matching_subset() {
    let instances = vec![
        instance("01", &[("env", "prod")]),
        instance("02", &[("env", "dev")]),
        instance("03", &[("env", "prod")]),
    ];
    let selector = LabelSelector::new().with_label("env", "prod");

    let filtered = selector.filter(&instances);
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|i| i.metadata["env"] == "prod"));
}

/// 测试：过滤结果为空时回退为未过滤的全集（fail open）
#[test]
fn test_filter_fails_open_on_empty_result() {
    let instances = vec![
        instance("01", &[("env", "dev")]),
        instance("02", &[("env", "dev")]),
    ];
    let selector = LabelSelector::new().with_label("env", "prod");

    let filtered = selector.filter(&instances);
    assert_eq!(filtered.len(), 2, "fail-open should return the original set");
}

/// 测试：空输入过滤后仍为空（fail open 只对非空输入生效）
#[test]
fn test_filter_empty_input_stays_empty() {
    let selector = LabelSelector::new().with_label("env", "prod");
    assert!(selector.filter(&[]).is_empty());
}
