//! Rule-chain interpreter.
//!
//! Walks a parsed chain's nodes in their precomputed order, evaluating
//! filters, applying transforms, and emitting action records. The walk is
//! bounded by the caller's deadline: an expired deadline aborts the chain
//! with a timeout status, but any actions already emitted stay in the
//! result.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use aemos_core::duration::parse_duration_ms;
use aemos_core::Deadline;

use crate::chain::{ParsedChain, ParsedNode};
use crate::error::RuleError;
use crate::expr::{
    ActionCommand, FilterExpr, GroupOp, LeafExpr, NodeConfig, Operator, TransformExpr,
};
use crate::scope::DataScope;

/// Outcome of one filter node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub node_id: i64,
    pub name: String,
    pub passed: bool,
}

/// Outcome of one transform node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformResult {
    pub node_id: i64,
    pub name: String,
    pub key: String,
    pub applied: bool,
}

/// An action emitted by the chain. Device-state effects happen downstream;
/// the interpreter itself performs no I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub rule_chain_id: i64,
    pub node_id: i64,
    pub command: ActionCommand,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub notification_sent: bool,
}

/// Per-node-kind results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResults {
    pub filters: Vec<FilterResult>,
    pub transformations: Vec<TransformResult>,
    pub actions: Vec<ActionRecord>,
}

/// Counters summarizing one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_nodes: usize,
    pub filters_passed: bool,
    pub transformations_applied: usize,
    pub actions_executed: usize,
}

/// Walk details: which nodes ran and the final data scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetails {
    pub executed_nodes: Vec<String>,
    pub final_data: DataScope,
}

/// Full result of one chain execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecution {
    pub rule_chain_id: i64,
    pub name: String,
    /// `success` or `error`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub summary: ExecutionSummary,
    pub node_results: NodeResults,
    pub execution_details: ExecutionDetails,
}

impl ChainExecution {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }
}

/// Execute a parsed chain against a data scope.
pub fn execute(parsed: &ParsedChain, scope: DataScope, deadline: Deadline) -> ChainExecution {
    let mut results = NodeResults::default();
    let mut executed_nodes = Vec::new();
    let mut filters_passed = true;
    let mut transformations_applied = 0usize;
    let mut current = scope;
    let now = Utc::now();

    let finish = |status: &str,
                  error: Option<String>,
                  error_code: Option<String>,
                  filters_passed: bool,
                  transformations_applied: usize,
                  results: NodeResults,
                  executed_nodes: Vec<String>,
                  final_data: DataScope| {
        ChainExecution {
            rule_chain_id: parsed.chain.id,
            name: parsed.chain.name.clone(),
            status: status.to_string(),
            error,
            error_code,
            summary: ExecutionSummary {
                total_nodes: parsed.total_nodes,
                filters_passed,
                transformations_applied,
                actions_executed: results.actions.len(),
            },
            node_results: results,
            execution_details: ExecutionDetails {
                executed_nodes,
                final_data,
            },
        }
    };

    for node in &parsed.nodes {
        if deadline.expired() {
            tracing::warn!(
                rule_chain_id = parsed.chain.id,
                node = %node.name,
                "chain execution hit its deadline"
            );
            return finish(
                "error",
                Some(format!("deadline exceeded before node {}", node.name)),
                Some("RULE_CHAIN_TIMEOUT".to_string()),
                filters_passed,
                transformations_applied,
                results,
                executed_nodes,
                current,
            );
        }

        executed_nodes.push(node.name.clone());
        match &node.config {
            NodeConfig::Filter(expr) => match eval_expr(expr, &current, now) {
                Ok(passed) => {
                    results.filters.push(FilterResult {
                        node_id: node.id,
                        name: node.name.clone(),
                        passed,
                    });
                    if !passed {
                        // Short-circuit: skip the rest of the chain.
                        filters_passed = false;
                        return finish(
                            "success",
                            None,
                            None,
                            filters_passed,
                            transformations_applied,
                            results,
                            executed_nodes,
                            current,
                        );
                    }
                }
                Err(e) => {
                    return finish(
                        "error",
                        Some(e.to_string()),
                        Some("RULE_EVAL_ERROR".to_string()),
                        filters_passed,
                        transformations_applied,
                        results,
                        executed_nodes,
                        current,
                    );
                }
            },
            NodeConfig::Transform(transform) => {
                let (next, applied) = apply_transform(transform, &current);
                current = next;
                if applied {
                    transformations_applied += 1;
                }
                results.transformations.push(TransformResult {
                    node_id: node.id,
                    name: node.name.clone(),
                    key: transform.key.clone(),
                    applied,
                });
            }
            NodeConfig::Action(action) => {
                if let Err(e) = validate_action(node, action) {
                    return finish(
                        "error",
                        Some(e.to_string()),
                        Some("RULE_EVAL_ERROR".to_string()),
                        filters_passed,
                        transformations_applied,
                        results,
                        executed_nodes,
                        current,
                    );
                }
                results.actions.push(ActionRecord {
                    rule_chain_id: parsed.chain.id,
                    node_id: node.id,
                    command: action.command.clone(),
                    timestamp: Utc::now(),
                    status: "success".to_string(),
                    notification_sent: false,
                });
            }
        }
    }

    finish(
        "success",
        None,
        None,
        filters_passed,
        transformations_applied,
        results,
        executed_nodes,
        current,
    )
}

fn validate_action(node: &ParsedNode, action: &crate::expr::ActionExpr) -> Result<(), RuleError> {
    let cmd = &action.command;
    if cmd.device_uuid.is_empty() || cmd.state_name.is_empty() || cmd.value.is_null() {
        return Err(RuleError::Eval(format!(
            "action node {} is missing deviceUuid, stateName, or value",
            node.name
        )));
    }
    Ok(())
}

/// Evaluate a filter tree. AND is all-true, OR is any-true. Errors (unknown
/// operator, invalid regex, forbidden operand type) propagate and fail the
/// chain.
pub fn eval_expr(
    expr: &FilterExpr,
    scope: &DataScope,
    now: DateTime<Utc>,
) -> Result<bool, RuleError> {
    match expr {
        FilterExpr::Leaf(leaf) => eval_leaf(leaf, scope, now),
        FilterExpr::Group(group) => match group.op {
            GroupOp::And => {
                for sub in &group.expressions {
                    if !eval_expr(sub, scope, now)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            GroupOp::Or => {
                for sub in &group.expressions {
                    if eval_expr(sub, scope, now)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        },
    }
}

fn eval_leaf(leaf: &LeafExpr, scope: &DataScope, now: DateTime<Utc>) -> Result<bool, RuleError> {
    if let Operator::Unknown(name) = &leaf.operator {
        return Err(RuleError::Eval(format!("unknown operator: {name}")));
    }

    let entry = scope.get(leaf.source_type, &leaf.uuid, &leaf.key);

    // The null/empty family is defined on absence.
    match leaf.operator {
        Operator::IsNull => return Ok(entry.map_or(true, |e| e.value.is_null())),
        Operator::IsNotNull => return Ok(entry.is_some_and(|e| !e.value.is_null())),
        Operator::IsEmpty => return Ok(entry.map_or(true, |e| is_empty(&e.value))),
        Operator::IsNotEmpty => return Ok(entry.is_some_and(|e| !is_empty(&e.value))),
        _ => {}
    }

    // Everything else is false when the UUID or key is absent.
    let Some(entry) = entry else {
        return Ok(false);
    };
    if entry.value.is_null() {
        return Ok(false);
    }
    let source = &entry.value;

    match &leaf.operator {
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let (Some(lhs), Some(rhs)) = (
                as_f64(source),
                leaf.value.as_ref().and_then(as_f64),
            ) else {
                return Ok(false);
            };
            Ok(match leaf.operator {
                Operator::Gt => lhs > rhs,
                Operator::Gte => lhs >= rhs,
                Operator::Lt => lhs < rhs,
                Operator::Lte => lhs <= rhs,
                _ => unreachable!(),
            })
        }
        Operator::Eq => Ok(leaf.value.as_ref().is_some_and(|v| loose_eq(source, v))),
        Operator::Ne => Ok(leaf.value.as_ref().is_some_and(|v| !loose_eq(source, v))),
        Operator::Between => {
            let bounds = leaf
                .value
                .as_ref()
                .and_then(Value::as_array)
                .filter(|a| a.len() == 2)
                .ok_or_else(|| {
                    RuleError::Eval("between requires a two-element array value".to_string())
                })?;
            let (Some(lo), Some(hi)) = (as_f64(&bounds[0]), as_f64(&bounds[1])) else {
                return Err(RuleError::Eval(
                    "between requires numeric bounds".to_string(),
                ));
            };
            Ok(as_f64(source).is_some_and(|v| v >= lo && v <= hi))
        }
        Operator::Contains | Operator::NotContains => {
            let Some(needle) = leaf.value.as_ref() else {
                return Ok(false);
            };
            let contained = match source {
                Value::String(s) => s.contains(&value_to_string(needle)),
                Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
                _ => false,
            };
            Ok(if leaf.operator == Operator::Contains {
                contained
            } else {
                !contained
            })
        }
        Operator::StartsWith => Ok(leaf
            .value
            .as_ref()
            .is_some_and(|v| value_to_string(source).starts_with(&value_to_string(v)))),
        Operator::EndsWith => Ok(leaf
            .value
            .as_ref()
            .is_some_and(|v| value_to_string(source).ends_with(&value_to_string(v)))),
        Operator::Matches => {
            let pattern = leaf
                .value
                .as_ref()
                .and_then(Value::as_str)
                .ok_or_else(|| RuleError::Eval("matches requires a string pattern".to_string()))?;
            let re = Regex::new(pattern)
                .map_err(|e| RuleError::Eval(format!("invalid regex {pattern:?}: {e}")))?;
            Ok(re.is_match(&value_to_string(source)))
        }
        Operator::In | Operator::NotIn => {
            let haystack = leaf
                .value
                .as_ref()
                .and_then(Value::as_array)
                .ok_or_else(|| RuleError::Eval("in/notIn require an array value".to_string()))?;
            let found = haystack.iter().any(|item| loose_eq(source, item));
            Ok(if leaf.operator == Operator::In {
                found
            } else {
                !found
            })
        }
        Operator::HasAll | Operator::HasAny | Operator::HasNone => {
            let wanted = leaf.value.as_ref().and_then(Value::as_array).ok_or_else(|| {
                RuleError::Eval("hasAll/hasAny/hasNone require an array value".to_string())
            })?;
            let Value::Array(items) = source else {
                return Ok(false);
            };
            let has = |w: &Value| items.iter().any(|item| loose_eq(item, w));
            Ok(match leaf.operator {
                Operator::HasAll => wanted.iter().all(has),
                Operator::HasAny => wanted.iter().any(has),
                Operator::HasNone => !wanted.iter().any(has),
                _ => unreachable!(),
            })
        }
        Operator::IsNumber => Ok(source.is_number()),
        Operator::IsString => Ok(source.is_string()),
        Operator::IsBoolean => Ok(source.is_boolean()),
        Operator::IsArray => Ok(source.is_array()),
        Operator::OlderThan | Operator::NewerThan | Operator::InLast => {
            Ok(eval_age(leaf, entry.timestamp, now))
        }
        Operator::ValueOlderThan | Operator::ValueNewerThan | Operator::ValueInLast => {
            // Guarded by value equality with the current source value.
            let matches_value = leaf.value.as_ref().is_some_and(|v| loose_eq(source, v));
            Ok(matches_value && eval_age(leaf, entry.timestamp, now))
        }
        Operator::IsNull
        | Operator::IsNotNull
        | Operator::IsEmpty
        | Operator::IsNotEmpty
        | Operator::Unknown(_) => unreachable!("handled above"),
    }
}

fn eval_age(leaf: &LeafExpr, timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let Some(ts) = timestamp else {
        return false;
    };
    let duration_ms = leaf
        .duration
        .as_deref()
        .map(parse_duration_ms)
        .unwrap_or(0) as i64;
    let age_ms = (now - ts).num_milliseconds().max(0);
    match leaf.operator {
        Operator::OlderThan | Operator::ValueOlderThan => age_ms > duration_ms,
        Operator::NewerThan | Operator::ValueNewerThan => age_ms < duration_ms,
        Operator::InLast | Operator::ValueInLast => age_ms <= duration_ms,
        _ => false,
    }
}

fn apply_transform(transform: &TransformExpr, scope: &DataScope) -> (DataScope, bool) {
    let mut next = scope.clone();
    let mut applied = false;
    for family in [&mut next.sensors, &mut next.devices] {
        for values in family.values_mut() {
            if let Some(entry) = values.get_mut(&transform.key) {
                if let Some(current) = as_f64(&entry.value) {
                    if let Some(result) = transform.operation.apply(current, transform.operand) {
                        entry.value = serde_json::Number::from_f64(result)
                            .map(Value::Number)
                            .unwrap_or(entry.value.clone());
                        applied = true;
                    }
                }
            }
        }
    }
    (next, applied)
}

/// Empty under the `isEmpty` family: null, empty string, empty array,
/// empty object.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Numeric view of a JSON value: numbers directly, numeric strings parsed.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Loose equality: numeric when both sides coerce to numbers, boolean when
/// both are booleans, string representation otherwise.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x == y;
    }
    if let (Value::Bool(x), Value::Bool(y)) = (a, b) {
        return x == y;
    }
    value_to_string(a) == value_to_string(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::SourceType;
    use crate::scope::ScopedValue;
    use aemos_storage::{ExecutionType, NodeType, RuleChain, RuleChainNode};
    use serde_json::json;

    fn chain_row(id: i64) -> RuleChain {
        RuleChain {
            id,
            name: format!("chain-{id}"),
            organization_id: 1,
            schedule_enabled: false,
            cron_expression: None,
            timezone: "UTC".into(),
            priority: 50,
            max_retries: 0,
            retry_delay_ms: 0,
            schedule_metadata: None,
            execution_type: ExecutionType::Hybrid,
            last_executed_at: None,
            last_error_at: None,
            execution_count: 0,
            failure_count: 0,
        }
    }

    fn node(id: i64, name: &str, node_type: NodeType, config: &str) -> RuleChainNode {
        RuleChainNode {
            id,
            rule_chain_id: 1,
            name: name.into(),
            node_type,
            config: config.into(),
            next_node_id: None,
        }
    }

    fn leaf(operator: &str, value: Option<Value>, duration: Option<&str>) -> LeafExpr {
        LeafExpr {
            source_type: SourceType::Sensor,
            uuid: "s1".into(),
            key: "temp".into(),
            operator: operator.parse().unwrap(),
            value,
            duration: duration.map(String::from),
        }
    }

    fn scope_with(value: Value) -> DataScope {
        let mut scope = DataScope::new();
        scope.insert(SourceType::Sensor, "s1", "temp", ScopedValue::new(value));
        scope
    }

    fn eval(leaf: &LeafExpr, scope: &DataScope) -> Result<bool, RuleError> {
        eval_expr(&FilterExpr::Leaf(leaf.clone()), scope, Utc::now())
    }

    #[test]
    fn numeric_comparisons() {
        let scope = scope_with(json!("32"));
        assert!(eval(&leaf(">", Some(json!(30)), None), &scope).unwrap());
        assert!(!eval(&leaf(">", Some(json!(40)), None), &scope).unwrap());
        assert!(eval(&leaf(">=", Some(json!(32)), None), &scope).unwrap());
        assert!(eval(&leaf("<", Some(json!(40)), None), &scope).unwrap());
        assert!(eval(&leaf("<=", Some(json!(32)), None), &scope).unwrap());
        // Non-numeric source is a quiet false, not an error.
        let scope = scope_with(json!("warm"));
        assert!(!eval(&leaf(">", Some(json!(30)), None), &scope).unwrap());
    }

    #[test]
    fn loose_equality() {
        let scope = scope_with(json!("32"));
        assert!(eval(&leaf("==", Some(json!(32)), None), &scope).unwrap());
        assert!(eval(&leaf("!=", Some(json!(33)), None), &scope).unwrap());
        let scope = scope_with(json!(true));
        assert!(eval(&leaf("==", Some(json!(true)), None), &scope).unwrap());
    }

    #[test]
    fn between_bounds() {
        let scope = scope_with(json!(5));
        assert!(eval(&leaf("between", Some(json!([1, 10])), None), &scope).unwrap());
        assert!(!eval(&leaf("between", Some(json!([6, 10])), None), &scope).unwrap());
        // Malformed bounds are a hard error.
        assert!(eval(&leaf("between", Some(json!([1])), None), &scope).is_err());
        assert!(eval(&leaf("between", Some(json!("1..10")), None), &scope).is_err());
    }

    #[test]
    fn string_and_array_containment() {
        let scope = scope_with(json!("greenhouse-7"));
        assert!(eval(&leaf("contains", Some(json!("house")), None), &scope).unwrap());
        assert!(eval(&leaf("notContains", Some(json!("barn")), None), &scope).unwrap());
        assert!(eval(&leaf("startsWith", Some(json!("green")), None), &scope).unwrap());
        assert!(eval(&leaf("endsWith", Some(json!("-7")), None), &scope).unwrap());

        let scope = scope_with(json!(["a", "b"]));
        assert!(eval(&leaf("contains", Some(json!("a")), None), &scope).unwrap());
        assert!(!eval(&leaf("contains", Some(json!("c")), None), &scope).unwrap());
    }

    #[test]
    fn regex_matches() {
        let scope = scope_with(json!("zone-12"));
        assert!(eval(&leaf("matches", Some(json!(r"^zone-\d+$")), None), &scope).unwrap());
        assert!(!eval(&leaf("matches", Some(json!(r"^field-\d+$")), None), &scope).unwrap());
        // Invalid regex fails the chain.
        assert!(eval(&leaf("matches", Some(json!("([")), None), &scope).is_err());
    }

    #[test]
    fn membership_operators() {
        let scope = scope_with(json!("b"));
        assert!(eval(&leaf("in", Some(json!(["a", "b"])), None), &scope).unwrap());
        assert!(eval(&leaf("notIn", Some(json!(["x", "y"])), None), &scope).unwrap());
        assert!(eval(&leaf("in", Some(json!("ab")), None), &scope).is_err());

        let scope = scope_with(json!(["a", "b", "c"]));
        assert!(eval(&leaf("hasAll", Some(json!(["a", "c"])), None), &scope).unwrap());
        assert!(eval(&leaf("hasAny", Some(json!(["z", "b"])), None), &scope).unwrap());
        assert!(eval(&leaf("hasNone", Some(json!(["x", "y"])), None), &scope).unwrap());
        assert!(!eval(&leaf("hasAll", Some(json!(["a", "z"])), None), &scope).unwrap());
    }

    #[test]
    fn type_predicates() {
        assert!(eval(&leaf("isNumber", None, None), &scope_with(json!(5))).unwrap());
        assert!(!eval(&leaf("isNumber", None, None), &scope_with(json!("5"))).unwrap());
        assert!(eval(&leaf("isString", None, None), &scope_with(json!("x"))).unwrap());
        assert!(eval(&leaf("isBoolean", None, None), &scope_with(json!(false))).unwrap());
        assert!(eval(&leaf("isArray", None, None), &scope_with(json!([1]))).unwrap());
    }

    #[test]
    fn null_and_empty_are_defined_on_absence() {
        let empty = DataScope::new();
        assert!(eval(&leaf("isNull", None, None), &empty).unwrap());
        assert!(!eval(&leaf("isNotNull", None, None), &empty).unwrap());
        assert!(eval(&leaf("isEmpty", None, None), &empty).unwrap());
        assert!(!eval(&leaf("isNotEmpty", None, None), &empty).unwrap());

        assert!(eval(&leaf("isEmpty", None, None), &scope_with(json!(""))).unwrap());
        assert!(eval(&leaf("isEmpty", None, None), &scope_with(json!([]))).unwrap());
        assert!(!eval(&leaf("isEmpty", None, None), &scope_with(json!("x"))).unwrap());
        assert!(eval(&leaf("isNotNull", None, None), &scope_with(json!(0))).unwrap());
    }

    #[test]
    fn absent_uuid_is_a_quiet_false() {
        let empty = DataScope::new();
        assert!(!eval(&leaf(">", Some(json!(0)), None), &empty).unwrap());
        assert!(!eval(&leaf("contains", Some(json!("x")), None), &empty).unwrap());
        assert!(!eval(&leaf("olderThan", None, Some("5m")), &empty).unwrap());
    }

    #[test]
    fn unknown_operator_is_a_hard_error() {
        let scope = scope_with(json!(1));
        let err = eval(&leaf("almostEquals", Some(json!(1)), None), &scope).unwrap_err();
        assert!(err.to_string().contains("unknown operator"));
    }

    #[test]
    fn age_operators() {
        let now = Utc::now();
        let mut scope = DataScope::new();
        scope.insert(
            SourceType::Sensor,
            "s1",
            "temp",
            ScopedValue::at(json!(20), now - chrono::Duration::seconds(600)),
        );

        let run = |op: &str, dur: &str| {
            eval_expr(
                &FilterExpr::Leaf(leaf(op, None, Some(dur))),
                &scope,
                now,
            )
            .unwrap()
        };
        assert!(run("olderThan", "5m"));
        assert!(!run("olderThan", "15m"));
        assert!(run("newerThan", "15m"));
        assert!(!run("newerThan", "5m"));
        assert!(run("inLast", "15m"));
        assert!(!run("inLast", "5m"));
    }

    #[test]
    fn value_guarded_age_operators() {
        // d1.door=open since 600 s ago: valueOlderThan 5m true, 15m false.
        let now = Utc::now();
        let mut scope = DataScope::new();
        scope.insert(
            SourceType::Device,
            "d1",
            "door",
            ScopedValue::at(json!("open"), now - chrono::Duration::seconds(600)),
        );

        let run = |value: &str, dur: &str| {
            let leaf = LeafExpr {
                source_type: SourceType::Device,
                uuid: "d1".into(),
                key: "door".into(),
                operator: "valueOlderThan".parse().unwrap(),
                value: Some(json!(value)),
                duration: Some(dur.into()),
            };
            eval_expr(&FilterExpr::Leaf(leaf), &scope, now).unwrap()
        };
        assert!(run("open", "5m"));
        assert!(!run("open", "15m"));
        // Guard: a different value never matches regardless of age.
        assert!(!run("closed", "5m"));
    }

    #[test]
    fn and_or_combinators() {
        let mut scope = DataScope::new();
        scope.insert(SourceType::Sensor, "s1", "temp", ScopedValue::new(json!(35)));
        scope.insert(SourceType::Sensor, "s2", "hum", ScopedValue::new(json!(50)));

        let json = r#"{
            "type": "AND",
            "expressions": [
                {"sourceType":"sensor","UUID":"s1","key":"temp","operator":">","value":30},
                {"type":"OR","expressions":[
                    {"sourceType":"sensor","UUID":"s2","key":"hum","operator":"<","value":40},
                    {"sourceType":"sensor","UUID":"s2","key":"hum","operator":"<=","value":50}
                ]}
            ]
        }"#;
        let expr: FilterExpr = serde_json::from_str(json).unwrap();
        assert!(eval_expr(&expr, &scope, Utc::now()).unwrap());
    }

    #[test]
    fn chain_executes_filter_transform_action() {
        let parsed = ParsedChain::parse(
            chain_row(1),
            vec![
                node(
                    1,
                    "hot",
                    NodeType::Filter,
                    r#"{"sourceType":"sensor","UUID":"s1","key":"temp","operator":">","value":30}"#,
                ),
                node(
                    2,
                    "to-fahrenheit",
                    NodeType::Transform,
                    r#"{"key":"temp","operation":"multiply","operand":1.8}"#,
                ),
                node(
                    3,
                    "fan-on",
                    NodeType::Action,
                    r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"fan","value":"on"}}"#,
                ),
            ],
        )
        .unwrap();

        let result = execute(&parsed, scope_with(json!(32)), Deadline::after_ms(5_000));
        assert!(result.succeeded());
        assert!(result.summary.filters_passed);
        assert_eq!(result.summary.transformations_applied, 1);
        assert_eq!(result.summary.actions_executed, 1);
        assert_eq!(result.summary.total_nodes, 3);
        assert_eq!(
            result.execution_details.executed_nodes,
            ["hot", "to-fahrenheit", "fan-on"]
        );

        let transformed = result
            .execution_details
            .final_data
            .get(SourceType::Sensor, "s1", "temp")
            .unwrap();
        assert_eq!(as_f64(&transformed.value), Some(57.6));

        let action = &result.node_results.actions[0];
        assert_eq!(action.command.device_uuid, "d1");
        assert!(!action.notification_sent);
    }

    #[test]
    fn failed_filter_short_circuits() {
        let parsed = ParsedChain::parse(
            chain_row(1),
            vec![
                node(
                    1,
                    "hot",
                    NodeType::Filter,
                    r#"{"sourceType":"sensor","UUID":"s1","key":"temp","operator":">","value":30}"#,
                ),
                node(
                    2,
                    "fan-on",
                    NodeType::Action,
                    r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"fan","value":"on"}}"#,
                ),
            ],
        )
        .unwrap();

        let result = execute(&parsed, scope_with(json!(25)), Deadline::after_ms(5_000));
        assert_eq!(result.status, "success");
        assert!(!result.summary.filters_passed);
        assert_eq!(result.summary.actions_executed, 0);
        assert_eq!(result.execution_details.executed_nodes, ["hot"]);
    }

    #[test]
    fn unknown_uuid_short_circuits_without_actions() {
        let parsed = ParsedChain::parse(
            chain_row(1),
            vec![
                node(
                    1,
                    "hot",
                    NodeType::Filter,
                    r#"{"sourceType":"sensor","UUID":"nope","key":"temp","operator":">","value":30}"#,
                ),
                node(
                    2,
                    "fan-on",
                    NodeType::Action,
                    r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"fan","value":"on"}}"#,
                ),
            ],
        )
        .unwrap();

        let result = execute(&parsed, scope_with(json!(99)), Deadline::after_ms(5_000));
        assert!(result.succeeded());
        assert!(!result.summary.filters_passed);
        assert!(result.node_results.actions.is_empty());
    }

    #[test]
    fn unknown_operator_fails_the_chain() {
        let parsed = ParsedChain::parse(
            chain_row(1),
            vec![node(
                1,
                "weird",
                NodeType::Filter,
                r#"{"sourceType":"sensor","UUID":"s1","key":"temp","operator":"almost","value":30}"#,
            )],
        )
        .unwrap();

        let result = execute(&parsed, scope_with(json!(32)), Deadline::after_ms(5_000));
        assert_eq!(result.status, "error");
        assert_eq!(result.error_code.as_deref(), Some("RULE_EVAL_ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_aborts_with_timeout_status() {
        let parsed = ParsedChain::parse(
            chain_row(1),
            vec![
                node(
                    1,
                    "a-act",
                    NodeType::Action,
                    r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"fan","value":"on"}}"#,
                ),
                node(
                    2,
                    "b-act",
                    NodeType::Action,
                    r#"{"type":"deviceCommand","command":{"deviceUuid":"d2","stateName":"pump","value":"on"}}"#,
                ),
            ],
        )
        .unwrap();

        let deadline = Deadline::after_ms(10);
        tokio::time::advance(std::time::Duration::from_millis(11)).await;

        let result = execute(&parsed, DataScope::new(), deadline);
        assert_eq!(result.status, "error");
        assert_eq!(result.error_code.as_deref(), Some("RULE_CHAIN_TIMEOUT"));
        assert!(result.node_results.actions.is_empty());
    }
}
