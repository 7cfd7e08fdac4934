//! Typed expression AST for rule-chain node configurations.
//!
//! Node `config` columns carry serialized expressions. They are parsed once,
//! when a chain is loaded into the index, into the types here; evaluation
//! never re-reads JSON. The serializer round-trips, so the REST surface can
//! echo a stored config back unchanged.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Which entity family a leaf reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Sensor,
    Device,
}

/// The full comparison operator algebra.
///
/// Operator names are part of the stored-config contract. An operator
/// string outside this set parses into [`Operator::Unknown`] so configs
/// round-trip losslessly; evaluating one raises a hard evaluation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
    Between,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    In,
    NotIn,
    HasAll,
    HasAny,
    HasNone,
    IsNull,
    IsNotNull,
    IsEmpty,
    IsNotEmpty,
    IsNumber,
    IsString,
    IsBoolean,
    IsArray,
    OlderThan,
    NewerThan,
    InLast,
    ValueOlderThan,
    ValueNewerThan,
    ValueInLast,
    /// Preserved verbatim; evaluation fails the chain.
    Unknown(String),
}

impl Operator {
    /// The canonical config string for this operator.
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Between => "between",
            Operator::Contains => "contains",
            Operator::NotContains => "notContains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::Matches => "matches",
            Operator::In => "in",
            Operator::NotIn => "notIn",
            Operator::HasAll => "hasAll",
            Operator::HasAny => "hasAny",
            Operator::HasNone => "hasNone",
            Operator::IsNull => "isNull",
            Operator::IsNotNull => "isNotNull",
            Operator::IsEmpty => "isEmpty",
            Operator::IsNotEmpty => "isNotEmpty",
            Operator::IsNumber => "isNumber",
            Operator::IsString => "isString",
            Operator::IsBoolean => "isBoolean",
            Operator::IsArray => "isArray",
            Operator::OlderThan => "olderThan",
            Operator::NewerThan => "newerThan",
            Operator::InLast => "inLast",
            Operator::ValueOlderThan => "valueOlderThan",
            Operator::ValueNewerThan => "valueNewerThan",
            Operator::ValueInLast => "valueInLast",
            Operator::Unknown(s) => s,
        }
    }

    /// Operators whose result is defined when the UUID or key is absent
    /// from the input scope.
    pub fn defined_on_absence(&self) -> bool {
        matches!(
            self,
            Operator::IsNull | Operator::IsNotNull | Operator::IsEmpty | Operator::IsNotEmpty
        )
    }
}

impl FromStr for Operator {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "between" => Operator::Between,
            "contains" => Operator::Contains,
            "notContains" => Operator::NotContains,
            "startsWith" => Operator::StartsWith,
            "endsWith" => Operator::EndsWith,
            "matches" => Operator::Matches,
            "in" => Operator::In,
            "notIn" => Operator::NotIn,
            "hasAll" => Operator::HasAll,
            "hasAny" => Operator::HasAny,
            "hasNone" => Operator::HasNone,
            "isNull" => Operator::IsNull,
            "isNotNull" => Operator::IsNotNull,
            "isEmpty" => Operator::IsEmpty,
            "isNotEmpty" => Operator::IsNotEmpty,
            "isNumber" => Operator::IsNumber,
            "isString" => Operator::IsString,
            "isBoolean" => Operator::IsBoolean,
            "isArray" => Operator::IsArray,
            "olderThan" => Operator::OlderThan,
            "newerThan" => Operator::NewerThan,
            "inLast" => Operator::InLast,
            "valueOlderThan" => Operator::ValueOlderThan,
            "valueNewerThan" => Operator::ValueNewerThan,
            "valueInLast" => Operator::ValueInLast,
            other => Operator::Unknown(other.to_string()),
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("operator parsing is infallible"))
    }
}

/// A single comparison against one entity value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafExpr {
    #[serde(rename = "sourceType")]
    pub source_type: SourceType,
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Compact duration string for the age-based operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// Boolean combinator over sub-expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOp {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// AND/OR over nested expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupExpr {
    #[serde(rename = "type")]
    pub op: GroupOp,
    pub expressions: Vec<FilterExpr>,
}

/// A filter expression tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterExpr {
    Group(GroupExpr),
    Leaf(LeafExpr),
}

impl FilterExpr {
    /// Collect every `(sourceType, UUID, key)` leaf in the tree.
    pub fn collect_deps(&self, out: &mut Vec<LeafDep>) {
        match self {
            FilterExpr::Leaf(leaf) => {
                let dep = LeafDep {
                    source_type: leaf.source_type,
                    uuid: leaf.uuid.clone(),
                    key: leaf.key.clone(),
                };
                if !out.contains(&dep) {
                    out.push(dep);
                }
            }
            FilterExpr::Group(group) => {
                for expr in &group.expressions {
                    expr.collect_deps(out);
                }
            }
        }
    }
}

/// An entity value a chain depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeafDep {
    pub source_type: SourceType,
    pub uuid: String,
    pub key: String,
}

/// Numeric operation applied by a transform node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformOp {
    Multiply,
    Add,
    Subtract,
    Divide,
}

impl TransformOp {
    /// Apply to a value. Division by zero yields `None` and the transform
    /// leaves the scope untouched.
    pub fn apply(&self, value: f64, operand: f64) -> Option<f64> {
        match self {
            TransformOp::Multiply => Some(value * operand),
            TransformOp::Add => Some(value + operand),
            TransformOp::Subtract => Some(value - operand),
            TransformOp::Divide => (operand != 0.0).then(|| value / operand),
        }
    }
}

/// Transform node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformExpr {
    pub key: String,
    pub operation: TransformOp,
    pub operand: f64,
}

/// Device command emitted by an action node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCommand {
    #[serde(rename = "deviceUuid")]
    pub device_uuid: String,
    #[serde(rename = "stateName")]
    pub state_name: String,
    pub value: Value,
}

/// Action node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExpr {
    #[serde(rename = "type")]
    pub action_type: String,
    pub command: ActionCommand,
}

/// Parsed configuration of one node, tagged by the node's declared type.
#[derive(Debug, Clone)]
pub enum NodeConfig {
    Filter(FilterExpr),
    Transform(TransformExpr),
    Action(ActionExpr),
}

impl NodeConfig {
    /// Parse a node's serialized config per its declared type.
    pub fn parse(node_type: aemos_storage::NodeType, config: &str) -> serde_json::Result<Self> {
        Ok(match node_type {
            aemos_storage::NodeType::Filter => NodeConfig::Filter(serde_json::from_str(config)?),
            aemos_storage::NodeType::Transform => {
                NodeConfig::Transform(serde_json::from_str(config)?)
            }
            aemos_storage::NodeType::Action => NodeConfig::Action(serde_json::from_str(config)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operator_round_trips() {
        let names = [
            ">", ">=", "<", "<=", "==", "!=", "between", "contains", "notContains", "startsWith",
            "endsWith", "matches", "in", "notIn", "hasAll", "hasAny", "hasNone", "isNull",
            "isNotNull", "isEmpty", "isNotEmpty", "isNumber", "isString", "isBoolean", "isArray",
            "olderThan", "newerThan", "inLast", "valueOlderThan", "valueNewerThan", "valueInLast",
        ];
        for name in names {
            let op: Operator = name.parse().unwrap();
            assert!(!matches!(op, Operator::Unknown(_)), "operator {name}");
            assert_eq!(op.as_str(), name);
        }
    }

    #[test]
    fn unknown_operator_is_preserved() {
        let op: Operator = "frobnicate".parse().unwrap();
        assert_eq!(op, Operator::Unknown("frobnicate".to_string()));
        assert_eq!(serde_json::to_string(&op).unwrap(), r#""frobnicate""#);
    }

    #[test]
    fn leaf_config_round_trips() {
        let json = r#"{"sourceType":"sensor","UUID":"s1","key":"temp","operator":">","value":30}"#;
        let expr: FilterExpr = serde_json::from_str(json).unwrap();
        let FilterExpr::Leaf(ref leaf) = expr else {
            panic!("expected leaf");
        };
        assert_eq!(leaf.operator, Operator::Gt);
        assert_eq!(leaf.value, Some(serde_json::json!(30)));

        let back = serde_json::to_value(&expr).unwrap();
        let reparsed: FilterExpr = serde_json::from_value(back).unwrap();
        assert!(matches!(reparsed, FilterExpr::Leaf(_)));
    }

    #[test]
    fn composite_config_parses_recursively() {
        let json = r#"{
            "type": "AND",
            "expressions": [
                {"sourceType":"sensor","UUID":"s1","key":"temp","operator":">","value":30},
                {"type":"OR","expressions":[
                    {"sourceType":"device","UUID":"d1","key":"door","operator":"==","value":"open"},
                    {"sourceType":"sensor","UUID":"s2","key":"hum","operator":"<","value":80}
                ]}
            ]
        }"#;
        let expr: FilterExpr = serde_json::from_str(json).unwrap();
        let mut deps = Vec::new();
        expr.collect_deps(&mut deps);
        assert_eq!(deps.len(), 3);
        assert!(deps.contains(&LeafDep {
            source_type: SourceType::Device,
            uuid: "d1".into(),
            key: "door".into()
        }));
    }

    #[test]
    fn duplicate_deps_are_collapsed() {
        let json = r#"{
            "type": "OR",
            "expressions": [
                {"sourceType":"sensor","UUID":"s1","key":"temp","operator":">","value":30},
                {"sourceType":"sensor","UUID":"s1","key":"temp","operator":"<","value":5}
            ]
        }"#;
        let expr: FilterExpr = serde_json::from_str(json).unwrap();
        let mut deps = Vec::new();
        expr.collect_deps(&mut deps);
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn transform_and_action_configs_parse() {
        let transform: TransformExpr =
            serde_json::from_str(r#"{"key":"temp","operation":"multiply","operand":1.8}"#).unwrap();
        assert_eq!(transform.operation, TransformOp::Multiply);

        let action: ActionExpr = serde_json::from_str(
            r#"{"type":"deviceCommand","command":{"deviceUuid":"d1","stateName":"fan","value":"on"}}"#,
        )
        .unwrap();
        assert_eq!(action.command.state_name, "fan");
    }

    #[test]
    fn divide_by_zero_is_rejected() {
        assert_eq!(TransformOp::Divide.apply(10.0, 0.0), None);
        assert_eq!(TransformOp::Divide.apply(10.0, 4.0), Some(2.5));
    }
}
