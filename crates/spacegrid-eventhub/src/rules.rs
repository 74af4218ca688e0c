//! Rule engine — nested boolean predicate trees over JSON payloads.
//!
//! A rule set is a flat list of nodes linked by `parentId`:
//!
//! ```json
//! [
//!   {"id": 1, "variable": "$logical", "operator": "group", "value": "OR"},
//!   {"id": 2, "parentId": 1, "variable": "user.age", "operator": "greater_than", "value": "18"},
//!   {"id": 3, "parentId": 1, "variable": "user.role", "operator": "equal_to", "value": "admin"}
//! ]
//! ```
//!
//! The list may also be wrapped as `{"rules": [...]}` or `{"groups": [...]}`.
//! Root nodes (no parent, or a parent that does not exist) are AND-ed.
//! A group is a node with both `variable: "$logical"` and
//! `operator: "group"`. Nodes cut off from every root by a `parentId`
//! cycle make the whole set false.
//! Invalid JSON at the top level is an error; a malformed node just
//! evaluates to false. Groups nested deeper than [`MAX_GROUP_DEPTH`] are
//! rejected.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

pub const MAX_GROUP_DEPTH: usize = 10;

const LOGICAL: &str = "$logical";

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule json: {0}")]
    Parse(String),

    #[error("rule set must be an array or an object, got {0}")]
    Shape(String),

    #[error("invalid payload json: {0}")]
    Payload(String),

    #[error("rule groups nested deeper than {MAX_GROUP_DEPTH}")]
    DepthExceeded,
}

pub type RuleResult<T> = Result<T, RuleError>;

#[derive(Debug, Clone)]
struct Node {
    id: Option<String>,
    parent_id: Option<String>,
    variable: String,
    operator: String,
    value: Value,
    malformed: bool,
}

impl Node {
    fn from_value(raw: &Value) -> Self {
        let Value::Object(obj) = raw else {
            return Self::malformed();
        };
        let id = obj.get("id").and_then(id_string);
        let parent_id = obj
            .get("parentId")
            .or_else(|| obj.get("parent_id"))
            .and_then(id_string);
        let variable = obj.get("variable").and_then(Value::as_str);
        let operator = obj.get("operator").and_then(Value::as_str);
        match (variable, operator) {
            (Some(variable), Some(operator)) => Self {
                id,
                parent_id,
                variable: variable.to_string(),
                operator: operator.to_string(),
                value: obj.get("value").cloned().unwrap_or(Value::Null),
                malformed: false,
            },
            _ => Self {
                id,
                parent_id,
                ..Self::malformed()
            },
        }
    }

    fn malformed() -> Self {
        Self {
            id: None,
            parent_id: None,
            variable: String::new(),
            operator: String::new(),
            value: Value::Null,
            malformed: true,
        }
    }

    fn is_group(&self) -> bool {
        self.variable == LOGICAL && self.operator == "group"
    }
}

/// A parsed rule tree, reusable across payloads.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    nodes: Vec<Node>,
    roots: Vec<usize>,
    children: HashMap<String, Vec<usize>>,
    /// Some node hangs off a `parentId` cycle and can never be reached.
    detached: bool,
}

impl RuleSet {
    pub fn parse(source: &str) -> RuleResult<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Ok(Self::default());
        }
        let parsed: Value = serde_json::from_str(source).map_err(|e| RuleError::Parse(e.to_string()))?;

        let raw_nodes: Vec<Value> = match parsed {
            Value::Array(items) => items,
            Value::Object(obj) => ["rules", "groups"]
                .iter()
                .filter_map(|k| obj.get(*k).and_then(Value::as_array))
                .flatten()
                .cloned()
                .collect(),
            Value::Null => Vec::new(),
            other => return Err(RuleError::Shape(type_name(&other).to_string())),
        };

        let nodes: Vec<Node> = raw_nodes.iter().map(Node::from_value).collect();
        let known: std::collections::HashSet<&str> = nodes.iter().filter_map(|n| n.id.as_deref()).collect();

        let mut roots = Vec::new();
        let mut children: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            match node.parent_id.as_deref() {
                Some(parent) if known.contains(parent) && node.id.as_deref() != Some(parent) => {
                    children.entry(parent.to_string()).or_default().push(i);
                }
                _ => roots.push(i),
            }
        }

        let detached = reachable(&nodes, &roots, &children) < nodes.len();
        Ok(Self {
            nodes,
            roots,
            children,
            detached,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Evaluate against a payload. An empty rule set matches everything.
    pub fn matches(&self, payload: &Value) -> RuleResult<bool> {
        if self.detached {
            return Ok(false);
        }
        for &root in &self.roots {
            if !self.eval(root, payload, 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn eval(&self, index: usize, payload: &Value, depth: usize) -> RuleResult<bool> {
        let node = &self.nodes[index];
        if node.malformed {
            return Ok(false);
        }
        if !node.is_group() {
            return Ok(predicate(node, payload));
        }
        if depth > MAX_GROUP_DEPTH {
            return Err(RuleError::DepthExceeded);
        }

        let kids = node
            .id
            .as_ref()
            .and_then(|id| self.children.get(id))
            .map(Vec::as_slice)
            .unwrap_or_default();
        if kids.is_empty() {
            return Ok(true);
        }

        match node.value.as_str().map(str::to_ascii_uppercase).as_deref() {
            Some("AND") => {
                for &kid in kids {
                    if !self.eval(kid, payload, depth + 1)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Some("OR") => {
                for &kid in kids {
                    if self.eval(kid, payload, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

/// How many nodes can be reached by walking down from the roots.
fn reachable(nodes: &[Node], roots: &[usize], children: &HashMap<String, Vec<usize>>) -> usize {
    let mut seen = vec![false; nodes.len()];
    let mut stack: Vec<usize> = roots.to_vec();
    while let Some(i) = stack.pop() {
        if std::mem::replace(&mut seen[i], true) {
            continue;
        }
        if let Some(kids) = nodes[i].id.as_ref().and_then(|id| children.get(id)) {
            stack.extend(kids.iter().copied().filter(|&k| !seen[k]));
        }
    }
    seen.into_iter().filter(|&s| s).count()
}

/// Parse `rules` and evaluate them against a raw payload.
///
/// Empty rules match without looking at the payload. An empty payload is
/// treated as `{}`.
pub fn evaluate(rules: &str, payload: &[u8]) -> RuleResult<bool> {
    let set = RuleSet::parse(rules)?;
    if set.is_empty() {
        return Ok(true);
    }
    let payload = if payload.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(payload).map_err(|e| RuleError::Payload(e.to_string()))?
    };
    set.matches(&payload)
}

fn predicate(node: &Node, payload: &Value) -> bool {
    let expected = &node.value;
    let Some(actual) = lookup(payload, &node.variable) else {
        return match node.operator.as_str() {
            "equal_to" => scalar_string(expected).is_empty(),
            "not_equal_to" => !scalar_string(expected).is_empty(),
            _ => false,
        };
    };

    match node.operator.as_str() {
        "equal_to" => loosely_equal(actual, expected),
        "not_equal_to" => !loosely_equal(actual, expected),
        "contains" => contains(actual, expected),
        "not_contains" => !contains(actual, expected),
        "greater_than" => compare_numbers(actual, expected, |a, b| a > b),
        "less_than" => compare_numbers(actual, expected, |a, b| a < b),
        "greater_than_or_equal" => compare_numbers(actual, expected, |a, b| a >= b),
        "less_than_or_equal" => compare_numbers(actual, expected, |a, b| a <= b),
        "after" => compare_dates(actual, expected, |a, b| a > b),
        "before" => compare_dates(actual, expected, |a, b| a < b),
        _ => false,
    }
}

fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if scalar_string(actual) == scalar_string(expected) {
        return true;
    }
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    let needle = scalar_string(expected);
    match actual {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
        Value::String(s) => s.contains(needle.as_str()),
        other => scalar_string(other).contains(needle.as_str()),
    }
}

fn compare_numbers(actual: &Value, expected: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn compare_dates(actual: &Value, expected: &Value, cmp: fn(i64, i64) -> bool) -> bool {
    match (as_timestamp(actual), as_timestamp(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Milliseconds since the epoch for RFC 3339 or plain `YYYY-MM-DD` values.
fn as_timestamp(value: &Value) -> Option<i64> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(rules: Value, payload: Value) -> bool {
        evaluate(&rules.to_string(), payload.to_string().as_bytes()).unwrap()
    }

    fn rule(id: i64, variable: &str, operator: &str, value: Value) -> Value {
        json!({"id": id, "variable": variable, "operator": operator, "value": value})
    }

    fn child(id: i64, parent: i64, variable: &str, operator: &str, value: Value) -> Value {
        json!({"id": id, "parentId": parent, "variable": variable, "operator": operator, "value": value})
    }

    fn group(id: i64, logic: &str) -> Value {
        json!({"id": id, "variable": "$logical", "operator": "group", "value": logic})
    }

    #[test]
    fn empty_rule_sets_match() {
        for empty in ["", "  ", "{}", "[]", r#"{"rules":[]}"#, r#"{"groups":[]}"#] {
            assert!(evaluate(empty, b"{\"a\":1}").unwrap(), "{empty:?}");
        }
        assert!(evaluate("", b"not json at all").unwrap());
    }

    #[test]
    fn invalid_top_level_is_error() {
        assert!(matches!(evaluate("{nope", b"{}"), Err(RuleError::Parse(_))));
        assert!(matches!(evaluate("42", b"{}"), Err(RuleError::Shape(_))));
    }

    #[test]
    fn roots_are_anded() {
        let rules = json!([
            rule(1, "status", "equal_to", json!("published")),
            rule(2, "author", "equal_to", json!("alice")),
        ]);
        assert!(eval(rules.clone(), json!({"status": "published", "author": "alice"})));
        assert!(!eval(rules, json!({"status": "published", "author": "bob"})));
    }

    #[test]
    fn or_group_needs_one_child() {
        let rules = json!([
            group(1, "OR"),
            child(2, 1, "tag", "equal_to", json!("rust")),
            child(3, 1, "tag", "equal_to", json!("go")),
        ]);
        assert!(eval(rules.clone(), json!({"tag": "go"})));
        assert!(!eval(rules, json!({"tag": "java"})));
    }

    #[test]
    fn empty_group_is_true() {
        assert!(eval(json!([group(1, "OR")]), json!({})));
    }

    #[test]
    fn nested_groups() {
        let rules = json!([
            group(1, "AND"),
            child(2, 1, "kind", "equal_to", json!("post")),
            {"id": 3, "parentId": 1, "variable": "$logical", "operator": "group", "value": "or"},
            child(4, 3, "views", "greater_than", json!(100)),
            child(5, 3, "pinned", "equal_to", json!(true)),
        ]);
        assert!(eval(rules.clone(), json!({"kind": "post", "views": 5, "pinned": true})));
        assert!(!eval(rules, json!({"kind": "post", "views": 5, "pinned": false})));
    }

    #[test]
    fn dotted_path_with_numeric_coercion() {
        let rules = json!([rule(1, "user.age", "greater_than", json!("18"))]);
        assert!(eval(rules.clone(), json!({"user": {"age": 21}})));
        assert!(!eval(rules.clone(), json!({"user": {"age": 16}})));
        assert!(eval(rules, json!({"user": {"age": "30"}})));
    }

    #[test]
    fn numeric_equality_fallback() {
        let rules = json!([rule(1, "n", "equal_to", json!("1.0"))]);
        assert!(eval(rules, json!({"n": 1})));
    }

    #[test]
    fn missing_field_asymmetry() {
        let ne = json!([rule(1, "ghost", "not_equal_to", json!("x"))]);
        let contains = json!([rule(1, "ghost", "contains", json!("x"))]);
        let not_contains = json!([rule(1, "ghost", "not_contains", json!("x"))]);
        let eq_empty = json!([rule(1, "ghost", "equal_to", json!(""))]);
        let gt = json!([rule(1, "ghost", "greater_than", json!(1))]);

        assert!(eval(ne, json!({})));
        assert!(!eval(contains, json!({})));
        assert!(!eval(not_contains, json!({})));
        assert!(eval(eq_empty, json!({})));
        assert!(!eval(gt, json!({})));
    }

    #[test]
    fn contains_strings_and_arrays() {
        let rules = json!([rule(1, "title", "contains", json!("rust"))]);
        assert!(eval(rules, json!({"title": "learning rust fast"})));
        let rules = json!([rule(1, "tags", "contains", json!("b"))]);
        assert!(eval(rules.clone(), json!({"tags": ["a", "b"]})));
        assert!(!eval(rules, json!({"tags": ["a"]})));
    }

    #[test]
    fn date_comparisons() {
        let after = json!([rule(1, "at", "after", json!("2024-01-01"))]);
        assert!(eval(after.clone(), json!({"at": "2024-06-01T12:00:00Z"})));
        assert!(!eval(after.clone(), json!({"at": "2023-12-31"})));
        assert!(!eval(after, json!({"at": "yesterday"})));

        let before = json!([rule(1, "at", "before", json!("2024-01-01T00:00:00+00:00"))]);
        assert!(eval(before, json!({"at": "2023-06-01"})));
    }

    #[test]
    fn malformed_rule_is_false_not_error() {
        let rules = json!([{"id": 1, "operator": "equal_to"}]);
        assert!(!eval(rules, json!({})));
        let rules = json!([rule(1, "a", "levenshtein", json!("x"))]);
        assert!(!eval(rules, json!({"a": "x"})));
        let rules = json!(["just a string"]);
        assert!(!eval(rules, json!({})));
    }

    #[test]
    fn orphans_become_roots() {
        let rules = json!([child(2, 99, "a", "equal_to", json!("x"))]);
        assert!(eval(rules.clone(), json!({"a": "x"})));
        assert!(!eval(rules, json!({"a": "y"})));
    }

    #[test]
    fn parent_cycles_never_match() {
        let rules = json!([
            child(1, 2, "a", "equal_to", json!("x")),
            child(2, 1, "a", "equal_to", json!("x")),
        ]);
        assert!(!eval(rules, json!({"a": "x"})));

        // A healthy root does not rescue a detached cycle.
        let rules = json!([
            rule(1, "a", "equal_to", json!("x")),
            child(2, 3, "a", "equal_to", json!("x")),
            child(3, 2, "a", "equal_to", json!("x")),
        ]);
        assert!(!eval(rules, json!({"a": "x"})));
    }

    #[test]
    fn group_sentinel_needs_both_markers() {
        // `operator: group` on an ordinary variable is just an unknown operator.
        let rules = json!([
            {"id": 1, "variable": "tag", "operator": "group", "value": "OR"},
            child(2, 1, "tag", "equal_to", json!("rust")),
        ]);
        assert!(!eval(rules, json!({"tag": "rust"})));

        // `$logical` with a real operator is a plain predicate on a missing field.
        let rules = json!([
            {"id": 1, "variable": "$logical", "operator": "not_equal_to", "value": "OR"},
        ]);
        assert!(eval(rules, json!({})));
    }

    #[test]
    fn string_ids_and_wrapped_rules() {
        let rules = json!({"rules": [
            {"id": "g", "variable": "$logical", "operator": "group", "value": "AND"},
            {"id": "r", "parentId": "g", "variable": "a", "operator": "equal_to", "value": 1},
        ]});
        assert!(eval(rules, json!({"a": 1})));
    }

    #[test]
    fn depth_cap_is_enforced() {
        let mut nodes = vec![group(1, "AND")];
        for id in 2..=12 {
            nodes.push(json!({
                "id": id, "parentId": id - 1,
                "variable": "$logical", "operator": "group", "value": "AND"
            }));
        }
        nodes.push(child(100, 12, "a", "equal_to", json!(1)));
        let err = evaluate(&Value::Array(nodes).to_string(), b"{\"a\":1}").unwrap_err();
        assert!(matches!(err, RuleError::DepthExceeded));
    }

    #[test]
    fn ten_levels_is_fine() {
        let mut nodes = vec![group(1, "AND")];
        for id in 2..=10 {
            nodes.push(json!({
                "id": id, "parentId": id - 1,
                "variable": "$logical", "operator": "group", "value": "AND"
            }));
        }
        nodes.push(child(100, 10, "a", "equal_to", json!(1)));
        assert!(evaluate(&Value::Array(nodes).to_string(), b"{\"a\":1}").unwrap());
    }

    #[test]
    fn empty_payload_is_empty_object() {
        let rules = json!([rule(1, "a", "not_equal_to", json!("x"))]);
        assert!(evaluate(&rules.to_string(), b"").unwrap());
        assert!(matches!(
            evaluate(&rules.to_string(), b"<xml/>"),
            Err(RuleError::Payload(_))
        ));
    }
}
