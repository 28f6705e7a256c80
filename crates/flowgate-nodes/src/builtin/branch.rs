use std::str::FromStr;

use futures::future::BoxFuture;
use regex::RegexBuilder;
use serde_json::Value;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::Handler;
use flowgate_core::types::{lenient_bool, ExecutionContext, ExecutionResult};

use super::{config_str, lookup_path};

pub const TRUE_HANDLE: &str = "true_result";
pub const FALSE_HANDLE: &str = "false_result";

/// Comparison applied by a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    Regex,
    Exists,
    GreaterThan,
    LessThan,
}

impl FromStr for Operator {
    type Err = FlowgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" | "==" => Ok(Self::Equals),
            "not_equals" | "ne" | "!=" => Ok(Self::NotEquals),
            "contains" => Ok(Self::Contains),
            "regex" | "matches" => Ok(Self::Regex),
            "exists" | "is_set" => Ok(Self::Exists),
            "greater_than" | "gt" | ">" => Ok(Self::GreaterThan),
            "less_than" | "lt" | "<" => Ok(Self::LessThan),
            other => Err(FlowgateError::Config(format!("unknown operator '{}'", other))),
        }
    }
}

/// If/else router.
///
/// The left operand is `config.field` looked up in the input, else the
/// input's `value` or `text` key, else the input itself. The right operand
/// is `config.value_b` (or `config.value`). The result carries the input on
/// exactly one of the `true_result` / `false_result` handles.
#[derive(Debug)]
pub struct ConditionalBranch {
    field: Option<String>,
    operator: Operator,
    expected: Value,
    case_sensitive: bool,
    pattern: Option<regex::Regex>,
}

impl ConditionalBranch {
    pub fn from_config(config: &Value) -> Result<Self> {
        let operator = match config_str(config, "operator") {
            Some(op) => op.parse()?,
            None => Operator::Equals,
        };
        let expected = config
            .get("value_b")
            .or_else(|| config.get("value"))
            .cloned()
            .unwrap_or(Value::Null);
        let case_sensitive = lenient_bool(config.get("case_sensitive")).unwrap_or(true);

        let pattern = if operator == Operator::Regex {
            let source = text_of(&expected);
            Some(
                RegexBuilder::new(&source)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|e| FlowgateError::Config(format!("invalid regex: {}", e)))?,
            )
        } else {
            None
        };

        Ok(Self {
            field: config_str(config, "field").map(String::from),
            operator,
            expected,
            case_sensitive,
            pattern,
        })
    }

    fn subject<'a>(&self, input: &'a Value) -> Option<&'a Value> {
        if let Some(field) = &self.field {
            return lookup_path(input, field);
        }
        match input {
            Value::Object(map) => map
                .get("value")
                .or_else(|| map.get("text"))
                .or(Some(input)),
            Value::Null => None,
            other => Some(other),
        }
    }

    /// Evaluate the comparison against an input payload.
    pub fn evaluate(&self, input: &Value) -> bool {
        let subject = self.subject(input);

        if self.operator == Operator::Exists {
            return subject.is_some_and(is_truthy);
        }
        let Some(subject) = subject else {
            return false;
        };

        match self.operator {
            Operator::GreaterThan | Operator::LessThan => {
                match (number_of(subject), number_of(&self.expected)) {
                    (Some(a), Some(b)) if self.operator == Operator::GreaterThan => a > b,
                    (Some(a), Some(b)) => a < b,
                    _ => false,
                }
            }
            Operator::Regex => self
                .pattern
                .as_ref()
                .is_some_and(|re| re.is_match(&text_of(subject))),
            _ => {
                let (a, b) = (self.fold(text_of(subject)), self.fold(text_of(&self.expected)));
                match self.operator {
                    Operator::Equals => a == b,
                    Operator::NotEquals => a != b,
                    Operator::Contains => a.contains(&b),
                    _ => false,
                }
            }
        }
    }

    fn fold(&self, s: String) -> String {
        if self.case_sensitive {
            s
        } else {
            s.to_lowercase()
        }
    }
}

impl Handler for ConditionalBranch {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        let handle = if self.evaluate(&input) { TRUE_HANDLE } else { FALSE_HANDLE };
        Box::pin(async move {
            Ok(ExecutionResult::success(input.clone()).with_handle(handle, input))
        })
    }
}

/// Plain-text rendering used for string comparisons.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_test_utils::test_context;
    use serde_json::json;

    fn branch(config: Value) -> ConditionalBranch {
        ConditionalBranch::from_config(&config).unwrap()
    }

    #[test]
    fn test_equals_on_value_key() {
        let b = branch(json!({"operator": "equals", "value_b": "approved"}));
        assert!(b.evaluate(&json!({"value": "approved"})));
        assert!(!b.evaluate(&json!({"value": "rejected"})));
        assert!(b.evaluate(&json!("approved")));
    }

    #[test]
    fn test_case_insensitive_contains() {
        let b = branch(json!({"operator": "contains", "value_b": "URGENT", "case_sensitive": false}));
        assert!(b.evaluate(&json!({"text": "this is urgent!"})));
        let strict = branch(json!({"operator": "contains", "value_b": "URGENT"}));
        assert!(!strict.evaluate(&json!({"text": "this is urgent!"})));
        // Editor forms store flags as text
        let text_flag = branch(json!({"operator": "contains", "value_b": "URGENT", "case_sensitive": "no"}));
        assert!(text_flag.evaluate(&json!({"text": "this is urgent!"})));
    }

    #[test]
    fn test_regex_and_field_path() {
        let b = branch(json!({"operator": "regex", "field": "email", "value_b": r"@example\.com$"}));
        assert!(b.evaluate(&json!({"email": "ada@example.com"})));
        assert!(!b.evaluate(&json!({"email": "ada@example.org"})));
        assert!(!b.evaluate(&json!({"name": "no email"})));
    }

    #[test]
    fn test_exists_and_numeric() {
        let exists = branch(json!({"operator": "exists", "field": "id"}));
        assert!(exists.evaluate(&json!({"id": 7})));
        assert!(!exists.evaluate(&json!({"id": ""})));
        assert!(!exists.evaluate(&json!({})));

        let gt = branch(json!({"operator": "greater_than", "field": "total", "value": "100"}));
        assert!(gt.evaluate(&json!({"total": 150})));
        assert!(!gt.evaluate(&json!({"total": 100})));
        assert!(!gt.evaluate(&json!({"total": "n/a"})));
    }

    #[test]
    fn test_bad_config_rejected() {
        assert!(ConditionalBranch::from_config(&json!({"operator": "between"})).is_err());
        assert!(ConditionalBranch::from_config(&json!({"operator": "regex", "value_b": "("})).is_err());
    }

    #[tokio::test]
    async fn test_emits_exactly_one_handle() {
        let b = branch(json!({"operator": "equals", "field": "ok", "value_b": "true"}));
        let ctx = test_context("branch");
        for (input, expected) in [
            (json!({"ok": true}), TRUE_HANDLE),
            (json!({"ok": false}), FALSE_HANDLE),
            (json!({}), FALSE_HANDLE),
        ] {
            let result = b.execute(input.clone(), &ctx).await.unwrap();
            let handles = result.handles().unwrap();
            assert_eq!(handles.len(), 1);
            assert_eq!(handles.get(expected), Some(&input));
            assert_eq!(result.data(), Some(&input));
        }
    }
}
