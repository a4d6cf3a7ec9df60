//! Trigger conditions for iQueries.
//!
//! A [`Condition`] is a composable boolean predicate evaluated against an
//! entity's attribute map and the engine's global-state map. Conditions are
//! pure data: they serialize into bootstrap documents and persistence
//! records, and evaluation has no side effects, so a condition may be
//! evaluated any number of times, in any order, concurrently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Attributes;
use crate::engine::GlobalState;

/////////////////////////////////////////// Comparator ////////////////////////////////////////////

/// How an observed value is compared against an expected value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// The observed value equals the expected value. A missing key compares unequal.
    #[default]
    Equals,
    /// The observed value differs from the expected value. A missing key compares unequal.
    NotEquals,
    /// Numeric greater-than. Requires the key to be present and both values numeric.
    GreaterThan,
    /// Numeric less-than. Requires the key to be present and both values numeric.
    LessThan,
    /// String containment for string values, membership for array values.
    Contains,
    /// The key is present at all; the expected value is ignored.
    Exists,
}

//////////////////////////////////////////// ConditionError ///////////////////////////////////////

/// Error produced by a malformed predicate.
///
/// Evaluation errors do not abort an update cycle: the iQuery layer logs them
/// and treats the offending iQuery as not eligible this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    /// An ordering comparator referenced a key that is absent.
    MissingKey(String),
    /// The observed and expected values cannot be compared with the requested comparator.
    TypeMismatch {
        /// The key whose value could not be compared.
        key: String,
        /// What went wrong.
        detail: String,
    },
}

impl std::fmt::Display for ConditionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingKey(key) => write!(f, "key {:?} is not present", key),
            Self::TypeMismatch { key, detail } => {
                write!(f, "cannot compare key {:?}: {}", key, detail)
            }
        }
    }
}

impl std::error::Error for ConditionError {}

///////////////////////////////////////////// Condition ///////////////////////////////////////////

/// A composable predicate over entity attributes and global state.
///
/// Leaf conditions read a single key; composite conditions fold their
/// operands with AND/OR/NOT. Conditions are built either directly or with
/// the [`and`](Condition::and), [`or`](Condition::or), and
/// [`negate`](Condition::negate) combinators.
///
/// # Examples
///
/// ```rust
/// use accrete::Condition;
/// use serde_json::json;
/// use std::collections::HashMap;
///
/// let needs_definition = Condition::has_attribute("definition").negate();
/// let mut attributes = HashMap::new();
/// let global_state = HashMap::new();
/// assert_eq!(needs_definition.evaluate(&attributes, &global_state), Ok(true));
///
/// attributes.insert("definition".to_string(), json!("a systems language"));
/// assert_eq!(needs_definition.evaluate(&attributes, &global_state), Ok(false));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compares one of the entity's attributes against an expected value.
    Attribute {
        /// Attribute key to read.
        key: String,
        /// Value to compare against.
        #[serde(default)]
        expected: Value,
        /// Comparison to apply.
        #[serde(default)]
        comparator: Comparator,
    },
    /// Compares one of the engine's global-state values against an expected value.
    Global {
        /// Global-state key to read.
        key: String,
        /// Value to compare against.
        #[serde(default)]
        expected: Value,
        /// Comparison to apply.
        #[serde(default)]
        comparator: Comparator,
    },
    /// True when every operand is true. Empty operand lists are true.
    All {
        /// The operands.
        conditions: Vec<Condition>,
    },
    /// True when at least one operand is true. Empty operand lists are false.
    Any {
        /// The operands.
        conditions: Vec<Condition>,
    },
    /// True when the single operand is false.
    Not {
        /// The operand.
        condition: Box<Condition>,
    },
}

impl Condition {
    /// Creates an attribute equality condition.
    pub fn attribute(key: impl Into<String>, expected: impl Into<Value>) -> Condition {
        Condition::Attribute {
            key: key.into(),
            expected: expected.into(),
            comparator: Comparator::Equals,
        }
    }

    /// Creates an attribute condition with an explicit comparator.
    pub fn attribute_cmp(
        key: impl Into<String>,
        expected: impl Into<Value>,
        comparator: Comparator,
    ) -> Condition {
        Condition::Attribute {
            key: key.into(),
            expected: expected.into(),
            comparator,
        }
    }

    /// Creates a condition that is true when the attribute key is present.
    pub fn has_attribute(key: impl Into<String>) -> Condition {
        Condition::Attribute {
            key: key.into(),
            expected: Value::Null,
            comparator: Comparator::Exists,
        }
    }

    /// Creates a global-state equality condition.
    pub fn global(key: impl Into<String>, expected: impl Into<Value>) -> Condition {
        Condition::Global {
            key: key.into(),
            expected: expected.into(),
            comparator: Comparator::Equals,
        }
    }

    /// Creates a global-state condition with an explicit comparator.
    pub fn global_cmp(
        key: impl Into<String>,
        expected: impl Into<Value>,
        comparator: Comparator,
    ) -> Condition {
        Condition::Global {
            key: key.into(),
            expected: expected.into(),
            comparator,
        }
    }

    /// Combines two conditions with logical AND.
    pub fn and(self, other: Condition) -> Condition {
        Condition::All {
            conditions: vec![self, other],
        }
    }

    /// Combines two conditions with logical OR.
    pub fn or(self, other: Condition) -> Condition {
        Condition::Any {
            conditions: vec![self, other],
        }
    }

    /// Inverts this condition.
    pub fn negate(self) -> Condition {
        Condition::Not {
            condition: Box::new(self),
        }
    }

    /// Evaluates this condition against an attribute map and the global state.
    ///
    /// Evaluation is pure. Composite conditions short-circuit, which cannot
    /// be observed because leaf evaluation has no side effects.
    pub fn evaluate(
        &self,
        attributes: &Attributes,
        global_state: &GlobalState,
    ) -> Result<bool, ConditionError> {
        match self {
            Condition::Attribute {
                key,
                expected,
                comparator,
            } => compare(key, attributes.get(key), expected, *comparator),
            Condition::Global {
                key,
                expected,
                comparator,
            } => compare(key, global_state.get(key), expected, *comparator),
            Condition::All { conditions } => {
                for condition in conditions {
                    if !condition.evaluate(attributes, global_state)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any { conditions } => {
                for condition in conditions {
                    if condition.evaluate(attributes, global_state)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => Ok(!condition.evaluate(attributes, global_state)?),
        }
    }
}

fn compare(
    key: &str,
    actual: Option<&Value>,
    expected: &Value,
    comparator: Comparator,
) -> Result<bool, ConditionError> {
    match comparator {
        Comparator::Exists => Ok(actual.is_some()),
        Comparator::Equals => Ok(actual == Some(expected)),
        Comparator::NotEquals => Ok(actual != Some(expected)),
        Comparator::GreaterThan | Comparator::LessThan => {
            let actual = actual.ok_or_else(|| ConditionError::MissingKey(key.to_string()))?;
            let lhs = actual.as_f64().ok_or_else(|| ConditionError::TypeMismatch {
                key: key.to_string(),
                detail: format!("observed value {} is not numeric", actual),
            })?;
            let rhs = expected
                .as_f64()
                .ok_or_else(|| ConditionError::TypeMismatch {
                    key: key.to_string(),
                    detail: format!("expected value {} is not numeric", expected),
                })?;
            if comparator == Comparator::GreaterThan {
                Ok(lhs > rhs)
            } else {
                Ok(lhs < rhs)
            }
        }
        Comparator::Contains => match actual {
            None => Ok(false),
            Some(Value::String(s)) => {
                let needle = expected
                    .as_str()
                    .ok_or_else(|| ConditionError::TypeMismatch {
                        key: key.to_string(),
                        detail: "string containment requires a string expected value".to_string(),
                    })?;
                Ok(s.contains(needle))
            }
            Some(Value::Array(items)) => Ok(items.contains(expected)),
            Some(other) => Err(ConditionError::TypeMismatch {
                key: key.to_string(),
                detail: format!("{} supports neither containment nor membership", other),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn equals_matches_present_value() {
        let attributes = attrs(&[("status", json!("ready"))]);
        let global_state = HashMap::new();
        let condition = Condition::attribute("status", "ready");
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
    }

    #[test]
    fn equals_is_false_for_missing_key() {
        let attributes = HashMap::new();
        let global_state = HashMap::new();
        let condition = Condition::attribute("status", "ready");
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(false));
    }

    #[test]
    fn not_equals_is_true_for_missing_key() {
        let attributes = HashMap::new();
        let global_state = HashMap::new();
        let condition = Condition::attribute_cmp("status", "ready", Comparator::NotEquals);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
    }

    #[test]
    fn exists_ignores_expected_value() {
        let attributes = attrs(&[("definition", json!(null))]);
        let global_state = HashMap::new();
        let condition = Condition::has_attribute("definition");
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
        assert_eq!(
            Condition::has_attribute("missing").evaluate(&attributes, &global_state),
            Ok(false)
        );
    }

    #[test]
    fn greater_than_compares_numbers() {
        let attributes = attrs(&[("confidence", json!(0.9))]);
        let global_state = HashMap::new();
        let condition = Condition::attribute_cmp("confidence", 0.5, Comparator::GreaterThan);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
        let condition = Condition::attribute_cmp("confidence", 0.95, Comparator::GreaterThan);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(false));
    }

    #[test]
    fn less_than_compares_integers_and_floats() {
        let attributes = attrs(&[("depth", json!(3))]);
        let global_state = HashMap::new();
        let condition = Condition::attribute_cmp("depth", 5.5, Comparator::LessThan);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
    }

    #[test]
    fn ordering_on_missing_key_errors() {
        let attributes = HashMap::new();
        let global_state = HashMap::new();
        let condition = Condition::attribute_cmp("depth", 5, Comparator::LessThan);
        assert_eq!(
            condition.evaluate(&attributes, &global_state),
            Err(ConditionError::MissingKey("depth".to_string()))
        );
    }

    #[test]
    fn ordering_on_non_numeric_value_errors() {
        let attributes = attrs(&[("depth", json!("deep"))]);
        let global_state = HashMap::new();
        let condition = Condition::attribute_cmp("depth", 5, Comparator::GreaterThan);
        assert!(matches!(
            condition.evaluate(&attributes, &global_state),
            Err(ConditionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn contains_on_strings_and_arrays() {
        let attributes = attrs(&[
            ("summary", json!("written in Rust")),
            ("tags", json!(["language", "systems"])),
        ]);
        let global_state = HashMap::new();
        let condition = Condition::attribute_cmp("summary", "Rust", Comparator::Contains);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
        let condition = Condition::attribute_cmp("tags", "systems", Comparator::Contains);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
        let condition = Condition::attribute_cmp("tags", "web", Comparator::Contains);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(false));
    }

    #[test]
    fn contains_on_missing_key_is_false() {
        let attributes = HashMap::new();
        let global_state = HashMap::new();
        let condition = Condition::attribute_cmp("tags", "web", Comparator::Contains);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(false));
    }

    #[test]
    fn global_condition_reads_global_state() {
        let attributes = HashMap::new();
        let mut global_state = HashMap::new();
        global_state.insert("cycle".to_string(), json!(7));
        let condition = Condition::global_cmp("cycle", 5, Comparator::GreaterThan);
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(true));
    }

    #[test]
    fn and_or_negate_combinators() {
        let attributes = attrs(&[("status", json!("ready")), ("depth", json!(2))]);
        let global_state = HashMap::new();

        let both = Condition::attribute("status", "ready")
            .and(Condition::attribute_cmp("depth", 5, Comparator::LessThan));
        assert_eq!(both.evaluate(&attributes, &global_state), Ok(true));

        let either = Condition::attribute("status", "paused")
            .or(Condition::attribute("status", "ready"));
        assert_eq!(either.evaluate(&attributes, &global_state), Ok(true));

        let neither = Condition::attribute("status", "ready").negate();
        assert_eq!(neither.evaluate(&attributes, &global_state), Ok(false));
    }

    #[test]
    fn empty_all_is_true_and_empty_any_is_false() {
        let attributes = HashMap::new();
        let global_state = HashMap::new();
        let all = Condition::All { conditions: vec![] };
        let any = Condition::Any { conditions: vec![] };
        assert_eq!(all.evaluate(&attributes, &global_state), Ok(true));
        assert_eq!(any.evaluate(&attributes, &global_state), Ok(false));
    }

    #[test]
    fn all_short_circuits_before_erroring_operand() {
        let attributes = HashMap::new();
        let global_state = HashMap::new();
        // The first operand is false, so the malformed second operand is never reached.
        let condition = Condition::attribute("status", "ready")
            .and(Condition::attribute_cmp("depth", 5, Comparator::LessThan));
        assert_eq!(condition.evaluate(&attributes, &global_state), Ok(false));
    }

    #[test]
    fn condition_round_trips_through_serde() {
        let condition = Condition::attribute("status", "ready")
            .and(Condition::has_attribute("definition").negate());
        let encoded = serde_json::to_string(&condition).unwrap();
        let decoded: Condition = serde_json::from_str(&encoded).unwrap();
        assert_eq!(condition, decoded);
    }

    #[test]
    fn condition_parses_from_tagged_document() {
        let raw = r#"{
            "type": "not",
            "condition": { "type": "attribute", "key": "definition", "comparator": "exists" }
        }"#;
        let condition: Condition = serde_json::from_str(raw).unwrap();
        assert_eq!(condition, Condition::has_attribute("definition").negate());
    }
}
