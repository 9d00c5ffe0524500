//! Axis values, declared value types and value domains.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value read from or written to an axis.
///
/// Serialized untagged so records read naturally (`0`, `1.5`, `"fast"`).
/// `Int` is listed first so integral JSON numbers round-trip as integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisValue {
    /// Integral quantity (counts, indices, enum codes)
    Int(i64),
    /// Floating point quantity (positions, powers)
    Float(f64),
    /// Free text or a named choice
    Str(String),
}

impl AxisValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AxisValue::Int(v) => Some(*v as f64),
            AxisValue::Float(v) => Some(*v),
            AxisValue::Str(_) => None,
        }
    }

    /// Short name of the variant, used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            AxisValue::Int(_) => "int",
            AxisValue::Float(_) => "float",
            AxisValue::Str(_) => "str",
        }
    }
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Int(v) => write!(f, "{}", v),
            AxisValue::Float(v) => write!(f, "{}", v),
            AxisValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for AxisValue {
    fn from(value: f64) -> Self {
        AxisValue::Float(value)
    }
}

impl From<i64> for AxisValue {
    fn from(value: i64) -> Self {
        AxisValue::Int(value)
    }
}

impl From<&str> for AxisValue {
    fn from(value: &str) -> Self {
        AxisValue::Str(value.to_string())
    }
}

impl From<String> for AxisValue {
    fn from(value: String) -> Self {
        AxisValue::Str(value)
    }
}

/// Declared type of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Floating point; integers are accepted and widened
    #[default]
    Float,
    /// Integers only
    Int,
    /// Free text
    Str,
    /// One of a declared list of values (requires [`Domain::Choices`])
    Choice,
}

/// Optional restriction on the values an axis accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Exhaustive list of permitted values
    Choices(Vec<AxisValue>),
    /// Inclusive numeric limits
    Limits {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
}

impl ValueType {
    /// Coerce `value` into this type, or explain why it does not fit.
    ///
    /// `Float` widens `Int`; every other combination must match exactly.
    /// `Choice` accepts any variant and defers to the domain.
    pub fn coerce(&self, value: &AxisValue) -> Result<AxisValue, String> {
        match (self, value) {
            (ValueType::Float, AxisValue::Float(_))
            | (ValueType::Int, AxisValue::Int(_))
            | (ValueType::Str, AxisValue::Str(_))
            | (ValueType::Choice, _) => Ok(value.clone()),
            (ValueType::Float, AxisValue::Int(v)) => Ok(AxisValue::Float(*v as f64)),
            (expected, got) => Err(format!(
                "expected {:?} value, got {} '{}'",
                expected,
                got.type_name(),
                got
            )),
        }
    }
}

impl Domain {
    /// Check that `value` lies inside the domain.
    pub fn check(&self, value: &AxisValue) -> Result<(), String> {
        match self {
            Domain::Choices(choices) => {
                if choices.contains(value) {
                    Ok(())
                } else {
                    let listed: Vec<String> = choices.iter().map(ToString::to_string).collect();
                    Err(format!(
                        "'{}' is not one of [{}]",
                        value,
                        listed.join(", ")
                    ))
                }
            }
            Domain::Limits { min, max } => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| format!("'{}' is not numeric", value))?;
                if !v.is_finite() {
                    Err(format!("{} is not a finite number", v))
                } else if v < *min || v > *max {
                    Err(format!("{} is outside limits [{}, {}]", v, min, max))
                } else {
                    Ok(())
                }
            }
        }
    }
}
