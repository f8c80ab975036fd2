use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Type alias for a HashMap representing key-value pairs of attributes.
///
/// Keys are strings representing attribute names.
///
/// # Examples
/// ```
/// # use flagpole::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("username".to_owned(), "john_doe".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of a person or group attribute, and of the value a property
/// condition compares against.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, `i64`, `bool`,
/// timestamps and lists.
///
/// Examples:
/// ```
/// # use flagpole::AttributeValue;
/// let string_attr: AttributeValue = "example".into();
/// let number_attr: AttributeValue = 42.0.into();
/// let bool_attr: AttributeValue = true.into();
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone, Default)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A point in time. Never produced by deserialization: date strings stay strings and are
    /// parsed by date operators.
    DateTime(Timestamp),
    /// A list of values.
    List(Vec<AttributeValue>),
    /// A null value.
    #[default]
    Null,
}

impl AttributeValue {
    /// Return the string slice if the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Numeric view used by ordering operators. Booleans count as `1` and `0`.
    pub(crate) fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Parse the value as a number, accepting numeric strings.
    pub(crate) fn parse_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String form used by string-based operators.
    ///
    /// Integral numbers render without a fractional part, so `18.0` compares equal to `"18"`.
    pub(crate) fn to_comparable_string(&self) -> String {
        match self {
            AttributeValue::String(s) => s.clone(),
            AttributeValue::Number(n) => format_number(*n),
            AttributeValue::Boolean(b) => b.to_string(),
            AttributeValue::DateTime(t) => t.to_rfc3339(),
            AttributeValue::List(values) => serde_json::to_string(values).unwrap_or_default(),
            AttributeValue::Null => "null".to_owned(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        (n as i64).to_string()
    } else {
        n.to_string()
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}
