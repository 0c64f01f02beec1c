//! Tagged runtime values for template evaluation.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;

/// A value produced while evaluating an expression.
///
/// `Undefined` carries the dotted path that failed to resolve, so that an
/// error raised later can name the missing variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A name or path that did not resolve.
    Undefined(String),
    /// Explicit null.
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Convert from the JSON interchange value.
    pub fn from_json(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::None,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Str(s.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON. `None` is returned for undefined values.
    pub fn to_json(&self) -> Option<JsonValue> {
        Some(match self {
            Value::Undefined(_) => return None,
            Value::None => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|v| v.to_json())
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                JsonValue::Object(out)
            }
        })
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined(_))
    }

    /// Truthiness as a conditional sees it. Undefined is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined(_) | Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined(_) => "undefined",
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "mapping",
        }
    }

    /// Numeric view, for arithmetic and ordering.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality used by `==` and `in`. Ints and floats compare numerically.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            _ => self == other,
        }
    }

    /// Ordering for `<`, `>` and friends; only numbers and strings order.
    pub fn partial_order(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined(_) => Ok(()),
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(_) | Value::Map(_) => match self.to_json() {
                Some(json) => write!(f, "{}", json),
                None => Ok(()),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_preserves_structure() {
        let json = json!({"name": "web", "ports": [80, 443], "tls": true, "ratio": 0.5});
        let value = Value::from_json(&json);
        assert!(matches!(value, Value::Map(_)));
        assert_eq!(value.to_json(), Some(json));
    }

    #[test]
    fn test_undefined_does_not_convert() {
        let value = Value::List(vec![Value::Int(1), Value::Undefined("x".into())]);
        assert_eq!(value.to_json(), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined("x".into()).is_truthy());
        assert!(!Value::None.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::Int(2).is_truthy());
        assert!(Value::Str("no".into()).is_truthy());
    }

    #[test]
    fn test_loose_equality_and_ordering() {
        assert!(Value::Int(1).loose_eq(&Value::Float(1.0)));
        assert!(!Value::Int(1).loose_eq(&Value::Str("1".into())));
        assert_eq!(
            Value::Str("a".into()).partial_order(&Value::Str("b".into())),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(1).partial_order(&Value::Str("b".into())), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::Int(8080).to_string(), "8080");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Str("a".into())]).to_string(),
            "[1,\"a\"]"
        );
        assert_eq!(Value::Undefined("x".into()).to_string(), "");
    }
}
