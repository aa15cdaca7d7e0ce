// src/value.rs
//
// Dynamically typed values carried on ports, parameters and block state.
//
// Lists and maps are reference-counted so that copying a block's state
// into its logic call is cheap, and so that "did this change?" checks can
// compare nested containers by identity instead of walking them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// String-keyed map of values (outputs, params, internal state).
pub type ValueMap = BTreeMap<String, Value>;

/// A value flowing through the control-rate graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Arc<Vec<Value>>),
    Map(Arc<ValueMap>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn map(entries: ValueMap) -> Self {
        Value::Map(Arc::new(entries))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "object",
        }
    }

    /// Truthiness as block scripts see it.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::List(_) | Value::Map(_) => true,
        }
    }

    /// Numeric coercion used by arithmetic. Non-numeric strings and
    /// containers become NaN.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::List(_) | Value::Map(_) => f64::NAN,
        }
    }

    /// Identity comparison: scalars by value, containers by reference.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// One-level comparison: lists element-wise by identity, maps by reference.
    pub fn shallow_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same(y)))
            }
            _ => self.same(other),
        }
    }
}

/// Shallow equality over two maps: same key set, values compared with
/// [`Value::shallow_eq`].
pub fn maps_shallow_eq(a: &ValueMap, b: &ValueMap) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((ka, va), (kb, vb))| ka == kb && va.shallow_eq(vb))
}

fn format_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_nan() {
        write!(f, "NaN")
    } else if n.is_infinite() {
        write!(f, "{}Infinity", if n < 0.0 { "-" } else { "" })
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => format_number(*n, f),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<ValueMap> for Value {
    fn from(entries: ValueMap) -> Self {
        Value::map(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_shallow_eq_compares_elements() {
        let a = Value::list(vec![1.into(), "x".into()]);
        let b = Value::list(vec![1.into(), "x".into()]);
        assert!(a.shallow_eq(&b));
        assert!(!a.same(&b));
    }

    #[test]
    fn test_nested_containers_compare_by_reference() {
        let inner = Value::list(vec![1.into()]);
        let a = Value::list(vec![inner.clone()]);
        let b = Value::list(vec![inner]);
        assert!(a.shallow_eq(&b));

        let c = Value::list(vec![Value::list(vec![1.into()])]);
        assert!(!a.shallow_eq(&c));

        let m1 = Value::map(ValueMap::new());
        let m2 = Value::map(ValueMap::new());
        assert!(!m1.shallow_eq(&m2));
        assert!(m1.shallow_eq(&m1.clone()));
    }

    #[test]
    fn test_maps_shallow_eq() {
        let mut a = ValueMap::new();
        a.insert("out".into(), 10.into());
        let mut b = a.clone();
        assert!(maps_shallow_eq(&a, &b));

        b.insert("out".into(), 11.into());
        assert!(!maps_shallow_eq(&a, &b));

        b.remove("out");
        assert!(!maps_shallow_eq(&a, &b));
    }

    #[test]
    fn test_display_numbers() {
        assert_eq!(Value::from(20).to_string(), "20");
        assert_eq!(Value::from(0.5).to_string(), "0.5");
        assert_eq!(Value::Number(f64::NAN).to_string(), "NaN");
    }

    #[test]
    fn test_json_round_trip_shape() {
        let v: Value = serde_json::from_str(r#"{"a": [1, true, null], "b": "s"}"#).unwrap();
        match &v {
            Value::Map(m) => {
                assert_eq!(m.get("b"), Some(&Value::from("s")));
                assert_eq!(
                    m.get("a"),
                    Some(&Value::list(vec![1.into(), true.into(), Value::Null]))
                );
            }
            other => panic!("expected map, got {:?}", other),
        }
    }
}
