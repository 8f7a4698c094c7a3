//! Cache value types

use serde::{Deserialize, Serialize};

/// Payload stored under a cache key (JSON-compatible)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  #[default]
  Null,
  String(String),
  Integer(i64),
  Json(serde_json::Value),
}

impl Value {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  /// Numeric view used by incr/decr; numeric strings count
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Integer(i) => Some(*i),
      Value::String(s) => s.parse().ok(),
      _ => None,
    }
  }
}

impl std::fmt::Display for Value {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Null => Ok(()),
      Value::String(s) => write!(f, "{}", s),
      Value::Integer(i) => write!(f, "{}", i),
      Value::Json(v) => write!(f, "{}", v),
    }
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::String(s)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.to_string())
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Value::Integer(i)
  }
}

impl From<serde_json::Value> for Value {
  fn from(v: serde_json::Value) -> Self {
    match v {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          Value::Integer(i)
        } else {
          Value::Json(serde_json::Value::Number(n))
        }
      }
      serde_json::Value::String(s) => Value::String(s),
      other => Value::Json(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_as_i64() {
    assert_eq!(Value::Integer(42).as_i64(), Some(42));
    assert_eq!(Value::String("42".to_string()).as_i64(), Some(42));
    assert_eq!(Value::String("nope".to_string()).as_i64(), None);
    assert_eq!(Value::Null.as_i64(), None);
  }

  #[test]
  fn test_from_json() {
    let v: Value = serde_json::json!(7).into();
    assert_eq!(v, Value::Integer(7));

    let v: Value = serde_json::json!({"a": 1}).into();
    assert!(matches!(v, Value::Json(_)));

    let v: Value = serde_json::Value::Null.into();
    assert_eq!(v, Value::Null);
  }

  #[test]
  fn test_display() {
    assert_eq!(Value::String("hello".to_string()).to_string(), "hello");
    assert_eq!(Value::Integer(42).to_string(), "42");
    assert_eq!(Value::Null.to_string(), "");
  }
}
