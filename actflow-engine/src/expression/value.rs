// Expression values
// Typed value algebra with an explicit `Undefined` sentinel for missing lookups

use indexmap::IndexMap;

use std::cmp::Ordering;
use std::fmt;

/// A value produced by expression evaluation.
///
/// `Undefined` is what a well-formed lookup of a missing key yields. It behaves
/// like `null` under coercion, so `undefined == ''` holds, but callers can still
/// tell "absent" apart from an explicit `null`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    /// Numeric coercion: null-likes are 0, booleans 1/0, blank strings 0,
    /// anything unparseable is NaN.
    pub fn as_number(&self) -> f64 {
        match self {
            Value::Undefined | Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else if let Some(hex) = trimmed.strip_prefix("0x") {
                    i64::from_str_radix(hex, 16)
                        .map(|n| n as f64)
                        .unwrap_or(f64::NAN)
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Array(_) | Value::Object(_) => f64::NAN,
        }
    }

    /// String coercion used by interpolation and string functions.
    pub fn as_string(&self) -> String {
        match self {
            Value::Undefined | Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => self.to_json_string(),
        }
    }

    /// Property lookup. Exact match first, then case-insensitive.
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(map) => map
                .get(key)
                .or_else(|| {
                    map.iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(key))
                        .map(|(_, v)| v)
                })
                .cloned()
                .unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    /// Loose equality: mismatched primitive types are compared as numbers,
    /// strings compare case-insensitively.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self.normalized(), other.normalized()) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
            (a @ (Value::Array(_) | Value::Object(_)), b) => a == b,
            (a, b @ (Value::Array(_) | Value::Object(_))) => a == b,
            (a, b) => {
                let (x, y) = (a.as_number(), b.as_number());
                x == y
            }
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`. `None` when the operands are not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self.normalized(), other.normalized()) {
            (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
            (a, b) if a.is_primitive() && b.is_primitive() => {
                a.as_number().partial_cmp(&b.as_number())
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(&self.to_json()).unwrap_or_default()
    }

    fn normalized(&self) -> Value {
        match self {
            Value::Undefined => Value::Null,
            other => other.clone(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.fract() == 0.0 && n.abs() < 9.0e15 {
        (n as i64).to_string()
    } else {
        n.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from(&json)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
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

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Value>> FromIterator<(String, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        Value::Object(iter.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_is_truthy() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
        assert!(Value::String("false".into()).is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
    }

    #[test]
    fn test_undefined_equals_empty_string() {
        assert!(Value::Undefined.loosely_equals(&Value::String(String::new())));
        assert!(Value::Undefined.loosely_equals(&Value::Null));
        assert!(!Value::Undefined.loosely_equals(&Value::String("x".into())));
    }

    #[test]
    fn test_loose_equality_coerces_to_numbers() {
        assert!(Value::Number(5.0).loosely_equals(&Value::String("5".into())));
        assert!(Value::Bool(true).loosely_equals(&Value::Number(1.0)));
        assert!(Value::String("ABC".into()).loosely_equals(&Value::String("abc".into())));
        assert!(!Value::String("abc".into()).loosely_equals(&Value::Number(0.0)));
    }

    #[test]
    fn test_as_string_formats_integers() {
        assert_eq!(Value::Number(5.0).as_string(), "5");
        assert_eq!(Value::Number(2.5).as_string(), "2.5");
        assert_eq!(Value::Undefined.as_string(), "");
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let obj: Value = vec![("Ref".to_string(), "main")].into_iter().collect();
        assert_eq!(obj.get("ref"), Value::String("main".into()));
        assert_eq!(obj.get("missing"), Value::Undefined);
        assert_eq!(Value::Number(1.0).get("x"), Value::Undefined);
    }

    #[test]
    fn test_compare() {
        assert_eq!(
            Value::Number(2.0).compare(&Value::String("10".into())),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Array(vec![]).compare(&Value::Number(1.0)), None);
    }
}
