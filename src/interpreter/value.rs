use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Runtime value manipulated by generated statements.
///
/// Every variant is plain data so a [`Namespace`] can be written into a
/// checkpoint and read back without loss. Agents are referenced by id only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "ValueRepr")]
pub enum Value {
    /// Absence of a value.
    None,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed mapping.
    Dict(BTreeMap<String, Value>),
    /// Reference to a live agent, resolved through the program registry.
    AgentRef(String),
}

impl Value {
    /// Python-style type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::AgentRef(_) => "agent",
        }
    }

    /// Truthiness as used by `if`, `while`, `and`, `or`, `not`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(flag) => *flag,
            Value::Int(num) => *num != 0,
            Value::Float(num) => *num != 0.0,
            Value::Str(text) => !text.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            Value::AgentRef(_) => true,
        }
    }

    /// Borrow the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(num) => Some(*num),
            Value::Bool(flag) => Some(i64::from(*flag)),
            _ => None,
        }
    }

    /// Render the value the way `repr()` would (strings quoted).
    pub fn repr(&self) -> String {
        match self {
            Value::Str(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(num) => write!(f, "{}", num),
            Value::Float(num) => {
                if num.fract() == 0.0 && num.is_finite() {
                    write!(f, "{:.1}", num)
                } else {
                    write!(f, "{}", num)
                }
            }
            Value::Str(text) => write!(f, "{}", text),
            Value::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.repr())?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (idx, (key, item)) in map.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}': {}", key, item.repr())?;
                }
                write!(f, "}}")
            }
            Value::AgentRef(id) => write!(f, "<agent {}>", id),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Str(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Str(text)
    }
}

impl From<i64> for Value {
    fn from(num: i64) -> Self {
        Value::Int(num)
    }
}

/// Wire form of [`Value`]: externally tagged, so both codecs decode it
/// without self-description, and with non-finite floats spelled out since
/// JSON has no literal for them.
#[derive(Deserialize)]
#[serde(rename = "Value")]
enum ValueRepr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    NonFinite(String),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    AgentRef(String),
}

impl From<ValueRepr> for Value {
    fn from(repr: ValueRepr) -> Self {
        match repr {
            ValueRepr::None => Value::None,
            ValueRepr::Bool(flag) => Value::Bool(flag),
            ValueRepr::Int(num) => Value::Int(num),
            ValueRepr::Float(num) => Value::Float(num),
            ValueRepr::NonFinite(text) => Value::Float(match text.as_str() {
                "inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                _ => f64::NAN,
            }),
            ValueRepr::Str(text) => Value::Str(text),
            ValueRepr::List(items) => Value::List(items),
            ValueRepr::Dict(map) => Value::Dict(map),
            ValueRepr::AgentRef(id) => Value::AgentRef(id),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_unit_variant("Value", 0, "None"),
            Value::Bool(flag) => serializer.serialize_newtype_variant("Value", 1, "Bool", flag),
            Value::Int(num) => serializer.serialize_newtype_variant("Value", 2, "Int", num),
            Value::Float(num) if num.is_finite() => {
                serializer.serialize_newtype_variant("Value", 3, "Float", num)
            }
            Value::Float(num) => {
                let text = if num.is_nan() {
                    "nan"
                } else if num.is_sign_positive() {
                    "inf"
                } else {
                    "-inf"
                };
                serializer.serialize_newtype_variant("Value", 4, "NonFinite", text)
            }
            Value::Str(text) => serializer.serialize_newtype_variant("Value", 5, "Str", text),
            Value::List(items) => serializer.serialize_newtype_variant("Value", 6, "List", items),
            Value::Dict(map) => serializer.serialize_newtype_variant("Value", 7, "Dict", map),
            Value::AgentRef(id) => serializer.serialize_newtype_variant("Value", 8, "AgentRef", id),
        }
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Bool(flag)
    }
}

/// Local variable environment of one in-flight oracle turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace {
    vars: BTreeMap<String, Value>,
}

impl Namespace {
    /// Create an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Mutable lookup, used for in-place container updates.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.vars.get_mut(name)
    }

    /// Bind a variable, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Remove a binding.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// Whether a variable is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the namespace is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }
}

impl FromIterator<(String, Value)> for Namespace {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_python_style() {
        let value = Value::List(vec![Value::Int(1), Value::from("a"), Value::None]);
        assert_eq!(value.to_string(), "[1, 'a', None]");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Bool(true).to_string(), "True");
    }

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::List(vec![Value::None]).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::AgentRef("1000".into()).is_truthy());
    }

    #[test]
    fn namespace_serializes_as_plain_map() {
        let mut ns = Namespace::new();
        ns.set("x", Value::Int(10));
        let json = serde_json::to_value(&ns).unwrap();
        assert_eq!(json["x"]["Int"], 10);
    }

    #[test]
    fn non_finite_floats_survive_json() {
        let mut ns = Namespace::new();
        ns.set("up", Value::Float(f64::INFINITY));
        ns.set("down", Value::Float(f64::NEG_INFINITY));
        ns.set("odd", Value::Float(f64::NAN));
        let text = serde_json::to_string(&ns).unwrap();
        assert!(!text.contains("null"));

        let back: Namespace = serde_json::from_str(&text).unwrap();
        assert_eq!(back.get("up"), Some(&Value::Float(f64::INFINITY)));
        assert_eq!(back.get("down"), Some(&Value::Float(f64::NEG_INFINITY)));
        assert!(matches!(back.get("odd"), Some(Value::Float(num)) if num.is_nan()));
    }
}
