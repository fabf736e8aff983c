use crate::instance::Instance;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A compiled regular expression as a first class value. Appears in typedef
/// constraints and as plugin arguments; equality and hashing go by pattern
/// text, not by automaton identity.
#[derive(Clone, Debug)]
pub struct RegexValue(Rc<regex::Regex>);

impl RegexValue {
    pub fn new(pattern: &str) -> Result<Self, String> {
        regex::Regex::new(pattern)
            .map(|r| RegexValue(Rc::new(r)))
            .map_err(|e| format!("invalid regular expression `{}`: {}", pattern, e))
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }

    pub fn pattern(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for RegexValue {
    fn eq(&self, other: &Self) -> bool {
        self.pattern() == other.pattern()
    }
}

/// The runtime value union.
///
/// `Unknown` is a first class member: it stands for "will only be decided by
/// a downstream system" and propagates through every operator and plugin
/// call. Instances compare by identity, everything else structurally.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Instance(Rc<Instance>),
    Unknown,
    Regex(RegexValue),
}

impl Value {
    pub fn string<S: Into<String>>(s: S) -> Self {
        Value::String(s.into())
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Rc<Instance>> {
        match self {
            Value::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Short type tag used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Instance(_) => "instance",
            Value::Unknown => "unknown",
            Value::Regex(_) => "regex",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            // numbers compare across the integer/float split
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (String(a), String(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Instance(a), Instance(b)) => Rc::ptr_eq(a, b),
            (Unknown, Unknown) => true,
            (Regex(a), Regex(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            // hash integral floats as their integer so `1 == 1.0` hashes alike
            Value::Int(i) => {
                state.write_u8(2);
                state.write_i64(*i);
            }
            Value::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::min_value() as f64 && *f <= i64::max_value() as f64
                {
                    state.write_u8(2);
                    state.write_i64(*f as i64);
                } else {
                    state.write_u8(3);
                    state.write_u64(f.to_bits());
                }
            }
            Value::String(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Value::List(items) => {
                state.write_u8(5);
                for item in items {
                    item.hash(state);
                }
            }
            Value::Instance(i) => {
                state.write_u8(6);
                state.write_u32(i.id());
            }
            Value::Unknown => state.write_u8(7),
            Value::Regex(r) => {
                state.write_u8(8);
                r.pattern().hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "'{}'", s),
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
            Value::Instance(i) => write!(f, "{}", i),
            Value::Unknown => write!(f, "<unknown>"),
            Value::Regex(r) => write!(f, "/{}/", r.pattern()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxhash::FxHashMap;

    #[test]
    fn numeric_equality_crosses_variants() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Float(1.5));
    }

    #[test]
    fn integral_floats_hash_as_ints() {
        let mut map = FxHashMap::default();
        map.insert(Value::Int(7), "seven");
        assert_eq!(map.get(&Value::Float(7.0)), Some(&"seven"));
    }

    #[test]
    fn regex_equality_by_pattern() {
        let a = RegexValue::new("^a+$").unwrap();
        let b = RegexValue::new("^a+$").unwrap();
        assert_eq!(Value::Regex(a), Value::Regex(b));
    }

    #[test]
    fn display_is_compact() {
        let v = Value::List(vec![Value::Int(1), Value::string("x")]);
        assert_eq!(v.to_string(), "[1, 'x']");
    }
}
