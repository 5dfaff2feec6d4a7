//! S-expression values exchanged with the editor and the evaluator.
//!
//! Symbols are kept distinct from strings: `swank:eval` decodes to
//! `Value::Symbol`, `"swank:eval"` to `Value::String`. Keywords are symbols
//! whose name starts with `:`.

mod printer;
mod reader;

use std::fmt;

pub use printer::encode;
pub use reader::{SexpError, decode, decode_bytes};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    T,
    Integer(i64),
    Float(f64),
    String(String),
    Symbol(String),
    List(Vec<Value>),
}

impl Value {
    pub fn symbol(name: impl Into<String>) -> Self {
        Value::Symbol(name.into())
    }

    /// Keyword symbol; the leading `:` is added when missing.
    pub fn keyword(name: &str) -> Self {
        if name.starts_with(':') {
            Value::Symbol(name.to_string())
        } else {
            Value::Symbol(format!(":{}", name))
        }
    }

    pub fn string(text: impl Into<String>) -> Self {
        Value::String(text.into())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn bool(flag: bool) -> Self {
        if flag { Value::T } else { Value::Nil }
    }

    /// Property list `(:key value ...)`.
    pub fn plist<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let mut items = Vec::new();
        for (key, value) in entries {
            items.push(Value::keyword(key));
            items.push(value);
        }
        Value::List(items)
    }

    pub fn is_nil(&self) -> bool {
        match self {
            Value::Nil => true,
            Value::List(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Value::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// List items; `nil` is the empty list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            Value::Nil => Some(&[]),
            _ => None,
        }
    }

    /// Strip one level of `(quote x)`.
    pub fn unquote(&self) -> &Value {
        match self.as_list() {
            Some([Value::Symbol(head), inner]) if head.eq_ignore_ascii_case("quote") => inner,
            _ => self,
        }
    }

    /// Text shown to a user: strings without quotes, everything else printed.
    pub fn display_text(&self) -> String {
        match self {
            Value::String(text) => text.clone(),
            other => encode(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::String(text)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::bool(flag)
    }
}
