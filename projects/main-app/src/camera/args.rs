use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered settings map handed to a capture program. `None` marks a key that
/// is present but unset; it never reaches the command line.
pub type ArgMap = IndexMap<String, Option<ArgValue>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(value) => write!(f, "{value}"),
            ArgValue::Int(value) => write!(f, "{value}"),
            ArgValue::Float(value) => write!(f, "{value}"),
            ArgValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Text(value.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Text(value)
    }
}

/// Turns a settings map into `--key value` / `--flag` tokens in map order.
pub fn encode(settings: &ArgMap) -> Vec<String> {
    let mut tokens = Vec::with_capacity(settings.len() * 2);
    for (key, value) in settings {
        match value {
            None | Some(ArgValue::Bool(false)) => {}
            Some(ArgValue::Bool(true)) => tokens.push(format!("--{key}")),
            Some(value) => {
                tokens.push(format!("--{key}"));
                tokens.push(value.to_string());
            }
        }
    }
    tokens
}
