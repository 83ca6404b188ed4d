use std::collections::HashMap;

use serde_json::Map;
use serde_json::Value;

use crate::substitute::to_text;

/// Anything placeholders can be looked up in.
pub trait VariableSource {
    fn lookup(&self, name: &str) -> Option<&str>;
}

/// The run-wide variables. Seeded from `KEY=VALUE` definitions and grown by `set` commands;
/// nothing is ever rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    variables: HashMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions<I>(definitions: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            variables: definitions.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// A read-only view where `supplemental` shadows the persistent variables.
    pub fn overlay(&self, supplemental: HashMap<String, String>) -> Scope<'_> {
        Scope {
            base: self,
            supplemental,
        }
    }
}

impl VariableSource for Environment {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name)
    }
}

pub struct Scope<'a> {
    base: &'a Environment,
    supplemental: HashMap<String, String>,
}

impl VariableSource for Scope<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.supplemental
            .get(name)
            .map(String::as_str)
            .or_else(|| self.base.get(name))
    }
}

/// Turns response fields into variables. Every field is available under its own name, and
/// nested values additionally under dotted paths such as `json.user.id` or `json.items.0`.
pub fn response_variables(fields: &Map<String, Value>) -> HashMap<String, String> {
    let mut variables = HashMap::new();
    for (key, value) in fields {
        flatten_into(key.clone(), value, &mut variables);
    }
    variables
}

fn flatten_into(path: String, value: &Value, variables: &mut HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(format!("{path}.{key}"), nested, variables);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_into(format!("{path}.{index}"), nested, variables);
            }
        }
        _ => {}
    }

    variables.insert(path, to_text(value));
}
