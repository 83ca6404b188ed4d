use std::sync::LazyLock;

use regex::Regex;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

use crate::environment::VariableSource;

/// `{name}`, where the name is anything up to the next closing brace.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("placeholder pattern is valid"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubstituteError {
    #[error("undefined variable `{0}`")]
    UndefinedVariable(String),
}

/// Replaces placeholders throughout `value`.
///
/// Mappings and sequences keep their shape. Scalars come back as the substituted *string*,
/// so `200` becomes `"200"`. `null` is left alone.
pub fn substitute<V>(value: &Value, variables: &V) -> Result<Value, SubstituteError>
where
    V: VariableSource + ?Sized,
{
    match value {
        Value::Object(fields) => fields
            .iter()
            .map(|(key, nested)| Ok((key.clone(), substitute(nested, variables)?)))
            .collect::<Result<Map<String, Value>, SubstituteError>>()
            .map(Value::Object),
        Value::Array(items) => items
            .iter()
            .map(|nested| substitute(nested, variables))
            .collect::<Result<Vec<Value>, SubstituteError>>()
            .map(Value::Array),
        Value::Null => Ok(Value::Null),
        scalar => substitute_str(&to_text(scalar), variables).map(Value::String),
    }
}

pub fn substitute_str<V>(text: &str, variables: &V) -> Result<String, SubstituteError>
where
    V: VariableSource + ?Sized,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for captures in PLACEHOLDER.captures_iter(text) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };

        let name = inner.as_str().trim();
        let value = variables
            .lookup(name)
            .ok_or_else(|| SubstituteError::UndefinedVariable(name.to_string()))?;

        out.push_str(&text[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }

    out.push_str(&text[last..]);
    Ok(out)
}

/// String form of a value: strings verbatim, everything else as compact JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// What kind of value this is, for error messages.
pub fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
