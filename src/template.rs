use serde_json::Value;
use thiserror::Error;

use crate::parser::Item;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no item \"{0}\" found")]
    NotFound(String),

    #[error("inheritance cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("`inherit` of \"{0}\" must be the name of another item")]
    InvalidInherit(String),
}

/// Finds `name` in `collection` and applies its `inherit` chain.
///
/// The first item with a matching `name` wins. A parent's fields are copied and the child's
/// own fields are laid over them, top-level keys only.
pub fn resolve(collection: &[Item], name: &str) -> Result<Item, ResolveError> {
    resolve_chain(collection, name, &mut Vec::new())
}

fn resolve_chain(
    collection: &[Item],
    name: &str,
    chain: &mut Vec<String>,
) -> Result<Item, ResolveError> {
    if chain.iter().any(|seen| seen == name) {
        chain.push(name.to_string());
        return Err(ResolveError::Cycle(chain.clone()));
    }

    let item = find(collection, name).ok_or_else(|| ResolveError::NotFound(name.to_string()))?;

    let Some(parent) = item.get("inherit") else {
        return Ok(item.clone());
    };
    let Value::String(parent) = parent else {
        return Err(ResolveError::InvalidInherit(name.to_string()));
    };

    chain.push(name.to_string());
    let mut merged = resolve_chain(collection, parent, chain)?;
    for (key, value) in item {
        merged.insert(key.clone(), value.clone());
    }

    Ok(merged)
}

pub fn find<'a>(collection: &'a [Item], name: &str) -> Option<&'a Item> {
    collection
        .iter()
        .find(|item| item.get("name").and_then(Value::as_str) == Some(name))
}
