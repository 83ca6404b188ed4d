use std::collections::HashSet;

use miette::Diagnostic;
use miette::NamedSource;
use miette::SourceSpan;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::parser::ApiQuest;
use crate::parser::Item;
use crate::parser::TestEntry;

/// Structural checks that can be made before anything runs. Whether names resolve is left
/// to the run itself, so earlier tests still get their turn.
pub struct Validator<'a> {
    config: &'a ApiQuest,
    src: &'a str,
    file_name: &'a str,
}

#[derive(Debug, Error, Diagnostic)]
#[error("Invalid field `{field}`: {message}")]
pub struct ValidationError {
    field: String,
    message: String,
    #[source_code]
    src: Option<NamedSource<String>>,
    #[label("invalid value here")]
    span: Option<SourceSpan>,
}

macro_rules! validation_err {
    ($field:expr, $msg:expr, $self:expr, $snippet:expr) => {
        ValidationError {
            field: $field.to_string(),
            message: $msg.to_string(),
            src: Some(NamedSource::new(
                $self.file_name.to_string(),
                $self.src.to_string(),
            )),
            span: $snippet.and_then(|snippet: &str| find_span(snippet, $self.src)),
        }
    };
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a ApiQuest, src: &'a str, file_name: &'a str) -> Self {
        Self {
            config,
            src,
            file_name,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        for (index, request) in self.config.requests.iter().enumerate() {
            let field = format!("requests[{index}]");

            let Some(Value::String(name)) = request.get("name") else {
                return Err(validation_err!(
                    format!("{field}.name"),
                    "every request needs a string `name`",
                    self,
                    request.get("url").and_then(Value::as_str)
                ));
            };

            if !names.insert(name.as_str()) {
                warn!(request = %name, "duplicate request name, the first one wins");
            }

            self.check_item(&field, request)?;
        }

        let mut names = HashSet::new();
        for (index, entry) in self.config.tests.iter().enumerate() {
            let TestEntry::Inline(test) = entry else {
                continue;
            };
            let field = format!("tests[{index}]");

            match test.get("name") {
                None | Some(Value::Null) => {}
                Some(Value::Object(_) | Value::Array(_)) => {
                    return Err(validation_err!(
                        format!("{field}.name"),
                        "a test name must be a plain value",
                        self,
                        None::<&str>
                    ));
                }
                Some(name) => {
                    if let Some(name) = name.as_str()
                        && !names.insert(name)
                    {
                        warn!(test = %name, "duplicate test name, the first one wins");
                    }
                }
            }

            self.check_item(&field, test)?;
        }

        Ok(())
    }

    fn check_item(&self, field: &str, item: &Item) -> Result<(), ValidationError> {
        match item.get("inherit") {
            None | Some(Value::String(_)) => Ok(()),
            Some(other) => {
                let mut err = validation_err!(
                    format!("{field}.inherit"),
                    format!("`inherit` must be the name of another item, got {other}"),
                    self,
                    None::<&str>
                );
                err.span = self.key_span(item, "inherit");
                Err(err)
            }
        }
    }

    /// Locates `key` within `item`, searching from where the item's name appears.
    fn key_span(&self, item: &Item, key: &str) -> Option<SourceSpan> {
        let from = item
            .get("name")
            .and_then(Value::as_str)
            .and_then(|name| self.src.find(name))
            .unwrap_or(0);

        find_span(key, &self.src[from..])
            .map(|span| SourceSpan::new((span.offset() + from).into(), span.len()))
    }
}

fn find_span(needle: &str, src: &str) -> Option<SourceSpan> {
    src.find(needle)
        .map(|start| SourceSpan::new(start.into(), needle.len()))
}
