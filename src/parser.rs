use std::ops::Range;
use std::path::Path;

use miette::Diagnostic;
use miette::NamedSource;
use miette::SourceSpan;
use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;

/// A request or test definition: a `name`, an optional `inherit` and any other fields.
pub type Item = Map<String, Value>;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ApiQuest {
    #[serde(default)]
    pub requests: Vec<Item>,
    #[serde(default)]
    pub tests: Vec<TestEntry>,
}

/// An entry of the `tests` sequence. A bare string refers to another test by name.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum TestEntry {
    Named(String),
    Inline(Item),
}

impl ApiQuest {
    /// The inline test definitions, which are the ones a test name can resolve to.
    pub fn test_items(&self) -> Vec<Item> {
        self.tests
            .iter()
            .filter_map(|entry| match entry {
                TestEntry::Inline(item) => Some(item.clone()),
                TestEntry::Named(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Toml,
}

impl Format {
    /// `.json` and `.toml` are picked by extension, everything else is read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Format::Json,
            Some("toml") => Format::Toml,
            _ => Format::Yaml,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("Failed to read config file `{path}`")]
    FileError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format:?} config: {message}")]
    Syntax {
        format: Format,
        message: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("here")]
        span: Option<SourceSpan>,
    },
}

/// A loaded configuration together with the text it came from.
pub struct Document {
    pub config: ApiQuest,
    pub source: String,
    pub path: String,
}

pub fn load(path: &str) -> Result<Document, LoadError> {
    let source = std::fs::read_to_string(path).map_err(|source| LoadError::FileError {
        path: path.to_string(),
        source,
    })?;

    let config = parse(&source, Format::from_path(Path::new(path)), path)?;

    Ok(Document {
        config,
        source,
        path: path.to_string(),
    })
}

pub fn parse(source: &str, format: Format, file_name: &str) -> Result<ApiQuest, LoadError> {
    let syntax_error = |message: String, span: Option<SourceSpan>| LoadError::Syntax {
        format,
        message,
        src: NamedSource::new(file_name, source.to_string()),
        span,
    };

    match format {
        Format::Yaml => serde_yaml::from_str(source).map_err(|e| {
            let span = e.location().map(|loc| SourceSpan::new(loc.index().into(), 1));
            syntax_error(e.to_string(), span)
        }),
        Format::Json => serde_json::from_str(source).map_err(|e| {
            let span = line_column_offset(source, e.line(), e.column())
                .map(|offset| SourceSpan::new(offset.into(), 1));
            syntax_error(e.to_string(), span)
        }),
        Format::Toml => toml::from_str(source).map_err(|e| {
            let span = e.span().map(|Range { start, end }| {
                SourceSpan::new(start.into(), end.saturating_sub(start).max(1))
            });
            syntax_error(e.message().to_string(), span)
        }),
    }
}

/// Byte offset of a 1-based line/column position.
fn line_column_offset(source: &str, line: usize, column: usize) -> Option<usize> {
    if line == 0 {
        return None;
    }

    let line_start: usize = source
        .split_inclusive('\n')
        .take(line - 1)
        .map(str::len)
        .sum();

    Some((line_start + column.saturating_sub(1)).min(source.len()))
}
