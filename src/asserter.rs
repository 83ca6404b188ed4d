use core::fmt;
use std::fmt::Display;

use serde_json::Value;
use thiserror::Error;

use crate::substitute::to_text;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum Mismatch {
    #[error("key {path} missing from response")]
    Missing { path: String },

    #[error("key {path} not matching")]
    NotEqual {
        path: String,
        expected: String,
        actual: String,
    },
}

impl Mismatch {
    pub fn path(&self) -> &str {
        match self {
            Mismatch::Missing { path } | Mismatch::NotEqual { path, .. } => path,
        }
    }
}

/// Checks that everything in `expected` is present and equal in `actual`.
///
/// Mappings are partial: extra keys in `actual` are ignored. Any other value is compared by
/// its string form, so `200` and `"200"` are equal. Stops at the first mismatch.
pub fn compare(expected: &Value, actual: &Value, path: &str) -> Result<(), Mismatch> {
    let Value::Object(fields) = expected else {
        let expected = to_text(expected);
        let actual = to_text(actual);

        if expected != actual {
            return Err(Mismatch::NotEqual {
                path: path.to_string(),
                expected,
                actual,
            });
        }

        return Ok(());
    };

    for (key, expected_value) in fields {
        let path = format!("{path}.{key}");

        let Some(actual_value) = actual.as_object().and_then(|actual| actual.get(key)) else {
            return Err(Mismatch::Missing { path });
        };

        compare(expected_value, actual_value, &path)?;
    }

    Ok(())
}

/// Multi-line, colored explanation of a mismatch.
pub struct MismatchReport<'a>(pub &'a Mismatch);

impl Display for MismatchReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Mismatch::Missing { path } => write!(
                f,
                "  {} {}",
                console::style(path).yellow().bold(),
                console::style("is missing from the response").red(),
            ),
            Mismatch::NotEqual {
                path,
                expected,
                actual,
            } => write!(
                f,
                "  {}\n    Expected: {}\n    Actual:   {}",
                console::style(path).yellow().bold(),
                console::style(expected).green(),
                console::style(actual).red(),
            ),
        }
    }
}
