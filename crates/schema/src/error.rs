//! Schema compilation errors.
//!
//! All schema failures are fatal: there is no recovery and no partial
//! output. Every variant carries the 1-based source line so tooling can
//! point at the offending declaration.

use thiserror::Error;

/// Result type alias for schema operations.
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Errors raised while tokenizing or compiling schema source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The schema format is space-indented; tabs are never valid.
    #[error("tab in leading whitespace at line {line}")]
    TabIndentation { line: usize },

    /// A line whose words match no schema construct.
    #[error("cannot parse schema line {line}: `{words}`")]
    Unclassified { line: usize, words: String },

    /// A structurally invalid declaration (wrong word count, duplicate
    /// name, empty block that requires children, ...).
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
}

impl SchemaError {
    pub(crate) fn unclassified(line: usize, words: &[String]) -> Self {
        Self::Unclassified {
            line,
            words: words.join(" "),
        }
    }

    pub(crate) fn malformed(line: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            message: message.into(),
        }
    }
}
