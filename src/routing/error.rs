//! Routing Compiler Errors

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while compiling a routing policy. All of them are fatal at
/// startup: a control plane never starts with a broken policy.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// Malformed policy text
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// Referenced external data file does not exist
    #[error("{kind} list '{name}' not found under {}", dir.display())]
    NotFound {
        kind: String,
        name: String,
        dir: PathBuf,
    },

    /// External data file exists but cannot be parsed
    #[error("failed to parse {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    /// Policy is well-formed but cannot be turned into a matcher
    #[error("failed to build matcher: {0}")]
    Build(String),
}

impl RoutingError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }
}
