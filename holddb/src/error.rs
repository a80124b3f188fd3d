use std::fmt;
use thiserror::Error;

/// Line/column of a node in a GraphQL document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
}

impl From<graphql_parser::Pos> for SourcePos {
    fn from(pos: graphql_parser::Pos) -> Self {
        SourcePos {
            line: pos.line,
            column: pos.column,
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Error, Debug)]
pub enum HoldError {
    #[error("invalid schema: {reason} at {position}")]
    SchemaValidation { reason: String, position: SourcePos },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("operation cancelled or deadline exceeded")]
    Cancelled,

    #[error("GraphQL parse error: {0}")]
    Parse(String),

    #[error("SQLite error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl HoldError {
    pub fn schema(reason: impl Into<String>, position: impl Into<SourcePos>) -> Self {
        HoldError::SchemaValidation {
            reason: reason.into(),
            position: position.into(),
        }
    }

    /// The human-readable reason of a schema validation error.
    pub fn reason(&self) -> Option<&str> {
        match self {
            HoldError::SchemaValidation { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HoldError>;
