use serde_json::Value;
use thiserror::Error;

static NULL: Value = Value::Null;

/// Top-level error type for the Strand graph engine.
///
/// Schema, validation, and auth failures carry a human message plus
/// structured context so callers can report exactly what was rejected.
#[derive(Error, Debug)]
pub enum StrandError {
    #[error("Schema error: {message}")]
    Schema { message: String, context: Value },

    #[error("Validation error: {message}")]
    Validation { message: String, context: Value },

    #[error("Authorization error: {message}")]
    Auth { message: String, context: Value },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StrandError {
    pub fn schema(message: impl Into<String>, context: Value) -> Self {
        Self::Schema {
            message: message.into(),
            context,
        }
    }

    pub fn validation(message: impl Into<String>, context: Value) -> Self {
        Self::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn auth(message: impl Into<String>, context: Value) -> Self {
        Self::Auth {
            message: message.into(),
            context,
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema",
            Self::Validation { .. } => "validation",
            Self::Auth { .. } => "auth",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Structured context, `Null` for variants without any.
    pub fn context(&self) -> &Value {
        match self {
            Self::Schema { context, .. }
            | Self::Validation { context, .. }
            | Self::Auth { context, .. } => context,
            _ => &NULL,
        }
    }
}

impl From<config::ConfigError> for StrandError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_are_distinct() {
        let v = StrandError::validation("bad", json!({ "prop": "age" }));
        let a = StrandError::auth("denied", Value::Null);
        assert_eq!(v.kind(), "validation");
        assert_eq!(a.kind(), "auth");
        assert_eq!(v.context()["prop"], "age");
        assert_eq!(v.to_string(), "Validation error: bad");
    }
}
