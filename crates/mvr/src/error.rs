//! Error types for the data mover.

use thiserror::Error;

/// Main error type for move operations.
#[derive(Error, Debug)]
pub enum MvrError {
    /// Configuration error (missing env var, invalid YAML, bad URL, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection pool construction failure.
    #[error("Connect error: {message}\n  Context: {context}")]
    Connect { message: String, context: String },

    /// The zero-row preflight query failed.
    #[error("Preflight failed: {0}")]
    Preflight(String),

    /// Mid-query failure or row-scan failure.
    #[error("Stream error: {0}")]
    Stream(String),

    /// A value could not be coerced to the destination canonical type.
    #[error("Encode error for column {column}: {message}")]
    Encode { column: String, message: String },

    /// File open, blob upload, or flush failed.
    #[error("Sink error: {0}")]
    Sink(String),

    /// The run was cancelled externally (signal or parent context).
    #[error("Run cancelled")]
    Cancelled,

    /// Errors from close/flush steps, joined with any primary error.
    #[error("Teardown error: {0}")]
    Teardown(String),

    /// PostgreSQL driver error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// SQL Server driver error.
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MvrError {
    /// Create a Connect error with context about where it occurred.
    pub fn connect(message: impl Into<String>, context: impl Into<String>) -> Self {
        MvrError::Connect {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create an Encode error for a specific column.
    pub fn encode(column: impl Into<String>, message: impl Into<String>) -> Self {
        MvrError::Encode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Exit code for the CLI, one per error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            MvrError::Config(_) | MvrError::Yaml(_) | MvrError::Json(_) => 2,
            MvrError::Connect { .. } => 3,
            MvrError::Preflight(_) => 4,
            MvrError::Stream(_) | MvrError::Postgres(_) | MvrError::Mssql(_) => 5,
            MvrError::Encode { .. } => 6,
            MvrError::Sink(_) | MvrError::Io(_) => 7,
            MvrError::Cancelled => 8,
            MvrError::Teardown(_) => 9,
        }
    }

    /// Format error with full details including the error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Join a teardown error onto a primary error without losing either.
    pub fn join_teardown(primary: Option<MvrError>, teardown: MvrError) -> MvrError {
        match primary {
            Some(p) => MvrError::Teardown(format!("{}; during teardown: {}", p, teardown)),
            None => teardown,
        }
    }
}

/// Result type alias for move operations.
pub type Result<T> = std::result::Result<T, MvrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinct_per_class() {
        assert_eq!(MvrError::Config("x".into()).exit_code(), 2);
        assert_eq!(MvrError::connect("x", "y").exit_code(), 3);
        assert_eq!(MvrError::Preflight("x".into()).exit_code(), 4);
        assert_eq!(MvrError::Stream("x".into()).exit_code(), 5);
        assert_eq!(MvrError::encode("c", "m").exit_code(), 6);
        assert_eq!(MvrError::Sink("x".into()).exit_code(), 7);
        assert_eq!(MvrError::Cancelled.exit_code(), 8);
        assert_eq!(MvrError::Teardown("x".into()).exit_code(), 9);
    }

    #[test]
    fn test_join_teardown_keeps_primary() {
        let primary = MvrError::Stream("query died".into());
        let joined =
            MvrError::join_teardown(Some(primary), MvrError::Teardown("flush failed".into()));
        let msg = joined.to_string();
        assert!(msg.contains("query died"));
        assert!(msg.contains("flush failed"));
    }

    #[test]
    fn test_join_teardown_without_primary() {
        let joined = MvrError::join_teardown(None, MvrError::Teardown("close failed".into()));
        assert!(matches!(joined, MvrError::Teardown(_)));
    }
}
