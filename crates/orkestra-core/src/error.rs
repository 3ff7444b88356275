use thiserror::Error;

/// Top-level error type for the Orkestra workspace.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum OrkestraError {
    /// A task graph failed validation (dangling dependency or cycle).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A task could not be dispatched to any executor.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// The sandbox runtime failed to set up or run a task.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// The forensic ledger could not be written or read.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// A message bus operation was rejected.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the orchestration kernel.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`OrkestraError`].
pub type OrkestraResult<T> = Result<T, OrkestraError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        let err = OrkestraError::Validation("cycle detected".into());
        assert_eq!(err.to_string(), "Validation error: cycle detected");

        let err = OrkestraError::Sandbox("docker missing".into());
        assert!(err.to_string().starts_with("Sandbox error"));
    }

    #[test]
    fn test_from_json_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: OrkestraError = parse.unwrap_err().into();
        assert!(matches!(err, OrkestraError::Json(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "ledger.jsonl");
        let err: OrkestraError = io.into();
        assert!(err.to_string().contains("ledger.jsonl"));
    }
}
