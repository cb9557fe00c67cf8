use crate::oracle::DatabaseDump;

/// Fatal conditions of a benchmark run. None of these is recovered from:
/// each one unwinds the worker that hit it and then the whole scenario.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// The database rejected a statement for a reason unrelated to a crash.
    #[error("statement rejected by {target}: {message}")]
    Statement { target: String, message: String },

    /// The primary could not be reached (again) in time.
    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Unsupported job/source kind or malformed scenario description.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BenchError {
    pub fn statement(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("PGroonga data is different after crash ({} actual dumps, {} expected dumps)", actual.len(), expected.len())]
    DumpMismatch {
        actual: Vec<DatabaseDump>,
        expected: Vec<DatabaseDump>,
    },

    #[error("index is broken: {index_column}")]
    IndexBroken {
        index_column: String,
        diff: serde_json::Value,
    },

    #[error("failed to run index_column_diff: {index_column}")]
    IndexCommandFailed {
        index_column: String,
        response: serde_json::Value,
    },
}

impl VerifyError {
    /// Everything needed to diagnose the failure offline.
    pub fn diagnostics(&self) -> serde_json::Value {
        match self {
            VerifyError::DumpMismatch { actual, expected } => serde_json::json!({
                "kind": "dump_mismatch",
                "actual_dumps": actual,
                "expected_dumps": expected,
            }),
            VerifyError::IndexBroken { index_column, diff } => serde_json::json!({
                "kind": "index_broken",
                "index_column_name": index_column,
                "index_column_diff": diff,
            }),
            VerifyError::IndexCommandFailed {
                index_column,
                response,
            } => serde_json::json!({
                "kind": "index_command_failed",
                "index_column_name": index_column,
                "index_column_diff": response,
            }),
        }
    }
}

/// Finds a `BenchError` anywhere in an `anyhow` chain.
pub fn find_bench_error(err: &anyhow::Error) -> Option<&BenchError> {
    err.chain().find_map(|e| e.downcast_ref::<BenchError>())
}
