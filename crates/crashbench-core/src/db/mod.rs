//! Narrow database interface used by the engine.
//!
//! A [`Connector`] opens [`Session`]s against one endpoint. Sessions speak the
//! simple text protocol: a statement goes out as SQL text and comes back as
//! text rows, so the engine never depends on column types.

pub mod postgres;

use async_trait::async_trait;
use std::sync::Arc;

pub use postgres::{PgConnector, PgSession};

/// One result row; values are the server's text representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)?.as_deref()
    }

    pub fn get_idx(&self, idx: usize) -> Option<&str> {
        self.values.get(idx)?.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    /// Rows reported by the last command tag, when the server sent one.
    pub rows_affected: Option<u64>,
}

impl QueryResult {
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.get_idx(0)
    }
}

/// What happened to one statement. A lost connection is data, not an error:
/// the crash protocol branches on it.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Completed(QueryResult),
    ConnectionLost(String),
    RejectedByDatabase(String),
}

#[async_trait]
pub trait Session: Send {
    async fn execute(&mut self, sql: &str) -> StatementOutcome;

    /// Server process id serving this session.
    async fn backend_pid(&mut self) -> anyhow::Result<i32>;

    /// True once the session is known to be unusable.
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a session; `database` overrides the configured database name.
    async fn connect(&self, database: Option<&str>) -> anyhow::Result<Box<dyn Session>>;

    /// Short label used in logs and error messages ("primary", "reference").
    fn label(&self) -> &str;
}
