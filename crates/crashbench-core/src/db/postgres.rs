use super::{Connector, QueryResult, Row, Session, StatementOutcome};
use crate::config::PgEndpoint;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// Opens `tokio-postgres` sessions against one configured endpoint.
#[derive(Debug, Clone)]
pub struct PgConnector {
    label: String,
    endpoint: PgEndpoint,
}

impl PgConnector {
    pub fn new(label: impl Into<String>, endpoint: PgEndpoint) -> Self {
        Self {
            label: label.into(),
            endpoint,
        }
    }

    fn pg_config(&self, database: Option<&str>) -> tokio_postgres::Config {
        let mut cfg = tokio_postgres::Config::new();
        cfg.host(&self.endpoint.host);
        cfg.port(self.endpoint.port);
        cfg.user(&self.endpoint.user);
        if let Some(password) = &self.endpoint.password {
            cfg.password(password);
        }
        cfg.dbname(database.unwrap_or(&self.endpoint.database));
        cfg.application_name("crashbench");
        cfg
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, database: Option<&str>) -> anyhow::Result<Box<dyn Session>> {
        let cfg = self.pg_config(database);
        let (client, connection) = cfg.connect(NoTls).await.with_context(|| {
            format!(
                "failed to connect to {} ({}:{}/{})",
                self.label,
                self.endpoint.host,
                self.endpoint.port,
                database.unwrap_or(&self.endpoint.database)
            )
        })?;
        let label = self.label.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(target: "crashbench::db", connection = %label, error = %e, "connection closed");
            }
        });
        Ok(Box::new(PgSession { client }))
    }

    fn label(&self) -> &str {
        &self.label
    }
}

pub struct PgSession {
    client: Client,
}

#[async_trait]
impl Session for PgSession {
    async fn execute(&mut self, sql: &str) -> StatementOutcome {
        match self.client.simple_query(sql).await {
            Ok(messages) => StatementOutcome::Completed(collect_result(messages)),
            Err(e) => classify_error(&e),
        }
    }

    async fn backend_pid(&mut self) -> anyhow::Result<i32> {
        let messages = self
            .client
            .simple_query("SELECT pg_backend_pid()")
            .await
            .context("failed to query backend pid")?;
        let result = collect_result(messages);
        let raw = result
            .first_value()
            .context("pg_backend_pid() returned no rows")?;
        raw.parse::<i32>()
            .with_context(|| format!("invalid backend pid: {raw}"))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

fn collect_result(messages: Vec<SimpleQueryMessage>) -> QueryResult {
    let mut result = QueryResult::default();
    let mut columns: Option<Arc<[String]>> = None;
    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                let cols = columns
                    .get_or_insert_with(|| {
                        row.columns()
                            .iter()
                            .map(|c| c.name().to_string())
                            .collect::<Vec<_>>()
                            .into()
                    })
                    .clone();
                let values = (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect();
                result.rows.push(Row::new(cols, values));
            }
            SimpleQueryMessage::CommandComplete(n) => {
                // A multi-statement batch resets the column layout.
                columns = None;
                result.rows_affected = Some(n);
            }
            _ => {}
        }
    }
    result
}

/// Connection-exception (08xxx) and operator-intervention (57Pxx, sent when
/// the postmaster restarts after a backend crash) count as a lost
/// connection, as does any error without an SQLSTATE.
fn classify_error(e: &tokio_postgres::Error) -> StatementOutcome {
    if e.is_closed() {
        return StatementOutcome::ConnectionLost(e.to_string());
    }
    match e.code() {
        Some(state) if is_connection_state(state.code()) => {
            StatementOutcome::ConnectionLost(describe(e))
        }
        Some(_) => StatementOutcome::RejectedByDatabase(describe(e)),
        None => StatementOutcome::ConnectionLost(e.to_string()),
    }
}

fn is_connection_state(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("57P")
}

fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{}: {}", db.code().code(), db.message()),
        None => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_states() {
        assert!(is_connection_state("08006"));
        assert!(is_connection_state("57P01"));
        assert!(is_connection_state("57P02"));
        assert!(!is_connection_state("23505"));
        assert!(!is_connection_state("42601"));
        assert!(!is_connection_state("57014"));
    }

    #[test]
    fn test_pg_config_uses_override_database() {
        let connector = PgConnector::new(
            "primary",
            PgEndpoint {
                host: "db.local".into(),
                port: 5433,
                user: "bench".into(),
                password: None,
                database: "bench".into(),
            },
        );
        let cfg = connector.pg_config(Some("postgres"));
        assert_eq!(cfg.get_dbname(), Some("postgres"));
        assert_eq!(cfg.get_user(), Some("bench"));
        assert_eq!(cfg.get_ports(), &[5433]);

        let cfg = connector.pg_config(None);
        assert_eq!(cfg.get_dbname(), Some("bench"));
    }
}
