//! Consistency oracle for the PGroonga backing store.
//!
//! A dump is the `pgroonga_command('dump')` output restricted to record
//! content, with the internal `Sources<oid>` table names replaced by the
//! relation names they belong to, so two clusters holding the same data
//! compare equal even though their OIDs differ.

use crate::db::{QueryResult, Session, StatementOutcome};
use crate::errors::{BenchError, VerifyError};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Normalized content export. Equality is byte equality of the text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DatabaseDump(String);

impl DatabaseDump {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DatabaseDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDiffStatus {
    Ok,
    /// The column was dropped concurrently; not a failure.
    MissingColumn,
    Inconsistent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDiffResult {
    pub index_name: String,
    pub status: IndexDiffStatus,
    pub diff_payload: serde_json::Value,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn dump(&self, session: &mut dyn Session) -> Result<DatabaseDump, BenchError>;

    /// One result per key column of every index owned by the extension.
    async fn diff_indexes(
        &self,
        session: &mut dyn Session,
    ) -> Result<Vec<IndexDiffResult>, BenchError>;
}

/// Post-crash content check: the primary's before/after pair must share at
/// least one state with the reference's before/after pair.
pub fn verify_dumps(actual: &[DatabaseDump], expected: &[DatabaseDump]) -> Result<(), VerifyError> {
    if actual.iter().any(|a| expected.contains(a)) {
        return Ok(());
    }
    Err(VerifyError::DumpMismatch {
        actual: actual.to_vec(),
        expected: expected.to_vec(),
    })
}

pub fn verify_index_diffs(results: &[IndexDiffResult]) -> Result<(), VerifyError> {
    for r in results {
        match r.status {
            IndexDiffStatus::Ok => {}
            IndexDiffStatus::MissingColumn => {
                tracing::debug!(index = %r.index_name, "skipping index column that no longer exists");
            }
            IndexDiffStatus::Inconsistent => {
                return Err(VerifyError::IndexBroken {
                    index_column: r.index_name.clone(),
                    diff: r.diff_payload.clone(),
                })
            }
        }
    }
    Ok(())
}

const PGROONGA_RELATIONS_SQL: &str = "SELECT oid, relname FROM pg_catalog.pg_class \
 WHERE relam IN (SELECT oid FROM pg_catalog.pg_am WHERE amname = 'pgroonga')";

const PGROONGA_INDEXES_SQL: &str = "SELECT indexrelid, indnkeyatts \
  FROM pg_catalog.pg_index \
 WHERE indexrelid IN ( \
         SELECT oid FROM pg_catalog.pg_class \
          WHERE relam IN ( \
                  SELECT oid FROM pg_catalog.pg_am WHERE amname = 'pgroonga'))";

const MISSING_COLUMN_MESSAGE: &str = "column doesn't exist";

/// [`Oracle`] backed by `pgroonga_command`.
#[derive(Debug, Clone, Default)]
pub struct PgroongaOracle;

impl PgroongaOracle {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Oracle for PgroongaOracle {
    async fn dump(&self, session: &mut dyn Session) -> Result<DatabaseDump, BenchError> {
        let relations = query(session, PGROONGA_RELATIONS_SQL).await?;
        let mut table_exprs = Vec::new();
        let mut table_map = HashMap::new();
        for row in &relations.rows {
            let (Some(oid), Some(name)) = (row.get("oid"), row.get("relname")) else {
                continue;
            };
            table_exprs.push(format!("pgroonga_table_name('{}')", escape_literal(name)));
            table_map.insert(format!("Sources{oid}"), name.to_string());
        }
        if table_exprs.is_empty() {
            return Ok(DatabaseDump::default());
        }
        table_exprs.sort();

        let sql = format!(
            "SELECT pgroonga_command('dump', ARRAY[\
             'dump_plugins', 'no', \
             'dump_schema', 'no', \
             'dump_indexes', 'no', \
             'dump_configs', 'no', \
             'sort_hash_table', 'yes', \
             'tables', {}]) AS dump",
            table_exprs.join(" || ', ' || ")
        );
        let result = query(session, &sql).await?;
        let raw = result.first_value().unwrap_or_default();
        Ok(normalize_dump(raw, &table_map))
    }

    async fn diff_indexes(
        &self,
        session: &mut dyn Session,
    ) -> Result<Vec<IndexDiffResult>, BenchError> {
        let indexes = query(session, PGROONGA_INDEXES_SQL).await?;
        let mut column_exprs = Vec::new();
        for row in &indexes.rows {
            let Some(oid) = row.get("indexrelid") else {
                continue;
            };
            let n_keys: usize = row
                .get("indnkeyatts")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            for i in 0..n_keys {
                column_exprs.push(format!(
                    "pgroonga_index_column_name({oid}::regclass::text::cstring, {i})"
                ));
            }
        }

        let mut results = Vec::with_capacity(column_exprs.len());
        for expr in column_exprs {
            let sql = format!(
                "SELECT pgroonga_command('index_column_diff', ARRAY[\
                 'table', split_part({expr}, '.', 1), \
                 'name', split_part({expr}, '.', 2)]) AS index_column_diff"
            );
            let result = query(session, &sql).await?;
            let raw = result.first_value().unwrap_or("null");
            let response: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                BenchError::Verify(VerifyError::IndexCommandFailed {
                    index_column: expr.clone(),
                    response: serde_json::Value::String(format!("unparsable response ({e}): {raw}")),
                })
            })?;
            results.push(classify_index_diff(&expr, response)?);
        }
        Ok(results)
    }
}

async fn query(session: &mut dyn Session, sql: &str) -> Result<QueryResult, BenchError> {
    match session.execute(sql).await {
        StatementOutcome::Completed(r) => Ok(r),
        StatementOutcome::ConnectionLost(msg) => Err(BenchError::Connection(format!(
            "connection lost while inspecting PGroonga: {msg}"
        ))),
        StatementOutcome::RejectedByDatabase(msg) => Err(BenchError::statement("oracle", msg)),
    }
}

/// Response shape: `[[return_code, start, elapsed, message?, ...], body]`.
pub fn classify_index_diff(
    index_name: &str,
    response: serde_json::Value,
) -> Result<IndexDiffResult, VerifyError> {
    let header = response.get(0);
    let return_code = header.and_then(|h| h.get(0)).and_then(|c| c.as_i64());
    if return_code != Some(0) {
        let message = header
            .and_then(|h| h.get(3))
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        if message.contains(MISSING_COLUMN_MESSAGE) {
            return Ok(IndexDiffResult {
                index_name: index_name.to_string(),
                status: IndexDiffStatus::MissingColumn,
                diff_payload: response,
            });
        }
        return Err(VerifyError::IndexCommandFailed {
            index_column: index_name.to_string(),
            response,
        });
    }
    let body_empty = match response.get(1) {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::Array(a)) => a.is_empty(),
        Some(serde_json::Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    };
    Ok(IndexDiffResult {
        index_name: index_name.to_string(),
        status: if body_empty {
            IndexDiffStatus::Ok
        } else {
            IndexDiffStatus::Inconsistent
        },
        diff_payload: response,
    })
}

fn sources_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Sources\d+").expect("static regex"))
}

/// Rewrites `Sources<oid>` to relation names on `load --table` lines only;
/// record values elsewhere must stay byte-exact.
pub fn normalize_dump(raw: &str, table_map: &HashMap<String, String>) -> DatabaseDump {
    let mut out = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        if line.starts_with("load --table") {
            let replaced = sources_pattern().replace_all(line, |caps: &regex::Captures<'_>| {
                let name = &caps[0];
                table_map.get(name).cloned().unwrap_or_else(|| name.to_string())
            });
            out.push_str(&replaced);
        } else {
            out.push_str(line);
        }
    }
    DatabaseDump(out)
}

fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Row;
    use std::sync::Arc;

    /// Answers by the first registered substring that the SQL contains.
    struct ScriptedSession {
        answers: Vec<(&'static str, StatementOutcome)>,
        seen: Vec<String>,
    }

    fn rows(columns: &[&str], data: &[&[&str]]) -> StatementOutcome {
        let cols: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect::<Vec<_>>().into();
        StatementOutcome::Completed(QueryResult {
            rows: data
                .iter()
                .map(|r| Row::new(cols.clone(), r.iter().map(|v| Some(v.to_string())).collect()))
                .collect(),
            rows_affected: Some(data.len() as u64),
        })
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn execute(&mut self, sql: &str) -> StatementOutcome {
            self.seen.push(sql.to_string());
            self.answers
                .iter()
                .find(|(needle, _)| sql.contains(needle))
                .map(|(_, o)| o.clone())
                .unwrap_or_else(|| StatementOutcome::RejectedByDatabase(format!("unexpected: {sql}")))
        }

        async fn backend_pid(&mut self) -> anyhow::Result<i32> {
            Ok(1)
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_normalize_only_load_lines() {
        let mut map = HashMap::new();
        map.insert("Sources16384".to_string(), "memos".to_string());
        let raw = "load --table Sources16384\n[\n[\"_key\",\"content\"],\n[\"Sources16384\",\"x\"]\n]\n";
        let dump = normalize_dump(raw, &map);
        assert_eq!(
            dump.as_str(),
            "load --table memos\n[\n[\"_key\",\"content\"],\n[\"Sources16384\",\"x\"]\n]\n"
        );
    }

    #[test]
    fn test_verify_dumps_intersection() {
        let a = DatabaseDump::new("a");
        let b = DatabaseDump::new("b");
        let c = DatabaseDump::new("c");
        assert!(verify_dumps(&[a.clone(), b.clone()], &[b.clone(), c.clone()]).is_ok());
        match verify_dumps(&[a.clone()], &[b.clone(), c.clone()]) {
            Err(VerifyError::DumpMismatch { actual, expected }) => {
                assert_eq!(actual, vec![a]);
                assert_eq!(expected, vec![b, c]);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_column_is_skipped() {
        let response = serde_json::json!([[-22, 0.0, 0.0, "[index-column-diff] column doesn't exist: <Lexicon.index>"], []]);
        let r = classify_index_diff("memos.content", response).unwrap();
        assert_eq!(r.status, IndexDiffStatus::MissingColumn);
        assert!(verify_index_diffs(&[r]).is_ok());
    }

    #[test]
    fn test_nonempty_diff_is_inconsistent() {
        let response = serde_json::json!([[0, 0.0, 0.0], [{"token": {"id": 1, "value": "groonga"}, "remains": [1]}]]);
        let r = classify_index_diff("memos.content", response).unwrap();
        assert_eq!(r.status, IndexDiffStatus::Inconsistent);
        let err = verify_index_diffs(&[r]).unwrap_err();
        assert!(matches!(err, VerifyError::IndexBroken { ref index_column, .. } if index_column == "memos.content"));
    }

    #[test]
    fn test_failed_command_is_verify_error() {
        let response = serde_json::json!([[-63, 0.0, 0.0, "[index-column-diff] invalid"], []]);
        let err = classify_index_diff("memos.content", response).unwrap_err();
        assert!(matches!(err, VerifyError::IndexCommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_dump_without_tables_issues_no_command() {
        let mut session = ScriptedSession {
            answers: vec![("pg_catalog.pg_class", rows(&["oid", "relname"], &[]))],
            seen: vec![],
        };
        let dump = PgroongaOracle::new().dump(&mut session).await.unwrap();
        assert!(dump.is_empty());
        assert_eq!(session.seen.len(), 1);
    }

    #[tokio::test]
    async fn test_dump_requests_content_only() {
        let mut session = ScriptedSession {
            answers: vec![
                ("'dump'", rows(&["dump"], &[&["load --table Sources17000\n[\n[\"_key\"],\n[\"a\"]\n]\n"]])),
                (
                    "pg_catalog.pg_class",
                    rows(&["oid", "relname"], &[&["17000", "pgroonga_memos_index"]]),
                ),
            ],
            seen: vec![],
        };
        let dump = PgroongaOracle::new().dump(&mut session).await.unwrap();
        assert!(dump.as_str().starts_with("load --table pgroonga_memos_index\n"));
        let cmd = &session.seen[1];
        for opt in ["'dump_plugins', 'no'", "'dump_schema', 'no'", "'dump_indexes', 'no'", "'dump_configs', 'no'"] {
            assert!(cmd.contains(opt), "{cmd}");
        }
        assert!(cmd.contains("pgroonga_table_name('pgroonga_memos_index')"));
    }

    #[tokio::test]
    async fn test_diff_indexes_per_key_column() {
        let mut session = ScriptedSession {
            answers: vec![
                ("index_column_diff", rows(&["index_column_diff"], &[&["[[0,0.0,0.0],[]]"]])),
                ("pg_catalog.pg_index", rows(&["indexrelid", "indnkeyatts"], &[&["17000", "2"]])),
            ],
            seen: vec![],
        };
        let results = PgroongaOracle::new().diff_indexes(&mut session).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == IndexDiffStatus::Ok));
        assert!(results[1].index_name.contains("17000::regclass::text::cstring, 1"));
    }
}
