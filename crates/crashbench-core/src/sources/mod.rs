//! Statement generators behind `source:` jobs and data files.

pub mod sql_value;
pub mod template;

use crate::errors::BenchError;
use serde::Deserialize;

pub use sql_value::SqlValue;
pub use template::{GenerationContext, TemplateSpec};

/// One statement produced by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSql {
    pub sql: String,
    pub crash_test: Option<bool>,
}

/// Fixed list of statements.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlSourceSpec {
    pub sqls: Vec<String>,
    #[serde(default)]
    pub test_crash_safe: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum SourceSpec {
    Sql(SqlSourceSpec),
    Template(TemplateSpec),
}

impl SourceSpec {
    /// `kind` is the value of `source:`. The payload is read from the key
    /// named after the kind, or from the surrounding mapping when that key
    /// is absent.
    pub fn from_payload(kind: &str, doc: &serde_yaml::Mapping) -> Result<Self, String> {
        let payload = doc
            .get(kind)
            .cloned()
            .unwrap_or_else(|| serde_yaml::Value::Mapping(doc.clone()));
        match kind {
            "sql" => serde_yaml::from_value(payload)
                .map(SourceSpec::Sql)
                .map_err(|e| format!("invalid sql source: {e}")),
            "template" => serde_yaml::from_value(payload)
                .map(SourceSpec::Template)
                .map_err(|e| format!("invalid template source: {e}")),
            other => Err(format!("unsupported source: {other}")),
        }
    }

    /// Streams generated statements into `emit` in generation order.
    pub fn generate<F>(&self, ctx: &mut GenerationContext, emit: &mut F) -> Result<(), BenchError>
    where
        F: FnMut(GeneratedSql) -> Result<(), BenchError>,
    {
        match self {
            SourceSpec::Sql(spec) => {
                for sql in &spec.sqls {
                    emit(GeneratedSql {
                        sql: sql.clone(),
                        crash_test: spec.test_crash_safe,
                    })?;
                }
                Ok(())
            }
            SourceSpec::Template(spec) => spec.generate(ctx, emit),
        }
    }

    pub fn collect(&self, ctx: &mut GenerationContext) -> Result<Vec<GeneratedSql>, BenchError> {
        let mut out = Vec::new();
        self.generate(ctx, &mut |g| {
            out.push(g);
            Ok(())
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(yaml: &str) -> serde_yaml::Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_sql_source_payload_under_kind_key() {
        let doc = mapping("source: sql\nsql:\n  sqls: [\"SELECT 1\", \"SELECT 2\"]\n  test_crash_safe: false\n");
        let spec = SourceSpec::from_payload("sql", &doc).unwrap();
        let out = spec.collect(&mut GenerationContext::new(0, 0, None)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].sql, "SELECT 2");
        assert_eq!(out[0].crash_test, Some(false));
    }

    #[test]
    fn test_sql_source_payload_inline() {
        let doc = mapping("name: j\nsource: sql\nsqls: [\"DELETE FROM t\"]\n");
        let spec = SourceSpec::from_payload("sql", &doc).unwrap();
        let out = spec.collect(&mut GenerationContext::new(0, 0, None)).unwrap();
        assert_eq!(out[0].crash_test, None);
    }

    #[test]
    fn test_unknown_source() {
        let err = SourceSpec::from_payload("faker", &mapping("faker: {}")).unwrap_err();
        assert!(err.contains("unsupported source: faker"));
    }
}
