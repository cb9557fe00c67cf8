//! Template record generator.
//!
//! Each table template lists its columns as tagged expressions which are
//! evaluated by a tiny interpreter, one record at a time:
//!
//! ```yaml
//! source: template
//! template:
//!   tables:
//!     - table: memos
//!       n_records: {min: 1, max: 3}
//!       primary_keys: [id]
//!       update_columns: [content]
//!       columns:
//!         id: {concat: [{constant: "memo-"}, try, "-", job, "-", {counter: memos}]}
//!         content: {constant: "PGroonga is fast"}
//!       sub_records:
//!         - table: tags
//!           columns:
//!             memo_id: {parent: id}
//!             tag: {constant: "groonga"}
//! ```

use super::{GeneratedSql, SqlValue};
use crate::errors::BenchError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub tables: Vec<TableTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableTemplate {
    pub table: String,
    #[serde(default)]
    pub n_records: RecordCount,
    #[serde(deserialize_with = "ordered_columns")]
    pub columns: Vec<(String, FieldExpr)>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub update_columns: Vec<String>,
    #[serde(default)]
    pub test_crash_safe: Option<bool>,
    #[serde(default)]
    pub sub_records: Vec<TableTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecordCount {
    Fixed(u64),
    Range { min: u64, max: u64 },
}

impl Default for RecordCount {
    fn default() -> Self {
        RecordCount::Fixed(1)
    }
}

/// A column value expression.
///
/// Written as a bare word (`try`, `job`) or a single-key mapping
/// (`{counter: name}`); parsed by hand from the YAML value so the same
/// syntax works wherever the template is embedded.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldExpr {
    Constant(SqlValue),
    /// Next value of a named counter, starting at 0.
    Counter(String),
    /// Current try ordinal of the scenario.
    Try,
    /// Ordinal of the job within the scenario.
    Job,
    /// Value of a column of the parent record.
    Parent(String),
    /// Value of another column of the same record.
    Field(String),
    Concat(Vec<ConcatPart>),
}

/// `concat` accepts bare strings as literal pieces.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcatPart {
    Expr(FieldExpr),
    Literal(String),
}

impl FieldExpr {
    pub fn from_yaml(v: &serde_yaml::Value) -> Result<Self, String> {
        use serde_yaml::Value;
        match v {
            Value::String(word) => match word.as_str() {
                "try" => Ok(FieldExpr::Try),
                "job" => Ok(FieldExpr::Job),
                other => Err(format!("unknown expression: {other}")),
            },
            Value::Mapping(m) if m.len() == 1 => {
                let Some((key, arg)) = m.iter().next() else {
                    return Err("empty expression".into());
                };
                let key = key
                    .as_str()
                    .ok_or_else(|| format!("expression name must be a string: {key:?}"))?;
                let name_arg = || {
                    arg.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| format!("{key} expects a name"))
                };
                match key {
                    "constant" => SqlValue::from_yaml(arg).map(FieldExpr::Constant),
                    "counter" => Ok(FieldExpr::Counter(name_arg()?)),
                    "parent" => Ok(FieldExpr::Parent(name_arg()?)),
                    "field" => Ok(FieldExpr::Field(name_arg()?)),
                    "concat" => {
                        let items = arg
                            .as_sequence()
                            .ok_or_else(|| "concat expects a list".to_string())?;
                        items
                            .iter()
                            .map(|item| match item {
                                Value::String(s) if s != "try" && s != "job" => {
                                    Ok(ConcatPart::Literal(s.clone()))
                                }
                                other => FieldExpr::from_yaml(other).map(ConcatPart::Expr),
                            })
                            .collect::<Result<Vec<_>, _>>()
                            .map(FieldExpr::Concat)
                    }
                    other => Err(format!("unknown expression: {other}")),
                }
            }
            other => Err(format!("expected an expression, got {other:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for FieldExpr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let v = serde_yaml::Value::deserialize(deserializer)?;
        FieldExpr::from_yaml(&v).map_err(D::Error::custom)
    }
}

fn ordered_columns<'de, D>(deserializer: D) -> Result<Vec<(String, FieldExpr)>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
    let mut out = Vec::with_capacity(mapping.len());
    for (k, v) in mapping {
        let name = k
            .as_str()
            .ok_or_else(|| D::Error::custom("column names must be strings"))?
            .to_string();
        let expr = FieldExpr::from_yaml(&v)
            .map_err(|e| D::Error::custom(format!("column {name}: {e}")))?;
        out.push((name, expr));
    }
    Ok(out)
}

/// Per-job generation state: ordinals, counters and the RNG.
pub struct GenerationContext {
    pub nth_try: usize,
    pub nth_job: usize,
    counters: HashMap<String, i64>,
    rng: StdRng,
}

impl GenerationContext {
    /// With a seed, the same (seed, try, job) always generates the same
    /// statements.
    pub fn new(nth_try: usize, nth_job: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => {
                let mixed = seed
                    ^ (nth_try as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
                    ^ (nth_job as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
                StdRng::seed_from_u64(mixed)
            }
            None => StdRng::from_entropy(),
        };
        Self {
            nth_try,
            nth_job,
            counters: HashMap::new(),
            rng,
        }
    }

    fn next_counter(&mut self, name: &str) -> i64 {
        let slot = self.counters.entry(name.to_string()).or_insert(0);
        let v = *slot;
        *slot += 1;
        v
    }
}

/// One generated record; values are evaluated lazily and memoized.
struct Record<'a> {
    columns: &'a [(String, FieldExpr)],
    parent: Option<&'a Record<'a>>,
    values: HashMap<String, SqlValue>,
    evaluating: HashSet<String>,
}

impl<'a> Record<'a> {
    fn new(columns: &'a [(String, FieldExpr)], parent: Option<&'a Record<'a>>) -> Self {
        Self {
            columns,
            parent,
            values: HashMap::new(),
            evaluating: HashSet::new(),
        }
    }

    fn get(&mut self, name: &str, ctx: &mut GenerationContext) -> Result<SqlValue, String> {
        if let Some(v) = self.values.get(name) {
            return Ok(v.clone());
        }
        let columns = self.columns;
        let expr = columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
            .ok_or_else(|| format!("unknown column: {name}"))?;
        if !self.evaluating.insert(name.to_string()) {
            return Err(format!("circular reference through column: {name}"));
        }
        let value = self.eval(expr, ctx);
        self.evaluating.remove(name);
        let value = value.map_err(|e| format!("failed to evaluate {name}: {e}"))?;
        self.values.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Parent values are read from the already-evaluated parent record.
    fn parent_value(&self, name: &str) -> Result<SqlValue, String> {
        let parent = self
            .parent
            .ok_or_else(|| format!("parent column {name} referenced without a parent record"))?;
        parent
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| format!("parent record has no column: {name}"))
    }

    fn eval(&mut self, expr: &FieldExpr, ctx: &mut GenerationContext) -> Result<SqlValue, String> {
        match expr {
            FieldExpr::Constant(v) => Ok(v.clone()),
            FieldExpr::Counter(name) => Ok(SqlValue::Integer(ctx.next_counter(name))),
            FieldExpr::Try => Ok(SqlValue::Integer(ctx.nth_try as i64)),
            FieldExpr::Job => Ok(SqlValue::Integer(ctx.nth_job as i64)),
            FieldExpr::Parent(name) => self.parent_value(name),
            FieldExpr::Field(name) => self.get(name, ctx),
            FieldExpr::Concat(parts) => {
                let mut s = String::new();
                for part in parts {
                    match part {
                        ConcatPart::Literal(lit) => s.push_str(lit),
                        ConcatPart::Expr(e) => s.push_str(&self.eval(e, ctx)?.as_text()),
                    }
                }
                Ok(SqlValue::Text(s))
            }
        }
    }

    fn evaluate_all(&mut self, ctx: &mut GenerationContext) -> Result<Vec<SqlValue>, String> {
        let columns = self.columns;
        columns
            .iter()
            .map(|(name, _)| self.get(name, ctx))
            .collect()
    }
}

impl TemplateSpec {
    pub fn generate<F>(&self, ctx: &mut GenerationContext, emit: &mut F) -> Result<(), BenchError>
    where
        F: FnMut(GeneratedSql) -> Result<(), BenchError>,
    {
        for table in &self.tables {
            generate_table(table, None, ctx, emit)?;
        }
        Ok(())
    }
}

fn generate_table<F>(
    table: &TableTemplate,
    parent: Option<&Record<'_>>,
    ctx: &mut GenerationContext,
    emit: &mut F,
) -> Result<(), BenchError>
where
    F: FnMut(GeneratedSql) -> Result<(), BenchError>,
{
    let fail = |e: String| BenchError::config(format!("table {}: {}", table.table, e));

    let n_records = match table.n_records {
        RecordCount::Fixed(n) => n,
        RecordCount::Range { min, max } if min <= max => ctx.rng.gen_range(min..=max),
        RecordCount::Range { min, max } => {
            return Err(fail(format!("n_records.min {min} > n_records.max {max}")))
        }
    };

    let column_names: Vec<&str> = table.columns.iter().map(|(n, _)| n.as_str()).collect();
    for _ in 0..n_records {
        let mut record = Record::new(&table.columns, parent);
        let values = record.evaluate_all(ctx).map_err(fail)?;
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        emit(GeneratedSql {
            sql: format!(
                "INSERT INTO {} ({})\n  VALUES ({})\n  ON CONFLICT DO NOTHING;\n",
                table.table,
                column_names.join(", "),
                values.join(", ")
            ),
            crash_test: table.test_crash_safe,
        })?;

        if !table.primary_keys.is_empty() && !table.update_columns.is_empty() {
            let mut update = Record::new(&table.columns, parent);
            let mut assignments = Vec::with_capacity(table.update_columns.len());
            for name in &table.update_columns {
                assignments.push(format!("{} = {}", name, update.get(name, ctx).map_err(fail)?));
            }
            let mut conditions = Vec::with_capacity(table.primary_keys.len());
            for name in &table.primary_keys {
                conditions.push(format!("{} = {}", name, record.get(name, ctx).map_err(fail)?));
            }
            emit(GeneratedSql {
                sql: format!(
                    "UPDATE {} SET {}\n  WHERE {};\n",
                    table.table,
                    assignments.join(", "),
                    conditions.join(" AND ")
                ),
                crash_test: table.test_crash_safe,
            })?;
        }

        for sub in &table.sub_records {
            generate_table(sub, Some(&record), ctx, emit)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> TemplateSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn run(spec: &TemplateSpec, ctx: &mut GenerationContext) -> Vec<String> {
        let mut out = Vec::new();
        spec.generate(ctx, &mut |g| {
            out.push(g.sql);
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_insert_with_counters_and_ordinals() {
        let s = spec(
            r#"
tables:
  - table: memos
    n_records: 2
    columns:
      id: {concat: ["m-", try, "-", job, "-", {counter: memos}]}
      title: {constant: "it's"}
"#,
        );
        let out = run(&s, &mut GenerationContext::new(1, 4, Some(7)));
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            "INSERT INTO memos (id, title)\n  VALUES ('m-1-4-0', 'it''s')\n  ON CONFLICT DO NOTHING;\n"
        );
        assert!(out[1].contains("'m-1-4-1'"));
    }

    #[test]
    fn test_sibling_and_parent_references() {
        let s = spec(
            r#"
tables:
  - table: users
    columns:
      name: {field: id}
      id: {counter: users}
    sub_records:
      - table: posts
        n_records: 2
        columns:
          user_id: {parent: id}
          seq: {counter: posts}
"#,
        );
        let out = run(&s, &mut GenerationContext::new(0, 0, None));
        assert_eq!(out.len(), 3);
        // `name` refers to `id`, so `id` takes the first counter value.
        assert!(out[0].contains("VALUES (0, 0)"), "{}", out[0]);
        assert!(out[1].contains("VALUES (0, 0)"), "{}", out[1]);
        assert!(out[2].contains("VALUES (0, 1)"), "{}", out[2]);
    }

    #[test]
    fn test_update_follows_insert() {
        let s = spec(
            r#"
tables:
  - table: memos
    primary_keys: [id]
    update_columns: [content]
    columns:
      id: {counter: id}
      content: {concat: ["v", {counter: version}]}
"#,
        );
        let out = run(&s, &mut GenerationContext::new(0, 0, None));
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], "UPDATE memos SET content = 'v1'\n  WHERE id = 0;\n");
    }

    #[test]
    fn test_non_finite_constant_is_rejected() {
        for literal in [".nan", ".inf", "-.inf"] {
            let yaml = format!("tables:\n  - table: t\n    columns:\n      a: {{constant: {literal}}}\n");
            let err = serde_yaml::from_str::<TemplateSpec>(&yaml).unwrap_err();
            assert!(err.to_string().contains("not a finite number"), "{err}");
        }
    }

    #[test]
    fn test_circular_reference_is_error() {
        let s = spec(
            r#"
tables:
  - table: t
    columns:
      a: {field: b}
      b: {field: a}
"#,
        );
        let err = s
            .generate(&mut GenerationContext::new(0, 0, None), &mut |_| Ok(()))
            .unwrap_err();
        assert!(err.to_string().contains("circular"), "{err}");
    }

    #[test]
    fn test_seeded_range_is_deterministic() {
        let s = spec(
            r#"
tables:
  - table: t
    n_records: {min: 1, max: 50}
    columns:
      a: {counter: a}
"#,
        );
        let a = run(&s, &mut GenerationContext::new(2, 3, Some(42))).len();
        let b = run(&s, &mut GenerationContext::new(2, 3, Some(42))).len();
        assert_eq!(a, b);
        assert!((1..=50).contains(&a));
    }
}
