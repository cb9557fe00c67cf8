use std::fmt;

/// A literal ready to be spliced into generated SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Unquoted text form, used when values are concatenated.
    pub fn as_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => s.clone(),
        }
    }

    pub fn from_yaml(v: &serde_yaml::Value) -> Result<Self, String> {
        match v {
            serde_yaml::Value::Null => Ok(SqlValue::Null),
            serde_yaml::Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    if !f.is_finite() {
                        return Err(format!("{n} is not a finite number"));
                    }
                    Ok(SqlValue::Float(f))
                } else {
                    Err(format!("unsupported number: {n}"))
                }
            }
            serde_yaml::Value::String(s) => Ok(SqlValue::Text(s.clone())),
            other => Err(format!("unsupported constant: {other:?}")),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(true) => f.write_str("TRUE"),
            SqlValue::Bool(false) => f.write_str("FALSE"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}
