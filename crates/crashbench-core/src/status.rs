use anyhow::Context;
use std::path::{Path, PathBuf};

pub const STATUS_FILE: &str = "status.yaml";

/// Small persisted key/value store that lets a run resume without
/// re-running the prepare phase.
#[derive(Debug, Clone)]
pub struct Status {
    path: PathBuf,
    data: serde_yaml::Mapping,
}

impl Status {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(STATUS_FILE);
        let data = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if text.trim().is_empty() {
                serde_yaml::Mapping::new()
            } else {
                serde_yaml::from_str(&text)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
        } else {
            serde_yaml::Mapping::new()
        };
        Ok(Self { path, data })
    }

    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.data.get(key)
    }

    pub fn is_prepared(&self) -> bool {
        self.get("prepared")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn update(&mut self, key: &str, value: serde_yaml::Value) -> anyhow::Result<()> {
        self.data.insert(key.into(), value);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(&self.data)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub fn mark_prepared(&mut self) -> anyhow::Result<()> {
        self.update("prepared", serde_yaml::Value::Bool(true))
    }
}
