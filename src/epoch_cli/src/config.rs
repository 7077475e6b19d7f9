use anyhow::{Context, Result};
use epoch_vm::RunConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// On-disk execution configuration, TOML or JSON by file extension.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileRunConfig {
    pub stack_bytes: usize,
    pub gc: bool,
}

impl Default for FileRunConfig {
    fn default() -> FileRunConfig {
        let defaults = RunConfig::default();
        FileRunConfig {
            stack_bytes: defaults.stack_bytes,
            gc: defaults.gc,
        }
    }
}

impl From<FileRunConfig> for RunConfig {
    fn from(file: FileRunConfig) -> RunConfig {
        RunConfig {
            stack_bytes: file.stack_bytes,
            gc: file.gc,
        }
    }
}

pub fn load(path: &Path) -> Result<RunConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let parsed: FileRunConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("parsing JSON config {}", path.display()))?,
        _ => toml::from_str(&text)
            .with_context(|| format!("parsing TOML config {}", path.display()))?,
    };
    Ok(parsed.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let parsed: FileRunConfig = toml::from_str("stack_bytes = 65536\ngc = false").unwrap();
        assert_eq!(parsed.stack_bytes, 65536);
        assert!(!parsed.gc);
    }

    #[test]
    fn missing_fields_fall_back() {
        let parsed: FileRunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.stack_bytes, RunConfig::default().stack_bytes);
        assert!(parsed.gc);
    }
}
