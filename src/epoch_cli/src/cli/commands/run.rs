use crate::config;
use anyhow::{Context, Result};
use epoch_vm::{ExecutionEngine, RunConfig};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

pub fn execute(input: &Path, config_path: Option<PathBuf>) -> Result<()> {
    let stream =
        fs::read(input).with_context(|| format!("reading stream {}", input.display()))?;
    let run_config = match config_path {
        Some(path) => config::load(&path)?,
        None => RunConfig::default(),
    };
    // The runtime itself prints nothing on failure; translating errors
    // into user-visible diagnostics is this driver's job.
    ExecutionEngine::new()
        .run_stream(stream, &run_config)
        .with_context(|| format!("executing {}", input.display()))?;
    info!("execution completed");
    Ok(())
}
