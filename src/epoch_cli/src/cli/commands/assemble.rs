use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

pub fn execute(input: &Path, output: Option<PathBuf>) -> Result<()> {
    let listing = fs::read_to_string(input)
        .with_context(|| format!("reading listing {}", input.display()))?;
    let stream = epoch_bytecode::asm::assemble(&listing)
        .with_context(|| format!("assembling {}", input.display()))?;
    let path = output.unwrap_or_else(|| input.with_extension("epb"));
    fs::write(&path, &stream)
        .with_context(|| format!("writing stream to {}", path.display()))?;
    info!("assembled {} bytes to {}", stream.len(), path.display());
    Ok(())
}
