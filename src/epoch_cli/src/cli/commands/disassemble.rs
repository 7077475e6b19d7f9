use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub fn execute(input: &Path, output: Option<PathBuf>) -> Result<()> {
    let stream =
        fs::read(input).with_context(|| format!("reading stream {}", input.display()))?;
    let listing = epoch_bytecode::disasm::disassemble(&stream)
        .with_context(|| format!("disassembling {}", input.display()))?;
    match output {
        Some(path) => fs::write(&path, listing)
            .with_context(|| format!("writing listing to {}", path.display()))?,
        None => print!("{}", listing),
    }
    Ok(())
}
