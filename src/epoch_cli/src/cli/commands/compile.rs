use anyhow::{Context, Result};
use epoch_compiler::{generate_program, CompileErrors, Program};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

pub fn execute(input: &Path, output: Option<PathBuf>, asm: bool) -> Result<()> {
    let source = fs::read_to_string(input)
        .with_context(|| format!("reading program {}", input.display()))?;
    let mut program: Program = serde_json::from_str(&source)
        .with_context(|| format!("parsing semantic IR from {}", input.display()))?;
    program.finalize();

    // The front-end reports its diagnostics before handing the IR over;
    // an IR that reaches this driver compiles against a clean collector.
    let errors = CompileErrors::new();
    let stream = generate_program(&program, &errors).context("bytecode emission failed")?;

    if asm {
        let listing = epoch_bytecode::disasm::disassemble(&stream)
            .context("disassembling emitted stream")?;
        let path = output.unwrap_or_else(|| input.with_extension("easm"));
        fs::write(&path, listing)
            .with_context(|| format!("writing listing to {}", path.display()))?;
        info!("wrote listing to {}", path.display());
    } else {
        let path = output.unwrap_or_else(|| input.with_extension("epb"));
        fs::write(&path, &stream)
            .with_context(|| format!("writing stream to {}", path.display()))?;
        info!("wrote {} bytes to {}", stream.len(), path.display());
    }
    Ok(())
}
