pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use self::commands::{assemble, compile, disassemble, run as run_command};

#[derive(Parser)]
#[command(name = "epoch")]
#[command(about = "Epoch bytecode toolchain driver", version, author)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile a semantic-IR program (JSON) into a binary instruction
    /// stream, or a textual assembly listing with --asm
    Compile {
        /// The input program JSON produced by the front-end
        #[arg(required = true)]
        input: PathBuf,

        /// The output file (defaults to <input>.epb, or <input>.easm
        /// with --asm)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Emit a textual assembly listing instead of binary
        #[arg(long, default_value_t = false)]
        asm: bool,
    },

    /// Assemble a textual listing back into a binary instruction stream
    Assemble {
        /// The input .easm listing
        #[arg(required = true)]
        input: PathBuf,

        /// The output file (defaults to <input>.epb)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Disassemble a binary instruction stream into a textual listing
    Disassemble {
        /// The input .epb stream
        #[arg(required = true)]
        input: PathBuf,

        /// The output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Execute a binary instruction stream
    Run {
        /// The input .epb stream
        #[arg(required = true)]
        input: PathBuf,

        /// Optional execution config file (TOML/JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Compile { input, output, asm } => compile::execute(&input, output, asm),
        Commands::Assemble { input, output } => assemble::execute(&input, output),
        Commands::Disassemble { input, output } => disassemble::execute(&input, output),
        Commands::Run { input, config } => run_command::execute(&input, config),
    }
}
