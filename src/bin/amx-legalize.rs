//! Command line driver for the dot-to-AMX lowering.
//!
//! # Usage
//!
//! ```bash
//! # Lower bf16 dots in a file and print the result
//! amx-legalize --bf16 input.tir
//!
//! # Read from stdin, enable every capability, print statistics
//! cat input.tir | amx-legalize --all --stats
//!
//! # Pass-option string form
//! amx-legalize --options "convert-int8=true convert-bf16=1" input.tir
//! ```

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use bumpalo::Bump;
use clap::Parser;
use log::info;

use amx_legalize::amx::{AmxOptions, ConvertDotToAmx};
use amx_legalize::core::PassSession;
use amx_legalize::ir::Module;

/// Lower dot operations to AMX tile operations
#[derive(Parser, Debug)]
#[command(name = "amx-legalize")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input IR file (stdin when omitted)
    input: Option<PathBuf>,

    /// Enable AMX-INT8
    #[arg(long)]
    int8: bool,

    /// Enable AMX-FP16
    #[arg(long)]
    fp16: bool,

    /// Enable AMX-BF16
    #[arg(long)]
    bf16: bool,

    /// Enable every capability
    #[arg(long)]
    all: bool,

    /// Pass options, e.g. "convert-int8=true convert-bf16=true"
    #[arg(long)]
    options: Option<String>,

    /// Print pass statistics after the module
    #[arg(long)]
    stats: bool,

    /// Only analyze; print candidates without rewriting
    #[arg(long)]
    analyze: bool,
}

impl Cli {
    fn amx_options(&self) -> Result<AmxOptions, Box<dyn std::error::Error>> {
        let mut options = match &self.options {
            Some(s) => s.parse()?,
            None => AmxOptions::default(),
        };
        if self.all {
            options = AmxOptions::all();
        }
        options.convert_int8 |= self.int8;
        options.convert_fp16 |= self.fp16;
        options.convert_bf16 |= self.bf16;
        Ok(options)
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let text = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let options = cli.amx_options()?;
    info!("running with {}", options);

    let mut module = Module::parse(&text)?;
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    let pass = ConvertDotToAmx::new(options);

    if cli.analyze {
        for candidate in pass.collect_candidates(&module, &session) {
            println!(
                "op{}: {}x{}x{} tiles, {}x{} block, {} -> {}",
                candidate.op.0,
                candidate.tile_m,
                candidate.tile_n,
                candidate.tile_k,
                candidate.tiles_in_block_m,
                candidate.tiles_in_block_n,
                candidate.lhs_tile_elem_ty,
                candidate.acc_mode,
            );
        }
    } else {
        pass.run(&mut module, &session);
        print!("{}", module);
    }

    if cli.stats {
        print!("{}", session.stats());
    }
    Ok(())
}
