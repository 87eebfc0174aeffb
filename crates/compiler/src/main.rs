//! tcc command-line driver.
//!
//! `tcc [-o OUT] [-c] [-v] INPUT.c` compiles one translation unit to a
//! Windows x86-64 executable. The default output name replaces the input
//! extension with `.exe` (`.obj` under `-c`).

use clap::{ArgAction, Parser as ClapParser};
use std::path::PathBuf;
use std::process;
use tcc::OutputKind;

#[derive(ClapParser)]
#[command(name = "tcc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(disable_version_flag = true)]
#[command(about = "Tiny C compiler producing PE32+ executables", long_about = None)]
struct Cli {
    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Produce an object file instead of an executable
    #[arg(short = 'c')]
    object: bool,

    /// Print version information
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    _version: Option<bool>,

    /// Input C source file
    input: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let kind = if cli.object { OutputKind::Obj } else { OutputKind::Exe };
    let output = cli.output.unwrap_or_else(|| {
        cli.input
            .with_extension(if cli.object { "obj" } else { "exe" })
    });

    match tcc::compile_file(&cli.input, &output, kind) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("tcc: {}", e);
            process::exit(1);
        }
    }
}
