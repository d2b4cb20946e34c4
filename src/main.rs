#![allow(dead_code)]
#[macro_use]
mod errors;
mod command;
mod repl;
mod storage;

use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "tinykv",
    version = VERSION,
    about = "Tiny disk-backed key-value store."
)]
struct Cli {
    /// Database file to open or create.
    #[arg(env = "TINYKV_FILE", default_value = "tinykv.db")]
    file: PathBuf,
    /// Where structured logs go; the console stays clean for output.
    #[arg(long, env = "TINYKV_LOG_FILE", default_value = "tinykv.log")]
    log_file: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = match OpenOptions::new()
        .append(true)
        .create(true)
        .open(&cli.log_file)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", cli.log_file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    match repl::console::start(&cli.file) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
