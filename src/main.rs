//! CLI entry point for bristlenose.
//!
//! # Architecture overview
//!
//! `main.rs` is the thin coordination layer between the CLI surface and
//! the library crate. Its responsibilities are:
//!
//! 1. Parse CLI arguments (via `clap`)
//! 2. Load and merge configuration from `~/.config/bristlenose/config.toml`
//! 3. Dispatch: the default (no subcommand) runs the pipeline over the
//!    given input directory; `status` prints the read-only manifest
//!    summary.
//!
//! CLI flags take precedence over config file values; the merge happens
//! here so the library never needs to know about the CLI.
//!
//! # Exit codes
//!
//! `0` on success — including runs with absorbed per-session failures;
//! non-zero only for unrecoverable orchestrator errors (bad input
//! directory, manifest version mismatch, cross-session stage failure,
//! cancellation).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bristlenose::cancel::cancel_pair;
use bristlenose::config::Config;
use bristlenose::error::BristlenoseError;
use bristlenose::pipeline::{self, PipelineOptions};

#[derive(Parser)]
#[command(name = "bristlenose", about = "User-research interview analysis")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Input directory of interview artefacts
    path: Option<PathBuf>,

    /// Output directory (default: <input>/bristlenose-output)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// LLM provider: anthropic, openai, gemini, or local
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Model identifier passed to the provider
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Bound for per-session LLM stages
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Redact PII into a parallel cooked transcript
    #[arg(long, global = true)]
    redact: bool,

    /// Accept cached LLM artefacts from whichever provider produced them
    #[arg(long, global = true)]
    reuse_provider: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Show pipeline progress from the manifest
    Status {
        /// Output directory of a previous run
        path: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), BristlenoseError> {
    if let Some(Command::Status { path }) = cli.command {
        print!("{}", pipeline::status(&path)?);
        return Ok(());
    }

    let input_dir = cli
        .path
        .clone()
        .ok_or_else(|| BristlenoseError::Other("an input directory is required".into()))?;
    if !input_dir.is_dir() {
        return Err(BristlenoseError::Other(format!(
            "Not a directory: {}",
            input_dir.display()
        )));
    }

    let config = Config::load();
    let mut options = PipelineOptions::from_config(input_dir, &config);
    if let Some(output) = cli.output {
        options.output_dir = output;
    }
    if let Some(provider) = cli.provider {
        options.provider = provider;
    }
    if let Some(model) = cli.model {
        options.model = model;
    }
    if let Some(concurrency) = cli.concurrency {
        options.concurrency = concurrency.max(1);
    }
    options.redact_pii |= cli.redact;
    options.reuse_provider = cli.reuse_provider;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (handle, token) = cancel_pair();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted — finishing in-flight work and saving state…");
                handle.cancel();
            }
        });

        let summary = pipeline::run(options, token).await?;
        if summary.session_failures > 0 {
            eprintln!(
                "Done with {} of {} sessions ({} failed; re-run to retry them).",
                summary.sessions - summary.session_failures,
                summary.sessions,
                summary.session_failures
            );
        } else {
            eprintln!("Done: {} sessions analysed.", summary.sessions);
        }
        eprintln!(
            "{} quotes, {} screen clusters, {} themes.",
            summary.quotes, summary.clusters, summary.themes
        );
        eprintln!("LLM usage: {}", summary.usage_line);
        Ok(())
    })
}
