//! celfilter CLI: driving adapter for the celfilter engine.
//!
//! Subcommands:
//! - `run <request> [--trace]`: run the filter step on a request document
//! - `check <input>`: validate a `Filters` document without evaluating it
//! - `eval <expression> [--request <file>]`: evaluate an expression against
//!   a request's state
//!
//! Documents are JSON when the file extension is `.json`, YAML otherwise.
//! Logs go to stderr; set `RUST_LOG` or pass `-v` for more.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use celfilter::{
    error_chain, Environment, FilterEngine, FilterFunction, Filters, Program, RunFunctionRequest,
};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

/// Filter desired composed resources with CEL expressions.
#[derive(Parser)]
#[command(name = "celfilter", version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the filter step on a RunFunctionRequest and print the response.
    Run {
        /// Request document.
        request: PathBuf,

        /// Print the per-resource decision trace to stderr.
        #[arg(long)]
        trace: bool,
    },

    /// Compile every pattern and type-check every expression of a Filters
    /// document.
    Check {
        /// Filters document.
        input: PathBuf,
    },

    /// Evaluate an expression and print its value and type.
    Eval {
        /// Expression source.
        expression: String,

        /// Request document supplying observed, desired and context.
        #[arg(long)]
        request: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Run { request, trace } => cmd_run(&request, trace),
        Commands::Check { input } => cmd_check(&input),
        Commands::Eval {
            expression,
            request,
        } => cmd_eval(&expression, request.as_deref()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

fn cmd_run(path: &Path, trace: bool) -> Result<()> {
    let request: RunFunctionRequest = load_document(path)?;
    let function = FilterFunction::new().context("cannot build CEL environment")?;

    if trace {
        print_trace(function.engine(), &request);
    }

    let response = function.run(&request);
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response.is_fatal() {
        bail!("function returned a fatal result");
    }
    Ok(())
}

fn cmd_check(path: &Path) -> Result<()> {
    let text = read(path)?;
    let filters = if is_json(path) {
        Filters::from_json(&text)
    } else {
        Filters::from_yaml(&text)
    }
    .map_err(|e| anyhow::anyhow!(error_chain(&e)))
    .with_context(|| format!("cannot load filters from {}", path.display()))?;

    let engine = FilterEngine::new().context("cannot build CEL environment")?;
    engine
        .check(&filters.filters)
        .map_err(|e| anyhow::anyhow!("{} (stage: {})", error_chain(&e), e.stage()))?;

    tracing::info!(rules = filters.filters.len(), "Filters checked");
    println!("Filters valid ({} rules)", filters.filters.len());
    Ok(())
}

fn cmd_eval(expression: &str, request: Option<&Path>) -> Result<()> {
    let request: RunFunctionRequest = match request {
        Some(path) => load_document(path)?,
        None => RunFunctionRequest::default(),
    };
    let env = Environment::standard().context("cannot build CEL environment")?;

    let program = Program::check(&env, expression).map_err(|e| anyhow::anyhow!(error_chain(&e)))?;
    let value = program
        .evaluate(&request.evaluation_context().activation(&env))
        .map_err(|e| anyhow::anyhow!(error_chain(&e)))?;

    println!("{}", serde_json::to_string_pretty(&celfilter::value_to_json(&value))?);
    eprintln!("type: {}", program.result_type());
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn print_trace(engine: &FilterEngine, request: &RunFunctionRequest) {
    let Some(input) = &request.input else {
        eprintln!("(no input, nothing to trace)");
        return;
    };
    let filters = match Filters::from_value(input.clone()) {
        Ok(filters) => filters,
        Err(e) => {
            eprintln!("(cannot trace: {})", error_chain(&e));
            return;
        }
    };
    match engine.filter_with_trace(
        &filters.filters,
        request.desired.resources.clone(),
        &request.evaluation_context(),
    ) {
        Ok(outcome) => eprint!("{}", outcome.trace),
        Err(e) => eprintln!("(cannot trace: {})", error_chain(&e)),
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "json")
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = read(path)?;
    tracing::debug!(path = %path.display(), json = is_json(path), "Loading document");
    if is_json(path) {
        serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("invalid YAML in {}", path.display()))
    }
}
