use std::{
    io,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use fit_validate::{fit_schema, Finding, ValidationError, Validator, Variant};
use tracing_subscriber::EnvFilter;

/// Validate Flat Image Tree (FIT) files
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Stop at the first error found; useful for debugging
    #[arg(short, long)]
    raise_on_error: bool,

    /// Use the Universal Payload (UPL) schema instead of FIT
    #[arg(short, long)]
    upl: bool,

    /// Log progress to stderr (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    /// Source (.its/.dts) or compiled (.itb/.dtb) files to validate
    files: Vec<PathBuf>,
}

fn show_findings(file: &Path, findings: &[Finding]) {
    eprintln!("{}:", file.display());
    for finding in findings {
        eprintln!("{finding}");
    }
    eprintln!();
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let variant = if cli.upl { Variant::Upl } else { Variant::Fit };
    let schema = fit_schema(variant).context("failed to build schema")?;
    let mut validator = Validator::new(Arc::new(schema), cli.raise_on_error);

    let mut failed = false;
    for file in &cli.files {
        match validator.start(file) {
            Ok(findings) if findings.is_empty() => {}
            Ok(findings) => {
                show_findings(file, &findings);
                failed = true;
            }
            Err(ValidationError::Aborted(finding)) => {
                eprintln!("Failed: {finding}");
                failed = true;
                break;
            }
            Err(e @ ValidationError::Load { .. }) => {
                eprintln!("{}: {e}", file.display());
                failed = true;
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
