mod cli;
mod config;
mod gate;

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use audit_log::AuditSink;
use policy_engine::PolicyEvaluator;

use crate::cli::{Cli, Command};
use crate::config::{LogFormat, LoggingConfig};
use crate::gate::{load_store, write_report, Gate};

/// Logs go to stderr; stdout carries reports and results.
fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut cfg = config::load(&cli.config)?;
    if let Some(bundle) = cli.command.bundle_override() {
        cfg.bundle_file = bundle.clone();
    }

    init_tracing(&cfg.logging);

    info!(
        config_file = %cli.config.display(),
        bundle_file = %cfg.bundle_file.display(),
        "policy-gate starting"
    );

    let audit = match &cfg.logging.audit_log_path {
        Some(path) => Some(
            AuditSink::start(path)
                .await
                .context("failed to start audit logger")?,
        ),
        None => None,
    };
    let (sink, audit_handle) = match audit {
        Some((sink, handle)) => (Some(sink), Some(handle)),
        None => (None, None),
    };

    let (store, report) = load_store(&cfg.bundle_file, sink.as_ref())?;

    let code = match cli.command {
        Command::Validate { .. } => {
            write_report(&report, &mut io::stdout().lock())?;
            if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Eval {
            request, explain, ..
        } => {
            let gate = Gate::new(PolicyEvaluator::new(store), sink.clone())
                .with_default_timezone(cfg.evaluation.default_timezone.clone())
                .with_explain(explain);
            let stdout = io::stdout().lock();
            let summary = match request {
                Some(path) if path.as_os_str() != "-" => {
                    let document = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read request file {}", path.display()))?;
                    gate.run_document(&document, stdout)?
                }
                _ => gate.run_lines(io::stdin().lock(), stdout)?,
            };
            info!(
                allowed = summary.allowed,
                denied = summary.denied,
                rejected = summary.rejected,
                "evaluation finished"
            );
            ExitCode::SUCCESS
        }
    };

    // Close every sender so the writer drains and exits.
    drop(sink);
    if let Some(handle) = audit_handle {
        handle.await.context("audit writer task failed")?;
    }

    Ok(code)
}
