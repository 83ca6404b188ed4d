#![allow(clippy::result_large_err)]
#![allow(dead_code)]

use std::process::ExitCode;

use clap::Parser;
use miette::Diagnostic;
use miette::Result;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::environment::Environment;
use crate::executor::ExecuteError;
use crate::executor::Executor;
use crate::outputter::OutPutter;
use crate::parser::Document;
use crate::parser::LoadError;
use crate::runner::Runner;
use crate::validator::ValidationError;
use crate::validator::Validator;

mod asserter;
mod cli;
mod environment;
mod executor;
mod outputter;
mod parser;
mod runner;
mod substitute;
mod template;
mod validator;

#[derive(Error, Debug, Diagnostic)]
pub enum ApiQuestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    ValidationError(#[from] ValidationError),

    #[error("Failed to start: {0}")]
    StartUp(#[from] ExecuteError),

    #[error("{failed} of {total} tests failed")]
    TestsFailed { failed: usize, total: usize },
}

/// Logs go to stderr so they never mix with test results. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "apiquest=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Reads the configuration file and checks its structure.
fn load_and_validate_config(cli: &Cli) -> Result<Document, ApiQuestError> {
    let document = parser::load(&cli.config)?;

    Validator::new(&document.config, &document.source, &document.path).validate()?;

    Ok(document)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Document { config, path, .. } = load_and_validate_config(&cli)?;
    let n_tests = config.tests.len();

    let environment = Environment::from_definitions(cli.defines.iter().cloned());
    debug!(variables = environment.len(), "seeded environment");

    let executor = Executor::new(cli.timeout()).map_err(ApiQuestError::StartUp)?;
    let mut runner = Runner::new(config, environment, executor);
    let mut out = OutPutter::stdout();

    out.start(&path, n_tests);
    let summary = runner.run_all(&mut out).await;
    out.summary(&summary);

    if summary.is_success() {
        return Ok(ExitCode::SUCCESS);
    }

    // The aborting test has already been reported against its name.
    if summary.aborted.is_some() {
        return Ok(ExitCode::FAILURE);
    }

    Err(ApiQuestError::TestsFailed {
        failed: summary.failed.len(),
        total: summary.total,
    }
    .into())
}
