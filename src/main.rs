//! Walker CLI
//!
//! The stock binary ships without test suites: `serve` works as is, while
//! `online` and `walk` need a binary that registers its suites and calls
//! [`walker::cli::run`].

use std::process::ExitCode;

use walker::{cli, SuiteCatalog};

#[tokio::main]
async fn main() -> ExitCode {
    cli::run(SuiteCatalog::new()).await
}
