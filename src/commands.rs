//! CLI command definitions
//!
//! Defines the clap commands for the walker CLI.

use clap::{ArgAction, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server that pairs a run with a live viewer
    Serve {
        /// Binding host for the relay (default from config: localhost)
        #[arg(long)]
        host: Option<String>,

        /// Port for the relay (default from config: 5555)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run tests online against a path-generation engine
    Online {
        /// Test package whose step handlers are executed
        test_package: PathBuf,

        /// Model file and generator, e.g. -m login.json "random(edge_coverage(100))"
        /// Can be specified multiple times
        #[arg(
            long = "model",
            short = 'm',
            num_args = 2,
            value_names = ["MODEL", "GENERATOR"],
            action = ArgAction::Append,
            required = true
        )]
        models: Vec<String>,

        /// Binding host for the relay
        #[arg(long)]
        host: Option<String>,

        /// Port for the relay
        #[arg(long, short)]
        port: Option<u16>,

        /// Executor kind
        #[arg(long, short = 'x', default_value = "in-process")]
        executor: String,

        /// Element to start the path from
        #[arg(long = "start-element", short = 'e')]
        start_element: Option<String>,

        /// Host of the engine REST service
        #[arg(long = "gw-host")]
        gw_host: Option<String>,

        /// First port tried for the engine REST service
        #[arg(long = "gw-port")]
        gw_port: Option<u16>,

        /// Filter out elements with the blocked property
        #[arg(long, short)]
        blocked: bool,

        /// Write the executed path to this file as JSON
        #[arg(long = "report-path-file")]
        report_path_file: Option<PathBuf>,
    },

    /// Run tests over a predefined path, without an engine
    Walk {
        /// Test package whose step handlers are executed
        test_package: PathBuf,

        /// JSON file with the list of steps to execute
        steps_file: PathBuf,

        /// Binding host for the relay
        #[arg(long)]
        host: Option<String>,

        /// Port for the relay
        #[arg(long, short)]
        port: Option<u16>,

        /// Executor kind
        #[arg(long, short = 'x', default_value = "in-process")]
        executor: String,

        /// Write the executed path to this file as JSON
        #[arg(long = "report-path-file")]
        report_path_file: Option<PathBuf>,
    },
}
