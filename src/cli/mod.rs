//! Command-line interface definitions for the `flashsoak` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `flashsoak` binary.
#[derive(Debug, Parser)]
#[command(
    name = "flashsoak",
    about = "Soak-test removable drives by rewriting and verifying a reference dataset",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Soak-test one or more mounted devices until interrupted.
    #[command(
        name = "run",
        about = "Soak-test one or more mounted devices until interrupted"
    )]
    Run(RunCommand),
}

/// Arguments for the `flashsoak run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Device under test, as `LABEL=MOUNT_ROOT[@BLOCK_NODE]`.
    ///
    /// Repeat the flag to test several devices. The block node is only
    /// needed by the `command` formatter.
    #[arg(long = "device", value_name = "SPEC", required = true)]
    pub(crate) devices: Vec<String>,
    /// Override the reference dataset directory for this run.
    #[arg(long, value_name = "DIR")]
    pub(crate) source: Option<String>,
    /// Format and rewrite every device before its first verify pass.
    #[arg(long)]
    pub(crate) clean_start: bool,
    /// Print the final summary as JSON instead of a table.
    #[arg(long)]
    pub(crate) json: bool,
}
