// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use cmd::commands;
use cmd::common::{exit_code, open_engine};
use diagnostics::Verbosity;
use nestql::OutputFormat;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "nestql")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to NESTQL_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log pipeline progress to stderr (overrides NESTQL_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Table,
    Csv,
    Count,
    Html,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Table => OutputFormat::Table,
            Format::Csv => OutputFormat::Csv,
            Format::Count => OutputFormat::Count,
            Format::Html => OutputFormat::Html,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, convert (if needed) and query a nested request path
    Query {
        /// Request path, e.g. /https:/alias@host/dir/file.csv?limit=10
        path: String,
        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: Format,
        /// Deadline in seconds for fetch and convert, overriding the configuration
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Show how a request path is parsed, routed and keyed
    Resolve {
        path: String,
    },
    /// Print the cache state of a request path without building it
    Status {
        path: String,
    },
}

async fn run(cli: Cli) -> Result<()> {
    let engine = open_engine(cli.config)?;
    let stdout = std::io::stdout();

    match cli.command {
        Commands::Query {
            path,
            format,
            deadline_secs,
        } => {
            let mut out = BufWriter::new(stdout);
            commands::query_command(&engine, &path, format.into(), deadline_secs, &mut out).await
        }
        Commands::Resolve { path } => commands::resolve_command(&engine, &path, &mut stdout.lock()).await,
        Commands::Status { path } => commands::status_command(&engine, &path, &mut stdout.lock()).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        diagnostics::init_with(Verbosity::Debug);
    } else {
        diagnostics::init();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let message = format!("{:#}", err);
            diagnostics::error!("Command failed: {message}", message: message.as_str());
            _ = writeln!(std::io::stderr(), "Error: {}", message);
            ExitCode::from(exit_code(&err))
        }
    }
}
