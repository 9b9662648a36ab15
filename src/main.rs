use std::process::ExitCode;

use clap::{Parser, Subcommand};

use peerloop::commands::init::InitArgs;
use peerloop::commands::protocol::ProtocolCommand;
use peerloop::commands::run::RunCommand;
use peerloop::commands::schema::SchemaArgs;
use peerloop::commands::status::StatusArgs;
use peerloop::error::ExitError;
use peerloop::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "peerloop",
    version,
    about = "Leaderless work claiming, peer review and merging for autonomous workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the work loop
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    /// Run single protocol operations (claim, merge, gate, unblock, validate)
    Protocol {
        #[command(subcommand)]
        command: ProtocolCommand,
    },
    /// Show items, claims and open changes
    Status(StatusArgs),
    /// Write a .peerloop.toml for a project
    Init(InitArgs),
    /// Print the JSON Schema for .peerloop.toml
    Schema(SchemaArgs),
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Protocol { .. } => "protocol",
            Self::Status(_) => "status",
            Self::Init(_) => "init",
            Self::Schema(_) => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run { command } => command.execute(),
        Commands::Protocol { command } => command.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Init(args) => args.execute(),
        Commands::Schema(args) => args.execute(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
