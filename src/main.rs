//! Gateway runtime CLI entry point.
//!
//! This binary owns configuration loading and logging setup; it does not
//! link a concrete chat-transport adapter (the real multi-device library
//! lives outside this crate's ecosystem, see [`alfred_gateway::transport`]).
//! A host binary that wires a real [`alfred_gateway::transport::GatewayTransport`]
//! implementation is expected to depend on this crate as a library instead.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use alfred_gateway::config::GatewayConfig;
use alfred_gateway::logging;

/// Gateway runtime — bridges a chat transport session to an orchestrator.
#[derive(Parser)]
#[command(name = "alfred-gateway", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Load config, start production logging, and report readiness.
    ///
    /// Without a linked transport adapter this cannot open a live session;
    /// it exists to verify configuration and logging wiring end to end.
    Start,
    /// Load configuration and print it (redacted), without starting anything.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Start => handle_start().await,
        Command::CheckConfig => handle_check_config(),
    }
}

async fn handle_start() -> ExitCode {
    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load gateway config: {error}");
            return ExitCode::FAILURE;
        }
    };

    let logs_dir = config.auth_dir.join("logs");
    let _logging_guard = match logging::init_production(&logs_dir) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("failed to initialize logging: {error}");
            return ExitCode::FAILURE;
        }
    };

    info!(?config, "gateway config loaded");
    error!(
        "no transport driver is linked into this binary; embed this crate in a host binary \
         that wires a concrete GatewayTransport and calls GatewayRuntime::connect()"
    );
    ExitCode::FAILURE
}

fn handle_check_config() -> ExitCode {
    logging::init_cli();
    match GatewayConfig::load() {
        Ok(config) => {
            println!("{config:?}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("failed to load gateway config: {error}");
            ExitCode::FAILURE
        }
    }
}
