//! `nanobot` — the gateway binary and operational CLI.

mod config_cmd;
mod doctor;
mod logging;
mod pid;
mod scaffold;
mod serve;
mod status;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nanobot", about = "Multi-channel personal AI assistant", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent gateway process.
    Gateway {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        verbose: bool,
    },
    /// Terminate a running gateway.
    Stop {
        /// Seconds to wait for graceful shutdown.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Kill the process if it is still alive after the timeout.
        #[arg(long)]
        force: bool,
    },
    /// Stop then start the gateway.
    Restart {
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        verbose: bool,
    },
    /// Print configuration summary and runtime snapshot.
    Status,
    /// Probe for problems; non-zero exit on detected failure.
    Health {
        /// Treat warnings as failures.
        #[arg(long)]
        strict: bool,
        /// Fail when no gateway process is running.
        #[arg(long)]
        require_gateway: bool,
    },
    /// View the main or audit log.
    Logs {
        #[arg(long)]
        audit: bool,
        #[arg(long, default_value_t = 50)]
        lines: usize,
        #[arg(long)]
        follow: bool,
    },
    /// Run connectivity probes.
    Check {
        /// Skip slow network probes.
        #[arg(long)]
        quick: bool,
    },
    /// Aggregate tool-call statistics from the audit log.
    ToolsHealth,
    /// Manage config.json.
    Config {
        #[command(subcommand)]
        action: config_cmd::ConfigAction,
    },
    /// Scaffold new workspace resources.
    New {
        #[command(subcommand)]
        what: scaffold::NewTarget,
    },
    /// Move legacy tool config files into <data>/tool_configs/.
    MigrateToolConfigs {
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Gateway { port, verbose } => serve::run_gateway(port, verbose),
        Command::Stop { timeout, force } => serve::stop_gateway(timeout, force),
        Command::Restart {
            timeout,
            force,
            port,
            verbose,
        } => {
            let stopped = serve::stop_gateway(timeout, force);
            if stopped != 0 {
                stopped
            } else {
                serve::run_gateway(port, verbose)
            }
        }
        Command::Status => status::print_status(),
        Command::Health {
            strict,
            require_gateway,
        } => doctor::health(strict, require_gateway),
        Command::Logs {
            audit,
            lines,
            follow,
        } => status::show_logs(audit, lines, follow),
        Command::Check { quick } => doctor::check(quick),
        Command::ToolsHealth => doctor::tools_health(),
        Command::Config { action } => config_cmd::run(action),
        Command::New { what } => scaffold::run(what),
        Command::MigrateToolConfigs { dry_run } => scaffold::migrate_tool_configs(dry_run),
    };
    std::process::exit(code);
}
