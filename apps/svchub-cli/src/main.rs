//! svchub - operator CLI for the service sync hub
//!
//! Runs the batch jobs that sit beside the event-driven sync:
//! - List and check the configured services
//! - Remove accounts whose owners lost access
//! - Re-sync groups across a whole service
//! - Tear down every account on a service
//! - Produce password hashes in each service's format

use clap::{Parser, Subcommand};

mod bootstrap;
mod commands;
mod config;
mod error;
mod logging;

use config::HubConfig;
use error::CliResult;

/// svchub - service account sync
#[derive(Parser)]
#[command(name = "svchub")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured services
    Services(commands::services::ServicesArgs),

    /// Test the connection to every configured service
    Check(commands::check::CheckArgs),

    /// Deactivate accounts whose owners lost the access permission
    VerifyAccounts(commands::verify_accounts::VerifyAccountsArgs),

    /// Re-sync groups for every account on a service
    RefreshGroups(commands::refresh_groups::RefreshGroupsArgs),

    /// Deactivate every account on a service
    DisableAll(commands::disable_all::DisableAllArgs),

    /// Hash a password the way a service stores it
    Hash(commands::hash::HashArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = run(cli).await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    if let Commands::Hash(args) = cli.command {
        return commands::hash::execute(args);
    }

    let config = HubConfig::from_env()?;
    logging::init_logging(&config.log_filter);

    match cli.command {
        Commands::Services(args) => commands::services::execute(&config, args).await,
        Commands::Check(args) => commands::check::execute(&config, args).await,
        Commands::VerifyAccounts(args) => commands::verify_accounts::execute(&config, args).await,
        Commands::RefreshGroups(args) => commands::refresh_groups::execute(&config, args).await,
        Commands::DisableAll(args) => commands::disable_all::execute(&config, args).await,
        Commands::Hash(args) => commands::hash::execute(args),
    }
}
