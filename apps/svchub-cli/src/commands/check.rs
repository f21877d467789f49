//! Check command - Probe every configured service

use clap::Args;
use std::time::Duration;
use tracing::warn;

use svchub_connector::resilience::with_timeout;

use crate::bootstrap::build_registry;
use crate::config::HubConfig;
use crate::error::{CliError, CliResult};

/// Arguments for the check command
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Seconds to wait for each service
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
}

pub async fn execute(config: &HubConfig, args: CheckArgs) -> CliResult<()> {
    let registry = build_registry(config)?;
    let limit = Duration::from_secs(args.timeout);
    let mut failed = 0;

    for service in registry.all() {
        match with_timeout(limit, service.connector.test_connection()).await {
            Ok(()) => println!("  ok    {}", service.id),
            Err(e) => {
                warn!(service_id = %service.id, error = %e, "Connection check failed");
                println!("  FAIL  {} - {}", service.id, e.error_code());
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(CliError::CheckFailed {
            failed,
            total: registry.len(),
        });
    }
    Ok(())
}
