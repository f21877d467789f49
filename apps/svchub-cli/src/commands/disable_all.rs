//! Disable-all command - Tear down every account on a service

use clap::Args;

use crate::bootstrap::build_orchestrator;
use crate::config::HubConfig;
use crate::error::{CliError, CliResult};

/// Arguments for the disable-all command
#[derive(Args, Debug)]
pub struct DisableAllArgs {
    /// Service id, e.g. `mumble`
    pub service: String,

    /// Confirm the teardown
    #[arg(long)]
    pub yes: bool,
}

pub async fn execute(config: &HubConfig, args: DisableAllArgs) -> CliResult<()> {
    if !args.yes {
        return Err(CliError::Validation(format!(
            "refusing to disable every {} account without --yes",
            args.service
        )));
    }

    let orchestrator = build_orchestrator(config).await?;
    let report = orchestrator.disable_all(&args.service).await?;
    super::finish_batch("Disabled", &report)
}
