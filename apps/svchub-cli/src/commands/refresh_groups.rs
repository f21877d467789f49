//! Refresh-groups command - Re-sync groups for every account on a service

use clap::Args;
use std::path::PathBuf;

use svchub_provisioning::StaticDirectory;

use crate::bootstrap::build_orchestrator;
use crate::config::HubConfig;
use crate::error::CliResult;

/// Arguments for the refresh-groups command
#[derive(Args, Debug)]
pub struct RefreshGroupsArgs {
    /// Service id, e.g. `phpbb3`
    pub service: String,

    /// JSON export of directory users
    #[arg(long)]
    pub users: PathBuf,
}

pub async fn execute(config: &HubConfig, args: RefreshGroupsArgs) -> CliResult<()> {
    let directory = StaticDirectory::from_json_file(&args.users)?;
    let orchestrator = build_orchestrator(config).await?;

    let report = orchestrator
        .reconcile_service(&args.service, &directory)
        .await?;
    super::finish_batch("Refreshed", &report)
}
