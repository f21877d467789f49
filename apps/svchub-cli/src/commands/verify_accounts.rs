//! Verify-accounts command - Remove accounts users are no longer entitled to

use clap::Args;
use std::path::PathBuf;

use svchub_provisioning::{BatchReport, DirectorySource, StaticDirectory};

use crate::bootstrap::build_orchestrator;
use crate::config::HubConfig;
use crate::error::CliResult;

/// Arguments for the verify-accounts command
#[derive(Args, Debug)]
pub struct VerifyAccountsArgs {
    /// JSON export of directory users
    #[arg(long)]
    pub users: PathBuf,
}

pub async fn execute(config: &HubConfig, args: VerifyAccountsArgs) -> CliResult<()> {
    let directory = StaticDirectory::from_json_file(&args.users)?;
    let orchestrator = build_orchestrator(config).await?;

    let mut total = BatchReport::default();
    for user in directory.list_users().await? {
        let report = orchestrator.validate_user(&user).await?;
        let prefix = |key: String| format!("{}/{key}", user.username);
        total.succeeded.extend(report.succeeded.into_iter().map(prefix));
        total.skipped.extend(report.skipped.into_iter().map(prefix));
        total.failed.extend(report.failed.into_iter().map(|mut f| {
            f.key = prefix(f.key);
            f
        }));
    }

    super::finish_batch("Deactivated", &total)
}
