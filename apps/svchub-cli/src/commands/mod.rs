//! Subcommand implementations.

pub mod check;
pub mod disable_all;
pub mod hash;
pub mod refresh_groups;
pub mod services;
pub mod verify_accounts;

use svchub_provisioning::BatchReport;

use crate::error::{CliError, CliResult};

/// Print a batch summary and turn failures into an error.
pub(crate) fn finish_batch(action: &str, report: &BatchReport) -> CliResult<()> {
    println!(
        "{action}: {} succeeded, {} skipped, {} failed",
        report.succeeded.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for failure in &report.failed {
        println!("  {} - {}", failure.key, failure.error.error_code());
    }

    if report.is_complete() {
        Ok(())
    } else {
        Err(CliError::CheckFailed {
            failed: report.failed.len(),
            total: report.succeeded.len() + report.skipped.len() + report.failed.len(),
        })
    }
}
