//! CLI error types with exit codes.

use svchub_provisioning::SyncError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by `svchub` commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The command ran but some items failed.
    #[error("{failed} of {total} items failed")]
    CheckFailed { failed: usize, total: usize },
}

pub type CliResult<T> = Result<T, CliError>;

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Sync(e) if e.is_retryable() => 3,
            CliError::Validation(_) => 4,
            CliError::Sync(_) => 5,
            CliError::Io(_) => 6,
            CliError::CheckFailed { .. } => 1,
        }
    }

    /// Print the error to stderr.
    ///
    /// Sync errors print the generic message plus a correlation id; the
    /// details go to the log under the same id.
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();
        let message = match self {
            CliError::Sync(e) => {
                let report = e.report();
                format!("{} (reference: {})", report.message, report.correlation_id)
            }
            other => other.to_string(),
        };

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {message}");
        } else {
            eprintln!("Error: {message}");
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {suggestion}");
            } else {
                eprintln!("\nSuggestion: {suggestion}");
            }
        }
    }

    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::Config(_) => Some("Check the SVCHUB_* environment variables or .env file."),
            CliError::Sync(e) if e.is_retryable() => {
                Some("The external service is unavailable. Try again later.")
            }
            CliError::CheckFailed { .. } => Some("See the log output for per-item errors."),
            _ => None,
        }
    }
}
