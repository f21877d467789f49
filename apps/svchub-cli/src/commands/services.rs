//! Services command - List the configured services

use clap::Args;
use serde::Serialize;

use crate::bootstrap::build_registry;
use crate::config::HubConfig;
use crate::error::CliResult;

/// Arguments for the services command
#[derive(Args, Debug)]
pub struct ServicesArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ServiceSummary {
    id: String,
    title: String,
    url: Option<String>,
    permission: String,
    name_format: String,
    deprovision: svchub_connector::types::DeprovisionAction,
    exposed_groups: Option<Vec<String>>,
    connector: String,
}

pub async fn execute(config: &HubConfig, args: ServicesArgs) -> CliResult<()> {
    let registry = build_registry(config)?;

    let summaries: Vec<ServiceSummary> = registry
        .all()
        .iter()
        .map(|s| ServiceSummary {
            id: s.id.clone(),
            title: s.title.clone(),
            url: s.url.clone(),
            permission: s.required_permission.clone(),
            name_format: s.name_formatter.template().to_string(),
            deprovision: s.deprovision,
            exposed_groups: s
                .exposed_groups
                .as_ref()
                .map(|g| g.iter().cloned().collect()),
            connector: s.connector.display_name().to_string(),
        })
        .collect();

    if args.json {
        let out = serde_json::to_string_pretty(&summaries)
            .map_err(|e| crate::error::CliError::Validation(e.to_string()))?;
        println!("{out}");
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No services configured.");
        return Ok(());
    }

    for s in &summaries {
        println!("{} ({})", s.title, s.id);
        println!("  connector:   {}", s.connector);
        println!("  permission:  {}", s.permission);
        println!("  name format: {}", s.name_format);
        if let Some(url) = &s.url {
            println!("  url:         {url}");
        }
        if let Some(groups) = &s.exposed_groups {
            println!("  groups:      {}", groups.join(", "));
        }
    }
    Ok(())
}
