use anyhow::{Context, Result};
use papermill_core::PipelineConfig;
use papermill_store::{DataLayout, Registry};
use papermill_types::Grouping;
use ulid::Ulid;

use super::print_json;

async fn open(config: &PipelineConfig) -> Result<Registry> {
    let layout = DataLayout::new(&config.data_dir);
    Registry::open(layout.registry_entries(), config.registry.clone())
        .await
        .with_context(|| format!("Failed to open registry under {}", config.data_dir.display()))
}

/// Execute `registry stats`.
pub(crate) async fn stats(config: &PipelineConfig) -> Result<()> {
    let registry = open(config).await?;
    print_json(&registry.stats())
}

/// Execute `registry show <entry-id>`.
pub(crate) async fn show(config: &PipelineConfig, entry_id: &str) -> Result<()> {
    let id: Ulid = entry_id
        .parse()
        .with_context(|| format!("Not an entry id: {entry_id}"))?;
    let registry = open(config).await?;
    match registry.get(&id) {
        Some(entry) => print_json(&entry),
        None => anyhow::bail!("No registry entry {id}"),
    }
}

/// Execute `registry grouping <name>`.
pub(crate) async fn grouping(config: &PipelineConfig, name: &str) -> Result<()> {
    let registry = open(config).await?;
    print_json(&registry.entries_in_grouping(&Grouping::new(name)))
}
