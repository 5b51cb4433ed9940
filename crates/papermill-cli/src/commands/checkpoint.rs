use anyhow::{Context, Result};
use papermill_core::PipelineConfig;
use papermill_store::{CheckpointStore, DataLayout};

use super::print_json;

async fn open(config: &PipelineConfig) -> Result<CheckpointStore> {
    let dir = DataLayout::new(&config.data_dir).checkpoints();
    CheckpointStore::open(&dir)
        .await
        .with_context(|| format!("Failed to open checkpoints in {}", dir.display()))
}

/// Execute `checkpoint list`.
pub(crate) async fn list(config: &PipelineConfig) -> Result<()> {
    let store = open(config).await?;
    print_json(&store.list_runs().await?)
}

/// Execute `checkpoint show <run-id>`.
pub(crate) async fn show(config: &PipelineConfig, run_id: &str) -> Result<()> {
    let store = open(config).await?;
    print_json(&store.load(run_id).await?)
}

/// Execute `checkpoint clear <run-id>`.
pub(crate) async fn clear(config: &PipelineConfig, run_id: &str) -> Result<()> {
    let store = open(config).await?;
    if store.clear(run_id).await? {
        println!("Cleared checkpoint for run {run_id}");
    } else {
        println!("No checkpoint for run {run_id}");
    }
    Ok(())
}
