use anyhow::Result;
use papermill_core::PipelineConfig;
use papermill_store::{CacheStore, DataLayout, Namespace};

use super::print_json;

fn open(config: &PipelineConfig) -> CacheStore {
    CacheStore::new(DataLayout::new(&config.data_dir).cache(), config.cache.clone())
}

/// Execute `cache sweep`.
pub(crate) async fn sweep(config: &PipelineConfig) -> Result<()> {
    let stats = open(config).sweep().await?;
    print_json(&stats)
}

/// Execute `cache clear <namespace>`.
pub(crate) async fn clear(config: &PipelineConfig, namespace: Namespace) -> Result<()> {
    let removed = open(config).clear_namespace(namespace).await?;
    println!("Removed {removed} {namespace} records");
    Ok(())
}

/// Execute `cache stats`.
pub(crate) async fn stats(config: &PipelineConfig) -> Result<()> {
    let stats = open(config).stats().await?;
    print_json(&stats)
}
