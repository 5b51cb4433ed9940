pub(crate) mod cache;
pub(crate) mod checkpoint;
pub(crate) mod config;
pub(crate) mod registry;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use papermill_core::PipelineConfig;
use serde::Serialize;

/// Config from `path` (defaults when absent), with `data_dir` applied on top.
pub(crate) fn resolve_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    Ok(config)
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
