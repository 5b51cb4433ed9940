use anyhow::{Context, Result};
use papermill_core::PipelineConfig;

/// Execute `config check`: validate, then print the effective config.
pub(crate) fn check(config: &PipelineConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    print!("{}", config.to_toml_string()?);
    eprintln!("Configuration: OK");
    Ok(())
}
