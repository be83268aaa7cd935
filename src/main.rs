use anyhow::{Context, Result};
use clap::Parser;
use penpot_mcp_lib::config::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve().context("invalid configuration")?;

    if cli.write_config {
        let path = cli.config_path();
        config::save_config(&path, &config)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("{}", path.display());
        return Ok(());
    }

    penpot_mcp_lib::logging::init_tracing(&config.log_level).map_err(anyhow::Error::msg)?;
    tracing::debug!(config = ?config, "effective configuration");

    penpot_mcp_lib::run(config).await
}
