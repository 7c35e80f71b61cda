use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webstill::backend::chromium::ChromiumBackend;
use webstill::BrowserBackend;
use webstill::cli::Args;
use webstill::output::prepare_output_dir;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = args.into_config()?;

    config.output_dir = prepare_output_dir(&config.output_dir, config.force_delete).await?;
    info!("mirroring {} into {}", config.start_url, config.output_dir.display());

    let backend = Arc::new(ChromiumBackend::launch().await?);
    let result = webstill::mirror::run(config, backend.clone()).await;
    backend.shutdown().await?;
    result?;

    Ok(())
}
