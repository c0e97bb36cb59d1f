//! Page snapshot CLI
//!
//! Saves one page and prints its bookmark as JSON. Configuration comes from
//! the environment (see `snapshot::config`); flags override it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use snapshot::task::Resource;
use snapshot::{extract_page, BookmarkState, Config, ExtractParams};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "snapshot")]
#[command(about = "Save a web page as a bookmark archive")]
struct Cli {
    /// Page to save
    url: String,

    /// Directory receiving the archive (overrides SNAPSHOT_DATA_DIR)
    #[arg(long)]
    out: Option<PathBuf>,

    /// JSON file listing resources to serve instead of fetching them
    #[arg(long)]
    resources: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,snapshot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("Invalid configuration")?;
    if let Some(out) = cli.out {
        config = config.with_data_dir(out);
    }

    let resources: Vec<Resource> = match &cli.resources {
        Some(path) => {
            let data = std::fs::read(path)
                .with_context(|| format!("Cannot read {}", path.display()))?;
            serde_json::from_slice(&data).context("Invalid resources file")?
        }
        None => Vec::new(),
    };

    tracing::info!(url = %cli.url, data_dir = %config.data_dir.display(), "saving page");
    let bookmark = extract_page(
        &config,
        ExtractParams {
            url: cli.url,
            resources,
        },
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&bookmark)?);

    if bookmark.state == BookmarkState::Error {
        anyhow::bail!("Extraction failed: {}", bookmark.errors.join("; "));
    }
    Ok(())
}
