use anyhow::{Context, Result};
use clap::Parser;
use imaging_db::config::{Config, DbCredentials};
use imaging_db::dataset::DatasetIdentifier;
use imaging_db::downloader::{DownloadCoordinator, DownloadOptions};
use imaging_db::metadata_store::PgMetadataStore;
use imaging_db::object_store::S3ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "data-downloader",
    version,
    about = "Download an imaging dataset and its metadata to a local folder"
)]
struct Cli {
    /// Unique dataset identifier
    #[arg(long)]
    id: String,

    /// Destination folder; a subfolder named after the identifier is created
    #[arg(long)]
    dest: PathBuf,

    /// Full path to JSON file with database login credentials
    #[arg(long)]
    login: Option<PathBuf>,

    /// Skip writing metadata sidecar files
    #[arg(long, default_value_t = false)]
    no_metadata: bool,

    /// Skip downloading blobs
    #[arg(long, default_value_t = false)]
    no_download: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let id = DatasetIdentifier::parse(&cli.id).context("Invalid dataset identifier")?;
    let options = DownloadOptions {
        metadata: !cli.no_metadata,
        download: !cli.no_download,
    };

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(login) = &cli.login {
        let credentials =
            DbCredentials::from_file(login).context("Failed to read credentials file")?;
        config.database.url = Some(credentials.to_uri());
    }

    let metadata = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to connect to metadata store")?,
    );
    let store = Arc::new(
        S3ObjectStore::new(&config.storage)
            .await
            .context("Failed to initialize object store")?,
    );
    let coordinator = DownloadCoordinator::new(store, metadata, config.transfer.clone());

    let report = coordinator
        .download(&id, &cli.dest, &options)
        .await
        .with_context(|| format!("Failed to download dataset {}", id))?;

    info!(
        dataset_id = %report.dataset_id,
        destination = %report.destination.display(),
        files = report.files_written,
        metadata = report.metadata_written,
        "Download finished"
    );
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
