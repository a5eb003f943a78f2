use anyhow::{bail, Context, Result};
use clap::Parser;
use imaging_db::config::{Config, DbCredentials};
use imaging_db::manifest;
use imaging_db::metadata_store::PgMetadataStore;
use imaging_db::object_store::S3ObjectStore;
use imaging_db::uploader::UploadCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "data-uploader",
    version,
    about = "Upload imaging datasets to S3 and record their metadata in PostgreSQL"
)]
struct Cli {
    /// Full path to csv manifest listing the files to upload
    #[arg(long)]
    csv: PathBuf,

    /// Full path to JSON file with database login credentials
    #[arg(long)]
    login: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(login) = &cli.login {
        let credentials =
            DbCredentials::from_file(login).context("Failed to read credentials file")?;
        config.database.url = Some(credentials.to_uri());
    }

    let rows = manifest::load_manifest(&cli.csv)
        .await
        .with_context(|| format!("Failed to load manifest {}", cli.csv.display()))?;
    info!(rows = rows.len(), "Loaded upload manifest");

    let metadata = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to connect to metadata store")?,
    );
    if config.database.run_migrations {
        metadata
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let store = Arc::new(
        S3ObjectStore::new(&config.storage)
            .await
            .context("Failed to initialize object store")?,
    );
    let coordinator = UploadCoordinator::new(store, metadata, config.transfer.clone());

    let cancel = CancellationToken::new();
    spawn_cancel_on_ctrl_c(&cancel);

    let mut failures = 0usize;
    for row in rows {
        if cancel.is_cancelled() {
            warn!("Cancelled, skipping remaining uploads");
            failures += 1;
            break;
        }

        let dataset_id = row.dataset_id.clone();
        let request = match row.into_request() {
            Ok(request) => request,
            Err(e) => {
                error!(dataset_id = %dataset_id, error = %e, "Invalid manifest row");
                failures += 1;
                continue;
            }
        };

        match coordinator.upload(&request, &cancel).await {
            Ok(report) => info!(
                dataset_id = %report.dataset_id,
                blobs = report.blobs_written,
                bytes = report.bytes_written,
                "Upload succeeded"
            ),
            Err(e) => {
                error!(dataset_id = %dataset_id, error = %e, "Upload failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} upload(s) failed", failures);
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn spawn_cancel_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling");
            cancel.cancel();
        }
    });
}
