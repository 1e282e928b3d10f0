use std::sync::Arc;

use kvdb::cancel::CancellationToken;
use kvdb::config::CliConfig;
use kvdb::db::KeyValueDb;
use kvdb::files::{DirectoryFileCollection, FileCollection, FileKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvdb=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match CliConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: directory={}, max_trlog_file_size={}, max_inline_value_size={}",
        config.directory.display(),
        config.db.max_trlog_file_size,
        config.db.max_inline_value_size
    );

    if let Err(e) = std::fs::create_dir_all(&config.directory) {
        tracing::error!("Failed to create data directory: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(&config) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let files: Arc<dyn FileCollection> = Arc::new(DirectoryFileCollection::open(&config.directory)?);
    let db = KeyValueDb::open(Arc::clone(&files), config.db)?;

    let keys = db.begin_read()?.len();
    tracing::info!("{keys} keys");
    report_files(files.as_ref());

    if db.compact(&CancellationToken::new())? {
        tracing::info!("compaction relocated values");
        report_files(files.as_ref());
    }

    let info = db.create_key_index()?;
    tracing::info!(
        "checkpoint {} at transaction {}",
        info.file_id,
        info.transaction_id
    );
    Ok(())
}

fn report_files(files: &dyn FileCollection) {
    for (file_id, info) in files.file_infos() {
        let kind = match info.kind {
            FileKind::TransactionLog => "transaction log",
            FileKind::PureValues => "pure values",
            FileKind::KeyIndex => "key index",
        };
        let size = files.size(file_id).unwrap_or(0);
        tracing::info!(
            "file {file_id}: {kind}, generation {}, {size} bytes",
            info.generation
        );
    }
}
