use std::sync::Arc;

use pkiman::{
    config::Config,
    pki::{
        CrlScheduler, FileStore, FsFileStore, MemoryStore, PkiRegistry, ReqwestTransport,
        TeeJournal,
    },
    telemetry,
};
use tokio::sync::watch;
use tokio::time::{Duration, interval};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Loaded configuration: {:?}", config);

    let store = Arc::new(match &config.storage.snapshot {
        Some(path) => {
            tracing::info!("Opening store snapshot {:?}", path);
            MemoryStore::open(path.clone())?
        }
        None => {
            tracing::warn!("No store snapshot configured, state is kept in memory only");
            MemoryStore::new()
        }
    });

    std::fs::create_dir_all(&config.storage.files_root)?;
    let files: Arc<dyn FileStore> = Arc::new(FsFileStore::new(
        config.storage.files_root.clone(),
        config.storage.base_url.clone(),
    ));
    let journal = TeeJournal::default();
    let transport = Arc::new(ReqwestTransport::new(&config.http));

    let registry = PkiRegistry::new(store.clone(), files, transport, Arc::new(journal.clone()));

    if let Some(dir) = &config.storage.import_dir {
        let summary = registry.import_dir(dir)?;
        tracing::info!(
            "Startup import: {} stored, {} already present, {} failed",
            summary.imported,
            summary.existing,
            summary.failed
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = CrlScheduler::new(
        config.scheduler.clone(),
        store,
        registry.synchronizer(),
        registry.journal(),
    );
    let scheduler_task = scheduler.start(shutdown_rx.clone());

    let retention = config.journal.retention();
    let mut journal_shutdown = shutdown_rx;
    let journal_task = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = journal.memory.clean(retention);
                    if removed > 0 {
                        tracing::debug!("Removed {} expired journal entries", removed);
                    }
                }
                _ = journal_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    if let Some(task) = scheduler_task {
        task.await?;
    }
    journal_task.await?;
    Ok(())
}
