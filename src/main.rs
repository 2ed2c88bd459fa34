use anyhow::{Context, Result};
use meta_sweeper::config::CleanerConfig;
use meta_sweeper::services::{MetaHandle, Reconciler};
use meta_sweeper::store::SqliteStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run flags ---
    let (cfg, flags) = CleanerConfig::from_env_and_args()?;
    tracing::info!("Starting meta-sweeper with config: {:?}", cfg);

    if let Some(master) = &cfg.master {
        tracing::warn!(
            master = %master,
            "physical reclamation is disabled; blob-store master is unused"
        );
    }

    // --- Connect to the metadata store ---
    let store = if flags.migrate {
        SqliteStore::create(&cfg.endpoints, cfg.max_connections).await
    } else {
        SqliteStore::connect(&cfg.endpoints, cfg.max_connections).await
    }
    .context("connecting to metadata store")?;

    // --- Handle migration mode ---
    if flags.migrate {
        store.migrate().await.context("creating metadata schema")?;
        tracing::info!("Database migration complete.");
        store.close().await;
        return Ok(());
    }

    // --- Ctrl-C cancels the pass ---
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling reconciliation");
            on_signal.cancel();
        }
    });

    let meta = MetaHandle::new(store.clone());
    let report = Reconciler::new(meta)
        .run(&cancel)
        .await
        .context("reconciliation pass failed")?;
    store.close().await;

    if flags.list_orphans {
        for key in &report.orphan_keys {
            println!("{key}");
        }
    }
    tracing::info!(stats = ?report.stats, "reconciliation complete");
    println!("{report}");

    Ok(())
}
