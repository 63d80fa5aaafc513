use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn, Level};

use paths_sync::store::ContentStore;
use paths_sync::sync::log_snapshot;
use paths_sync::{HttpGateway, PathId, Session, SyncConfig, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load env
    let _ = dotenv::dotenv();
    let level = dotenv::var("PATHS_LOG")
        .ok()
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::DEBUG);
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = SyncConfig::from_env()?;

    let mut once = false;
    let mut requested: Vec<PathId> = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--once" => once = true,
            _ => requested.push(arg),
        }
    }

    // Init storage
    let store = Arc::new(ContentStore::open(&config.data_dir).await?);
    info!("Content store initialized at {:?}", config.data_dir);

    let session = Session::load(&config.session_file);
    let gateway = HttpGateway::new(&config.api_base_url, session, config.http_timeout)?;
    info!(base_url = %config.api_base_url, "Gateway initialized");

    let path_ids = watched_paths(&store, requested).await?;
    if path_ids.is_empty() {
        warn!("No paths to watch; pass path ids or set a path order first");
    }
    for path_id in &path_ids {
        match store.entries_for_path(path_id).await {
            Ok(records) => info!(path_id = %path_id, cached = records.len(), "cached entries"),
            Err(e) => warn!(path_id = %path_id, "Failed to read cached entries: {}", e),
        }
    }

    let engine = SyncEngine::new(gateway, store.clone(), config.reconcile.clone());
    engine.set_watched_paths(path_ids).await;
    let report = engine.refresh().await;
    info!(?report, cached = engine.cached_entries().await, "initial sync finished");
    log_snapshot(&engine.snapshot().await);

    if once {
        println!("{}", serde_json::to_string_pretty(&engine.snapshot().await)?);
        drop(engine);
        if let Ok(store) = Arc::try_unwrap(store) {
            store.close().await;
        }
        return Ok(());
    }

    info!("Polling every {:?}", config.poll_interval);
    let mut snapshots = engine.subscribe();
    snapshots.mark_unchanged();
    let mut ticker = tokio::time::interval(config.poll_interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let report = engine.refresh().await;
        if report.touched() > 0 || report.list_failures > 0 {
            info!(?report, "sync pass finished");
        }
        if snapshots.has_changed()? {
            log_snapshot(&snapshots.borrow_and_update());
        }
    }
}

/// Path ids from the command line, or the stored order minus hidden and
/// deleted paths. An explicit list becomes the new stored order.
async fn watched_paths(store: &ContentStore, requested: Vec<PathId>) -> anyhow::Result<Vec<PathId>> {
    if !requested.is_empty() {
        store.set_path_order(&requested).await?;
        return Ok(requested);
    }

    let mut visible = Vec::new();
    for path_id in store.path_order().await? {
        if store.is_path_hidden(&path_id).await? || store.is_path_deleted(&path_id).await? {
            continue;
        }
        visible.push(path_id);
    }
    Ok(visible)
}
