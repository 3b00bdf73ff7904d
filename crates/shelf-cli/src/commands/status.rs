use anyhow::Result;
use colored::Colorize;
use shelf_sync::{OfflineEngine, SyncStatus};

pub async fn execute(engine: &OfflineEngine) -> Result<()> {
    let state = engine.connectivity().state();
    let status = engine.status().await;

    let label = match status {
        SyncStatus::Synced => status.to_string().green(),
        SyncStatus::Syncing | SyncStatus::Pending { .. } => status.to_string().yellow(),
        SyncStatus::Offline | SyncStatus::ServerUnreachable => status.to_string().red(),
    };

    println!("Status:     {}", label.bold());
    println!("Online:     {}", if state.online { "yes" } else { "no" });
    println!("Server:     {}", engine.config().api_base_url.cyan());
    println!("Reachable:  {}", if state.server_reachable { "yes" } else { "no" });
    println!("Storage:    {}", engine.storage_name());
    println!("Cached:     {} books", engine.cached_books().await.len());
    println!("Pending:    {} changes", engine.pending_actions().await.len());

    let failed = engine.failed_actions().await.len();
    if failed > 0 {
        println!("Failed:     {}", failed.to_string().red());
    }

    Ok(())
}

pub async fn stats(engine: &OfflineEngine) -> Result<()> {
    match engine.refresh_stats().await? {
        Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
        None => println!("{}", "Statistics are unavailable while offline".yellow()),
    }
    Ok(())
}
