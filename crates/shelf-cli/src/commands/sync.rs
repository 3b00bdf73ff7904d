use anyhow::Result;
use colored::Colorize;
use shelf_sync::{OfflineEngine, PassOutcome};

pub async fn execute(engine: &OfflineEngine) -> Result<()> {
    match engine.sync_now().await? {
        PassOutcome::Completed(report) => {
            println!(
                "{} {} processed, {} failed",
                "Sync finished:".green().bold(),
                report.processed,
                report.failed
            );
            for (local, server) in &report.id_mapping {
                println!("  {} -> {}", local.dimmed(), server.cyan());
            }
            if report.failed > 0 {
                println!("{}", "Failed changes stay queued, see `shelf pending`".yellow());
            }
        }
        PassOutcome::NothingToSync => println!("{}", "Nothing to sync".green()),
        PassOutcome::AlreadyRunning => println!("{}", "A sync is already running".yellow()),
        PassOutcome::Unavailable => {
            println!("{}", "Server unreachable, changes stay queued".red());
        }
    }
    Ok(())
}

pub async fn pending(engine: &OfflineEngine, json: bool) -> Result<()> {
    let actions = engine.pending_actions().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&actions)?);
        return Ok(());
    }

    if actions.is_empty() {
        println!("{}", "No pending changes".green());
        return Ok(());
    }

    for action in &actions {
        let target = action
            .record_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let title = action
            .payload
            .draft
            .as_ref()
            .map(|draft| draft.title.as_str())
            .unwrap_or("");
        println!(
            "{}  {:<6} {} {}",
            action.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            action.kind.to_string().bold(),
            target.cyan(),
            title
        );
        if let Some(error) = &action.last_error {
            println!("    {} after {} attempts: {}", "failed".red(), action.attempts, error);
        }
    }
    Ok(())
}
