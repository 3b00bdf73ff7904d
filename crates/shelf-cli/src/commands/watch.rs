use anyhow::Result;
use colored::Colorize;
use shelf_sync::OfflineEngine;
use std::sync::Arc;
use std::time::Duration;

/// Run the background tasks until Ctrl-C, printing status changes
pub async fn execute(engine: &Arc<OfflineEngine>) -> Result<()> {
    let tasks = engine.start();
    println!("{}", "Watching for changes, press Ctrl-C to stop".green().bold());

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut last_status = None;
    let mut last_count = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let status = engine.status().await;
                if last_status != Some(status) {
                    println!("status: {}", status.to_string().cyan());
                    last_status = Some(status);
                }
                let count = engine.books().await.len();
                if last_count != Some(count) {
                    println!("books in view: {}", count);
                    last_count = Some(count);
                }
            }
        }
    }

    tasks.shutdown();
    println!("{}", "Stopped".dimmed());
    Ok(())
}
