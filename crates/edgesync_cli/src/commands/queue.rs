//! Queue inspection command implementation.

use edgesync_queue::{OfflineQueue, QueueStats, QueuedOperation};
use serde::Serialize;
use std::error::Error;
use std::path::Path;

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct QueueReport {
    /// Queue file.
    pub path: String,
    /// Row counts.
    pub stats: QueueStats,
    /// Oldest rows, in delivery order.
    pub head: Vec<QueuedOperation>,
}

/// Reads a queue file without contacting the cloud.
pub fn collect(path: &Path, limit: usize) -> Result<QueueReport, Box<dyn Error>> {
    if !path.exists() {
        return Err(format!("no queue found at {}", path.display()).into());
    }

    let queue = OfflineQueue::open(path)?;
    let report = QueueReport {
        path: path.display().to_string(),
        stats: queue.stats(),
        head: queue.peek(limit),
    };
    queue.close()?;
    Ok(report)
}

/// Runs the queue command.
pub fn run(path: &Path, limit: usize, format: &str) -> Result<(), Box<dyn Error>> {
    let report = collect(path, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        "text" => {
            println!("Queue: {}", report.path);
            println!("  pending:   {}", report.stats.pending);
            println!("  failed:    {}", report.stats.failed);
            println!("  completed: {}", report.stats.completed);
            for op in &report.head {
                print!(
                    "  #{:<6} {} {:<6} {} attempts={}",
                    op.id,
                    op.created_at.to_rfc3339(),
                    op.operation,
                    op.entity,
                    op.attempts
                );
                match &op.last_error {
                    Some(reason) => println!(" error={reason}"),
                    None => println!(),
                }
            }
        }
        other => return Err(format!("unknown format {other:?}").into()),
    }
    Ok(())
}
