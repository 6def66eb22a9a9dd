//! Index status overview.
//!
//! Summarizes, per configured index, how many items are tracked, how many
//! are indexed, and how many tasks wait on its server. Used by `sidx status`
//! to confirm that syncs and task sweeps are keeping up.

use anyhow::Result;
use serde::Serialize;

use crate::indexing::Engine;

/// Per-index counts.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub index: String,
    pub server: String,
    pub backend: String,
    pub total: u64,
    pub indexed: u64,
    pub applied_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server: String,
    pub backend: String,
    pub pending_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub indexes: Vec<IndexStatus>,
    pub servers: Vec<ServerStatus>,
}

pub async fn collect_status(engine: &Engine) -> Result<Status> {
    let mut indexes = Vec::new();
    for index in engine.indexes() {
        let tracker = engine.tracker(&index.id);
        let server = engine.server(&index.server)?;
        indexes.push(IndexStatus {
            index: index.id.clone(),
            server: index.server.clone(),
            backend: server.backend_kind().to_string(),
            total: tracker.get_total_items_count().await?,
            indexed: tracker.get_indexed_items_count().await?,
            applied_at: engine.registry().get(&index.id).await?.map(|r| r.updated_at),
        });
    }
    let mut servers = Vec::new();
    for server in engine.servers() {
        servers.push(ServerStatus {
            server: server.id().to_string(),
            backend: server.backend_kind().to_string(),
            pending_tasks: server.tasks().pending_count(server.id()).await?,
        });
    }
    Ok(Status { indexes, servers })
}

/// Print the status table.
pub async fn run_status(engine: &Engine, db_path: &std::path::Path) -> Result<()> {
    let status = collect_status(engine).await?;
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("Search Harness Status");
    println!("=====================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));

    println!();
    println!(
        "  {:<20} {:<12} {:>8} {:>8} {:>8}   {}",
        "INDEX", "SERVER", "TOTAL", "INDEXED", "PENDING", "APPLIED"
    );
    println!("  {}", "-".repeat(76));
    for s in &status.indexes {
        let applied = match s.applied_at {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        };
        println!(
            "  {:<20} {:<12} {:>8} {:>8} {:>8}   {}",
            s.index,
            s.server,
            s.total,
            s.indexed,
            s.total - s.indexed,
            applied
        );
    }

    println!();
    println!("  {:<20} {:<12} {:>8}", "SERVER", "BACKEND", "TASKS");
    println!("  {}", "-".repeat(42));
    for s in &status.servers {
        println!("  {:<20} {:<12} {:>8}", s.server, s.backend, s.pending_tasks);
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now ("3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
