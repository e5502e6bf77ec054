//! Index statistics and document listing.
//!
//! Backs `mmrag stats` and `mmrag documents`: a quick view of what is
//! indexed, how it splits across modalities, and whether any entries were
//! embedded in a space other than the configured one (those need
//! re-ingestion after an encoder change).

use anyhow::Result;

use mmrag_core::models::SpaceVersion;
use mmrag_core::store::VectorIndex;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteIndex;

async fn open_index(config: &Config) -> Result<SqliteIndex> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    Ok(SqliteIndex::new(pool))
}

/// Print a summary of the index.
pub async fn run_stats(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    let stats = index.stats().await?;
    let current = SpaceVersion::new(&config.embedding.model, config.embedding.dims);

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("mmrag — Index Stats");
    println!("===================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Space:       {}", current);
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Entries:     {}", stats.entries);

    if !stats.entries_by_modality.is_empty() {
        println!();
        println!("  By modality:");
        for (modality, count) in &stats.entries_by_modality {
            println!("    {:<12} {:>8}", modality, count);
        }
    }

    let stale = stats.stale_entries(&current);
    if stale > 0 {
        println!();
        println!("  Stale entries (other spaces): {}", stale);
        for (space, count) in &stats.entries_by_space {
            if space != current.as_str() {
                println!("    {:<24} {:>8}", space, count);
            }
        }
        println!("  Re-ingest the affected documents to make them searchable again.");
    }

    println!();
    index.pool().close().await;
    Ok(())
}

/// Print one line per indexed document, newest first.
pub async fn run_documents(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    let documents = index.list_documents().await?;

    if documents.is_empty() {
        println!("No documents indexed.");
    } else {
        println!(
            "{:<18} {:<6} {:<20} {:>7} {:>9}   {:<14} FILENAME",
            "ID", "TYPE", "STATUS", "CHUNKS", "SIZE", "UPLOADED"
        );
        println!("{}", "-".repeat(96));
        for doc in &documents {
            println!(
                "{:<18} {:<6} {:<20} {:>7} {:>9}   {:<14} {}",
                doc.id,
                doc.modality.as_str(),
                doc.status.as_str(),
                doc.chunk_count,
                format_bytes(doc.size_bytes),
                format_ts_relative(doc.uploaded_at),
                doc.filename
            );
        }
    }

    index.pool().close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
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

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => plural(delta / 60, "min"),
        3600..=86_399 => plural(delta / 3600, "hour"),
        86_400..=2_591_999 => plural(delta / 86_400, "day"),
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
