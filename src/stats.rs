//! Relocation statistics.
//!
//! Summarizes what a run has produced so far: stored redirects per status
//! code, and the local asset tree broken down by date partition. Used by
//! `wprl stats` to confirm fetches and redirects landed where expected.

use anyhow::Result;
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Counts for the local asset tree.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AssetStats {
    pub files: u64,
    pub bytes: u64,
    /// Interrupted downloads (`*.part`) left behind.
    pub partials: u64,
    /// `YYYY/MM` → file count.
    pub by_partition: BTreeMap<String, u64>,
}

/// Walk `root` and tally finished assets. A missing root is an empty tree.
pub fn scan_assets(root: &Path) -> AssetStats {
    let mut stats = AssetStats::default();
    if !root.exists() {
        return stats;
    }

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "part") {
            stats.partials += 1;
            continue;
        }

        stats.files += 1;
        stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);

        let partition = path
            .strip_prefix(root)
            .ok()
            .and_then(|rel| {
                let parts: Vec<_> = rel.iter().filter_map(|c| c.to_str()).collect();
                match parts.as_slice() {
                    [year, month, _file] => Some(format!("{}/{}", year, month)),
                    _ => None,
                }
            })
            .unwrap_or_else(|| "(other)".to_string());
        *stats.by_partition.entry(partition).or_insert(0) += 1;
    }

    stats
}

/// Run the stats command: query the redirect table, walk the asset tree, and
/// print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;

    let total_redirects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM redirects")
        .fetch_one(&pool)
        .await?;

    let status_rows = sqlx::query(
        "SELECT status_code, COUNT(*) AS n FROM redirects GROUP BY status_code ORDER BY status_code",
    )
    .fetch_all(&pool)
    .await?;

    let last_created: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM redirects")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let assets = scan_assets(&config.assets.root);

    println!("wp-relocate stats");
    println!("=================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Redirects:   {}", total_redirects);
    for row in &status_rows {
        let code: i64 = row.get("status_code");
        let n: i64 = row.get("n");
        println!("    {}:       {}", code, n);
    }
    if let Some(ts) = last_created {
        println!("  Last added:  {}", format_ts(ts));
    }
    println!();
    println!("  Assets:      {}", config.assets.root.display());
    println!("  Files:       {}", assets.files);
    println!("  Size:        {}", format_bytes(assets.bytes));
    if assets.partials > 0 {
        println!("  Partial:     {}", assets.partials);
    }

    if !assets.by_partition.is_empty() {
        println!();
        println!("  By partition:");
        println!("  {:<12} {:>8}", "PARTITION", "FILES");
        println!("  {}", "-".repeat(21));
        for (partition, n) in &assets.by_partition {
            println!("  {:<12} {:>8}", partition, n);
        }
    }

    println!();

    pool.close().await;
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

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
