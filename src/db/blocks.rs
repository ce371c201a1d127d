//! Address block pool

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

use super::{now_ms, Database};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IpBlock {
    pub id: i64,
    pub cidr: String,
    pub enabled: bool,
    pub source_file: Option<String>,
    pub added_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Pool already had rows; the file was not read
    AlreadySeeded,
    /// Seed file does not exist
    MissingFile,
    Seeded { inserted: usize, rejected: usize },
}

/// Parse newline-delimited blocks. Blank lines and `#` comments are ignored,
/// bare addresses become single-host networks, duplicates collapse.
/// Returns the accepted blocks in file order plus the rejected lines.
pub fn parse_seed(content: &str) -> (Vec<String>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let net = line
            .parse::<IpNet>()
            .ok()
            .or_else(|| line.parse::<IpAddr>().ok().map(IpNet::from));
        match net {
            Some(net) => {
                let cidr = net.to_string();
                if seen.insert(cidr.clone()) {
                    accepted.push(cidr);
                }
            }
            None => rejected.push(line.to_string()),
        }
    }

    (accepted, rejected)
}

impl Database {
    /// Seed the pool from `path` if and only if the pool table is empty.
    pub async fn seed_blocks_if_empty(&self, path: &Path) -> Result<SeedOutcome> {
        // Cheap pre-check so an established pool never touches the file
        let existing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ip_blocks")
            .fetch_one(self.pool())
            .await?;
        if existing.0 > 0 {
            return Ok(SeedOutcome::AlreadySeeded);
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Block seed file not found: {}", path.display());
                return Ok(SeedOutcome::MissingFile);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading seed file {}", path.display()))
            }
        };

        let (blocks, rejected) = parse_seed(&content);
        for line in &rejected {
            warn!("Skipping invalid block in {}: {:?}", path.display(), line);
        }

        let source = path.to_string_lossy().into_owned();
        let mut tx = self.begin_immediate().await?;
        let outcome = insert_seed(&mut tx, &blocks, &source).await;
        let inserted = self.finish(tx, outcome).await?;

        match inserted {
            Some(inserted) => {
                info!("Seeded {} blocks from {}", inserted, path.display());
                Ok(SeedOutcome::Seeded {
                    inserted,
                    rejected: rejected.len(),
                })
            }
            None => Ok(SeedOutcome::AlreadySeeded),
        }
    }

    pub async fn list_blocks(&self) -> Result<Vec<IpBlock>> {
        let rows = sqlx::query_as::<_, IpBlock>(
            "SELECT id, cidr, enabled, source_file, added_at FROM ip_blocks ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn count_enabled_blocks(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ip_blocks WHERE enabled = 1")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }

    /// Returns false when no block matches `cidr`.
    pub async fn set_block_enabled(&self, cidr: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE ip_blocks SET enabled = ? WHERE cidr = ?")
            .bind(enabled)
            .bind(cidr)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Enabled blocks in pool order. Sampler indices refer to positions in this list.
pub async fn enabled_pool(conn: &mut SqliteConnection) -> Result<Vec<IpBlock>, sqlx::Error> {
    sqlx::query_as::<_, IpBlock>(
        "SELECT id, cidr, enabled, source_file, added_at FROM ip_blocks WHERE enabled = 1 ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await
}

async fn insert_seed(
    conn: &mut SqliteConnection,
    blocks: &[String],
    source: &str,
) -> Result<Option<usize>, sqlx::Error> {
    // Re-check under the write lock: another process may have seeded meanwhile
    let existing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ip_blocks")
        .fetch_one(&mut *conn)
        .await?;
    if existing.0 > 0 {
        return Ok(None);
    }

    let added_at = now_ms();
    let mut inserted = 0;
    for cidr in blocks {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO ip_blocks (cidr, enabled, source_file, added_at) VALUES (?, 1, ?, ?)",
        )
        .bind(cidr)
        .bind(source)
        .bind(added_at)
        .execute(&mut *conn)
        .await?;
        inserted += result.rows_affected() as usize;
    }
    Ok(Some(inserted))
}
