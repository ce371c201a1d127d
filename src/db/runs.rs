//! Runs, block attributions and discovered endpoints

use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use super::{now_ms, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InitiatedBy {
    Scheduler,
    Dashboard,
    Manual,
}

impl InitiatedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitiatedBy::Scheduler => "scheduler",
            InitiatedBy::Dashboard => "dashboard",
            InitiatedBy::Manual => "manual",
        }
    }
}

impl fmt::Display for InitiatedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub initiated_by: String,
    pub status: RunStatus,
    pub blocks_scanned: i64,
    pub ips_found: i64,
}

type RunRow = (String, i64, Option<i64>, String, String, i64, i64);

impl From<RunRow> for RunRecord {
    fn from(row: RunRow) -> Self {
        let (run_id, started_at, ended_at, initiated_by, status, blocks_scanned, ips_found) = row;
        // The CHECK constraint keeps status well-formed; anything else reads as failed
        let status = status.parse().unwrap_or(RunStatus::Failed);
        RunRecord {
            run_id,
            started_at,
            ended_at,
            initiated_by,
            status,
            blocks_scanned,
            ips_found,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunBlock {
    pub run_id: String,
    pub ip_block: String,
    pub picked_at: i64,
    pub block_source_file: Option<String>,
    pub block_namespace: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EndpointRecord {
    pub ip: String,
    pub port: i64,
    pub source: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub seen_count: i64,
}

/// One parsed producer line, stamped when it arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub ip: IpAddr,
    pub port: u16,
    pub seen_at: i64,
}

const RUN_COLUMNS: &str =
    "run_id, started_at, ended_at, initiated_by, status, blocks_scanned, ips_found";

impl Database {
    pub async fn create_run(&self, initiated_by: InitiatedBy) -> Result<RunRecord, sqlx::Error> {
        let run = RunRecord {
            run_id: Uuid::new_v4().to_string(),
            started_at: now_ms(),
            ended_at: None,
            initiated_by: initiated_by.as_str().to_string(),
            status: RunStatus::Running,
            blocks_scanned: 0,
            ips_found: 0,
        };

        let mut tx = self.begin_immediate().await?;
        let outcome = sqlx::query(
            "INSERT INTO runs (run_id, started_at, initiated_by, status) VALUES (?, ?, ?, 'running')",
        )
        .bind(&run.run_id)
        .bind(run.started_at)
        .bind(&run.initiated_by)
        .execute(&mut *tx)
        .await;
        self.finish(tx, outcome).await?;

        Ok(run)
    }

    pub async fn record_run_block(
        &self,
        run_id: &str,
        ip_block: &str,
        picked_at: i64,
        block_source_file: Option<&str>,
        block_namespace: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO run_blocks (run_id, ip_block, picked_at, block_source_file, block_namespace) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(ip_block)
        .bind(picked_at)
        .bind(block_source_file)
        .bind(block_namespace)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn increment_blocks_scanned(&self, run_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE runs SET blocks_scanned = blocks_scanned + 1 WHERE run_id = ? AND status = 'running'",
        )
        .bind(run_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Close a running run. Only the first call has an effect; `None` means
    /// the run was not in `running` state.
    pub async fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
    ) -> Result<Option<RunRecord>, sqlx::Error> {
        let mut tx = self.begin_immediate().await?;
        let outcome = finalize_in_tx(&mut tx, run_id, status).await;
        self.finish(tx, outcome).await
    }

    /// Apply a batch of observations at both run and run-block granularity.
    ///
    /// Observations are applied in order inside one transaction, each under
    /// its own savepoint so the run and block rows land together or not at
    /// all. A failing observation is logged and skipped. Returns how many
    /// observations failed.
    pub async fn upsert_observations(
        &self,
        run_id: &str,
        ip_block: &str,
        source: &str,
        batch: &[Observation],
    ) -> Result<usize, sqlx::Error> {
        let mut tx = self.pool().begin().await?;
        let mut failed = 0;

        for obs in batch {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            let stored = upsert_observation(&mut savepoint, run_id, ip_block, source, obs).await;
            match stored {
                Ok(()) => savepoint.commit().await?,
                Err(e) => {
                    warn!("Failed to store endpoint {}:{} from {}: {}", obs.ip, obs.port, ip_block, e);
                    savepoint.rollback().await?;
                    failed += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(failed)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, sqlx::Error> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {} FROM runs WHERE run_id = ?", RUN_COLUMNS))
                .bind(run_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(RunRecord::from))
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunRecord>, sqlx::Error> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs ORDER BY started_at DESC LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(RunRecord::from).collect())
    }

    /// Block attributions in pick order
    pub async fn run_blocks(&self, run_id: &str) -> Result<Vec<RunBlock>, sqlx::Error> {
        sqlx::query_as::<_, RunBlock>(
            "SELECT run_id, ip_block, picked_at, block_source_file, block_namespace FROM run_blocks WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await
    }

    pub async fn run_endpoints(
        &self,
        run_id: &str,
        limit: i64,
    ) -> Result<Vec<EndpointRecord>, sqlx::Error> {
        sqlx::query_as::<_, EndpointRecord>(
            r#"
            SELECT ip, port, source, first_seen, last_seen, seen_count
            FROM endpoints
            WHERE run_id = ?
            ORDER BY seen_count DESC, ip, port
            LIMIT ?
            "#,
        )
        .bind(run_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
    }

    pub async fn block_endpoints(
        &self,
        run_id: &str,
        ip_block: &str,
    ) -> Result<Vec<EndpointRecord>, sqlx::Error> {
        sqlx::query_as::<_, EndpointRecord>(
            r#"
            SELECT ip, port, source, first_seen, last_seen, seen_count
            FROM block_endpoints
            WHERE run_id = ? AND ip_block = ?
            ORDER BY ip, port
            "#,
        )
        .bind(run_id)
        .bind(ip_block)
        .fetch_all(self.pool())
        .await
    }
}

async fn upsert_observation(
    conn: &mut SqliteConnection,
    run_id: &str,
    ip_block: &str,
    source: &str,
    obs: &Observation,
) -> Result<(), sqlx::Error> {
    let ip = obs.ip.to_string();
    sqlx::query(
        r#"
        INSERT INTO endpoints (run_id, ip, port, source, first_seen, last_seen, seen_count)
        VALUES (?, ?, ?, ?, ?, ?, 1)
        ON CONFLICT (run_id, ip, port, source) DO UPDATE SET
            seen_count = seen_count + 1,
            last_seen = MAX(last_seen, excluded.last_seen)
        "#,
    )
    .bind(run_id)
    .bind(&ip)
    .bind(obs.port as i64)
    .bind(source)
    .bind(obs.seen_at)
    .bind(obs.seen_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO block_endpoints (run_id, ip_block, ip, port, source, first_seen, last_seen, seen_count)
        VALUES (?, ?, ?, ?, ?, ?, ?, 1)
        ON CONFLICT (run_id, ip_block, ip, port, source) DO UPDATE SET
            seen_count = seen_count + 1,
            last_seen = MAX(last_seen, excluded.last_seen)
        "#,
    )
    .bind(run_id)
    .bind(ip_block)
    .bind(&ip)
    .bind(obs.port as i64)
    .bind(source)
    .bind(obs.seen_at)
    .bind(obs.seen_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn finalize_in_tx(
    conn: &mut SqliteConnection,
    run_id: &str,
    status: RunStatus,
) -> Result<Option<RunRecord>, sqlx::Error> {
    let ips_found: (i64,) =
        sqlx::query_as("SELECT COUNT(DISTINCT ip) FROM endpoints WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&mut *conn)
            .await?;

    let result = sqlx::query(
        "UPDATE runs SET status = ?, ended_at = ?, ips_found = ? WHERE run_id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(now_ms())
    .bind(ips_found.0)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    let row: RunRow = sqlx::query_as(&format!("SELECT {} FROM runs WHERE run_id = ?", RUN_COLUMNS))
        .bind(run_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Some(row.into()))
}
