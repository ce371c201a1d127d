//! Database module

mod blocks;
mod runs;
mod schema;
mod stored;

pub use blocks::{enabled_pool, IpBlock, SeedOutcome};
pub use runs::{EndpointRecord, InitiatedBy, Observation, RunBlock, RunRecord, RunStatus};
pub use stored::Stored;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite, Transaction};
use std::time::Duration;
use tracing::warn;

use crate::config::DatabaseConfig;

/// Current wall clock in Unix milliseconds, the unit every timestamp column uses
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.url)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Take a connection and open a write-locking transaction on it.
    ///
    /// `BEGIN IMMEDIATE` grabs SQLite's reserved lock up front, so concurrent
    /// writers in other processes queue on the busy timeout instead of failing
    /// at commit. Dropping the transaction before [`Database::finish`] rolls it
    /// back, so a cancelled caller never returns a locked connection to the pool.
    pub async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    /// Commit on `Ok`, roll back on `Err`, and hand the outcome back.
    pub async fn finish<T, E>(
        &self,
        tx: Transaction<'static, Sqlite>,
        outcome: Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<sqlx::Error>,
    {
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Fresh on-disk database; the TempDir must outlive the Database
    pub async fn temp_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("test.db").to_string_lossy().into_owned(),
            busy_timeout_ms: 5000,
            max_connections: 4,
        };
        let db = Database::new(&config).await.unwrap();
        db.run_migrations().await.unwrap();
        (db, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_db;
    use super::*;

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let (db, _dir) = temp_db().await;

        let mut tx = db.begin_immediate().await.unwrap();
        sqlx::query("INSERT INTO ip_blocks (cidr, added_at) VALUES ('10.0.0.0/24', 0)")
            .execute(&mut *tx)
            .await
            .unwrap();
        let outcome: Result<(), sqlx::Error> = Err(sqlx::Error::RowNotFound);
        assert!(db.finish(tx, outcome).await.is_err());

        assert_eq!(db.count_enabled_blocks().await.unwrap(), 0);

        // The connection went back to the pool outside any transaction
        let tx = db.begin_immediate().await.unwrap();
        db.finish(tx, Ok::<_, sqlx::Error>(())).await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_transaction_releases_the_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("locks.db").to_string_lossy().into_owned(),
            busy_timeout_ms: 2000,
            max_connections: 1,
        };
        let db = Database::new(&config).await.unwrap();
        db.run_migrations().await.unwrap();

        // Cancelled between BEGIN and COMMIT, like a client that hangs up
        let abandoned = async {
            let mut tx = db.begin_immediate().await.unwrap();
            sqlx::query("INSERT INTO ip_blocks (cidr, added_at) VALUES ('10.0.0.0/24', 0)")
                .execute(&mut *tx)
                .await
                .unwrap();
            std::future::pending::<()>().await;
        };
        assert!(tokio::time::timeout(Duration::from_millis(50), abandoned)
            .await
            .is_err());

        // The single pooled connection is usable again
        let tx = db.begin_immediate().await.unwrap();
        db.finish(tx, Ok::<_, sqlx::Error>(())).await.unwrap();

        // And another handle on the same file can write
        let other = Database::new(&config).await.unwrap();
        sqlx::query("INSERT INTO ip_blocks (cidr, added_at) VALUES ('10.0.1.0/24', 0)")
            .execute(other.pool())
            .await
            .unwrap();
        assert_eq!(other.count_enabled_blocks().await.unwrap(), 1);
    }
}
