//! Persisted scheduler state
//!
//! One row, created with defaults the first time anything reads it. Every
//! transition loads the row, applies a pure mutation and writes it back
//! inside a single `BEGIN IMMEDIATE` transaction. Plain reads skip the write
//! lock once the row exists.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::process::ExitStatus;
use thiserror::Error;
use tracing::warn;

use crate::db::{Database, InitiatedBy, Stored};
use crate::pipeline::exit_parts;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("delay must be a positive number of seconds, got {0}")]
    InvalidDelay(i64),
    #[error("a run is already in flight")]
    AlreadyRunning,
    #[error("scheduler store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Who asked for a scheduler change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSource {
    Dashboard,
    Cli,
}

impl ControlSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSource::Dashboard => "dashboard",
            ControlSource::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LastExit {
    pub fn from_status(status: &ExitStatus) -> Self {
        let (code, signal) = exit_parts(status);
        Self {
            code,
            signal,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerState {
    pub armed: bool,
    pub delay_seconds: i64,
    pub next_run_at: Option<i64>,
    pub running: bool,
    pub started_by_dashboard: bool,
    pub last_exit: Option<LastExit>,
    /// PID of the run process this scheduler launched, while it runs
    pub run_pid: Option<u32>,
}

impl SchedulerState {
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            armed: self.armed,
            delay_seconds: self.delay_seconds,
            next_run_at_ms: self.next_run_at,
            running: self.running,
            last_exit: self.last_exit.clone(),
        }
    }

    fn is_due(&self, now: i64) -> bool {
        self.armed && !self.running && self.next_run_at.is_some_and(|at| now >= at)
    }
}

/// Shape returned to control surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub armed: bool,
    pub delay_seconds: i64,
    pub next_run_at_ms: Option<i64>,
    pub running: bool,
    pub last_exit: Option<LastExit>,
}

#[derive(Clone)]
pub struct StateStore {
    db: Database,
    default_delay_seconds: i64,
}

impl StateStore {
    pub fn new(db: Database, default_delay_seconds: i64) -> Self {
        Self {
            db,
            default_delay_seconds,
        }
    }

    pub async fn load(&self, now: i64) -> Result<SchedulerState, SchedulerError> {
        let mut conn = self.db.pool().acquire().await?;
        if let Some(state) = read_row(&mut conn, self.default_delay_seconds).await? {
            return Ok(state);
        }
        drop(conn);
        self.transition(now, |_| Ok(())).await.map(|(state, ())| state)
    }

    pub async fn arm(&self, delay_seconds: i64, source: ControlSource, now: i64) -> Result<SchedulerState, SchedulerError> {
        if delay_seconds <= 0 {
            return Err(SchedulerError::InvalidDelay(delay_seconds));
        }
        self.apply(now, |state| {
            state.armed = true;
            state.delay_seconds = delay_seconds;
            state.next_run_at = Some(now + delay_seconds * 1000);
            state.started_by_dashboard = source == ControlSource::Dashboard;
            Ok(())
        })
        .await
    }

    pub async fn cancel(&self, now: i64) -> Result<SchedulerState, SchedulerError> {
        self.apply(now, |state| {
            state.armed = false;
            state.next_run_at = None;
            state.started_by_dashboard = false;
            Ok(())
        })
        .await
    }

    pub async fn run_now(&self, source: ControlSource, epsilon_ms: i64, now: i64) -> Result<SchedulerState, SchedulerError> {
        self.apply(now, |state| {
            if state.running {
                return Err(SchedulerError::AlreadyRunning);
            }
            state.armed = true;
            state.next_run_at = Some(now + epsilon_ms.max(0));
            state.started_by_dashboard = source == ControlSource::Dashboard;
            Ok(())
        })
        .await
    }

    /// Mark a run as started if one is due. `next_run_at` is left alone until
    /// the run exits.
    pub async fn claim_fire(&self, now: i64) -> Result<Option<InitiatedBy>, SchedulerError> {
        self.transition(now, |state| {
            if !state.is_due(now) {
                return Ok(None);
            }
            state.running = true;
            state.run_pid = None;
            Ok(Some(if state.started_by_dashboard {
                InitiatedBy::Dashboard
            } else {
                InitiatedBy::Scheduler
            }))
        })
        .await
        .map(|(_, fired)| fired)
    }

    pub async fn attach_pid(&self, pid: u32, now: i64) -> Result<(), SchedulerError> {
        self.apply(now, |state| {
            if state.running {
                state.run_pid = Some(pid);
            }
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// Leave `running`, remember how the run ended and, if still armed,
    /// schedule the next fire `delay_seconds` after `now`.
    ///
    /// `pid` is the process that exited. When both it and the recorded PID are
    /// known they must match; otherwise the exit belongs to an older run and
    /// nothing changes. Returns `None` when the exit was not applied.
    pub async fn record_exit(
        &self,
        pid: Option<u32>,
        exit: LastExit,
        now: i64,
    ) -> Result<Option<SchedulerState>, SchedulerError> {
        self.transition(now, |state| {
            let owns_run = match (state.run_pid, pid) {
                (Some(recorded), Some(exited)) => recorded == exited,
                _ => true,
            };
            if !state.running || !owns_run {
                return Ok(false);
            }
            finish_run(state, exit, now);
            Ok(true)
        })
        .await
        .map(|(state, applied)| applied.then_some(state))
    }

    /// Like [`StateStore::record_exit`], but only if `pid` is still the run on record
    pub async fn release_lost_run(&self, pid: u32, now: i64) -> Result<bool, SchedulerError> {
        self.transition(now, |state| {
            if !state.running || state.run_pid != Some(pid) {
                return Ok(false);
            }
            finish_run(state, LastExit::error(format!("run process {} lost", pid)), now);
            Ok(true)
        })
        .await
        .map(|(_, released)| released)
    }

    /// The launcher could not start a run: disarm instead of retrying.
    pub async fn record_spawn_failure(&self, error: String, now: i64) -> Result<SchedulerState, SchedulerError> {
        self.apply(now, |state| {
            state.running = false;
            state.run_pid = None;
            state.armed = false;
            state.next_run_at = None;
            state.started_by_dashboard = false;
            state.last_exit = Some(LastExit::error(error));
            Ok(())
        })
        .await
    }

    async fn apply<F>(&self, now: i64, mutate: F) -> Result<SchedulerState, SchedulerError>
    where
        F: FnOnce(&mut SchedulerState) -> Result<(), SchedulerError>,
    {
        self.transition(now, mutate).await.map(|(state, ())| state)
    }

    /// Load, mutate and persist the row in one immediate transaction.
    /// Nothing is written when `mutate` fails or leaves the state unchanged.
    async fn transition<T, F>(&self, now: i64, mutate: F) -> Result<(SchedulerState, T), SchedulerError>
    where
        F: FnOnce(&mut SchedulerState) -> Result<T, SchedulerError>,
    {
        let mut tx = self.db.begin_immediate().await?;
        let outcome = async {
            let before = load_or_create(&mut tx, self.default_delay_seconds, now).await?;
            let mut state = before.clone();
            let value = mutate(&mut state)?;
            if state != before {
                save(&mut tx, &state, now).await?;
            }
            Ok::<_, SchedulerError>((state, value))
        }
        .await;
        self.db.finish(tx, outcome).await
    }
}

fn finish_run(state: &mut SchedulerState, exit: LastExit, now: i64) {
    state.running = false;
    state.run_pid = None;
    state.started_by_dashboard = false;
    state.last_exit = Some(exit);
    // Fixed delay: measured from completion, not from the previous fire
    state.next_run_at = state.armed.then(|| now + state.delay_seconds * 1000);
}

type StateRow = (bool, i64, Option<i64>, bool, bool, Option<String>, Option<i64>);

async fn load_or_create(
    conn: &mut SqliteConnection,
    default_delay_seconds: i64,
    now: i64,
) -> Result<SchedulerState, sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO scheduler_state (id, armed, delay_seconds, running, started_by_dashboard, updated_at) VALUES (1, 0, ?, 0, 0, ?)",
    )
    .bind(default_delay_seconds)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    read_row(conn, default_delay_seconds)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

async fn read_row(
    conn: &mut SqliteConnection,
    default_delay_seconds: i64,
) -> Result<Option<SchedulerState>, sqlx::Error> {
    let row: Option<StateRow> = sqlx::query_as(
        "SELECT armed, delay_seconds, next_run_at, running, started_by_dashboard, last_exit, run_pid FROM scheduler_state WHERE id = 1",
    )
    .fetch_optional(&mut *conn)
    .await?;
    let Some((armed, delay_seconds, next_run_at, running, started_by_dashboard, last_exit, run_pid)) = row
    else {
        return Ok(None);
    };

    let last_exit = match Stored::<LastExit>::from_json(last_exit.as_deref()) {
        Stored::Value(exit) => Some(exit),
        Stored::Absent => None,
        Stored::Corrupt(reason) => {
            warn!("Discarding unreadable scheduler last_exit: {}", reason);
            None
        }
    };

    Ok(Some(SchedulerState {
        armed,
        delay_seconds: if delay_seconds > 0 { delay_seconds } else { default_delay_seconds },
        next_run_at,
        running,
        started_by_dashboard,
        last_exit,
        run_pid: run_pid.and_then(|pid| u32::try_from(pid).ok()),
    }))
}

async fn save(conn: &mut SqliteConnection, state: &SchedulerState, now: i64) -> Result<(), sqlx::Error> {
    let last_exit = state
        .last_exit
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        UPDATE scheduler_state SET
            armed = ?, delay_seconds = ?, next_run_at = ?, running = ?,
            started_by_dashboard = ?, last_exit = ?, run_pid = ?, updated_at = ?
        WHERE id = 1
        "#,
    )
    .bind(state.armed)
    .bind(state.delay_seconds)
    .bind(state.next_run_at)
    .bind(state.running)
    .bind(state.started_by_dashboard)
    .bind(last_exit)
    .bind(state.run_pid.map(i64::from))
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    const T0: i64 = 1_700_000_000_000;

    async fn store() -> (StateStore, tempfile::TempDir) {
        let (db, dir) = temp_db().await;
        (StateStore::new(db, 3600), dir)
    }

    #[tokio::test]
    async fn first_read_creates_defaults() {
        let (store, _dir) = store().await;
        let state = store.load(T0).await.unwrap();
        assert!(!state.armed);
        assert!(!state.running);
        assert_eq!(state.delay_seconds, 3600);
        assert_eq!(state.next_run_at, None);
        assert_eq!(state.last_exit, None);
    }

    #[tokio::test]
    async fn rearm_overwrites_rather_than_adds() {
        let (store, _dir) = store().await;
        let armed = store.arm(60, ControlSource::Cli, T0).await.unwrap();
        assert_eq!(armed.next_run_at, Some(T0 + 60_000));

        let rearmed = store.arm(10, ControlSource::Cli, T0 + 5_000).await.unwrap();
        assert_eq!(rearmed.delay_seconds, 10);
        assert_eq!(rearmed.next_run_at, Some(T0 + 15_000));
    }

    #[tokio::test]
    async fn arm_rejects_non_positive_delay() {
        let (store, _dir) = store().await;
        assert!(matches!(
            store.arm(0, ControlSource::Cli, T0).await,
            Err(SchedulerError::InvalidDelay(0))
        ));
    }

    #[tokio::test]
    async fn cancel_disarms_but_leaves_running_alone() {
        let (store, _dir) = store().await;
        store.arm(5, ControlSource::Cli, T0).await.unwrap();
        assert!(store.claim_fire(T0 + 5_000).await.unwrap().is_some());

        let state = store.cancel(T0 + 6_000).await.unwrap();
        assert!(!state.armed);
        assert_eq!(state.next_run_at, None);
        assert!(state.running);

        // The in-flight run ends without scheduling another
        let state = store
            .record_exit(None, LastExit { code: Some(0), signal: None, error: None }, T0 + 9_000)
            .await
            .unwrap()
            .unwrap();
        assert!(!state.running);
        assert_eq!(state.next_run_at, None);
    }

    #[tokio::test]
    async fn run_now_keeps_cadence_and_refuses_overlap() {
        let (store, _dir) = store().await;
        store.arm(600, ControlSource::Cli, T0).await.unwrap();

        let state = store.run_now(ControlSource::Dashboard, 250, T0 + 1_000).await.unwrap();
        assert!(state.armed);
        assert_eq!(state.delay_seconds, 600);
        assert_eq!(state.next_run_at, Some(T0 + 1_250));

        assert_eq!(
            store.claim_fire(T0 + 1_250).await.unwrap(),
            Some(InitiatedBy::Dashboard)
        );
        assert!(matches!(
            store.run_now(ControlSource::Cli, 250, T0 + 2_000).await,
            Err(SchedulerError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn exit_rearms_from_completion_time() {
        let (store, _dir) = store().await;
        store.arm(10, ControlSource::Cli, T0).await.unwrap();
        assert_eq!(
            store.claim_fire(T0 + 10_000).await.unwrap(),
            Some(InitiatedBy::Scheduler)
        );

        // Fire time is frozen while the run is in flight
        let during = store.load(T0 + 30_000).await.unwrap();
        assert_eq!(during.next_run_at, Some(T0 + 10_000));
        assert!(store.claim_fire(T0 + 30_000).await.unwrap().is_none());

        let done = store
            .record_exit(None, LastExit { code: Some(0), signal: None, error: None }, T0 + 60_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.next_run_at, Some(T0 + 70_000));
        assert_eq!(done.last_exit.unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn spawn_failure_disarms() {
        let (store, _dir) = store().await;
        store.arm(1, ControlSource::Cli, T0).await.unwrap();
        store.claim_fire(T0 + 1_000).await.unwrap();

        let state = store
            .record_spawn_failure("No such file or directory".into(), T0 + 1_000)
            .await
            .unwrap();
        assert!(!state.armed);
        assert!(!state.running);
        assert_eq!(state.next_run_at, None);
        assert_eq!(
            state.last_exit.unwrap().error.as_deref(),
            Some("No such file or directory")
        );
    }

    #[tokio::test]
    async fn lost_run_is_released_only_for_matching_pid() {
        let (store, _dir) = store().await;
        store.arm(30, ControlSource::Cli, T0).await.unwrap();
        store.claim_fire(T0 + 30_000).await.unwrap();
        store.attach_pid(4242, T0 + 30_000).await.unwrap();

        assert!(!store.release_lost_run(1111, T0 + 40_000).await.unwrap());
        assert!(store.release_lost_run(4242, T0 + 40_000).await.unwrap());

        let state = store.load(T0 + 40_000).await.unwrap();
        assert!(!state.running);
        assert_eq!(state.run_pid, None);
        assert_eq!(state.next_run_at, Some(T0 + 70_000));
        assert!(state.last_exit.unwrap().error.unwrap().contains("4242"));
    }

    #[tokio::test]
    async fn stale_exit_does_not_end_the_next_run() {
        let (store, _dir) = store().await;
        store.arm(30, ControlSource::Cli, T0).await.unwrap();
        store.claim_fire(T0 + 30_000).await.unwrap();
        store.attach_pid(2, T0 + 30_000).await.unwrap();

        let exit = LastExit { code: Some(0), signal: None, error: None };
        assert!(store
            .record_exit(Some(1), exit.clone(), T0 + 31_000)
            .await
            .unwrap()
            .is_none());
        let state = store.load(T0 + 31_000).await.unwrap();
        assert!(state.running);
        assert_eq!(state.run_pid, Some(2));

        let state = store
            .record_exit(Some(2), exit, T0 + 32_000)
            .await
            .unwrap()
            .unwrap();
        assert!(!state.running);

        // Nothing is running any more, so a late duplicate is ignored too
        let late = LastExit::error("late");
        assert!(store.record_exit(Some(2), late, T0 + 33_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_does_not_wait_for_the_write_lock() {
        let (store, _dir) = store().await;
        store.load(T0).await.unwrap();

        let held = store.db.begin_immediate().await.unwrap();
        let state = tokio::time::timeout(std::time::Duration::from_secs(1), store.load(T0))
            .await
            .expect("load blocked behind a writer")
            .unwrap();
        assert!(!state.armed);
        store.db.finish(held, Ok::<_, sqlx::Error>(())).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_last_exit_reads_as_none() {
        let (store, _dir) = store().await;
        store.load(T0).await.unwrap();
        sqlx::query("UPDATE scheduler_state SET last_exit = '{not json' WHERE id = 1")
            .execute(store.db.pool())
            .await
            .unwrap();
        assert_eq!(store.load(T0).await.unwrap().last_exit, None);
    }

    #[test]
    fn status_serializes_camel_case() {
        let state = SchedulerState {
            armed: true,
            delay_seconds: 60,
            next_run_at: Some(5),
            running: false,
            started_by_dashboard: false,
            last_exit: Some(LastExit { code: Some(1), signal: None, error: None }),
            run_pid: None,
        };
        let json = serde_json::to_value(state.status()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "armed": true,
                "delaySeconds": 60,
                "nextRunAtMs": 5,
                "running": false,
                "lastExit": {"code": 1, "signal": null}
            })
        );
    }
}
