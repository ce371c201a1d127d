//! Durable run scheduler
//!
//! A poll loop over the persisted scheduler state. When the state is
//! armed, due and not running, the loop claims it, launches a pipeline
//! process and watches that process until it exits. Only processes launched
//! here are ever tracked.

mod state;

pub use state::{ControlSource, LastExit, SchedulerError, SchedulerStatus, StateStore};

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::db::{now_ms, Database, InitiatedBy};

const EXIT_RECORD_ATTEMPTS: u32 = 3;

/// Starts one pipeline run as an independent process
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, initiated_by: InitiatedBy) -> io::Result<Child>;
}

/// Re-executes this binary with `run`, in its own process group so signals
/// aimed at the scheduler do not reach the run.
pub struct SelfExecLauncher {
    exe: PathBuf,
    config_path: PathBuf,
}

impl SelfExecLauncher {
    pub fn new(config_path: PathBuf) -> io::Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            config_path,
        })
    }
}

impl Launcher for SelfExecLauncher {
    fn launch(&self, initiated_by: InitiatedBy) -> io::Result<Child> {
        let mut command = Command::new(&self.exe);
        command
            .arg("--config")
            .arg(&self.config_path)
            .arg("run")
            .arg("--initiated-by")
            .arg(initiated_by.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);
        command.spawn()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: StateStore,
    launcher: Arc<dyn Launcher>,
    poll_interval: Duration,
    run_now_epsilon_ms: i64,
    /// PID of the run this process is currently watching
    active: Arc<Mutex<Option<u32>>>,
}

impl Scheduler {
    pub fn new(db: Database, config: &SchedulerConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            store: StateStore::new(db, config.default_delay_seconds),
            launcher,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            run_now_epsilon_ms: config.run_now_epsilon_ms,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn arm(&self, delay_seconds: i64, source: ControlSource) -> Result<SchedulerStatus, SchedulerError> {
        let state = self.store.arm(delay_seconds, source, now_ms()).await?;
        info!(
            target: "oplog",
            source = source.as_str(),
            delay_seconds,
            next_run_at = state.next_run_at,
            "Scheduler armed"
        );
        Ok(state.status())
    }

    pub async fn cancel(&self, source: ControlSource) -> Result<SchedulerStatus, SchedulerError> {
        let state = self.store.cancel(now_ms()).await?;
        info!(target: "oplog", source = source.as_str(), running = state.running, "Scheduler disarmed");
        Ok(state.status())
    }

    pub async fn run_now(&self, source: ControlSource) -> Result<SchedulerStatus, SchedulerError> {
        let state = self
            .store
            .run_now(source, self.run_now_epsilon_ms, now_ms())
            .await?;
        info!(target: "oplog", source = source.as_str(), "Scheduler run requested");
        Ok(state.status())
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        Ok(self.store.load(now_ms()).await?.status())
    }

    /// Poll until `shutdown` is cancelled. A run in flight keeps going after
    /// the loop stops; its exit is picked up by the next scheduler instance.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Scheduler loop started (poll every {:?})", self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_at(now_ms()).await {
                        warn!("Scheduler poll failed: {}", e);
                    }
                }
            }
        }
    }

    /// One poll. Returns the watcher task when a run was launched.
    pub(crate) async fn tick_at(&self, now: i64) -> Result<Option<JoinHandle<()>>, SchedulerError> {
        self.reconcile(now).await?;

        let Some(initiated_by) = self.store.claim_fire(now).await? else {
            return Ok(None);
        };

        let child = match self.launcher.launch(initiated_by) {
            Ok(child) => child,
            Err(e) => {
                error!(target: "oplog", "Scheduler could not launch run, disarming: {}", e);
                self.store.record_spawn_failure(e.to_string(), now).await?;
                return Ok(None);
            }
        };

        let pid = child.id();
        info!(target: "oplog", initiated_by = %initiated_by, pid, "Scheduler fired");
        self.set_active(pid);
        if let Some(pid) = pid {
            if let Err(e) = self.store.attach_pid(pid, now).await {
                warn!("Could not record run pid {}: {}", pid, e);
            }
        }

        Ok(Some(tokio::spawn(self.clone().watch(child))))
    }

    async fn watch(self, mut child: Child) {
        let pid = child.id();
        let exit = match child.wait().await {
            Ok(status) => LastExit::from_status(&status),
            Err(e) => LastExit::error(e.to_string()),
        };
        info!(
            target: "oplog",
            pid,
            code = exit.code,
            signal = exit.signal,
            "Run process exited"
        );
        self.record_watched_exit(pid, exit).await;
    }

    /// Persist the exit of a run this process launched. The run stays marked
    /// active until the row is updated, so `reconcile` never takes its dead
    /// PID for a lost run.
    async fn record_watched_exit(&self, pid: Option<u32>, exit: LastExit) {
        // Safe to repeat: the transition is a pure overwrite of the same fields
        for attempt in 1..=EXIT_RECORD_ATTEMPTS {
            match self.store.record_exit(pid, exit.clone(), now_ms()).await {
                Ok(Some(state)) => {
                    if let Some(at) = state.next_run_at {
                        info!(target: "oplog", next_run_at = at, "Scheduler re-armed");
                    }
                    break;
                }
                Ok(None) => {
                    debug!("Exit of pid {:?} does not match the run on record", pid);
                    break;
                }
                Err(e) if attempt < EXIT_RECORD_ATTEMPTS => {
                    warn!("Recording run exit failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(e) => error!("Giving up recording run exit: {}", e),
            }
        }
        self.clear_active(pid);
    }

    /// Release a run left behind by an earlier scheduler process once its
    /// recorded PID is gone. A running row without a PID is left untouched.
    async fn reconcile(&self, now: i64) -> Result<(), SchedulerError> {
        let state = self.store.load(now).await?;
        let Some(pid) = state.run_pid.filter(|_| state.running) else {
            return Ok(());
        };
        if self.active_pid() == Some(pid) || pid_alive(pid) {
            return Ok(());
        }
        if self.store.release_lost_run(pid, now).await? {
            warn!(target: "oplog", pid, "Run process from an earlier scheduler is gone; released");
        }
        Ok(())
    }

    fn set_active(&self, pid: Option<u32>) {
        match self.active.lock() {
            Ok(mut active) => *active = pid,
            Err(poisoned) => *poisoned.into_inner() = pid,
        }
    }

    /// Forget `pid` unless a newer run has already replaced it
    fn clear_active(&self, pid: Option<u32>) {
        let mut active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *active == pid {
            *active = None;
        }
    }

    fn active_pid(&self) -> Option<u32> {
        match self.active.lock() {
            Ok(active) => *active,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists and may be signalled
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    let alive = io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    debug!("pid {} alive: {}", pid, alive);
    alive
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: i64 = 1_700_000_000_000;

    /// Launches `/bin/sh -c <script>`, or fails to launch when `script` is None
    struct ScriptLauncher {
        script: Option<String>,
        launches: AtomicUsize,
    }

    impl ScriptLauncher {
        fn new(script: Option<&str>) -> Self {
            Self {
                script: script.map(str::to_string),
                launches: AtomicUsize::new(0),
            }
        }
    }

    impl Launcher for ScriptLauncher {
        fn launch(&self, _initiated_by: InitiatedBy) -> io::Result<Child> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Some(script) => Command::new("/bin/sh").arg("-c").arg(script).spawn(),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "launcher missing")),
            }
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_ms: 50,
            default_delay_seconds: 3600,
            run_now_epsilon_ms: 0,
        }
    }

    struct Harness {
        scheduler: Scheduler,
        launcher: Arc<ScriptLauncher>,
        db: Database,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn launches(&self) -> usize {
            self.launcher.launches.load(Ordering::SeqCst)
        }
    }

    async fn harness(script: Option<&str>) -> Harness {
        let (db, dir) = temp_db().await;
        let launcher = Arc::new(ScriptLauncher::new(script));
        Harness {
            scheduler: Scheduler::new(db.clone(), &config(), launcher.clone()),
            launcher,
            db,
            _dir: dir,
        }
    }

    async fn set_running(db: &Database, running: bool) {
        sqlx::query("UPDATE scheduler_state SET running = ? WHERE id = 1")
            .bind(running)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn held_running_flag_blocks_fires() {
        let h = harness(Some("exit 0")).await;
        h.scheduler.store.arm(1, ControlSource::Cli, T0).await.unwrap();
        set_running(&h.db, true).await;

        for offset in [1_000, 5_000, 60_000] {
            assert!(h.scheduler.tick_at(T0 + offset).await.unwrap().is_none());
        }
        assert_eq!(h.launches(), 0);

        set_running(&h.db, false).await;
        let watcher = h.scheduler.tick_at(T0 + 61_000).await.unwrap();
        assert!(watcher.is_some());
        assert_eq!(h.launches(), 1);
        watcher.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn exit_is_recorded_and_schedule_restarts_from_completion() {
        let h = harness(Some("exit 4")).await;
        h.scheduler.store.arm(30, ControlSource::Cli, T0).await.unwrap();

        let watcher = h.scheduler.tick_at(T0 + 30_000).await.unwrap().unwrap();
        // No second fire while the first is in flight
        assert!(h.scheduler.tick_at(T0 + 31_000).await.unwrap().is_none());

        let before_exit = now_ms();
        watcher.await.unwrap();

        let state = h.scheduler.store.load(now_ms()).await.unwrap();
        assert!(!state.running);
        assert_eq!(state.run_pid, None);
        assert_eq!(state.last_exit.unwrap().code, Some(4));
        let next = state.next_run_at.unwrap();
        assert!(next >= before_exit + 30_000);
        assert_eq!(h.launches(), 1);
    }

    #[tokio::test]
    async fn launch_failure_disarms_without_retrying() {
        let h = harness(None).await;
        h.scheduler.store.arm(1, ControlSource::Cli, T0).await.unwrap();

        assert!(h.scheduler.tick_at(T0 + 1_000).await.unwrap().is_none());
        assert!(h.scheduler.tick_at(T0 + 2_000).await.unwrap().is_none());
        assert_eq!(h.launches(), 1);

        let status = h.scheduler.status().await.unwrap();
        assert!(!status.armed);
        assert!(!status.running);
        assert_eq!(
            status.last_exit.unwrap().error.as_deref(),
            Some("launcher missing")
        );
    }

    #[tokio::test]
    async fn run_now_fires_on_next_poll() {
        let h = harness(Some("exit 0")).await;
        let status = h.scheduler.run_now(ControlSource::Dashboard).await.unwrap();
        assert!(status.armed);
        assert_eq!(status.delay_seconds, 3600);

        let watcher = h.scheduler.tick_at(now_ms()).await.unwrap().unwrap();
        watcher.await.unwrap();
        let status = h.scheduler.status().await.unwrap();
        assert!(status.armed);
        assert!(status.next_run_at_ms.unwrap() > now_ms() + 3_000_000);
    }

    #[tokio::test]
    async fn stale_run_from_dead_pid_is_released() {
        let h = harness(Some("exit 0")).await;
        h.scheduler.store.arm(10, ControlSource::Cli, T0).await.unwrap();

        // A PID that certainly no longer exists: a reaped child of ours
        let mut gone = Command::new("/bin/sh").arg("-c").arg("exit 0").spawn().unwrap();
        let pid = gone.id().unwrap();
        gone.wait().await.unwrap();

        sqlx::query("UPDATE scheduler_state SET running = 1, run_pid = ? WHERE id = 1")
            .bind(i64::from(pid))
            .execute(h.db.pool())
            .await
            .unwrap();

        assert!(h.scheduler.tick_at(T0 + 5_000).await.unwrap().is_none());
        let state = h.scheduler.store.load(T0 + 5_000).await.unwrap();
        assert!(!state.running);
        assert_eq!(state.next_run_at, Some(T0 + 15_000));
        assert_eq!(h.launches(), 0);
    }

    #[tokio::test]
    async fn watched_run_is_not_released_before_its_exit_is_recorded() {
        let h = harness(Some("exit 0")).await;
        h.scheduler.store.arm(10, ControlSource::Cli, T0).await.unwrap();

        // Our own child, already reaped, as the watcher sees it right after wait()
        let mut child = Command::new("/bin/sh").arg("-c").arg("exit 0").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        sqlx::query("UPDATE scheduler_state SET running = 1, run_pid = ? WHERE id = 1")
            .bind(i64::from(pid))
            .execute(h.db.pool())
            .await
            .unwrap();
        h.scheduler.set_active(Some(pid));

        assert!(h.scheduler.tick_at(T0 + 5_000).await.unwrap().is_none());
        let state = h.scheduler.store.load(T0 + 5_000).await.unwrap();
        assert!(state.running);
        assert_eq!(state.last_exit, None);

        h.scheduler
            .record_watched_exit(Some(pid), LastExit { code: Some(0), signal: None, error: None })
            .await;
        let state = h.scheduler.store.load(now_ms()).await.unwrap();
        assert!(!state.running);
        let exit = state.last_exit.unwrap();
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.error, None);
        assert_eq!(h.scheduler.active_pid(), None);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let h = harness(Some("exit 0")).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let scheduler = h.scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.launches(), 0);
    }
}
