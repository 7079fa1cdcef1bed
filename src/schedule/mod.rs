//! Cron scheduler for background maintenance jobs.
//!
//! Each registered job gets its own firing loop while the scheduler is
//! started. A job never runs concurrently with itself: a firing that lands
//! while the previous run is still executing is skipped and counted.
//!
//! Expressions use five fields (`min hour dom mon dow`) or the six/seven field
//! form with seconds accepted by the `cron` crate. Times are UTC.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Body of a scheduled job, invoked once per firing.
pub type JobTask = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Wrap an async closure as a [`JobTask`].
pub fn job_task<F, Fut>(f: F) -> JobTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || -> JobFuture { Box::pin(f()) })
}

/// Snapshot of a job's metadata. Changing it has no effect on the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: String,
    pub cron_expr: String,
    /// Whether the job's firing loop is live.
    pub is_active: bool,
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    /// Firings dropped because the previous run had not finished.
    pub skipped: u64,
}

struct JobEntry {
    cron_expr: String,
    schedule: Schedule,
    task: JobTask,
    running: Arc<AtomicBool>,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    skipped: u64,
    /// Present while the firing loop runs.
    cancel: Option<CancellationToken>,
    in_flight: Option<JoinHandle<()>>,
}

impl JobEntry {
    fn info(&self, id: &str) -> JobInfo {
        JobInfo {
            id: id.to_string(),
            cron_expr: self.cron_expr.clone(),
            is_active: self.cancel.is_some(),
            is_running: self.running.load(Ordering::SeqCst),
            last_run: self.last_run,
            next_run: self.next_run,
            skipped: self.skipped,
        }
    }
}

type Registry = Arc<RwLock<HashMap<String, JobEntry>>>;

/// Run of a removed job that has not finished yet. Re-adding the id picks it
/// up so the singleton guarantee holds across remove and add.
struct Draining {
    running: Arc<AtomicBool>,
    in_flight: Option<JoinHandle<()>>,
}

/// Registry of cron jobs with an explicit start/stop/shutdown lifecycle.
///
/// `start`, and `add_job` on a started scheduler, spawn tokio tasks and must
/// be called from within a runtime.
pub struct Scheduler {
    jobs: Registry,
    /// Root token while started.
    root: Mutex<Option<CancellationToken>>,
    draining: Mutex<HashMap<String, Draining>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            root: Mutex::new(None),
            draining: Mutex::new(HashMap::new()),
        }
    }

    /// Register a job. Fails with [`Error::Conflict`] when `id` is taken and
    /// [`Error::InvalidArgument`] when the expression does not parse. On a
    /// started scheduler the job begins firing right away.
    pub fn add_job(&self, id: &str, cron_expr: &str, task: JobTask) -> Result<()> {
        let schedule = parse_cron(cron_expr)?;
        let root = self.root.lock().unwrap_or_else(|p| p.into_inner());
        let mut jobs = write(&self.jobs);
        if jobs.contains_key(id) {
            return Err(Error::Conflict(format!("scheduler job {} already exists", id)));
        }

        let (running, in_flight) = match self.draining().remove(id) {
            Some(previous) if previous.running.load(Ordering::SeqCst) => {
                (previous.running, previous.in_flight)
            }
            _ => (Arc::new(AtomicBool::new(false)), None),
        };
        let mut entry = JobEntry {
            cron_expr: cron_expr.to_string(),
            schedule,
            task,
            running,
            last_run: None,
            next_run: None,
            skipped: 0,
            cancel: None,
            in_flight,
        };
        if let Some(root) = root.as_ref() {
            self.spawn_firing_loop(id, &mut entry, root.child_token());
        }
        jobs.insert(id.to_string(), entry);
        info!(job = %id, cron = %cron_expr, "Scheduled job registered");
        Ok(())
    }

    /// Unregister a job. A run already executing is left to finish, and a
    /// job re-added under the same id does not start before it ends.
    pub fn remove_job(&self, id: &str) -> Result<()> {
        let mut jobs = write(&self.jobs);
        let JobEntry {
            running,
            in_flight,
            cancel,
            ..
        } = jobs
            .remove(id)
            .ok_or_else(|| Error::not_found("scheduler job", id))?;
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let mut draining = self.draining();
        draining.retain(|_, d| d.running.load(Ordering::SeqCst));
        if running.load(Ordering::SeqCst) {
            draining.insert(id.to_string(), Draining { running, in_flight });
        }
        info!(job = %id, "Scheduled job removed");
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Option<JobInfo> {
        read(&self.jobs).get(id).map(|entry| entry.info(id))
    }

    /// All jobs, ordered by id.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = read(&self.jobs)
            .iter()
            .map(|(id, entry)| entry.info(id))
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn is_started(&self) -> bool {
        self.root_token().is_some()
    }

    /// Begin firing every registered job. Starting twice only logs a warning.
    pub fn start(&self) {
        let mut root = self.root.lock().unwrap_or_else(|p| p.into_inner());
        if root.is_some() {
            warn!("Scheduler is already running");
            return;
        }
        let token = CancellationToken::new();
        let mut jobs = write(&self.jobs);
        for (id, entry) in jobs.iter_mut() {
            self.spawn_firing_loop(id, entry, token.child_token());
        }
        info!(jobs = jobs.len(), "Scheduler started");
        *root = Some(token);
    }

    /// Stop firing. Runs already executing continue. Stopping twice only logs
    /// a warning.
    pub fn stop(&self) {
        if !self.stop_inner() {
            warn!("Scheduler is not running");
        }
    }

    /// Stop, then wait up to `timeout` for in-flight runs to finish.
    /// Returns whether all of them finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop_inner();
        let mut handles: Vec<(String, JoinHandle<()>)> = write(&self.jobs)
            .iter_mut()
            .filter_map(|(id, entry)| entry.in_flight.take().map(|h| (id.clone(), h)))
            .collect();
        handles.extend(
            self.draining()
                .drain()
                .filter_map(|(id, d)| d.in_flight.map(|h| (id, h))),
        );

        let deadline = Instant::now() + timeout;
        let mut clean = true;
        for (id, handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(job = %id, "Scheduled job task failed to join: {}", e),
                Err(_) => {
                    warn!(job = %id, "Scheduled job did not finish before shutdown timeout");
                    clean = false;
                }
            }
        }
        info!("Scheduler shut down");
        clean
    }

    fn stop_inner(&self) -> bool {
        let mut root = self.root.lock().unwrap_or_else(|p| p.into_inner());
        let Some(token) = root.take() else {
            return false;
        };
        token.cancel();
        for entry in write(&self.jobs).values_mut() {
            entry.cancel = None;
            entry.next_run = None;
        }
        info!("Scheduler stopped");
        true
    }

    fn draining(&self) -> MutexGuard<'_, HashMap<String, Draining>> {
        self.draining.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn root_token(&self) -> Option<CancellationToken> {
        self.root.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn spawn_firing_loop(&self, id: &str, entry: &mut JobEntry, token: CancellationToken) {
        entry.next_run = entry.schedule.upcoming(Utc).next();
        entry.cancel = Some(token.clone());
        tokio::spawn(firing_loop(
            self.jobs.clone(),
            id.to_string(),
            entry.schedule.clone(),
            token,
        ));
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(token) = self.root.lock().unwrap_or_else(|p| p.into_inner()).take() {
            token.cancel();
        }
    }
}

async fn firing_loop(jobs: Registry, id: String, schedule: Schedule, token: CancellationToken) {
    let mut cursor = Utc::now();
    loop {
        // Never fire the same instant twice, and skip instants missed while stalled.
        let from = cursor.max(Utc::now());
        let Some(next) = schedule.after(&from).next() else {
            warn!(job = %id, "Cron expression has no upcoming firing");
            break;
        };
        {
            let mut guard = write(&jobs);
            match guard.get_mut(&id) {
                Some(entry) if !token.is_cancelled() => entry.next_run = Some(next),
                _ => break,
            }
        }

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        cursor = next;
        fire(&jobs, &id, &token);
    }
    debug!(job = %id, "Firing loop exited");
}

fn fire(jobs: &Registry, id: &str, token: &CancellationToken) {
    let mut guard = write(jobs);
    let Some(entry) = guard.get_mut(id) else {
        return;
    };
    if token.is_cancelled() {
        return;
    }
    if entry.running.swap(true, Ordering::SeqCst) {
        entry.skipped += 1;
        warn!(job = %id, "Previous run still executing, skipping this firing");
        return;
    }
    entry.last_run = Some(Utc::now());
    let task = entry.task.clone();
    let running = entry.running.clone();
    entry.in_flight = Some(tokio::spawn(run_once(id.to_string(), task, running)));
}

async fn run_once(id: String, task: JobTask, running: Arc<AtomicBool>) {
    let started = Instant::now();
    debug!(job = %id, "Scheduled job started");
    // Spawned separately so a panicking task still clears the running flag.
    match tokio::spawn(task()).await {
        Ok(Ok(())) => debug!(
            job = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scheduled job finished"
        ),
        Ok(Err(e)) => error!(job = %id, "Scheduled job failed: {:#}", e),
        Err(e) => error!(job = %id, "Scheduled job panicked: {}", e),
    }
    running.store(false, Ordering::SeqCst);
}

fn read(jobs: &Registry) -> RwLockReadGuard<'_, HashMap<String, JobEntry>> {
    jobs.read().unwrap_or_else(|p| p.into_inner())
}

fn write(jobs: &Registry) -> RwLockWriteGuard<'_, HashMap<String, JobEntry>> {
    jobs.write().unwrap_or_else(|p| p.into_inner())
}

fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::invalid("cron_expr", format!("{:?}: {}", expr, e)))
}

pub fn validate_cron_expression(expr: &str) -> Result<()> {
    parse_cron(expr).map(|_| ())
}

/// Next firing of `expr` after now.
pub fn next_run_time(expr: &str) -> Result<DateTime<Utc>> {
    parse_cron(expr)?
        .upcoming(Utc)
        .next()
        .ok_or_else(|| Error::invalid("cron_expr", format!("{:?} never fires", expr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> JobTask {
        job_task(|| async { Ok(()) })
    }

    #[test]
    fn test_cron_validation() {
        assert!(validate_cron_expression("*/5 * * * *").is_ok());
        assert!(validate_cron_expression("0 3 * * *").is_ok());
        assert!(validate_cron_expression("*/30 * * * * *").is_ok());
        for bad in ["", "not a cron", "61 * * * *", "* * *"] {
            let err = validate_cron_expression(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { field: "cron_expr", .. }));
        }
    }

    #[test]
    fn test_next_run_time_is_in_the_future() {
        let next = next_run_time("*/10 * * * *").unwrap();
        assert!(next > Utc::now());
        assert_eq!(next.timestamp() % 600, 0);
    }

    #[tokio::test]
    async fn test_registry_errors() {
        let scheduler = Scheduler::new();
        scheduler.add_job("reap", "*/5 * * * *", noop()).unwrap();

        let err = scheduler.add_job("reap", "0 3 * * *", noop()).unwrap_err();
        assert!(err.is_conflict());
        let err = scheduler.add_job("prune", "every day", noop()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(scheduler.get_job("prune").is_none());

        assert!(scheduler.remove_job("missing").unwrap_err().is_not_found());
        scheduler.remove_job("reap").unwrap();
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_are_copies() {
        let scheduler = Scheduler::new();
        scheduler.add_job("b", "0 3 * * *", noop()).unwrap();
        scheduler.add_job("a", "*/5 * * * *", noop()).unwrap();

        let mut jobs = scheduler.list_jobs();
        assert_eq!(jobs.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!jobs[0].is_active);
        assert!(jobs[0].next_run.is_none());

        jobs[0].is_active = true;
        jobs[0].cron_expr = "changed".to_string();
        let fresh = scheduler.get_job("a").unwrap();
        assert!(!fresh.is_active);
        assert_eq!(fresh.cron_expr, "*/5 * * * *");
    }

    #[tokio::test]
    async fn test_start_and_stop_toggle_jobs() {
        let scheduler = Scheduler::new();
        scheduler.add_job("reap", "*/5 * * * *", noop()).unwrap();

        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_started());
        let info = scheduler.get_job("reap").unwrap();
        assert!(info.is_active);
        assert!(info.next_run.unwrap() > Utc::now());

        scheduler.add_job("late", "0 3 * * *", noop()).unwrap();
        assert!(scheduler.get_job("late").unwrap().is_active);

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_started());
        let info = scheduler.get_job("reap").unwrap();
        assert!(!info.is_active);
        assert!(info.next_run.is_none());

        scheduler.start();
        assert!(scheduler.get_job("late").unwrap().is_active);
        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_slow_job_is_not_run_concurrently() {
        let scheduler = Scheduler::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let task = {
            let starts = starts.clone();
            let current = current.clone();
            let max_seen = max_seen.clone();
            job_task(move || {
                let starts = starts.clone();
                let current = current.clone();
                let max_seen = max_seen.clone();
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2500)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        scheduler.add_job("slow", "* * * * * *", task).unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(4200)).await;

        let info = scheduler.get_job("slow").unwrap();
        assert!(starts.load(Ordering::SeqCst) >= 1);
        assert!(info.skipped >= 1);
        assert!(info.last_run.is_some());
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_readded_job_waits_for_previous_run() {
        let scheduler = Scheduler::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let task = {
            let starts = starts.clone();
            let current = current.clone();
            let max_seen = max_seen.clone();
            job_task(move || {
                let starts = starts.clone();
                let current = current.clone();
                let max_seen = max_seen.clone();
                async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        scheduler.add_job("reap", "* * * * * *", task.clone()).unwrap();
        scheduler.start();
        while !scheduler.get_job("reap").unwrap().is_running {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        scheduler.remove_job("reap").unwrap();
        scheduler.add_job("reap", "* * * * * *", task).unwrap();
        assert!(scheduler.get_job("reap").unwrap().is_running);

        tokio::time::sleep(Duration::from_millis(3200)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(starts.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_failing_job_keeps_firing() {
        let scheduler = Scheduler::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let task = {
            let attempts = attempts.clone();
            job_task(move || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("store unavailable"))
                }
            })
        };

        scheduler.add_job("flaky", "* * * * * *", task).unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(2600)).await;
        scheduler.stop();

        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert!(!scheduler.get_job("flaky").unwrap().is_running);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_run() {
        let scheduler = Scheduler::new();
        let finished = Arc::new(AtomicBool::new(false));
        let task = {
            let finished = finished.clone();
            job_task(move || {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        scheduler.add_job("once", "* * * * * *", task).unwrap();
        scheduler.start();
        while scheduler.get_job("once").unwrap().last_run.is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);
        assert!(finished.load(Ordering::SeqCst));
    }
}
