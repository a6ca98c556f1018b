//! Recurring actions on a fixed, drift-free cadence.
//!
//! The n-th firing of a job is due at `start + n * interval`, independent
//! of how long earlier actions took. An action that overruns one or more
//! slots causes those slots to be skipped, never fired in a burst.

use crate::error::{ExecutorError, ExecutorResult};
use bytrade_telemetry::Metrics;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state of one scheduled job.
#[derive(Debug)]
struct ScheduledJob {
    interval: Duration,
    next_fire_at: Mutex<Instant>,
    fires: AtomicU64,
    token: CancellationToken,
}

/// Handle to a scheduled job. Clones refer to the same job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: u64,
    job: Arc<ScheduledJob>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn interval(&self) -> Duration {
        self.job.interval
    }

    pub fn is_cancelled(&self) -> bool {
        self.job.token.is_cancelled()
    }

    /// When the next firing is due.
    pub fn next_fire_at(&self) -> Instant {
        *self.job.next_fire_at.lock()
    }

    /// Number of completed invocations, failed ones included.
    pub fn fire_count(&self) -> u64 {
        self.job.fires.load(Ordering::SeqCst)
    }
}

/// Runs recurring actions, each on its own task.
#[derive(Debug, Default)]
pub struct ScheduledOrderRunner {
    jobs: Arc<Mutex<HashMap<u64, JobHandle>>>,
    next_id: AtomicU64,
}

impl ScheduledOrderRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `action` every `interval`, first at `now + interval`.
    ///
    /// An `Err` or a panic from one invocation is logged and the schedule
    /// continues. Fails outside a Tokio runtime.
    pub fn schedule<F, Fut, E>(&self, interval: Duration, action: F) -> ExecutorResult<JobHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if interval.is_zero() {
            return Err(ExecutorError::InvalidInterval(interval));
        }
        let runtime =
            Handle::try_current().map_err(|e| ExecutorError::NoRuntime(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let start = Instant::now();
        let job = Arc::new(ScheduledJob {
            interval,
            next_fire_at: Mutex::new(start + interval),
            fires: AtomicU64::new(0),
            token: CancellationToken::new(),
        });
        let handle = JobHandle {
            id,
            job: Arc::clone(&job),
        };
        self.jobs.lock().insert(id, handle.clone());

        let jobs = Arc::clone(&self.jobs);
        runtime.spawn(async move {
            run_job(id, &job, start, action).await;
            jobs.lock().remove(&id);
        });

        info!(
            job_id = id,
            interval_ms = interval.as_millis() as u64,
            "Job scheduled"
        );
        Ok(handle)
    }

    /// Stop future firings. An invocation already running completes.
    pub fn cancel(&self, handle: &JobHandle) {
        if !handle.job.token.is_cancelled() {
            handle.job.token.cancel();
            info!(job_id = handle.id, "Job cancelled");
        }
        self.jobs.lock().remove(&handle.id);
    }

    pub fn cancel_all(&self) {
        let handles: Vec<JobHandle> = self.jobs.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.job.token.cancel();
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "All jobs cancelled");
        }
    }

    /// Jobs that have not been cancelled, by id.
    pub fn active_jobs(&self) -> Vec<JobHandle> {
        let mut jobs: Vec<JobHandle> = self
            .jobs
            .lock()
            .values()
            .filter(|h| !h.is_cancelled())
            .cloned()
            .collect();
        jobs.sort_by_key(|h| h.id);
        jobs
    }
}

impl Drop for ScheduledOrderRunner {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_job<F, Fut, E>(id: u64, job: &ScheduledJob, start: Instant, action: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let mut slot: u32 = 1;
    loop {
        let Some(offset) = job.interval.checked_mul(slot) else {
            warn!(job_id = id, "Schedule exhausted");
            break;
        };
        let fire_at = start + offset;
        *job.next_fire_at.lock() = fire_at;

        tokio::select! {
            biased;
            () = job.token.cancelled() => break,
            () = tokio::time::sleep_until(fire_at) => {}
        }

        let outcome = AssertUnwindSafe(async { action().await })
            .catch_unwind()
            .await;
        let fires = job.fires.fetch_add(1, Ordering::SeqCst) + 1;
        match outcome {
            Ok(Ok(())) => {
                debug!(job_id = id, fires, "Scheduled action completed");
                Metrics::scheduled_run("ok");
            }
            Ok(Err(e)) => {
                warn!(job_id = id, fires, error = %e, "Scheduled action failed");
                Metrics::scheduled_run("error");
            }
            Err(_) => {
                error!(job_id = id, fires, "Scheduled action panicked");
                Metrics::scheduled_run("panic");
            }
        }

        if job.token.is_cancelled() {
            break;
        }

        // Next slot strictly in the future; overrun slots are dropped
        let elapsed = Instant::now().saturating_duration_since(start);
        let due = elapsed.as_nanos() / job.interval.as_nanos() + 1;
        let next = u32::try_from(due).unwrap_or(u32::MAX).max(slot + 1);
        if next > slot + 1 {
            warn!(
                job_id = id,
                skipped = next - slot - 1,
                "Scheduled action overran its interval, skipping missed slots"
            );
        }
        slot = next;
    }
    debug!(job_id = id, "Job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let runner = ScheduledOrderRunner::new();
        let result = runner.schedule(Duration::ZERO, || async { Ok::<(), String>(()) });
        assert!(matches!(result, Err(ExecutorError::InvalidInterval(_))));
    }

    #[test]
    fn test_schedule_outside_runtime_is_an_error() {
        let runner = ScheduledOrderRunner::new();
        let result = runner.schedule(Duration::from_secs(1), || async { Ok::<(), String>(()) });
        assert!(matches!(result, Err(ExecutorError::NoRuntime(_))));
        assert!(runner.active_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_fixed_cadence() {
        let runner = ScheduledOrderRunner::new();
        let start = Instant::now();
        let fired_at = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let fired_at = Arc::clone(&fired_at);
            runner
                .schedule(Duration::from_secs(1), move || {
                    let fired_at = Arc::clone(&fired_at);
                    async move {
                        fired_at.lock().push(Instant::now() - start);
                        // Latency must not push later firings back
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok::<(), String>(())
                    }
                })
                .unwrap()
        };
        assert_eq!(handle.next_fire_at(), start + Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(
            *fired_at.lock(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3)
            ]
        );
        assert_eq!(handle.fire_count(), 3);
        assert_eq!(handle.next_fire_at(), start + Duration::from_secs(4));
        runner.cancel(&handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_skips_missed_slots() {
        let runner = ScheduledOrderRunner::new();
        let start = Instant::now();
        let fired_at = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let fired_at = Arc::clone(&fired_at);
            runner
                .schedule(Duration::from_secs(1), move || {
                    let fired_at = Arc::clone(&fired_at);
                    async move {
                        let first = fired_at.lock().is_empty();
                        fired_at.lock().push(Instant::now() - start);
                        if first {
                            tokio::time::sleep(Duration::from_millis(2_500)).await;
                        }
                        Ok::<(), String>(())
                    }
                })
                .unwrap()
        };

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        // Slot 1 runs until 3.5s; slots 2 and 3 are skipped
        assert_eq!(
            *fired_at.lock(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(5)
            ]
        );
        runner.cancel(&handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_do_not_stop_schedule() {
        let runner = ScheduledOrderRunner::new();
        let calls = counter();

        let handle = {
            let calls = Arc::clone(&calls);
            runner
                .schedule(Duration::from_secs(1), move || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        match n {
                            1 => Err("exchange rejected".to_string()),
                            2 => panic!("action bug"),
                            _ => Ok(()),
                        }
                    }
                })
                .unwrap()
        };

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(handle.fire_count(), 3);
        runner.cancel(&handle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_running_action() {
        let runner = Arc::new(ScheduledOrderRunner::new());
        let started = counter();
        let finished = counter();
        let slot = Arc::new(Mutex::new(None::<JobHandle>));

        let handle = {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            let job_runner = Arc::clone(&runner);
            let slot = Arc::clone(&slot);
            runner
                .schedule(Duration::from_secs(1), move || {
                    let started = Arc::clone(&started);
                    let finished = Arc::clone(&finished);
                    let job_runner = Arc::clone(&job_runner);
                    let slot = Arc::clone(&slot);
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        // Cancel ourselves mid-flight
                        let handle = slot.lock().clone();
                        if let Some(handle) = handle {
                            job_runner.cancel(&handle);
                            job_runner.cancel(&handle);
                        }
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), String>(())
                    }
                })
                .unwrap()
        };
        *slot.lock() = Some(handle.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(handle.is_cancelled());
        assert!(runner.active_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_and_active_jobs() {
        let runner = ScheduledOrderRunner::new();
        let calls = counter();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            handles.push(
                runner
                    .schedule(Duration::from_secs(1), move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<(), String>(()) }
                    })
                    .unwrap(),
            );
        }
        let ids: Vec<u64> = runner.active_jobs().iter().map(JobHandle::id).collect();
        assert_eq!(ids, vec![handles[0].id(), handles[1].id()]);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        runner.cancel_all();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(handles.iter().all(JobHandle::is_cancelled));
        assert!(runner.active_jobs().is_empty());
    }
}
