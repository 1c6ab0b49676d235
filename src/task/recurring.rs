//! Recurring-task primitive
//!
//! Everything above this module only knows how to "run this job every N ms".
//! [`TokioScheduler`] backs that with one tokio task per registration on the
//! shared multi-thread runtime; [`ManualScheduler`] replays the same contract
//! against a [`ManualClock`] so whole scheduler stacks can be stepped
//! deterministically.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::ScheduleError;
use crate::util::clock::{Clock, ManualClock, Millis};

/// Body of a recurring task
pub type Job = Arc<dyn Fn() + Send + Sync>;

/// Submit repeating jobs at a fixed period
pub trait RecurringScheduler: Send + Sync {
    /// Run `job` every `period`, first fire one period from now
    fn schedule_at_fixed_rate(
        &self,
        name: &str,
        period: Duration,
        job: Job,
    ) -> Result<TaskHandle, ScheduleError>;
}

/// Handle to a registered recurring task
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TaskHandle {
    fn new(name: &str, cancelled: Arc<AtomicBool>, abort: Option<tokio::task::AbortHandle>) -> Self {
        Self {
            name: name.to_string(),
            cancelled,
            abort,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop further fires. Safe to call more than once.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            debug!("Cancelled recurring task '{}'", self.name);
        }
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[inline]
fn clamp_period(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}

/// Tokio-backed scheduler: one lightweight task per recurring job
pub struct TokioScheduler {
    handle: Handle,
    closed: Arc<AtomicBool>,
}

impl TokioScheduler {
    /// Bind to the runtime of the calling context
    pub fn current() -> Result<Self, ScheduleError> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| ScheduleError::RuntimeUnavailable)
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Refuse new registrations and let running tasks exit on their next tick
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Recurring scheduler shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl RecurringScheduler for TokioScheduler {
    fn schedule_at_fixed_rate(
        &self,
        name: &str,
        period: Duration,
        job: Job,
    ) -> Result<TaskHandle, ScheduleError> {
        if self.is_shut_down() {
            return Err(ScheduleError::ShuttingDown);
        }

        let period = clamp_period(period);
        let cancelled = Arc::new(AtomicBool::new(false));
        let task_cancelled = cancelled.clone();
        let closed = self.closed.clone();
        let task_name = name.to_string();

        let join = self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if task_cancelled.load(Ordering::Acquire) || closed.load(Ordering::Acquire) {
                    break;
                }
                job();
            }

            debug!("Recurring task '{}' stopped", task_name);
        });

        debug!("Scheduled '{}' every {:?}", name, period);
        Ok(TaskHandle::new(name, cancelled, Some(join.abort_handle())))
    }
}

struct ManualJob {
    name: String,
    period: Millis,
    next_fire: Millis,
    job: Job,
    cancelled: Arc<AtomicBool>,
}

/// Discrete-event scheduler driven by a [`ManualClock`]
///
/// `advance` fires due jobs in deadline order (registration order on ties),
/// moving the clock to each fire time before running the job. Jobs registered
/// while a job runs are picked up by the same `advance` call.
pub struct ManualScheduler {
    clock: Arc<ManualClock>,
    jobs: Mutex<Vec<ManualJob>>,
    closed: AtomicBool,
}

impl ManualScheduler {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            jobs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Step time forward by `by` ms, firing everything that falls due
    pub fn advance(&self, by: Millis) {
        let target = self.clock.now_millis() + by;

        loop {
            let next = {
                let mut jobs = self.jobs.lock();
                jobs.retain(|j| !j.cancelled.load(Ordering::Acquire));

                let due = jobs
                    .iter_mut()
                    .filter(|j| j.next_fire <= target)
                    .min_by_key(|j| j.next_fire);

                due.map(|j| {
                    let fire_at = j.next_fire;
                    j.next_fire += j.period;
                    (fire_at, j.job.clone(), j.cancelled.clone())
                })
            };

            let Some((fire_at, job, cancelled)) = next else {
                break;
            };

            if fire_at > self.clock.now_millis() {
                self.clock.set(fire_at);
            }
            if !cancelled.load(Ordering::Acquire) {
                job();
            }
        }

        self.clock.set(target);
    }

    /// Fire every live job once at the current time
    pub fn run_once(&self) {
        let jobs: Vec<Job> = self
            .jobs
            .lock()
            .iter()
            .filter(|j| !j.cancelled.load(Ordering::Acquire))
            .map(|j| j.job.clone())
            .collect();

        for job in jobs {
            job();
        }
    }

    /// Number of live (uncancelled) jobs
    pub fn job_count(&self) -> usize {
        self.jobs
            .lock()
            .iter()
            .filter(|j| !j.cancelled.load(Ordering::Acquire))
            .count()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs
            .lock()
            .iter()
            .filter(|j| !j.cancelled.load(Ordering::Acquire))
            .map(|j| j.name.clone())
            .collect()
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl RecurringScheduler for ManualScheduler {
    fn schedule_at_fixed_rate(
        &self,
        name: &str,
        period: Duration,
        job: Job,
    ) -> Result<TaskHandle, ScheduleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ScheduleError::ShuttingDown);
        }

        let period = clamp_period(period).as_millis() as Millis;
        let cancelled = Arc::new(AtomicBool::new(false));

        self.jobs.lock().push(ManualJob {
            name: name.to_string(),
            period,
            next_fire: self.clock.now_millis() + period,
            job,
            cancelled: cancelled.clone(),
        });

        Ok(TaskHandle::new(name, cancelled, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_fires_on_period() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = ManualScheduler::new(clock.clone());
        let count = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule_at_fixed_rate("count", Duration::from_millis(100), counter_job(&count))
            .unwrap();

        scheduler.advance(99);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        scheduler.advance(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.advance(350);
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(clock.now_millis(), 450);
    }

    #[test]
    fn test_manual_clock_at_fire_time() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = ManualScheduler::new(clock.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_job = seen.clone();
        let job_clock = clock.clone();
        scheduler
            .schedule_at_fixed_rate(
                "stamp",
                Duration::from_millis(30),
                Arc::new(move || seen_job.lock().push(job_clock.now_millis())),
            )
            .unwrap();

        scheduler.advance(100);
        assert_eq!(*seen.lock(), vec![30, 60, 90]);
    }

    #[test]
    fn test_manual_cancel() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = ManualScheduler::new(clock);
        let count = Arc::new(AtomicUsize::new(0));

        let handle = scheduler
            .schedule_at_fixed_rate("count", Duration::from_millis(10), counter_job(&count))
            .unwrap();
        scheduler.advance(20);
        handle.cancel();
        handle.cancel();
        scheduler.advance(100);

        assert!(handle.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.job_count(), 0);
    }

    #[test]
    fn test_manual_shutdown_rejects() {
        let scheduler = ManualScheduler::new(Arc::new(ManualClock::new(0)));
        scheduler.shutdown();
        let result =
            scheduler.schedule_at_fixed_rate("late", Duration::from_millis(10), Arc::new(|| {}));
        assert_eq!(result.unwrap_err(), ScheduleError::ShuttingDown);
    }

    #[test]
    fn test_tokio_scheduler_requires_runtime() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(ScheduleError::RuntimeUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_and_stops() {
        let scheduler = TokioScheduler::current().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = tokio_test::assert_ok!(scheduler.schedule_at_fixed_rate(
            "count",
            Duration::from_millis(10),
            counter_job(&count)
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);

        scheduler.shutdown();
        let result =
            scheduler.schedule_at_fixed_rate("late", Duration::from_millis(10), Arc::new(|| {}));
        assert_eq!(result.unwrap_err(), ScheduleError::ShuttingDown);
    }
}
