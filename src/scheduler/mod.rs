//! Background upload scheduler.
//!
//! Drives reconciliation passes between the local buffer and remote storage
//! on a fixed interval. At most one pass runs at a time; ticks that arrive
//! while a pass is in flight are dropped rather than queued.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffer::RecordingBuffer;
use crate::executor::UploadExecutor;
use crate::{DEFAULT_ITEM_DELAY, DEFAULT_UPLOAD_INTERVAL, MAX_UPLOAD_INTERVAL};

/// Timing configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between scheduled passes
    pub interval: Duration,
    /// Pause between successive upload attempts within one pass
    pub item_delay: Duration,
}

impl SchedulerConfig {
    /// Timer period actually used: `interval` clamped to 1ms ..= one day
    pub fn effective_interval(&self) -> Duration {
        self.interval.clamp(Duration::from_millis(1), MAX_UPLOAD_INTERVAL)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_UPLOAD_INTERVAL,
            item_delay: DEFAULT_ITEM_DELAY,
        }
    }
}

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Timer armed, no pass in flight
    Idle,
    /// A reconciliation pass is in flight
    Running,
    /// Timer not armed; only forced passes run
    Stopped,
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Upload attempts made
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items skipped because their retry budget was exhausted
    pub skipped: usize,
    /// Uploaded recordings evicted by the closing cleanup
    pub evicted: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl std::fmt::Display for PassReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempted={}, succeeded={}, failed={}, skipped={}, evicted={}, took={}ms",
            self.attempted, self.succeeded, self.failed, self.skipped, self.evicted, self.duration_ms
        )
    }
}

/// Result of asking for a pass
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Another pass was already in flight; nothing was done
    Skipped,
    /// The pass ran to completion
    Completed(PassReport),
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            PassOutcome::Skipped => None,
        }
    }
}

/// Clears the in-flight flag when a pass ends, however it ends
struct FlightGuard {
    in_flight: Arc<AtomicBool>,
    idle: Arc<Notify>,
}

impl FlightGuard {
    fn acquire(in_flight: &Arc<AtomicBool>, idle: &Arc<Notify>) -> Option<Self> {
        in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                in_flight: Arc::clone(in_flight),
                idle: Arc::clone(idle),
            })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

struct SchedulerInner {
    executor: Arc<UploadExecutor>,
    config: SchedulerConfig,
    in_flight: Arc<AtomicBool>,
    idle: Arc<Notify>,
    timer: Mutex<Option<JoinHandle<()>>>,
    last_report: RwLock<Option<PassReport>>,
}

impl SchedulerInner {
    fn buffer(&self) -> &Arc<RecordingBuffer> {
        self.executor.buffer()
    }

    /// Start a pass in the background unless one is already in flight
    fn trigger(self: &Arc<Self>) {
        let Some(guard) = FlightGuard::acquire(&self.in_flight, &self.idle) else {
            debug!("Upload pass already in flight, dropping tick");
            return;
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_pass().await;
            // Release the scheduler before waking idle waiters
            drop(inner);
            drop(guard);
        });
    }

    async fn run_pass(&self) -> PassReport {
        let pending = self.buffer().pending().await;
        if pending.is_empty() {
            debug!("No pending recordings to upload");
            return PassReport::default();
        }

        let started = Instant::now();
        let mut report = PassReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let max_attempts = self.buffer().max_attempts();

        info!("Starting upload pass for {} pending recordings", pending.len());

        for recording in &pending {
            if recording.upload_attempts >= max_attempts {
                warn!(
                    "Recording {} exhausted {} upload attempts, skipping",
                    recording.id, max_attempts
                );
                report.skipped += 1;
                continue;
            }

            if report.attempted > 0 {
                sleep(self.config.item_delay).await;
            }

            report.attempted += 1;
            if self.executor.attempt(recording).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        report.evicted = self.buffer().cleanup().await;
        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.failed > 0 {
            warn!("Upload pass finished with failures: {}", report);
        } else {
            info!("Upload pass finished: {}", report);
        }

        *self.last_report.write().await = Some(report.clone());
        report
    }
}

/// Periodically uploads pending recordings with bounded retries
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<SchedulerInner>,
}

impl UploadScheduler {
    pub fn new(executor: Arc<UploadExecutor>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                config,
                in_flight: Arc::new(AtomicBool::new(false)),
                idle: Arc::new(Notify::new()),
                timer: Mutex::new(None),
                last_report: RwLock::new(None),
            }),
        }
    }

    /// Run one pass now, then arm the repeating timer.
    ///
    /// Calling `start` on a started scheduler only logs.
    pub async fn start(&self) {
        let mut timer = self.inner.timer.lock().await;
        if timer.is_some() {
            info!("Upload scheduler is already running");
            return;
        }

        let period = self.inner.config.effective_interval();
        if period != self.inner.config.interval {
            warn!(
                "Upload interval {:?} out of range, using {:?}",
                self.inner.config.interval, period
            );
        }
        info!("Starting upload scheduler (interval {:?})", period);

        self.inner.trigger();

        // Weak so dropping the last scheduler handle also ends the timer
        let weak = Arc::downgrade(&self.inner);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => inner.trigger(),
                    None => break,
                }
            }
        }));
    }

    /// Disarm the timer. A pass already in flight runs to completion.
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.timer.lock().await.take() {
            handle.abort();
            info!("Upload scheduler stopped");
        }
    }

    /// Run one pass immediately, independent of the timer.
    ///
    /// Returns [`PassOutcome::Skipped`] when a pass is already in flight.
    pub async fn force_upload_now(&self) -> PassOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.inner.in_flight, &self.inner.idle) else {
            info!("Upload pass already in flight, forced upload skipped");
            return PassOutcome::Skipped;
        };

        PassOutcome::Completed(self.inner.run_pass().await)
    }

    /// Wait until no pass is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if !self.inner.in_flight.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub async fn state(&self) -> SchedulerState {
        if self.inner.in_flight.load(Ordering::Acquire) {
            SchedulerState::Running
        } else if self.is_started().await {
            SchedulerState::Idle
        } else {
            SchedulerState::Stopped
        }
    }

    /// Whether the repeating timer is armed
    pub async fn is_started(&self) -> bool {
        self.inner.timer.lock().await.is_some()
    }

    /// Report of the most recent pass that found pending work
    pub async fn last_report(&self) -> Option<PassReport> {
        self.inner.last_report.read().await.clone()
    }

    pub fn executor(&self) -> &Arc<UploadExecutor> {
        &self.inner.executor
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            debug!("Upload scheduler dropped while started, cancelling timer");
            handle.abort();
        }
    }
}
