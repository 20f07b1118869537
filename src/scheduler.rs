//! Read scheduler.
//!
//! One timer task per registered read. Ticks land on absolute multiples of
//! the read's interval so sources stay on their grid under load. A tick that
//! finds the previous run of the same read still going is skipped and
//! counted. Callbacks run on the blocking pool, bounded by a semaphore.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::CollectdError;
use crate::plugin::{ReadContext, ReadEntry, Registry};
use crate::time::CdTime;

// ============================================================================
// SECTION 1: TIMING RULES
// ============================================================================

/// Upper bound of the back-off interval of a failing read.
pub const MAX_READ_INTERVAL: CdTime = CdTime::from_secs(86_400);

/// Interval to use after a run: the base on success, doubled (capped) on
/// failure.
pub fn backoff(effective: CdTime, base: CdTime, ok: bool) -> CdTime {
    if ok {
        return base;
    }
    let doubled = effective.saturating_mul(2);
    if doubled > MAX_READ_INTERVAL {
        MAX_READ_INTERVAL.max(base)
    } else {
        doubled
    }
}

/// Next tick: a multiple of `base` at least `effective` past `now`'s grid
/// slot, and strictly after `previous`.
pub fn next_tick(now: CdTime, base: CdTime, effective: CdTime, previous: CdTime) -> CdTime {
    let candidate = (now + effective.saturating_sub(base)).next_multiple_of(base);
    candidate.max(previous + base)
}

// ============================================================================
// SECTION 2: SCHEDULER
// ============================================================================

/// Per-read state shared between the timer task and the running callback.
#[derive(Debug)]
struct ReadState {
    in_flight: AtomicBool,
    /// Raw ticks of the current (possibly backed-off) interval
    effective: AtomicU64,
}

pub struct ReadScheduler {
    registry: Arc<Registry>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    runs: TaskTracker,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadScheduler {
    pub fn new(registry: Arc<Registry>, read_threads: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(read_threads.max(1))),
            cancel: CancellationToken::new(),
            runs: TaskTracker::new(),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a timer task for every read currently registered.
    pub fn start(&self) -> usize {
        let reads = self.registry.reads();
        let default_interval = self.registry.settings().interval;
        let mut timers = self.timers.lock();
        for entry in reads {
            let base = if entry.interval.is_zero() {
                default_interval
            } else {
                entry.interval
            };
            info!(target: "collectd::scheduler", plugin = %entry.name, interval = %base, "Scheduling read");
            timers.push(tokio::spawn(run_timer(
                Arc::clone(&self.registry),
                entry,
                base,
                Arc::clone(&self.permits),
                self.cancel.clone(),
                self.runs.clone(),
            )));
        }
        timers.len()
    }

    /// Stop ticking and wait for reads that are still running.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let timers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.timers.lock());
        for result in join_all(timers).await {
            if let Err(e) = result {
                warn!(target: "collectd::scheduler", error = %e, "Timer task ended abnormally");
            }
        }
        self.runs.close();
        self.runs.wait().await;
        info!(target: "collectd::scheduler", "Read scheduler stopped");
    }
}

async fn run_timer(
    registry: Arc<Registry>,
    entry: ReadEntry,
    base: CdTime,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    runs: TaskTracker,
) {
    let state = Arc::new(ReadState {
        in_flight: AtomicBool::new(false),
        effective: AtomicU64::new(base.as_raw()),
    });
    let mut next = CdTime::now().next_multiple_of(base);

    loop {
        let wait = next.saturating_sub(CdTime::now()).as_duration();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if state.in_flight.swap(true, AtomicOrdering::AcqRel) {
            registry.dispatch_stats().record_skipped_read();
            debug!(target: "collectd::scheduler", plugin = %entry.name, "Previous read still running, tick skipped");
        } else {
            runs.spawn(run_once(
                Arc::clone(&registry),
                entry.clone(),
                base,
                Arc::clone(&state),
                Arc::clone(&permits),
                cancel.clone(),
            ));
        }

        let effective = CdTime::from_raw(state.effective.load(AtomicOrdering::Acquire));
        next = next_tick(CdTime::now(), base, effective, next);
    }
}

async fn run_once(
    registry: Arc<Registry>,
    entry: ReadEntry,
    base: CdTime,
    state: Arc<ReadState>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = permits.acquire_owned() => permit.ok(),
    };
    let Some(permit) = permit else {
        state.in_flight.store(false, AtomicOrdering::Release);
        return;
    };

    let callback = Arc::clone(&entry.callback);
    let name = entry.name.clone();
    let reg = Arc::clone(&registry);
    let result = tokio::task::spawn_blocking(move || {
        let ctx = ReadContext {
            registry: &reg,
            plugin: &name,
            interval: base,
        };
        callback(&ctx)
    })
    .await;
    drop(permit);

    let outcome = match result {
        Ok(inner) => inner,
        Err(join_err) => Err(CollectdError::callback(entry.name.as_str(), join_err.to_string())),
    };
    let ok = outcome.is_ok();
    registry.dispatch_stats().record_read(ok);

    let previous = CdTime::from_raw(state.effective.load(AtomicOrdering::Acquire));
    let effective = backoff(previous, base, ok);
    state.effective.store(effective.as_raw(), AtomicOrdering::Release);

    if let Err(err) = outcome {
        registry.errors().record(&err);
        warn!(
            target: "collectd::scheduler",
            plugin = %entry.name,
            error = %err,
            next_interval = %effective,
            "Read failed, backing off"
        );
    } else if previous != base {
        info!(target: "collectd::scheduler", plugin = %entry.name, "Read succeeded, interval restored");
    }
    state.in_flight.store(false, AtomicOrdering::Release);
}

// ============================================================================
// SECTION 3: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{GlobalSettings, ReadFn};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(GlobalSettings {
            hostname: "testhost".to_string(),
            interval: CdTime::from_millis(100),
            timeout_factor: 2,
        }))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = CdTime::from_secs(10);
        assert_eq!(backoff(base, base, false), CdTime::from_secs(20));
        assert_eq!(backoff(CdTime::from_secs(20), base, false), CdTime::from_secs(40));
        assert_eq!(backoff(CdTime::from_secs(80_000), base, false), MAX_READ_INTERVAL);
        assert_eq!(backoff(CdTime::from_secs(640), base, true), base);
    }

    #[test]
    fn test_next_tick_stays_on_grid() {
        let base = CdTime::from_secs(10);
        let prev = CdTime::from_secs(100);
        assert_eq!(next_tick(CdTime::from_secs(101), base, base, prev), CdTime::from_secs(110));
        assert_eq!(
            next_tick(CdTime::from_secs(101), base, CdTime::from_secs(20), prev),
            CdTime::from_secs(120)
        );
        // A tick that woke early still advances.
        assert_eq!(next_tick(CdTime::from_secs(99), base, base, prev), CdTime::from_secs(110));
    }

    #[tokio::test]
    async fn test_reads_run_on_schedule() {
        let registry = registry();
        let count = Arc::new(AtomicUsize::new(0));
        let count_in_cb = Arc::clone(&count);
        let read: ReadFn = Arc::new(move |_ctx: &ReadContext<'_>| {
            count_in_cb.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(())
        });
        registry.register_read("counter", CdTime::ZERO, None, read).unwrap();

        let scheduler = ReadScheduler::new(Arc::clone(&registry), 2);
        assert_eq!(scheduler.start(), 1);
        tokio::time::sleep(Duration::from_millis(450)).await;
        scheduler.stop().await;

        let runs = count.load(AtomicOrdering::Relaxed);
        assert!(runs >= 2, "only {} runs", runs);
        assert_eq!(registry.stats().reads_executed as usize, runs);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let registry = registry();
        let read: ReadFn = Arc::new(|_ctx: &ReadContext<'_>| {
            std::thread::sleep(Duration::from_millis(250));
            Ok(())
        });
        registry.register_read("slow", CdTime::ZERO, None, read).unwrap();

        let scheduler = ReadScheduler::new(Arc::clone(&registry), 2);
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(600)).await;
        scheduler.stop().await;

        assert!(registry.stats().reads_skipped >= 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_read() {
        let registry = registry();
        let finished = Arc::new(AtomicBool::new(false));
        let finished_in_cb = Arc::clone(&finished);
        let read: ReadFn = Arc::new(move |_ctx: &ReadContext<'_>| {
            std::thread::sleep(Duration::from_millis(200));
            finished_in_cb.store(true, AtomicOrdering::Release);
            Ok(())
        });
        registry.register_read("slow", CdTime::ZERO, None, read).unwrap();

        let scheduler = ReadScheduler::new(Arc::clone(&registry), 1);
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(180)).await;
        scheduler.stop().await;
        assert!(finished.load(AtomicOrdering::Acquire));
    }

    #[tokio::test]
    async fn test_failing_read_is_counted() {
        let registry = registry();
        let read: ReadFn = Arc::new(|_ctx: &ReadContext<'_>| Err(CollectdError::callback("broken", "no sensor")));
        registry.register_read("broken", CdTime::ZERO, None, read).unwrap();

        let scheduler = ReadScheduler::new(Arc::clone(&registry), 1);
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop().await;

        let stats = registry.stats();
        assert!(stats.reads_failed >= 1);
        assert_eq!(stats.reads_failed, stats.reads_executed);
    }
}
