//! Hashed-wheel read-timeout timer.
//!
//! One process-wide wheel serves every client instance. Tasks are bucketed
//! by their deadline tick; the driver task advances one bucket per tick and
//! runs whatever is due. Cancellation flips an atomic, so a cancelled token
//! never runs its task even if the driver has already pulled the entry.

use std::{
    sync::{
        atomic::{AtomicU8, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use once_cell::sync::Lazy;

const STATE_PENDING: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

/// Tick duration override, in milliseconds.
const TICK_ENV: &str = "COURIER_WHEEL_TICK_MS";
/// Wheel size override; rounded up to a power of two.
const SIZE_ENV: &str = "COURIER_WHEEL_SIZE";

const DEFAULT_TICK_MS: u64 = 30;
const DEFAULT_SIZE: usize = 512;

type Task = Box<dyn FnOnce() + Send>;

/// The process-wide wheel, configured from the environment on first use.
pub(crate) fn global() -> &'static HashedWheelTimer {
    static GLOBAL: Lazy<HashedWheelTimer> = Lazy::new(|| {
        let tick = std::env::var(TICK_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_TICK_MS);
        let size = std::env::var(SIZE_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_SIZE);
        HashedWheelTimer::new(Duration::from_millis(tick), size)
    });
    &GLOBAL
}

pub(crate) struct HashedWheelTimer {
    shared: Arc<Shared>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Shared {
    tick: Duration,
    mask: u64,
    // tick counter; slot = deadline_tick & mask
    current: AtomicU64,
    buckets: Vec<Mutex<Vec<Arc<Entry>>>>,
}

struct Entry {
    deadline_tick: u64,
    state: AtomicU8,
    task: Mutex<Option<Task>>,
}

impl HashedWheelTimer {
    pub(crate) fn new(tick: Duration, size: usize) -> HashedWheelTimer {
        let size = size.next_power_of_two();
        let buckets = (0..size).map(|_| Mutex::new(Vec::new())).collect();
        HashedWheelTimer {
            shared: Arc::new(Shared {
                tick,
                mask: (size - 1) as u64,
                current: AtomicU64::new(0),
                buckets,
            }),
            driver: Mutex::new(None),
        }
    }

    /// Schedule `task` to run after `delay`. Must be called from within a
    /// tokio runtime; the driver task is spawned lazily on first use.
    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> Timeout {
        self.ensure_driver();

        let ticks = delay.as_nanos().div_ceil(self.shared.tick.as_nanos().max(1)) as u64;
        let deadline_tick = self.shared.current.load(Ordering::Acquire) + ticks.max(1);
        let entry = Arc::new(Entry {
            deadline_tick,
            state: AtomicU8::new(STATE_PENDING),
            task: Mutex::new(Some(task)),
        });

        let slot = (deadline_tick & self.shared.mask) as usize;
        self.shared.buckets[slot].lock().unwrap().push(entry.clone());
        Timeout { entry }
    }

    fn ensure_driver(&self) {
        let mut driver = self.driver.lock().unwrap();
        let running = driver.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !running {
            let shared = self.shared.clone();
            *driver = Some(tokio::spawn(drive(shared)));
        }
    }

    /// Number of not-yet-fired, not-yet-cancelled tasks.
    #[allow(dead_code)]
    pub(crate) fn pending(&self) -> usize {
        self.shared
            .buckets
            .iter()
            .map(|b| {
                b.lock()
                    .unwrap()
                    .iter()
                    .filter(|e| e.state.load(Ordering::Acquire) == STATE_PENDING)
                    .count()
            })
            .sum()
    }

    /// Stop the driver and cancel everything outstanding. The returned
    /// tokens are the timeouts that were still live, already cancelled.
    #[allow(dead_code)]
    pub(crate) fn stop(&self) -> Vec<Timeout> {
        if let Some(driver) = self.driver.lock().unwrap().take() {
            driver.abort();
        }
        let mut live = Vec::new();
        for bucket in &self.shared.buckets {
            for entry in bucket.lock().unwrap().drain(..) {
                let timeout = Timeout { entry };
                if timeout.cancel() {
                    live.push(timeout);
                }
            }
        }
        live
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
    loop {
        interval.tick().await;
        let now = shared.current.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = (now & shared.mask) as usize;

        let due: Vec<Arc<Entry>> = {
            let mut bucket = shared.buckets[slot].lock().unwrap();
            let mut due = Vec::new();
            bucket.retain(|e| {
                match e.state.load(Ordering::Acquire) {
                    STATE_CANCELLED => false,
                    _ if e.deadline_tick <= now => {
                        due.push(e.clone());
                        false
                    }
                    _ => true,
                }
            });
            due
        };

        for entry in due {
            if entry
                .state
                .compare_exchange(
                    STATE_PENDING,
                    STATE_EXPIRED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if let Some(task) = entry.task.lock().unwrap().take() {
                    task();
                }
            }
        }
    }
}

/// Token for a scheduled timeout task.
pub(crate) struct Timeout {
    entry: Arc<Entry>,
}

impl Timeout {
    /// Cancel the task. Returns `true` if the task had not yet run; a
    /// cancelled task will never run.
    pub(crate) fn cancel(&self) -> bool {
        let cancelled = self
            .entry
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if cancelled {
            // drop the closure eagerly; it may capture channels
            self.entry.task.lock().unwrap().take();
        }
        cancelled
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == STATE_EXPIRED
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("cancelled", &self.is_cancelled())
            .field("expired", &self.is_expired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token = timer.schedule(
            Duration::from_millis(50),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(token.is_expired());
        timer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_never_fires() {
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token = timer.schedule(
            Duration::from_millis(50),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(token.cancel());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(token.is_cancelled());
        // second cancel is a no-op
        assert!(!token.cancel());
        timer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_live_tokens_cancelled() {
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 16);
        let _a = timer.schedule(Duration::from_secs(60), Box::new(|| {}));
        let _b = timer.schedule(Duration::from_secs(60), Box::new(|| {}));
        assert_eq!(timer.pending(), 2);

        let live = timer.stop();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(Timeout::is_cancelled));
        assert_eq!(timer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn far_deadline_survives_wheel_wrap() {
        // 16 slots x 10ms: a 500ms deadline wraps the wheel multiple times.
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timer.schedule(
            Duration::from_millis(500),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.stop();
    }
}
