use dashmap::DashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::interval;

// Index of a fixed window: floor(now / window)
pub type WindowIndex = u64;

// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        // clocks before the epoch clamp to zero
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

// Clock that only moves when told to (tests, replays)
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    // saturates at u64::MAX instead of wrapping
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        let _ = self
            .millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| Some(now.saturating_add(by)));
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Largest usable request limit. A count pinned at `u32::MAX` is saturated
/// and can no longer tell admitted requests from rejected ones.
pub const MAX_LIMIT: u32 = u32::MAX - 1;

// Saturated counts are always over the limit.
fn within_limit(count: u32, limit: u32) -> bool {
    count < u32::MAX && count <= limit
}

// Each entry is one word: high 32 bits window tag, low 32 bits count.
const COUNT_BITS: u32 = 32;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

fn pack(tag: u32, count: u32) -> u64 {
    ((tag as u64) << COUNT_BITS) | count as u64
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> COUNT_BITS) as u32, (word & COUNT_MASK) as u32)
}

fn window_tag(window: WindowIndex) -> u32 {
    window as u32
}

// Serial-number distance from `stored` forward to `current`; negative when
// the stored window is ahead of the clock.
fn windows_behind(stored: u32, current: u32) -> i64 {
    current.wrapping_sub(stored) as i32 as i64
}

/// Fixed-window request counter keyed by client.
///
/// Every key owns a single atomic word holding the window it was last seen
/// in and its count within that window. `increment` updates that pair with a
/// compare-and-swap loop, so concurrent callers on one key each observe a
/// distinct count and a rollover is applied exactly once. Unrelated keys only
/// share a map shard for the duration of a lookup.
pub struct BucketCounter {
    window_millis: u64,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, AtomicU64>,
}

impl BucketCounter {
    pub fn with_clock(window_seconds: NonZeroU64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_millis: window_seconds.get().saturating_mul(1000),
            clock,
            buckets: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis)
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn current_window(&self, now: u64) -> WindowIndex {
        now / self.window_millis
    }

    /// Fraction of the current window already elapsed, in `[0, 1)`.
    pub fn elapsed_ratio(&self, now: u64) -> f64 {
        (now % self.window_millis) as f64 / self.window_millis as f64
    }

    /// Milliseconds left before the next window starts.
    ///
    /// At the exact start of a window this is the full window length, so
    /// `elapsed_ratio(now) + millis_until_next_window(now) / window == 1`
    /// holds for every `now`.
    pub fn millis_until_next_window(&self, now: u64) -> u64 {
        self.window_millis - now % self.window_millis
    }

    pub fn increment(&self, key: &str) -> u32 {
        self.increment_at(key, self.now())
    }

    /// Counts one request for `key` at `now` and returns the new count.
    ///
    /// The first request of a key, or the first one after its window has
    /// passed, returns 1.
    pub fn increment_at(&self, key: &str, now: u64) -> u32 {
        let tag = window_tag(self.current_window(now));

        if let Some(slot) = self.buckets.get(key) {
            return advance(&slot, tag);
        }

        // Lost insert races land on the winner's entry and advance it.
        let slot = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| AtomicU64::new(pack(tag, 0)));
        advance(&slot, tag)
    }

    /// Counts the request and reports whether it is within `limit`.
    ///
    /// Rejected requests still consume a slot, so the count keeps climbing
    /// past the limit until the window rolls over.
    pub fn is_allowed(&self, key: &str, limit: u32) -> bool {
        self.is_allowed_at(key, limit, self.now())
    }

    pub fn is_allowed_at(&self, key: &str, limit: u32, now: u64) -> bool {
        self.admit_at(key, limit, now).1
    }

    /// Counts the request at `now` and returns the new count together with
    /// whether it is within `limit`.
    pub fn admit_at(&self, key: &str, limit: u32, now: u64) -> (u32, bool) {
        let count = self.increment_at(key, now);
        (count, within_limit(count, limit))
    }

    /// Count recorded for `key` in the window containing `now`, without
    /// counting a request.
    pub fn count_at(&self, key: &str, now: u64) -> u32 {
        let tag = window_tag(self.current_window(now));
        self.buckets
            .get(key)
            .map(|slot| {
                let (stored, count) = unpack(slot.load(Ordering::Acquire));
                if windows_behind(stored, tag) > 0 { 0 } else { count }
            })
            .unwrap_or(0)
    }

    pub fn count(&self, key: &str) -> u32 {
        self.count_at(key, self.now())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drops keys whose last window is `idle_windows` or more behind the
    /// window containing `now`. Returns how many were removed.
    pub fn sweep_at(&self, now: u64, idle_windows: u32) -> usize {
        let tag = window_tag(self.current_window(now));
        let threshold = idle_windows.max(1) as i64;
        let mut evicted = 0;

        // retain holds each shard's write lock, so no CAS is in flight on
        // an entry while it is judged.
        self.buckets.retain(|_, slot| {
            let (stored, _) = unpack(slot.load(Ordering::Acquire));
            let keep = windows_behind(stored, tag) < threshold;
            if !keep {
                evicted += 1;
            }
            keep
        });

        evicted
    }

    pub fn sweep(&self, idle_windows: u32) -> usize {
        self.sweep_at(self.now(), idle_windows)
    }

    /// Sweeps idle keys once per window on the tokio runtime.
    ///
    /// The task only holds a weak reference and ends after the counter is
    /// dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, idle_windows: u32) -> tokio::task::JoinHandle<()> {
        let counter: Weak<Self> = Arc::downgrade(self);
        let period = self.window();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            tracing::debug!(?period, idle_windows, "bucket maintenance started");

            loop {
                ticker.tick().await;

                let Some(counter) = counter.upgrade() else {
                    tracing::debug!("bucket counter dropped, maintenance stopping");
                    break;
                };

                let evicted = counter.sweep(idle_windows);
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = counter.len(), "evicted idle clients");
                }
            }
        })
    }
}

fn advance(slot: &AtomicU64, tag: u32) -> u32 {
    let mut current = slot.load(Ordering::Acquire);

    loop {
        let (stored, count) = unpack(current);
        let next = if windows_behind(stored, tag) > 0 {
            pack(tag, 1)
        } else {
            pack(stored, count.saturating_add(1))
        };

        match slot.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return unpack(next).1,
            Err(actual) => current = actual,
        }
    }
}
