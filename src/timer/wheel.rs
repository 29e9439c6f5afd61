//! Hashed timing wheel.
//!
//! Bucketed timer in the netty style: `ticks_per_wheel` buckets
//! (rounded up to a power of two), each holding the timeouts that hash
//! onto it. Scheduling and cancellation are O(1) from any thread; one
//! `advance` per `ms_per_tick` walks a single bucket. A timeout far in
//! the future survives `remaining_rounds` full rotations before it
//! fires.
//!
//! Deadlines are quantized: a timeout for `expire_ms` fires on tick
//! `⌈expire_ms / ms_per_tick⌉`, so up to one tick late and never
//! early.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use super::monotonic_ms;

const ST_INIT: u8 = 0;
const ST_CANCELLED: u8 = 1;
const ST_EXPIRED: u8 = 2;

type TimerTask = Box<dyn FnOnce() + Send>;

struct Timeout {
    state: AtomicU8,
    remaining_rounds: AtomicU32,
    deadline_ms: u64,
    task: Mutex<Option<TimerTask>>,
}

impl Timeout {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// CAS INIT -> EXPIRED and run the task. Loses cleanly against a
    /// concurrent cancel.
    fn expire(&self) {
        if self
            .state
            .compare_exchange(ST_INIT, ST_EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let task = self.task.lock().expect("timeout task poisoned").take();
            if let Some(task) = task {
                task();
            }
        }
    }
}

/// Cancellation handle for one scheduled timeout.
#[derive(Clone)]
pub struct TimeoutHandle {
    inner: Arc<Timeout>,
}

impl TimeoutHandle {
    /// CAS INIT -> CANCELLED. Idempotent; returns whether this call
    /// made the transition. Cancelling a timeout whose task already
    /// started is a no-op: the task completes.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .inner
            .state
            .compare_exchange(ST_INIT, ST_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            // free whatever the task captured right away; the bucket
            // entry is reaped on its next walk
            self.inner.task.lock().expect("timeout task poisoned").take();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state() == ST_CANCELLED
    }

    pub fn is_expired(&self) -> bool {
        self.inner.state() == ST_EXPIRED
    }

    /// Absolute deadline on the monotonic-ms clock.
    pub fn deadline_ms(&self) -> u64 {
        self.inner.deadline_ms
    }
}

/// O(1) schedule/cancel bucketed timer advanced by an external tick.
pub struct TimingWheel {
    ms_per_tick: u64,
    mask: u64,
    shift: u32,
    ticked: AtomicU64,
    buckets: Box<[Mutex<Vec<Arc<Timeout>>>]>,
}

impl TimingWheel {
    /// `ticks_per_wheel` is rounded up to the next power of two.
    pub fn new(ms_per_tick: u64, ticks_per_wheel: usize) -> Self {
        assert!(ms_per_tick > 0, "wheel tick must be positive");
        assert!(ticks_per_wheel > 0, "wheel must have buckets");

        let slots = ticks_per_wheel.next_power_of_two();
        let buckets = (0..slots)
            .map(|_| Mutex::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            ms_per_tick,
            mask: (slots - 1) as u64,
            shift: slots.trailing_zeros(),
            ticked: AtomicU64::new(0),
            buckets,
        }
    }

    pub fn ms_per_tick(&self) -> u64 {
        self.ms_per_tick
    }

    pub fn ticks_per_wheel(&self) -> usize {
        self.buckets.len()
    }

    /// Ticks advanced so far.
    pub fn ticked(&self) -> u64 {
        self.ticked.load(Ordering::Acquire)
    }

    /// Schedule `task` to run `expire_ms` from now (quantized up to
    /// whole ticks). Callable from any thread; the task runs on
    /// whichever thread drives `advance`.
    pub fn schedule(&self, expire_ms: u64, task: impl FnOnce() + Send + 'static) -> TimeoutHandle {
        let ticks = expire_ms.div_ceil(self.ms_per_tick).max(1);
        let rounds = u32::try_from(ticks >> self.shift).unwrap_or(u32::MAX);
        let ticked = self.ticked.load(Ordering::Acquire);
        let index = ((ticks + (ticked & self.mask)) & self.mask) as usize;

        let timeout = Arc::new(Timeout {
            state: AtomicU8::new(ST_INIT),
            remaining_rounds: AtomicU32::new(rounds),
            deadline_ms: monotonic_ms() + expire_ms,
            task: Mutex::new(Some(Box::new(task))),
        });

        trace!(expire_ms, ticks, rounds, index, "Timeout scheduled");
        self.buckets[index]
            .lock()
            .expect("wheel bucket poisoned")
            .push(Arc::clone(&timeout));

        TimeoutHandle { inner: timeout }
    }

    /// One tick: walk the current bucket, fire what is due, then move
    /// the tick counter forward.
    ///
    /// Must be driven by a single thread (the TimerDriver's reactor).
    /// Due tasks run after the bucket lock is released, in insertion
    /// order, so a task may schedule back into the wheel.
    pub fn advance(&self) {
        let ticked = self.ticked.load(Ordering::Acquire);
        let index = (ticked & self.mask) as usize;

        let mut due: Vec<Arc<Timeout>> = Vec::new();
        {
            let mut bucket = self.buckets[index].lock().expect("wheel bucket poisoned");
            bucket.retain(|timeout| match timeout.state() {
                ST_CANCELLED | ST_EXPIRED => false,
                _ => {
                    if timeout.remaining_rounds.load(Ordering::Relaxed) == 0 {
                        due.push(Arc::clone(timeout));
                        false
                    } else {
                        timeout.remaining_rounds.fetch_sub(1, Ordering::Relaxed);
                        true
                    }
                }
            });
        }

        for timeout in due {
            timeout.expire();
        }

        self.ticked.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fired_counter(wheel: &TimingWheel, expire_ms: u64) -> (TimeoutHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = wheel.schedule(expire_ms, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (handle, count)
    }

    #[test]
    fn test_fires_on_ceiled_tick() {
        let wheel = TimingWheel::new(10, 8);
        // 25ms at 10ms/tick -> tick 3
        let (handle, count) = fired_counter(&wheel, 25);

        wheel.advance();
        wheel.advance();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        wheel.advance();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_expired());
    }

    #[test]
    fn test_zero_delay_fires_next_tick() {
        let wheel = TimingWheel::new(10, 8);
        let (_handle, count) = fired_counter(&wheel, 0);
        wheel.advance();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_survives_rounds_past_wheel_size() {
        let wheel = TimingWheel::new(10, 8);
        // 100ms -> 10 ticks: one full rotation plus two
        let (_handle, count) = fired_counter(&wheel, 100);

        for _ in 0..9 {
            wheel.advance();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        wheel.advance();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_advance_suppresses_task() {
        let wheel = TimingWheel::new(10, 8);
        let (handle, count) = fired_counter(&wheel, 10);

        assert!(handle.cancel());
        assert!(!handle.cancel()); // idempotent, reports no transition
        assert!(handle.is_cancelled());

        for _ in 0..16 {
            wheel.advance();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_expiry_is_noop() {
        let wheel = TimingWheel::new(10, 8);
        let (handle, count) = fired_counter(&wheel, 5);
        wheel.advance();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handle.cancel());
        assert!(handle.is_expired());
    }

    #[test]
    fn test_same_bucket_fires_in_insertion_order() {
        let wheel = TimingWheel::new(10, 8);
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            wheel.schedule(10, move || order.lock().unwrap().push(label));
        }
        wheel.advance();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_task_can_reschedule_into_wheel() {
        let wheel = Arc::new(TimingWheel::new(10, 8));
        let count = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&wheel);
        let c = Arc::clone(&count);
        wheel.schedule(10, move || {
            c.fetch_add(1, Ordering::SeqCst);
            let c2 = Arc::clone(&c);
            w.schedule(10, move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        wheel.advance();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        wheel.advance();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rounds_up_to_power_of_two() {
        let wheel = TimingWheel::new(100, 10);
        assert_eq!(wheel.ticks_per_wheel(), 16);
    }
}
