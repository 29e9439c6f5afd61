//! Periodic tick source for a timing wheel.
//!
//! The driver binds a wheel to one reactor and keeps itself scheduled
//! there: each firing advances the wheel and re-arms at
//! `start + k * ms_per_tick`, so drift never accumulates — a late
//! firing shortens the following wait instead of shifting the whole
//! train. Timeout tasks therefore always run on the bound reactor's
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::runtime::{Reactor, ReactorHandle};

use super::TimingWheel;

pub struct TimerDriver {
    wheel: Arc<TimingWheel>,
    remote: ReactorHandle,
    running: Arc<AtomicBool>,
}

impl TimerDriver {
    pub fn new(remote: ReactorHandle, wheel: Arc<TimingWheel>) -> Self {
        Self {
            wheel,
            remote,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn wheel(&self) -> &Arc<TimingWheel> {
        &self.wheel
    }

    pub fn is_attached(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start ticking. Idempotent while attached.
    pub fn attach(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let wheel = Arc::clone(&self.wheel);
        let running = Arc::clone(&self.running);
        debug!(ms_per_tick = wheel.ms_per_tick(), "Timer driver attached");
        self.remote.post(move |reactor| {
            arm(reactor, wheel, running, Instant::now(), 1);
        });
    }

    /// Stop ticking after the tick currently in flight.
    pub fn detach(&self) {
        self.running.store(false, Ordering::Release);
        debug!("Timer driver detached");
    }
}

fn arm(reactor: &mut Reactor, wheel: Arc<TimingWheel>, running: Arc<AtomicBool>, start: Instant, k: u64) {
    let deadline = start + Duration::from_millis(wheel.ms_per_tick() * k);
    reactor.schedule_at(deadline, move |reactor| {
        if !running.load(Ordering::Acquire) {
            return;
        }
        wheel.advance();
        arm(reactor, wheel, running, start, k + 1);
    });
}
