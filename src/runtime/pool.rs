//! Fixed pool of reactor threads with round-robin selection.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use super::event_loop::{Reactor, ReactorHandle};

/// N reactors on N threads. Connections are balanced across them by a
/// monotonic counter modulo N; handles stay valid from `start` until
/// `stop` joins the threads.
pub struct LoopPool {
    handles: Vec<ReactorHandle>,
    pending: Mutex<Vec<Reactor>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl LoopPool {
    /// Build `count` reactors (not yet running). `count` of zero means
    /// one reactor per available core.
    pub fn new(count: usize) -> io::Result<Self> {
        let count = if count == 0 { num_cpus() } else { count };

        let mut reactors = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let reactor = Reactor::new()?;
            handles.push(reactor.handle());
            reactors.push(reactor);
        }

        Ok(Self {
            handles,
            pending: Mutex::new(reactors),
            threads: Mutex::new(Vec::with_capacity(count)),
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Launch one named thread per reactor.
    pub fn start(&self) {
        let mut pending = self.pending.lock().expect("loop pool poisoned");
        let mut threads = self.threads.lock().expect("loop pool poisoned");

        for (index, mut reactor) in pending.drain(..).enumerate() {
            let thread = thread::Builder::new()
                .name(format!("loop-{index}"))
                .spawn(move || {
                    if let Err(e) = reactor.run() {
                        error!(reactor = index, error = %e, "Reactor loop failed");
                    }
                })
                .expect("spawning reactor thread");
            threads.push(thread);
        }

        info!(loops = self.handles.len(), "Loop pool started");
    }

    /// Next reactor in rotation.
    pub fn pick(&self) -> &ReactorHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[index]
    }

    pub fn handles(&self) -> &[ReactorHandle] {
        &self.handles
    }

    /// Request stop on every reactor and join the threads.
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.stop();
        }
        self.join();
    }

    /// Block until the reactor threads exit.
    pub fn join(&self) {
        let mut threads = self.threads.lock().expect("loop pool poisoned");
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_rotates_round_robin() {
        let pool = LoopPool::new(3).unwrap();
        let first = pool.pick().clone();
        let second = pool.pick().clone();
        let third = pool.pick().clone();
        let wrapped = pool.pick().clone();

        assert!(!first.same_reactor(&second));
        assert!(!second.same_reactor(&third));
        assert!(first.same_reactor(&wrapped));
    }

    #[test]
    fn test_start_stop_joins_cleanly() {
        let pool = LoopPool::new(2).unwrap();
        pool.start();

        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..pool.len() {
            let tx = tx.clone();
            pool.pick().post(move |_| tx.send(()).unwrap());
        }
        for _ in 0..pool.len() {
            rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        }

        pool.stop();
    }

    #[test]
    fn test_zero_count_uses_available_cores() {
        let pool = LoopPool::new(0).unwrap();
        assert!(pool.len() >= 1);
    }
}
