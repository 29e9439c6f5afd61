//! Reactor: readiness multiplexing plus a cross-thread task queue.
//!
//! One reactor owns one `mio::Poll` and a slab of [`EventSink`]s keyed
//! by token. The loop blocks in `poll` (bounded by the earliest
//! pending deadline), fans readiness out to sinks, fires due
//! deadline tasks, then drains tasks posted from other threads. The
//! wake channel is a `mio::Waker` (eventfd or pipe underneath)
//! registered under a reserved token; `post` enqueues under a lock and
//! nudges it so a blocked loop observes the submission promptly.

use mio::{Events, Poll, Registry, Token, Waker};
use slab::Slab;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::handle::{Control, EventSink, HandleId};

/// Token reserved for the wake channel; slab keys grow from zero and
/// never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// A unit of work executed on the reactor thread.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send>;

struct Slot {
    binding: u64,
    /// Taken while the sink is being dispatched, so reentrant
    /// dispatch attempts become no-ops.
    sink: Option<Box<dyn EventSink>>,
}

/// Deadline task ordered by (instant, submission sequence).
struct TimerEntry {
    at: Instant,
    seq: u64,
    task: Option<Task>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed so the BinaryHeap surfaces the earliest deadline,
        // ties broken in submission order
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ReactorShared {
    registry: Registry,
    waker: Waker,
    tasks: Mutex<VecDeque<Task>>,
    stop: AtomicBool,
}

/// Cheap cloneable face of a reactor, usable from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// Enqueue `task` to run on the reactor thread and wake the loop.
    ///
    /// Tasks posted from one thread run in post order; ordering across
    /// threads is unspecified.
    pub fn post(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        self.shared
            .tasks
            .lock()
            .expect("reactor task queue poisoned")
            .push_back(Box::new(task));
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Reactor wake failed");
        }
    }

    /// Request loop termination. `run` returns after the dispatch
    /// batch in flight completes.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "Reactor wake failed");
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// True when both handles face the same reactor.
    pub fn same_reactor(&self, other: &ReactorHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }
}

/// Single-threaded readiness dispatcher.
///
/// Exactly one thread may call [`Reactor::run`]; everything else talks
/// to the loop through a [`ReactorHandle`].
pub struct Reactor {
    poll: Poll,
    slots: Slab<Slot>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    binding_seq: u64,
    shared: Arc<ReactorShared>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll,
            slots: Slab::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            binding_seq: 0,
            shared: Arc::new(ReactorShared {
                registry,
                waker,
                tasks: Mutex::new(VecDeque::new()),
                stop: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Install a sink: reserve a token, let the sink register its
    /// descriptor, and start dispatching its readiness.
    pub fn attach(&mut self, mut sink: Box<dyn EventSink>) -> io::Result<HandleId> {
        let id = self.reserve_slot();
        let remote = self.handle();
        match sink.register(&remote, id) {
            Ok(()) => {
                self.commit_slot(id, sink);
                Ok(id)
            }
            Err(e) => {
                self.abort_slot(id);
                Err(e)
            }
        }
    }

    /// Remove a sink installed earlier. Stale ids (token recycled, or
    /// the sink already gone) are ignored.
    pub fn detach(&mut self, id: HandleId) {
        let matches = self
            .slots
            .get(id.token.0)
            .map(|s| s.binding == id.binding)
            .unwrap_or(false);
        if !matches {
            return;
        }
        let slot = self.slots.remove(id.token.0);
        if let Some(mut sink) = slot.sink {
            sink.on_shutdown();
        }
        trace!(token = id.token.0, "Sink detached");
    }

    /// Run `task` at `at`. The deadline bounds the poll wait, so no
    /// timerfd is involved; ties fire in submission order.
    pub fn schedule_at(&mut self, at: Instant, task: impl FnOnce(&mut Reactor) + Send + 'static) {
        let seq = self.timer_seq;
        self.timer_seq += 1;
        self.timers.push(TimerEntry {
            at,
            seq,
            task: Some(Box::new(task)),
        });
    }

    /// Reserve a slot so the caller can learn its id before the sink
    /// exists; `commit_slot` (or `abort_slot`) must follow.
    pub(crate) fn reserve_slot(&mut self) -> HandleId {
        self.binding_seq += 1;
        let binding = self.binding_seq;
        let token = Token(self.slots.insert(Slot {
            binding,
            sink: None,
        }));
        HandleId { token, binding }
    }

    pub(crate) fn commit_slot(&mut self, id: HandleId, sink: Box<dyn EventSink>) {
        let slot = &mut self.slots[id.token.0];
        debug_assert_eq!(slot.binding, id.binding);
        slot.sink = Some(sink);
    }

    pub(crate) fn abort_slot(&mut self, id: HandleId) {
        self.slots.remove(id.token.0);
    }

    /// Dispatch the write path of the sink at `id`, as if WRITE
    /// readiness fired. Used by send paths that queued data from
    /// another thread.
    ///
    /// The binding stamp is checked first: the sender may have raced a
    /// close, and the token may already belong to a different sink.
    pub(crate) fn drive_writable(&mut self, id: HandleId) {
        let matches = self
            .slots
            .get(id.token.0)
            .map(|s| s.binding == id.binding)
            .unwrap_or(false);
        if !matches {
            trace!(token = id.token.0, "Stale write drive ignored");
            return;
        }
        self.dispatch(id.token, false, true);
    }

    /// Block dispatching events, deadline tasks and posted tasks until
    /// [`ReactorHandle::stop`] is called.
    ///
    /// EINTR is retried; any other multiplexer failure is fatal to
    /// this reactor and surfaces as the returned error.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shared.stop.load(Ordering::Acquire) {
            let timeout = self.next_deadline_timeout();
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Multiplexer failure, reactor stopping");
                    self.shutdown_sinks();
                    return Err(e);
                }
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue; // queue drained below
                }
                let readable = event.is_readable() || event.is_error() || event.is_read_closed();
                let writable = event.is_writable();
                self.dispatch(token, readable, writable);
            }

            self.run_due_timers();
            self.run_posted_tasks();
        }

        self.shutdown_sinks();
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(slot) = self.slots.get_mut(token.0) else {
            // closed earlier in this batch
            return;
        };
        let binding = slot.binding;
        let Some(mut sink) = slot.sink.take() else {
            return;
        };

        let mut control = Control::Keep;
        if readable {
            control = sink.on_readable();
        }
        if control == Control::Keep && writable {
            control = sink.on_writable();
        }

        match control {
            Control::Keep => {
                match self.slots.get_mut(token.0) {
                    Some(slot) if slot.binding == binding => slot.sink = Some(sink),
                    // detached while dispatching; let the sink go
                    _ => sink.on_shutdown(),
                }
            }
            Control::Remove => {
                if self
                    .slots
                    .get(token.0)
                    .map(|s| s.binding == binding)
                    .unwrap_or(false)
                {
                    self.slots.remove(token.0);
                }
                debug!(token = token.0, "Sink removed");
            }
        }
    }

    fn next_deadline_timeout(&self) -> Option<Duration> {
        self.timers
            .peek()
            .map(|entry| entry.at.saturating_duration_since(Instant::now()))
    }

    fn run_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.peek() {
            if entry.at > now {
                break;
            }
            let mut entry = self.timers.pop().expect("peeked timer entry");
            if let Some(task) = entry.task.take() {
                task(self);
            }
        }
    }

    fn run_posted_tasks(&mut self) {
        // snapshot: tasks posted while these run land in the queue and
        // wake the next iteration
        let batch: Vec<Task> = {
            let mut queue = self
                .shared
                .tasks
                .lock()
                .expect("reactor task queue poisoned");
            queue.drain(..).collect()
        };
        for task in batch {
            task(self);
        }
    }

    fn shutdown_sinks(&mut self) {
        let tokens: Vec<usize> = self.slots.iter().map(|(k, _)| k).collect();
        for token in tokens {
            let slot = self.slots.remove(token);
            if let Some(mut sink) = slot.sink {
                sink.on_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_reactor() -> (ReactorHandle, thread::JoinHandle<io::Result<()>>) {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let join = thread::spawn(move || reactor.run());
        (handle, join)
    }

    #[test]
    fn test_tasks_run_in_post_order() {
        let (handle, join) = spawn_reactor();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..32 {
            let seen = Arc::clone(&seen);
            handle.post(move |_| seen.lock().unwrap().push(i));
        }

        let (tx, rx) = std::sync::mpsc::channel();
        handle.post(move |_| tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        handle.stop();
        join.join().unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_deadlines_fire_in_order() {
        let (handle, join) = spawn_reactor();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        handle.post(move |reactor| {
            let base = Instant::now();
            for (label, offset_ms) in [("late", 60u64), ("early", 20), ("mid", 40)] {
                let s = Arc::clone(&s);
                reactor.schedule_at(base + Duration::from_millis(offset_ms), move |_| {
                    s.lock().unwrap().push(label);
                });
            }
        });

        thread::sleep(Duration::from_millis(300));
        handle.stop();
        join.join().unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_stop_unblocks_idle_loop() {
        let (handle, join) = spawn_reactor();
        thread::sleep(Duration::from_millis(50));
        handle.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_tasks_posted_before_run_are_not_lost() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let (tx, rx) = std::sync::mpsc::channel();
        handle.post(move |_| tx.send(7u32).unwrap());

        let join = thread::spawn(move || reactor.run());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        handle.stop();
        join.join().unwrap().unwrap();
    }
}
