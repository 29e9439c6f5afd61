//! Per-socket read/write state machine.
//!
//! A `Connection` lives in its reactor's slab and is only touched on
//! that thread. Applications hold a [`ConnHandle`]: a cheap clone that
//! can enqueue outbound buffers from any thread; the actual socket
//! writes happen on the reactor after a posted drain task or a WRITE
//! readiness event.
//!
//! ## Read path
//!
//! Each READ readiness drains the socket with a two-segment gather
//! read: the inbound buffer's writable region first, then a 32 KiB
//! scratch shared by every connection on the thread. Bytes that landed
//! in scratch are copied in after growing the buffer, which keeps the
//! common case (frame fits the buffer) copy-free while still pulling
//! large bursts out of the kernel in one syscall.
//!
//! ## Write path
//!
//! Senders append to a mutex-guarded FIFO and post a drain task. The
//! drain gathers up to 50 buffers per `writev`, advances read cursors
//! in FIFO order, arms WRITE interest when the socket refuses more and
//! clears it once the queue empties. Only the reactor thread ever
//! moves read cursors; the mutex protects list membership alone.

use mio::net::TcpStream;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

use crate::buffer::ByteBuffer;
use crate::codec::FramingCodec;

use super::event_loop::{Reactor, ReactorHandle};
use super::handle::{Control, EventSink, Handle, HandleId};

/// Predicted message length: initial inbound buffer capacity, and the
/// floor for post-parse growth when the header is still incomplete.
pub const PRED_MSG_LEN: usize = 1024;

const SCRATCH_LEN: usize = 32 * 1024;

/// Upper bound on iovecs per writev.
const MAX_WRITE_VECS: usize = 50;

thread_local! {
    /// Spill segment for the gather read, shared by all connections
    /// on one reactor thread.
    static READ_SCRATCH: RefCell<Box<[u8; SCRATCH_LEN]>> =
        RefCell::new(Box::new([0u8; SCRATCH_LEN]));
}

/// Application callback set shared by every connection of a server.
///
/// `on_connect` runs on the owning reactor thread before the
/// connection is attached; `on_message` per decoded frame;
/// `on_close` at most once, with `None` for a clean peer close and
/// the error for a fatal one.
pub struct ConnCallbacks<C: FramingCodec> {
    pub on_connect: Box<dyn Fn(&ConnHandle) + Send + Sync>,
    pub on_message: Box<dyn Fn(&ConnHandle, C::Frame) + Send + Sync>,
    pub on_close: Box<dyn Fn(&ConnHandle, Option<io::Error>) + Send + Sync>,
}

struct ConnShared {
    id: HandleId,
    peer: SocketAddr,
    remote: ReactorHandle,
    outbound: Mutex<VecDeque<ByteBuffer>>,
    closed: AtomicBool,
}

/// Cloneable, thread-safe face of a connection.
#[derive(Clone)]
pub struct ConnHandle {
    shared: Arc<ConnShared>,
}

impl ConnHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    /// True once the close path ran; subsequent sends are dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Reactor this connection lives on.
    pub fn reactor(&self) -> &ReactorHandle {
        &self.shared.remote
    }

    /// Enqueue one framed buffer for sending.
    pub fn send(&self, buf: ByteBuffer) {
        if buf.is_empty() {
            return;
        }
        self.send_multi(vec![buf]);
    }

    /// Enqueue several framed buffers, preserving their order.
    pub fn send_multi(&self, bufs: Vec<ByteBuffer>) {
        if self.is_closed() {
            trace!(peer = %self.shared.peer, "Send on closed connection dropped");
            return;
        }
        {
            let mut queue = self
                .shared
                .outbound
                .lock()
                .expect("outbound queue poisoned");
            queue.extend(bufs.into_iter().filter(|b| !b.is_empty()));
        }
        let shared = Arc::clone(&self.shared);
        self.shared
            .remote
            .post(move |reactor| reactor.drive_writable(shared.id));
    }

    /// Serialize `frame` through the codec and enqueue the result.
    pub fn send_frame<C: FramingCodec>(&self, frame: C::Frame) {
        let mut bufs = Vec::with_capacity(2);
        C::write_frame(frame, &mut bufs);
        self.send_multi(bufs);
    }

    /// Detach and discard the connection. Silent: `on_close` is for
    /// peer- or error-initiated teardown, not this.
    pub fn close(&self) {
        let id = self.shared.id;
        self.shared.remote.post(move |reactor| reactor.detach(id));
    }
}

enum ReadStep {
    /// `n` bytes landed; `cap` was the gather capacity offered.
    Got { n: usize, cap: usize },
    WouldBlock,
    Retry,
    Eof,
    Fatal(io::Error),
}

/// Reactor-thread half of a TCP connection, monomorphized over the
/// framing codec.
pub struct Connection<C: FramingCodec> {
    stream: TcpStream,
    handle: Handle,
    inbound: ByteBuffer,
    shared: Arc<ConnShared>,
    callbacks: Arc<ConnCallbacks<C>>,
    closed: bool,
}

impl<C: FramingCodec + 'static> Connection<C> {
    /// Build a connection around an accepted socket, give the
    /// application its `on_connect` look before any event can fire,
    /// then attach. Runs on the owning reactor's thread.
    pub(crate) fn establish(
        reactor: &mut Reactor,
        stream: TcpStream,
        peer: SocketAddr,
        callbacks: Arc<ConnCallbacks<C>>,
    ) -> io::Result<()> {
        let id = reactor.reserve_slot();
        let remote = reactor.handle();
        let shared = Arc::new(ConnShared {
            id,
            peer,
            remote: remote.clone(),
            outbound: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });

        let mut conn = Box::new(Connection {
            stream,
            handle: Handle::new(remote, id),
            inbound: ByteBuffer::with_capacity(PRED_MSG_LEN),
            shared: Arc::clone(&shared),
            callbacks: Arc::clone(&callbacks),
            closed: false,
        });

        (callbacks.on_connect)(&ConnHandle {
            shared: Arc::clone(&shared),
        });

        let attach_result = {
            let Connection { handle, stream, .. } = &mut *conn;
            handle.attach(stream)
        };
        match attach_result {
            Ok(()) => {
                reactor.commit_slot(id, conn);
                Ok(())
            }
            Err(e) => {
                reactor.abort_slot(id);
                shared.closed.store(true, Ordering::Release);
                (callbacks.on_close)(
                    &ConnHandle { shared },
                    Some(io::Error::new(e.kind(), "registering connection failed")),
                );
                Err(e)
            }
        }
    }

    fn conn_handle(&self) -> ConnHandle {
        ConnHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn read_step(&mut self) -> ReadStep {
        READ_SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            let writable_len = self.inbound.writable_len();
            let cap = writable_len + SCRATCH_LEN;

            let n = {
                let mut segs = [
                    IoSliceMut::new(self.inbound.writable()),
                    IoSliceMut::new(&mut scratch[..]),
                ];
                match self.stream.read_vectored(&mut segs) {
                    Ok(0) => return ReadStep::Eof,
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return ReadStep::WouldBlock
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        return ReadStep::Retry
                    }
                    Err(e) => return ReadStep::Fatal(e),
                }
            };

            if n > writable_len {
                // tail spilled into scratch: commit the first segment,
                // grow, copy the spill in behind it
                let spill = n - writable_len;
                self.inbound.mark_write(writable_len);
                self.inbound.put_slice(&scratch[..spill]);
            } else {
                self.inbound.mark_write(n);
            }
            ReadStep::Got { n, cap }
        })
    }

    /// Pull every complete frame out of the inbound buffer, then apply
    /// the buffer policy for whatever partial data remains.
    fn extract_frames(&mut self) {
        loop {
            match C::read_frame(&mut self.inbound) {
                Some(frame) => {
                    let handle = self.conn_handle();
                    (self.callbacks.on_message)(&handle, frame);
                }
                None => {
                    if self.inbound.is_empty() {
                        if self.inbound.capacity() > PRED_MSG_LEN {
                            // shed growth left over from a large burst
                            self.inbound = ByteBuffer::with_capacity(PRED_MSG_LEN);
                        }
                    } else {
                        let need = match C::peek_len(&self.inbound) {
                            Some(total) => total.saturating_sub(self.inbound.readable_len()),
                            None => PRED_MSG_LEN,
                        };
                        self.inbound.ensure(need);
                    }
                    return;
                }
            }
        }
    }

    fn flush_outbound(&mut self) -> Control {
        loop {
            let mut batch: Vec<ByteBuffer> = {
                let mut queue = self
                    .shared
                    .outbound
                    .lock()
                    .expect("outbound queue poisoned");
                let take = queue.len().min(MAX_WRITE_VECS);
                queue.drain(..take).collect()
            };

            if batch.is_empty() {
                let Connection { handle, stream, .. } = self;
                if let Err(e) = handle.set_write_enabled(stream, false) {
                    warn!(peer = %self.shared.peer, error = %e, "Clearing WRITE interest failed");
                }
                return Control::Keep;
            }

            let written = {
                let segs: Vec<IoSlice<'_>> =
                    batch.iter().map(|b| IoSlice::new(b.readable())).collect();
                self.stream.write_vectored(&segs)
            };

            match written {
                Ok(0) => {
                    return self.close_now(Some(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    )));
                }
                Ok(mut n) => {
                    let mut leftovers: Vec<ByteBuffer> = Vec::new();
                    for mut buf in batch {
                        if leftovers.is_empty() && n >= buf.readable_len() {
                            n -= buf.readable_len();
                        } else {
                            let part = n.min(buf.readable_len());
                            if part > 0 {
                                buf.mark_read(part);
                                n -= part;
                            }
                            leftovers.push(buf);
                        }
                    }
                    if !leftovers.is_empty() {
                        self.requeue_front(leftovers);
                    }
                    // partial progress: loop once more; a full socket
                    // answers the next writev with WouldBlock
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.requeue_front(batch);
                    let Connection { handle, stream, .. } = self;
                    if let Err(e) = handle.set_write_enabled(stream, true) {
                        warn!(peer = %self.shared.peer, error = %e, "Arming WRITE interest failed");
                    }
                    return Control::Keep;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.requeue_front(batch);
                }
                Err(e) => {
                    debug!(peer = %self.shared.peer, error = %e, "Write failed");
                    return self.close_now(Some(e));
                }
            }
        }
    }

    fn requeue_front(&self, batch: Vec<ByteBuffer>) {
        let mut queue = self
            .shared
            .outbound
            .lock()
            .expect("outbound queue poisoned");
        for buf in batch.into_iter().rev() {
            queue.push_front(buf);
        }
    }

    fn close_now(&mut self, err: Option<io::Error>) -> Control {
        if self.closed {
            return Control::Remove;
        }
        self.closed = true;
        self.shared.closed.store(true, Ordering::Release);

        {
            let Connection { handle, stream, .. } = self;
            if let Err(e) = handle.detach(stream) {
                debug!(peer = %self.shared.peer, error = %e, "Deregister on close failed");
            }
        }

        debug!(peer = %self.shared.peer, clean = err.is_none(), "Connection closed");
        (self.callbacks.on_close)(&self.conn_handle(), err);
        Control::Remove
    }
}

impl<C: FramingCodec + 'static> EventSink for Connection<C> {
    fn register(&mut self, _reactor: &ReactorHandle, id: HandleId) -> io::Result<()> {
        // establish() attaches before committing the slot
        debug_assert_eq!(id, self.handle.id());
        Ok(())
    }

    fn on_readable(&mut self) -> Control {
        loop {
            match self.read_step() {
                ReadStep::Got { n, cap } => {
                    self.extract_frames();
                    if self.closed {
                        return Control::Remove;
                    }
                    if n < cap {
                        // short read: the socket is drained
                        return Control::Keep;
                    }
                }
                ReadStep::WouldBlock => return Control::Keep,
                ReadStep::Retry => continue,
                ReadStep::Eof => return self.close_now(None),
                ReadStep::Fatal(e) => return self.close_now(Some(e)),
            }
        }
    }

    fn on_writable(&mut self) -> Control {
        if self.closed {
            return Control::Remove;
        }
        self.flush_outbound()
    }

    fn on_shutdown(&mut self) {
        // external detach or reactor stop: close without notifying
        self.closed = true;
        self.shared.closed.store(true, Ordering::Release);
        let Connection { handle, stream, .. } = self;
        if let Err(e) = handle.detach(stream) {
            debug!(peer = %self.shared.peer, error = %e, "Deregister on shutdown failed");
        }
    }
}

impl<C: FramingCodec> Drop for Connection<C> {
    fn drop(&mut self) {
        debug_assert!(
            !self.handle.is_attached(),
            "connection dropped while still attached"
        );
    }
}
