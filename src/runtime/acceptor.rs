//! Listening socket that feeds accepted connections to the loop pool.

use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::codec::FramingCodec;
use crate::sock::{self, TcpTuning};

use super::connection::{ConnCallbacks, Connection};
use super::event_loop::ReactorHandle;
use super::handle::{Control, EventSink, Handle, HandleId};
use super::pool::LoopPool;

/// Accepts sockets and delegates each to a reactor picked from the
/// pool. The new connection is constructed on the picked reactor's
/// thread, where `on_connect` runs before the socket is attached.
pub struct Acceptor<C: FramingCodec + 'static> {
    listener: TcpListener,
    local_addr: SocketAddr,
    handle: Option<Handle>,
    pool: Arc<LoopPool>,
    tuning: TcpTuning,
    callbacks: Arc<ConnCallbacks<C>>,
}

impl<C: FramingCodec + 'static> Acceptor<C> {
    /// Bind the listening socket (SO_REUSEADDR set, non-blocking).
    pub fn bind(
        addr: SocketAddr,
        backlog: i32,
        pool: Arc<LoopPool>,
        tuning: TcpTuning,
        callbacks: Arc<ConnCallbacks<C>>,
    ) -> io::Result<Self> {
        let std_listener = sock::bind_listener(addr, backlog, false)?;
        let local_addr = std_listener.local_addr()?;
        Ok(Self {
            listener: TcpListener::from_std(std_listener),
            local_addr,
            handle: None,
            pool,
            tuning,
            callbacks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl<C: FramingCodec + 'static> EventSink for Acceptor<C> {
    fn register(&mut self, reactor: &ReactorHandle, id: HandleId) -> io::Result<()> {
        let mut handle = Handle::new(reactor.clone(), id);
        handle.attach(&mut self.listener)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn on_readable(&mut self) -> Control {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.tuning.apply(&stream) {
                        warn!(peer = %peer, error = %e, "Socket tuning failed");
                    }
                    let remote = self.pool.pick().clone();
                    let callbacks = Arc::clone(&self.callbacks);
                    remote.post(move |reactor| {
                        if let Err(e) = Connection::<C>::establish(reactor, stream, peer, callbacks)
                        {
                            warn!(peer = %peer, error = %e, "Attaching accepted socket failed");
                        }
                    });
                    debug!(peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE and friends: keep the listener, the next
                    // readiness retries
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
        Control::Keep
    }

    fn on_writable(&mut self) -> Control {
        Control::Keep
    }

    fn on_shutdown(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = handle.detach(&mut self.listener) {
                warn!(error = %e, "Deregistering listener failed");
            }
        }
    }
}
