//! TCP server: acceptor plus loop pool plus application callbacks.
//!
//! `TcpServer` is the assembly point: the application registers its
//! connect/message/close handlers, `start` binds the listener and
//! attaches the acceptor to one of the pool's reactors, and every
//! accepted socket becomes a `Connection` on a round-robin-picked
//! loop.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

use crate::codec::FramingCodec;
use crate::runtime::{Acceptor, ConnCallbacks, ConnHandle, HandleId, LoopPool, ReactorHandle};
use crate::sock::TcpTuning;

const DEFAULT_BACKLOG: i32 = 1024;

/// Connection-oriented server over a framing codec.
///
/// Handlers must be installed before [`TcpServer::start`]; they are
/// shared by every connection the acceptor produces.
pub struct TcpServer<C: FramingCodec + 'static> {
    addr: SocketAddr,
    backlog: i32,
    tuning: TcpTuning,
    pool: Arc<LoopPool>,
    on_connect: Option<Box<dyn Fn(&ConnHandle) + Send + Sync>>,
    on_message: Option<Box<dyn Fn(&ConnHandle, C::Frame) + Send + Sync>>,
    on_close: Option<Box<dyn Fn(&ConnHandle, Option<io::Error>) + Send + Sync>>,
    acceptor_loop: Option<ReactorHandle>,
    acceptor_id: Arc<OnceLock<HandleId>>,
}

impl<C: FramingCodec + 'static> TcpServer<C> {
    pub fn new(addr: SocketAddr, pool: Arc<LoopPool>) -> Self {
        Self {
            addr,
            backlog: DEFAULT_BACKLOG,
            tuning: TcpTuning::default(),
            pool,
            on_connect: None,
            on_message: None,
            on_close: None,
            acceptor_loop: None,
            acceptor_id: Arc::new(OnceLock::new()),
        }
    }

    pub fn set_backlog(&mut self, backlog: i32) {
        self.backlog = backlog;
    }

    /// Socket options applied to every accepted connection.
    pub fn set_tuning(&mut self, tuning: TcpTuning) {
        self.tuning = tuning;
    }

    /// Runs on the connection's reactor thread before it is attached.
    pub fn on_connect(&mut self, f: impl Fn(&ConnHandle) + Send + Sync + 'static) {
        self.on_connect = Some(Box::new(f));
    }

    /// Runs per decoded frame, on the connection's reactor thread.
    pub fn on_message(&mut self, f: impl Fn(&ConnHandle, C::Frame) + Send + Sync + 'static) {
        self.on_message = Some(Box::new(f));
    }

    /// Runs at most once per connection: `None` for a clean peer
    /// close, the error for a fatal one.
    pub fn on_close(
        &mut self,
        f: impl Fn(&ConnHandle, Option<io::Error>) + Send + Sync + 'static,
    ) {
        self.on_close = Some(Box::new(f));
    }

    /// Bind the listener and attach the acceptor on a pool loop.
    ///
    /// Returns the bound address (useful with port 0). Handlers not
    /// installed default to no-ops.
    pub fn start(&mut self) -> io::Result<SocketAddr> {
        assert!(self.acceptor_loop.is_none(), "server started twice");

        let callbacks = Arc::new(ConnCallbacks::<C> {
            on_connect: self.on_connect.take().unwrap_or_else(|| Box::new(|_| {})),
            on_message: self.on_message.take().unwrap_or_else(|| Box::new(|_, _| {})),
            on_close: self.on_close.take().unwrap_or_else(|| Box::new(|_, _| {})),
        });

        let acceptor = Acceptor::bind(
            self.addr,
            self.backlog,
            Arc::clone(&self.pool),
            self.tuning.clone(),
            callbacks,
        )?;
        let local_addr = acceptor.local_addr();

        let remote = self.pool.pick().clone();
        let id_cell = Arc::clone(&self.acceptor_id);
        remote.post(move |reactor| match reactor.attach(Box::new(acceptor)) {
            Ok(id) => {
                let _ = id_cell.set(id);
            }
            Err(e) => error!(error = %e, "Attaching acceptor failed"),
        });

        self.acceptor_loop = Some(remote);
        info!(addr = %local_addr, loops = self.pool.len(), "Server listening");
        Ok(local_addr)
    }

    /// Detach the acceptor; established connections keep running.
    pub fn stop(&mut self) {
        if let Some(remote) = self.acceptor_loop.take() {
            let id_cell = Arc::clone(&self.acceptor_id);
            remote.post(move |reactor| {
                if let Some(&id) = id_cell.get() {
                    reactor.detach(id);
                }
            });
            info!(addr = %self.addr, "Server stopped accepting");
        }
    }
}
