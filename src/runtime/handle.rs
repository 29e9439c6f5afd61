//! Binding of one I/O source to one reactor.
//!
//! A [`Handle`] pairs a registered token with the READ/WRITE event
//! mask and applies mask changes through the reactor's registry. The
//! readiness callbacks live on the [`EventSink`] trait implemented by
//! whatever owns the handle (a connection, an acceptor); the reactor
//! dispatches to the sink stored under the handle's token.

use mio::event::Source;
use mio::{Interest, Token};
use std::io;

use super::event_loop::ReactorHandle;

/// What the reactor should do with a sink after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep the sink registered.
    Keep,
    /// Drop the sink from the reactor. The sink has already
    /// deregistered its descriptor and delivered its close
    /// notification.
    Remove,
}

/// Readiness callbacks dispatched on the owning reactor's thread.
///
/// `register` is called exactly once, when the reactor installs the
/// sink; it must register the sink's descriptor under `token`.
/// `on_shutdown` runs when the reactor discards the sink without the
/// sink having asked for removal (external detach, reactor stop) and
/// must release the descriptor registration.
pub trait EventSink: Send {
    fn register(&mut self, reactor: &ReactorHandle, id: HandleId) -> io::Result<()>;
    fn on_readable(&mut self) -> Control;
    fn on_writable(&mut self) -> Control;
    fn on_shutdown(&mut self);
}

/// Stable address of an attached sink: slab token plus a per-attach
/// binding stamp.
///
/// Tokens are recycled when sinks detach; the stamp makes a posted
/// task that captured a stale id harmless instead of aiming it at
/// whatever reused the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId {
    pub(crate) token: Token,
    pub(crate) binding: u64,
}

/// Descriptor-to-reactor binding with event-mask control.
///
/// States: detached -> attached -> detached. Mask changes on an
/// attached handle reregister immediately; WRITE notifications stop
/// only once the owner clears the WRITE bit.
pub struct Handle {
    remote: ReactorHandle,
    id: HandleId,
    read: bool,
    write: bool,
    registered: bool,
}

impl Handle {
    pub(crate) fn new(remote: ReactorHandle, id: HandleId) -> Self {
        Self {
            remote,
            id,
            read: true,
            write: false,
            registered: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn is_attached(&self) -> bool {
        self.registered
    }

    pub fn write_enabled(&self) -> bool {
        self.write
    }

    /// Register the source with the reactor under this handle's token.
    pub fn attach<S: Source>(&mut self, source: &mut S) -> io::Result<()> {
        assert!(!self.registered, "handle attached twice");
        let interest = self
            .interest()
            .expect("attaching a handle with an empty event mask");
        self.remote
            .registry()
            .register(source, self.id.token, interest)?;
        self.registered = true;
        Ok(())
    }

    /// Deregister the source. Safe to call on a detached handle.
    pub fn detach<S: Source>(&mut self, source: &mut S) -> io::Result<()> {
        if self.registered {
            self.remote.registry().deregister(source)?;
            self.registered = false;
        }
        Ok(())
    }

    /// Set or clear the WRITE bit of the event mask.
    pub fn set_write_enabled<S: Source>(&mut self, source: &mut S, on: bool) -> io::Result<()> {
        if self.write == on {
            return Ok(());
        }
        self.write = on;
        self.reapply(source)
    }

    /// Set or clear the READ bit of the event mask.
    pub fn set_read_enabled<S: Source>(&mut self, source: &mut S, on: bool) -> io::Result<()> {
        if self.read == on {
            return Ok(());
        }
        self.read = on;
        self.reapply(source)
    }

    fn interest(&self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn reapply<S: Source>(&mut self, source: &mut S) -> io::Result<()> {
        match (self.interest(), self.registered) {
            (Some(interest), true) => {
                self.remote
                    .registry()
                    .reregister(source, self.id.token, interest)
            }
            (Some(interest), false) => {
                self.remote
                    .registry()
                    .register(source, self.id.token, interest)?;
                self.registered = true;
                Ok(())
            }
            (None, true) => {
                // empty mask: the descriptor stays bound to the token
                // but receives no notifications
                self.remote.registry().deregister(source)?;
                self.registered = false;
                Ok(())
            }
            (None, false) => Ok(()),
        }
    }
}
