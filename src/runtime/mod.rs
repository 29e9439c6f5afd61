//! Event-driven runtime: reactors, connections, acceptors.
//!
//! The shape is a pool of single-threaded reactors. Each reactor
//! blocks in `mio::Poll`, dispatches readiness to the sinks it owns
//! (connections, acceptors), fires deadline tasks, and drains work
//! posted from other threads through its wake channel. Connections
//! never migrate between reactors; everything that touches a socket
//! runs on the thread that registered it.

mod acceptor;
mod connection;
mod event_loop;
mod handle;
mod pool;

pub use acceptor::Acceptor;
pub use connection::{ConnCallbacks, ConnHandle, Connection, PRED_MSG_LEN};
pub use event_loop::{Reactor, ReactorHandle, Task};
pub use handle::{Control, EventSink, Handle, HandleId};
pub use pool::LoopPool;
