//! netpump: a reactive TCP networking framework.
//!
//! Building blocks for connection-oriented servers:
//! - a pool of single-threaded reactors multiplexing socket readiness
//!   (`mio` underneath), with cross-thread task posting
//! - length-field framed connections with gather I/O and write
//!   backpressure
//! - a hashed timing wheel for cheap short-lived timeouts
//! - a session registry binding user ids to live connections, with
//!   idle eviction driven by the wheel
//!
//! The demo binary wires these into an echo server that tracks a
//! session per connection and kicks idle ones.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod runtime;
pub mod server;
pub mod session;
pub mod sock;
pub mod timer;

pub use buffer::ByteBuffer;
pub use codec::{FieldLenCodec, Frame, FrameInfo, FramingCodec};
pub use runtime::{ConnHandle, LoopPool, Reactor, ReactorHandle};
pub use server::TcpServer;
pub use session::{derive_cid, Session, SessionRegistry, SessionSource};
pub use sock::TcpTuning;
pub use timer::{TimerDriver, TimingWheel};
