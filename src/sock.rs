//! Socket construction and tunables.
//!
//! Listeners are built through `socket2` so SO_REUSEADDR (and
//! optionally SO_REUSEPORT for kernel load balancing) can be applied
//! before bind. Accepted sockets get their per-connection options from
//! a [`TcpTuning`] carried by the acceptor.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Per-connection socket options applied at accept time.
#[derive(Debug, Clone, Default)]
pub struct TcpTuning {
    pub keepalive: bool,
    pub send_buffer: Option<usize>,
    pub recv_buffer: Option<usize>,
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
}

impl TcpTuning {
    /// Apply the options to an open socket.
    pub fn apply(&self, stream: &mio::net::TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keepalive)?;
        if let Some(size) = self.send_buffer {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(t) = self.send_timeout {
            sock.set_write_timeout(Some(t))?;
        }
        if let Some(t) = self.recv_timeout {
            sock.set_read_timeout(Some(t))?;
        }
        Ok(())
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
///
/// `reuse_port` additionally sets SO_REUSEPORT so several processes
/// can share the port and let the kernel balance accepts.
pub fn bind_listener(
    addr: SocketAddr,
    backlog: i32,
    reuse_port: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16, false).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_reuse_addr_allows_rebind_after_drop() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = bind_listener(addr, 16, false).unwrap();
        let bound = first.local_addr().unwrap();
        drop(first);
        // with SO_REUSEADDR the port is immediately rebindable
        let second = bind_listener(bound, 16, false).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), bound.port());
    }
}
