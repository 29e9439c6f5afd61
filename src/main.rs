//! netpump demo server: frame echo with session tracking.
//!
//! Every connection gets a session keyed by its endpoint; each frame
//! is echoed back and refreshes the session, and the timing wheel
//! kicks sessions that go quiet.

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netpump::config::Config;
use netpump::session::derive_cid;
use netpump::{
    ConnHandle, FieldLenCodec, LoopPool, Session, SessionRegistry, TcpServer, TcpTuning,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        addr = %config.listen,
        loops = config.loops,
        expire_ms = config.expire_ms,
        "Starting netpump server"
    );

    let pool = Arc::new(LoopPool::new(config.loops)?);
    pool.start();

    let registry: Arc<SessionRegistry<ConnHandle>> = SessionRegistry::new(
        pool.pick().clone(),
        config.expire_ms,
        config.tick_ms,
    );
    registry.enable_idle_kick();

    let mut server = TcpServer::<FieldLenCodec>::new(config.listen, Arc::clone(&pool));
    server.set_backlog(config.backlog);
    server.set_tuning(TcpTuning {
        keepalive: config.keepalive,
        send_buffer: config.send_buffer,
        recv_buffer: config.recv_buffer,
        ..TcpTuning::default()
    });

    {
        let registry = Arc::clone(&registry);
        server.on_connect(move |conn| {
            let session = Arc::new(Session::new(endpoint_uin(conn), 0, conn.clone()));
            registry.add(session);
        });
    }
    {
        let registry = Arc::clone(&registry);
        server.on_message(move |conn, frame| {
            registry.touch_cid(derive_cid(conn.peer_addr()));
            conn.send_frame::<FieldLenCodec>(frame);
        });
    }
    {
        let registry = Arc::clone(&registry);
        server.on_close(move |conn, _err| {
            let _ = registry.remove_by_cid(derive_cid(conn.peer_addr()));
        });
    }

    server.start()?;
    pool.join();
    Ok(())
}

/// Demo user id: folded endpoint identity. A real gateway takes the
/// uin from an auth frame instead.
fn endpoint_uin(conn: &ConnHandle) -> u32 {
    let cid = derive_cid(conn.peer_addr());
    (cid >> 32) as u32 ^ cid as u32
}
