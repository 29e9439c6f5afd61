//! Sessions: user id bound to a live connection endpoint, with idle
//! eviction.
//!
//! A session joins a `uin` (user id) to the source it arrived on. The
//! registry indexes sessions both by connection id and by uin — one
//! uin may hold several concurrent sessions (multi-login) — and arms a
//! wheel timeout per session; any activity re-arms it, and a session
//! that stays quiet for `expire_ms` is evicted by the wheel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::buffer::ByteBuffer;
use crate::runtime::{ConnHandle, ReactorHandle};
use crate::timer::{monotonic_ms, TimeoutHandle, TimerDriver, TimingWheel};

/// Default wheel tick for idle detection.
pub const DEFAULT_TICK_MS: u64 = 100;

/// Where a session's traffic goes. TCP sessions wrap a [`ConnHandle`];
/// a datagram endpoint implements the same surface.
pub trait SessionSource: Send + Sync + 'static {
    fn peer_addr(&self) -> SocketAddr;
    fn send(&self, buf: ByteBuffer);
    fn send_multi(&self, bufs: Vec<ByteBuffer>);
}

impl SessionSource for ConnHandle {
    fn peer_addr(&self) -> SocketAddr {
        ConnHandle::peer_addr(self)
    }

    fn send(&self, buf: ByteBuffer) {
        ConnHandle::send(self, buf);
    }

    fn send_multi(&self, bufs: Vec<ByteBuffer>) {
        ConnHandle::send_multi(self, bufs);
    }
}

/// 64-bit connection id derived from the peer address: ip in the high
/// 32 bits, port in the low 16. IPv6 addresses fold their octets into
/// the ip word, keeping the id deterministic per endpoint.
pub fn derive_cid(addr: SocketAddr) -> u64 {
    let ip: u32 = match addr {
        SocketAddr::V4(v4) => u32::from(*v4.ip()),
        SocketAddr::V6(v6) => v6
            .ip()
            .octets()
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .fold(0, |acc, word| acc ^ word),
    };
    ((ip as u64) << 32) | addr.port() as u64
}

/// One user bound to one endpoint.
pub struct Session<S> {
    cid: u64,
    uin: u32,
    session_key: u32,
    ts_create: u64,
    ts_update: AtomicU64,
    seq: AtomicU32,
    /// Bumped on every touch; the armed eviction task only fires if
    /// its snapshot still matches.
    epoch: AtomicU64,
    timeout: Mutex<Option<TimeoutHandle>>,
    source: S,
}

impl<S: SessionSource> Session<S> {
    pub fn new(uin: u32, session_key: u32, source: S) -> Self {
        let now = monotonic_ms();
        Self {
            cid: derive_cid(source.peer_addr()),
            uin,
            session_key,
            ts_create: now,
            ts_update: AtomicU64::new(now),
            seq: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            timeout: Mutex::new(None),
            source,
        }
    }

    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub fn uin(&self) -> u32 {
        self.uin
    }

    pub fn session_key(&self) -> u32 {
        self.session_key
    }

    pub fn create_time(&self) -> u64 {
        self.ts_create
    }

    pub fn last_update(&self) -> u64 {
        self.ts_update.load(Ordering::Acquire)
    }

    /// Next request sequence number.
    pub fn inc_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn stamp(&self, now_ms: u64) {
        self.ts_update.store(now_ms, Ordering::Release);
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Swap in a new eviction timeout, cancelling the old one.
    fn replace_timeout(&self, next: Option<TimeoutHandle>) {
        let mut slot = self.timeout.lock().expect("session timeout poisoned");
        if let Some(old) = slot.take() {
            old.cancel();
        }
        *slot = next;
    }
}

struct SessionMaps<S> {
    by_cid: HashMap<u64, Arc<Session<S>>>,
    by_uin: HashMap<u32, Vec<Arc<Session<S>>>>,
}

/// Dual-indexed session store with wheel-driven idle eviction.
///
/// Both indexes live under one lock, so a session is in both or in
/// neither. Fan-out sends snapshot the matching sessions under the
/// lock and deliver after releasing it.
pub struct SessionRegistry<S: SessionSource> {
    expire_ms: u64,
    wheel: Arc<TimingWheel>,
    driver: Option<TimerDriver>,
    inner: Mutex<SessionMaps<S>>,
}

impl<S: SessionSource> SessionRegistry<S> {
    /// Registry with its own wheel, ticked on `remote` once
    /// [`enable_idle_kick`](Self::enable_idle_kick) is called.
    pub fn new(remote: ReactorHandle, expire_ms: u64, tick_ms: u64) -> Arc<Self> {
        assert!(tick_ms > 0 && expire_ms > 0, "zero session timing");
        let slots = (expire_ms / tick_ms).max(1) as usize;
        let wheel = Arc::new(TimingWheel::new(tick_ms, slots));
        let driver = TimerDriver::new(remote, Arc::clone(&wheel));
        Arc::new(Self {
            expire_ms,
            wheel,
            driver: Some(driver),
            inner: Mutex::new(SessionMaps {
                by_cid: HashMap::new(),
                by_uin: HashMap::new(),
            }),
        })
    }

    /// Registry on an externally driven wheel (tests tick it by hand).
    pub fn with_wheel(wheel: Arc<TimingWheel>, expire_ms: u64) -> Arc<Self> {
        assert!(expire_ms > 0, "zero session expiry");
        Arc::new(Self {
            expire_ms,
            wheel,
            driver: None,
            inner: Mutex::new(SessionMaps {
                by_cid: HashMap::new(),
                by_uin: HashMap::new(),
            }),
        })
    }

    pub fn expire_ms(&self) -> u64 {
        self.expire_ms
    }

    /// Start evicting idle sessions.
    pub fn enable_idle_kick(&self) {
        if let Some(driver) = &self.driver {
            driver.attach();
        }
    }

    /// Stop the eviction ticks; sessions stay put.
    pub fn disable_idle_kick(&self) {
        if let Some(driver) = &self.driver {
            driver.detach();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session maps poisoned").by_cid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert into both indexes and arm the idle timeout.
    ///
    /// A session already registered under the same cid is displaced
    /// (its timeout cancelled), matching a reconnect from the same
    /// endpoint.
    pub fn add(self: &Arc<Self>, session: Arc<Session<S>>) {
        let displaced = {
            let mut maps = self.inner.lock().expect("session maps poisoned");
            let displaced = maps.by_cid.insert(session.cid(), Arc::clone(&session));
            if let Some(old) = &displaced {
                if let Some(list) = maps.by_uin.get_mut(&old.uin()) {
                    list.retain(|s| !Arc::ptr_eq(s, old));
                    if list.is_empty() {
                        maps.by_uin.remove(&old.uin());
                    }
                }
            }
            maps.by_uin
                .entry(session.uin())
                .or_default()
                .push(Arc::clone(&session));
            displaced
        };
        if let Some(old) = displaced {
            warn!(cid = old.cid(), uin = old.uin(), "Session displaced by same endpoint");
            old.replace_timeout(None);
        }

        debug!(cid = session.cid(), uin = session.uin(), "Session added");
        self.touch(&session);
    }

    /// Drop the session from both indexes and cancel its timeout.
    /// Only removes the exact session passed in — another session of
    /// the same uin (or a newer one under the same cid) is untouched.
    pub fn remove(&self, session: &Arc<Session<S>>) -> bool {
        let removed = {
            let mut maps = self.inner.lock().expect("session maps poisoned");
            let matches = maps
                .by_cid
                .get(&session.cid())
                .map(|cur| Arc::ptr_eq(cur, session))
                .unwrap_or(false);
            if matches {
                maps.by_cid.remove(&session.cid());
                if let Some(list) = maps.by_uin.get_mut(&session.uin()) {
                    list.retain(|s| !Arc::ptr_eq(s, session));
                    if list.is_empty() {
                        maps.by_uin.remove(&session.uin());
                    }
                }
            }
            matches
        };

        if removed {
            session.replace_timeout(None);
            debug!(cid = session.cid(), uin = session.uin(), "Session removed");
        }
        removed
    }

    pub fn remove_by_cid(&self, cid: u64) -> Option<Arc<Session<S>>> {
        let session = self.find_by_cid(cid)?;
        self.remove(&session).then_some(session)
    }

    pub fn find_by_cid(&self, cid: u64) -> Option<Arc<Session<S>>> {
        self.inner
            .lock()
            .expect("session maps poisoned")
            .by_cid
            .get(&cid)
            .cloned()
    }

    /// Snapshot of every session bound to `uin`.
    pub fn sessions_for_uin(&self, uin: u32) -> Vec<Arc<Session<S>>> {
        self.inner
            .lock()
            .expect("session maps poisoned")
            .by_uin
            .get(&uin)
            .cloned()
            .unwrap_or_default()
    }

    /// Refresh activity: stamp `last_update`, advance the epoch and
    /// re-arm the eviction timeout `expire_ms` out.
    pub fn touch(self: &Arc<Self>, session: &Arc<Session<S>>) {
        session.stamp(monotonic_ms());
        let epoch = session.bump_epoch();

        let registry = Arc::downgrade(self);
        let target = Arc::downgrade(session);
        let timeout = self.wheel.schedule(self.expire_ms, move || {
            let (Some(registry), Some(session)) = (registry.upgrade(), target.upgrade()) else {
                return;
            };
            // a touch between arming and firing re-armed with a newer
            // epoch; this firing is then stale and must not evict
            if session.epoch() == epoch {
                debug!(cid = session.cid(), uin = session.uin(), "Idle session expired");
                registry.remove(&session);
            }
        });
        session.replace_timeout(Some(timeout));
    }

    pub fn touch_cid(self: &Arc<Self>, cid: u64) -> bool {
        match self.find_by_cid(cid) {
            Some(session) => {
                self.touch(&session);
                true
            }
            None => false,
        }
    }

    /// Deliver `buf` to every session of `uin`. Returns how many
    /// sessions were hit.
    pub fn send_to_uin(&self, uin: u32, buf: &ByteBuffer) -> usize {
        let sessions = self.sessions_for_uin(uin);
        for session in &sessions {
            session.source().send(buf.clone());
        }
        sessions.len()
    }

    /// Deliver an ordered buffer group to every session of `uin`.
    pub fn send_multi_to_uin(&self, uin: u32, bufs: &[ByteBuffer]) -> usize {
        let sessions = self.sessions_for_uin(uin);
        for session in &sessions {
            session.source().send_multi(bufs.to_vec());
        }
        sessions.len()
    }
}
