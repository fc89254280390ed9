//! The keyed connection pool.
//!
//! One pool per client. Keys are `(scheme, host, port)`; the pool keeps
//! at most 16 keys in least-recently-used order, each holding a LIFO
//! stack of idle HTTP/1.x connections and at most one shared HTTP/2
//! session. "Locking" an HTTP/2 connection means obtaining a stream
//! slot, never exclusive use.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Instant,
};

use log::trace;

use super::conn::Http1Conn;
use crate::proto::h2::Session;

/// Server identity a connection may be reused for.
pub(crate) type PoolKey = (&'static str, String, u16);

const MAX_KEYS: usize = 16;
const MAX_IDLE_PER_KEY: usize = 8;

#[derive(Default)]
struct Entry {
    idle: Vec<Http1Conn>,
    h2: Option<Session>,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<PoolKey, Entry>,
    // most recently used at the back
    order: VecDeque<PoolKey>,
}

impl PoolInner {
    fn touch(&mut self, key: &PoolKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
        while self.order.len() > MAX_KEYS {
            if let Some(evicted) = self.order.pop_front() {
                trace!("pool evicting {evicted:?}");
                self.entries.remove(&evicted);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct Pool {
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish()
    }
}

impl Pool {
    pub(crate) fn new() -> Pool {
        Pool::default()
    }

    /// Pop the freshest idle connection whose timers have not fired.
    pub(crate) fn checkout_h1(&self, key: &PoolKey) -> Option<Http1Conn> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.touch(key);
        let entry = inner.entries.get_mut(key)?;
        let now = Instant::now();
        while let Some(conn) = entry.idle.pop() {
            if conn.is_expired(now) {
                trace!("pooled connection for {key:?} expired");
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Park an idle connection for reuse.
    pub(crate) fn checkin_h1(&self, key: PoolKey, mut conn: Http1Conn) {
        conn.idle_since = Instant::now();
        if conn.is_expired(conn.idle_since) {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.touch(&key);
        let entry = inner.entries.entry(key).or_default();
        if entry.idle.len() < MAX_IDLE_PER_KEY {
            entry.idle.push(conn);
        }
    }

    /// A shared HTTP/2 session with a free stream slot, if one lives.
    pub(crate) fn h2(&self, key: &PoolKey) -> Option<Session> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.touch(key);
        let entry = inner.entries.get_mut(key)?;
        match &entry.h2 {
            Some(session) if session.is_closed() => {
                entry.h2 = None;
                None
            }
            Some(session) if session.can_open() => Some(session.clone()),
            _ => None,
        }
    }

    /// Install the session future requests will multiplex onto.
    pub(crate) fn set_h2(&self, key: PoolKey, session: Session) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.touch(&key);
        inner.entries.entry(key).or_default().h2 = Some(session);
    }

    /// Drop everything held for `key`.
    pub(crate) fn purge(&self, key: &PoolKey) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(key);
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, key: &PoolKey) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(key).map(|e| e.idle.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BoxIo;
    use std::time::Duration;

    fn dummy_conn(keepalive: Duration) -> Http1Conn {
        let (a, _b) = tokio::io::duplex(16);
        // the far half is dropped; fine for pool bookkeeping tests
        Http1Conn::new(Box::new(a) as BoxIo, None, keepalive)
    }

    fn key(host: &str) -> PoolKey {
        ("http", host.to_owned(), 80)
    }

    #[tokio::test]
    async fn checkin_checkout_roundtrip() {
        let pool = Pool::new();
        pool.checkin_h1(key("a"), dummy_conn(Duration::from_secs(60)));
        assert_eq!(pool.idle_count(&key("a")), 1);
        assert!(pool.checkout_h1(&key("a")).is_some());
        assert!(pool.checkout_h1(&key("a")).is_none());
    }

    #[tokio::test]
    async fn expired_connections_are_not_returned() {
        let pool = Pool::new();
        pool.checkin_h1(key("a"), dummy_conn(Duration::from_secs(60)));
        {
            let mut inner = pool.inner.lock().unwrap();
            inner.entries.get_mut(&key("a")).unwrap().idle[0].idle_since =
                Instant::now() - Duration::from_secs(120);
        }
        assert!(pool.checkout_h1(&key("a")).is_none());
    }

    #[tokio::test]
    async fn request_budget_expires_connections() {
        let pool = Pool::new();
        let mut conn = dummy_conn(Duration::from_secs(60));
        conn.max_requests = Some(2);
        conn.requests_made = 2;
        pool.checkin_h1(key("a"), conn);
        assert_eq!(pool.idle_count(&key("a")), 0);
    }

    #[tokio::test]
    async fn lru_keeps_at_most_sixteen_keys() {
        let pool = Pool::new();
        for i in 0..20 {
            pool.checkin_h1(key(&format!("host-{i}")), dummy_conn(Duration::from_secs(60)));
        }
        let inner = pool.inner.lock().unwrap();
        assert_eq!(inner.entries.len(), 16);
        assert!(!inner.entries.contains_key(&key("host-0")));
        assert!(inner.entries.contains_key(&key("host-19")));
    }
}
