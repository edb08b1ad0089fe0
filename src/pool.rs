//! Connection pool.
//!
//! Bounds the number of live remote sessions and reuses idle ones. The pool lock
//! only guards the idle list and the outstanding count; it is never held while a
//! session talks to the network.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::remote::{Connector, RemoteSession};

/// Sessions kept idle at most, and the outstanding ceiling above which freed
/// sessions are discarded.
pub const MAX_IDLE_CONNECTIONS: usize = 5;

/// An idle session older than this may be in a bad state on the server side.
pub const MAX_IDLE_TIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_idle_connections: usize,
    pub max_idle_time: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        PoolLimits {
            max_idle_connections: MAX_IDLE_CONNECTIONS,
            max_idle_time: MAX_IDLE_TIME,
        }
    }
}

struct IdleSession<S> {
    session: S,
    last_used: Instant,
}

struct PoolState<S> {
    idle: VecDeque<IdleSession<S>>,
    /// Live sessions, idle or checked out.
    outstanding: usize,
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    limits: PoolLimits,
    state: Mutex<PoolState<C::Session>>,
}

/// A checked-out session. Returned to the pool on drop.
pub struct PooledSession<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    session: Option<C::Session>,
    last_used: Instant,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self::with_limits(connector, PoolLimits::default())
    }

    pub fn with_limits(connector: C, limits: PoolLimits) -> Self {
        ConnectionPool {
            connector,
            limits,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                outstanding: 0,
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Check out a session, reusing the most recently freed usable one or
    /// establishing a new one. Connection failures propagate; there is no retry.
    pub fn get_connection(&self) -> Result<PooledSession<'_, C>> {
        let mut discarded = Vec::new();
        let reused = {
            let mut state = self.state.lock();
            let mut found = None;
            while let Some(idle) = state.idle.pop_front() {
                if !idle.session.is_connected() {
                    debug!("discarding disconnected session");
                } else if idle.last_used.elapsed() > self.limits.max_idle_time {
                    debug!("discarding session idle for {:?}", idle.last_used.elapsed());
                } else {
                    found = Some(idle.session);
                    break;
                }
                state.outstanding = state.outstanding.saturating_sub(1);
                discarded.push(idle.session);
            }
            found
        };
        // Dropping a session may close sockets; keep that outside the lock.
        drop(discarded);

        let session = match reused {
            Some(session) => {
                trace!("reusing pooled session");
                session
            }
            None => {
                debug!("opening new session to {}", self.connector.describe());
                let session = self.connector.connect()?;
                self.state.lock().outstanding += 1;
                session
            }
        };

        Ok(PooledSession {
            pool: self,
            session: Some(session),
            last_used: Instant::now(),
        })
    }

    /// Give a session back. Equivalent to dropping it.
    pub fn free_connection(&self, session: PooledSession<'_, C>) {
        drop(session);
    }

    fn release(&self, session: C::Session, last_used: Instant) {
        let discarded = {
            let mut state = self.state.lock();
            if session.is_connected() && state.outstanding <= self.limits.max_idle_connections {
                state.idle.push_front(IdleSession {
                    session,
                    last_used,
                });
                None
            } else {
                state.outstanding = state.outstanding.saturating_sub(1);
                Some(session)
            }
        };
        if let Some(session) = discarded {
            trace!("discarding session on release");
            drop(session);
        }
    }

    /// Run one logical remote operation on a pooled session.
    pub fn with_session<T>(&self, op: impl FnOnce(&mut C::Session) -> Result<T>) -> Result<T> {
        let mut session = self.get_connection()?;
        let result = op(&mut *session);
        if let Err(e) = &result {
            if e.is_connection_error() {
                warn!("remote session failed, discarding it: {}", e);
                session.discard();
            }
        }
        result
    }

    /// Drop a session that may be out of step with the server instead of
    /// returning it to the idle list.
    fn discard(&self, session: C::Session) {
        {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        drop(session);
    }

    /// Live sessions, idle or checked out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }
}

impl<C: Connector> PooledSession<'_, C> {
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Close this session instead of pooling it.
    pub fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.discard(session);
        }
    }
}

impl<C: Connector> Deref for PooledSession<'_, C> {
    type Target = C::Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("session present until drop")
    }
}

impl<C: Connector> DerefMut for PooledSession<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session present until drop")
    }
}

impl<C: Connector> Drop for PooledSession<'_, C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, self.last_used);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRemote;

    #[test]
    fn test_reuses_idle_session() {
        let remote = MemoryRemote::new();
        let pool = ConnectionPool::new(remote.connector());

        let s = pool.get_connection().unwrap();
        pool.free_connection(s);
        let s = pool.get_connection().unwrap();
        drop(s);

        assert_eq!(remote.connect_count(), 1);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_pool_bound_after_concurrent_checkout() {
        let remote = MemoryRemote::new();
        let pool = ConnectionPool::new(remote.connector());

        let sessions: Vec<_> = (0..10).map(|_| pool.get_connection().unwrap()).collect();
        assert_eq!(pool.outstanding(), 10);
        for s in sessions {
            pool.free_connection(s);
            assert!(pool.idle_count() <= MAX_IDLE_CONNECTIONS);
        }
        assert_eq!(pool.idle_count(), MAX_IDLE_CONNECTIONS);
        assert_eq!(pool.outstanding(), MAX_IDLE_CONNECTIONS);
    }

    #[test]
    fn test_disconnected_sessions_are_discarded() {
        let remote = MemoryRemote::new();
        let pool = ConnectionPool::new(remote.connector());

        let a = pool.get_connection().unwrap();
        let b = pool.get_connection().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.outstanding(), 2);

        remote.disconnect_all();
        let c = pool.get_connection().unwrap();
        // Both idle sessions were dead; one fresh session replaces them.
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(remote.connect_count(), 3);
        assert!(c.is_connected());
        drop(c);

        remote.disconnect_all();
        // A disconnected session is not returned to the idle list.
        let d = pool.get_connection().unwrap();
        remote.disconnect_all();
        drop(d);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_idle_sessions_age_out() {
        let remote = MemoryRemote::new();
        let limits = PoolLimits {
            max_idle_connections: MAX_IDLE_CONNECTIONS,
            max_idle_time: Duration::from_millis(10),
        };
        let pool = ConnectionPool::with_limits(remote.connector(), limits);

        drop(pool.get_connection().unwrap());
        std::thread::sleep(Duration::from_millis(30));
        drop(pool.get_connection().unwrap());

        assert_eq!(remote.connect_count(), 2);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_connect_failure_propagates() {
        let remote = MemoryRemote::new();
        remote.fail_connects(true);
        let pool = ConnectionPool::new(remote.connector());

        assert!(pool.get_connection().is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_failed_session_is_not_pooled() {
        let remote = MemoryRemote::new();
        remote.add_file("/f", b"data");
        let pool = ConnectionPool::new(remote.connector());

        remote.fail_stats(true);
        let err = pool.with_session(|s| s.stat("/f")).unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.outstanding(), 0);

        remote.fail_stats(false);
        pool.with_session(|s| s.stat("/f")).unwrap();
        assert_eq!(remote.connect_count(), 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_ordinary_errors_keep_session() {
        let remote = MemoryRemote::new();
        let pool = ConnectionPool::new(remote.connector());

        assert!(pool.with_session(|s| s.stat("/missing")).unwrap_err().is_not_found());
        pool.with_session(|s| s.noop()).unwrap();
        assert_eq!(remote.connect_count(), 1);
    }

    #[test]
    fn test_concurrent_threads_share_pool() {
        let remote = MemoryRemote::new();
        remote.add_file("/f", b"data");
        let pool = ConnectionPool::new(remote.connector());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        pool.with_session(|s| s.stat("/f")).unwrap();
                    }
                });
            }
        });

        assert!(pool.idle_count() <= MAX_IDLE_CONNECTIONS);
        assert!(pool.outstanding() <= 8);
    }
}
