//! Idle-connection pool backing one host client.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::netio::Conn;

pub(crate) struct IdleConn {
    pub(crate) conn: Conn,
    pub(crate) created_at: Instant,
    idle_at: Instant,
}

/// Bounded pool of idle connections plus the per-host concurrency limiter.
pub(crate) struct ConnPool {
    idle: Mutex<VecDeque<IdleConn>>,
    limiter: Arc<Semaphore>,
    capacity: usize,
    max_idle_duration: Duration,
    max_conn_duration: Option<Duration>,
}

impl ConnPool {
    pub(crate) fn new(
        max_conns: usize,
        max_idle_duration: Duration,
        max_conn_duration: Option<Duration>,
    ) -> ConnPool {
        ConnPool {
            idle: Mutex::new(VecDeque::new()),
            limiter: Arc::new(Semaphore::new(max_conns)),
            capacity: max_conns,
            max_idle_duration,
            max_conn_duration,
        }
    }

    /// Claims a request slot, waiting at most `wait` when the host is at its
    /// connection limit. No wait configured means failing immediately.
    pub(crate) async fn acquire_permit(
        &self,
        wait: Option<Duration>,
    ) -> crate::Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.limiter.clone().try_acquire_owned() {
            return Ok(permit);
        }
        let wait = match wait {
            Some(wait) if !wait.is_zero() => wait,
            _ => return Err(crate::Error::new_no_free_conns()),
        };
        match tokio::time::timeout(wait, self.limiter.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is never closed while the pool is alive.
            Ok(Err(_)) | Err(_) => Err(crate::Error::new_no_free_conns()),
        }
    }

    fn is_expired(&self, entry: &IdleConn, now: Instant) -> bool {
        if now.duration_since(entry.idle_at) > self.max_idle_duration {
            return true;
        }
        match self.max_conn_duration {
            Some(max) => now.duration_since(entry.created_at) > max,
            None => false,
        }
    }

    /// Pops the freshest usable idle connection, discarding expired ones.
    pub(crate) fn checkout(&self) -> Option<IdleConn> {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(entry) = idle.pop_back() {
            if self.is_expired(&entry, now) {
                trace!("discarding expired pooled connection");
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// Returns a healthy connection to the idle set.
    pub(crate) fn checkin(&self, conn: Conn, created_at: Instant) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push_back(IdleConn {
            conn,
            created_at,
            idle_at: Instant::now(),
        });
    }

    /// Drops every expired idle connection.
    pub(crate) fn evict_expired(&self) {
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.retain(|entry| !self.is_expired(entry, now));
    }

    /// True when nothing is pooled and nothing is in flight.
    pub(crate) fn is_unused(&self) -> bool {
        let idle_empty = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        idle_empty && self.limiter.available_permits() == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_conn() -> Conn {
        let (a, _b) = tokio::io::duplex(64);
        Conn::new(a)
    }

    #[tokio::test]
    async fn permit_exhaustion_without_wait_is_no_free_conns() {
        let pool = ConnPool::new(1, Duration::from_secs(10), None);
        let _held = pool.acquire_permit(None).await.unwrap();
        let err = pool.acquire_permit(None).await.unwrap_err();
        assert!(err.is_no_free_conns());
    }

    #[tokio::test]
    async fn permit_wait_times_out() {
        let pool = ConnPool::new(1, Duration::from_secs(10), None);
        let _held = pool.acquire_permit(None).await.unwrap();
        let err = pool
            .acquire_permit(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_no_free_conns());
    }

    #[tokio::test]
    async fn permit_wait_succeeds_when_released() {
        let pool = Arc::new(ConnPool::new(1, Duration::from_secs(10), None));
        let held = pool.acquire_permit(None).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_permit(Some(Duration::from_secs(1))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn expired_idle_conns_are_discarded() {
        let pool = ConnPool::new(4, Duration::from_millis(10), None);
        pool.checkin(dummy_conn(), Instant::now());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.checkout().is_none());
        assert!(pool.is_unused());
    }

    #[tokio::test]
    async fn fresh_idle_conns_are_reused() {
        let pool = ConnPool::new(4, Duration::from_secs(10), None);
        pool.checkin(dummy_conn(), Instant::now());
        assert!(!pool.is_unused());
        assert!(pool.checkout().is_some());
        assert!(pool.is_unused());
    }

    #[tokio::test]
    async fn max_conn_duration_evicts_old_connections() {
        let pool = ConnPool::new(4, Duration::from_secs(10), Some(Duration::from_millis(10)));
        let created = Instant::now() - Duration::from_millis(50);
        let entry = IdleConn {
            conn: dummy_conn(),
            created_at: created,
            idle_at: Instant::now(),
        };
        pool.idle.lock().unwrap().push_back(entry);
        assert!(pool.checkout().is_none());
    }
}
