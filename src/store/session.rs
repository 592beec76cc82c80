//! Sessions on a secondary store and the bounded pool they are borrowed from.
//!
//! A session is used by one logical operation at a time. Each session counts
//! the operations it completed; the last serial number returned to the pool is
//! the session's commit point, captured by hybrid-log checkpoints.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Result;

#[derive(Debug)]
pub struct Session {
    id: u64,
    serial_num: u64,
    pending_reads: u64,
}

impl Session {
    fn new(id: u64, serial_num: u64) -> Self {
        Self {
            id,
            serial_num,
            pending_reads: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn serial_num(&self) -> u64 {
        self.serial_num
    }

    /// Reads this session had to complete from disk.
    pub fn pending_reads(&self) -> u64 {
        self.pending_reads
    }

    pub(crate) fn complete_op(&mut self) {
        self.serial_num += 1;
    }

    pub(crate) fn record_pending(&mut self) {
        self.pending_reads += 1;
    }
}

#[derive(Debug)]
pub struct SessionPool {
    capacity: usize,
    idle: Mutex<Vec<Session>>,
    next_id: AtomicU64,
    commit_points: Mutex<BTreeMap<u64, u64>>,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            next_id: AtomicU64::new(1),
            commit_points: Mutex::new(BTreeMap::new()),
        }
    }

    /// Borrows an idle session, creating one when the pool is empty.
    pub fn acquire(&self) -> Result<PooledSession<'_>> {
        let session = match self.idle.lock()?.pop() {
            Some(session) => session,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let serial = self.commit_points.lock()?.get(&id).copied().unwrap_or(0);
                Session::new(id, serial)
            }
        };
        Ok(PooledSession {
            pool: self,
            session: Some(session),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Commit point of every session that has returned to the pool.
    pub fn commit_points(&self) -> Result<Vec<(u64, u64)>> {
        Ok(self
            .commit_points
            .lock()?
            .iter()
            .map(|(id, serial)| (*id, *serial))
            .collect())
    }

    /// Restores recovered commit points. Session ids restart at 1 and each
    /// new session resumes the serial number recorded for its id.
    pub fn restore_commit_points(&self, points: &[(u64, u64)]) -> Result<()> {
        let mut commit_points = self.commit_points.lock()?;
        commit_points.clear();
        commit_points.extend(points.iter().copied());
        self.idle.lock()?.clear();
        self.next_id.store(1, Ordering::SeqCst);
        Ok(())
    }

    /// Serial number a recovered session will resume from.
    pub fn recovered_serial(&self, session_id: u64) -> Option<u64> {
        self.commit_points
            .lock()
            .ok()
            .and_then(|points| points.get(&session_id).copied())
    }

    fn release(&self, session: Session) {
        if let Ok(mut points) = self.commit_points.lock() {
            points.insert(session.id, session.serial_num);
        }
        match self.idle.lock() {
            Ok(mut idle) if idle.len() < self.capacity => idle.push(session),
            _ => tracing::debug!(session = session.id, "Session pool full, dropping session"),
        }
    }
}

/// A session borrowed from a [`SessionPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        // Only taken in drop
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_reuses_returned_session() {
        let pool = SessionPool::new(2);
        let id = {
            let mut session = pool.acquire().unwrap();
            session.complete_op();
            session.id()
        };
        assert_eq!(pool.idle_count(), 1);

        let session = pool.acquire().unwrap();
        assert_eq!(session.id(), id);
        assert_eq!(session.serial_num(), 1);
    }

    #[test]
    fn test_concurrent_borrows_get_distinct_sessions() {
        let pool = SessionPool::new(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = SessionPool::new(1);
        {
            let _a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            let _c = pool.acquire().unwrap();
        }
        assert_eq!(pool.idle_count(), 1);
        // Commit points are kept for every session, pooled or not
        assert_eq!(pool.commit_points().unwrap().len(), 3);
    }

    #[test]
    fn test_restore_commit_points() {
        let pool = SessionPool::new(4);
        pool.restore_commit_points(&[(1, 10), (2, 4)]).unwrap();

        assert_eq!(pool.recovered_serial(1), Some(10));
        assert_eq!(pool.recovered_serial(3), None);

        let session = pool.acquire().unwrap();
        assert_eq!(session.id(), 1);
        assert_eq!(session.serial_num(), 10);
    }
}
