// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Byte quotas for buffered exchange blocks.
//!
//! Responsibilities:
//! - Enforces a process-wide limit and a per-query limit on memory held by
//!   sinks, shared queues and sources.
//! - Blocks producers until quota is available; lets remote sources register
//!   a one-shot observer instead of blocking a worker thread.
//!
//! Key exported interfaces:
//! - Types: `MemoryPool`, `MemoryReservation`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::common::config::{exchange_max_memory_bytes, exchange_max_memory_bytes_per_query};
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::mpp_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::observer::Observable;

const RESERVE_WAIT_SLICE: Duration = Duration::from_millis(50);

static RESERVE_WAIT_COUNT: AtomicU64 = AtomicU64::new(0);

fn should_log_reserve_wait() -> bool {
    let count = RESERVE_WAIT_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    count % 200 == 0
}

#[derive(Default)]
struct PoolState {
    reserved: i64,
    per_query: HashMap<String, i64>,
    waiters: Vec<Weak<Observable>>,
}

pub struct MemoryPool {
    max_bytes: i64,
    max_bytes_per_query: i64,
    state: Mutex<PoolState>,
    cv: Condvar,
    tracker: Arc<MemTracker>,
}

impl MemoryPool {
    pub fn new(label: impl Into<String>, max_bytes: i64, max_bytes_per_query: i64) -> Arc<Self> {
        Arc::new(Self {
            max_bytes: max_bytes.max(1),
            max_bytes_per_query: max_bytes_per_query.max(1),
            state: Mutex::new(PoolState::default()),
            cv: Condvar::new(),
            tracker: MemTracker::new_root(label),
        })
    }

    /// Pool sized from the `[exchange]` config section.
    pub fn from_config() -> Arc<Self> {
        Self::new(
            "exchange",
            exchange_max_memory_bytes(),
            exchange_max_memory_bytes_per_query(),
        )
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes
    }

    pub fn max_bytes_per_query(&self) -> i64 {
        self.max_bytes_per_query
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn reserved_bytes(&self) -> i64 {
        self.state.lock().expect("memory pool lock").reserved
    }

    pub fn query_reserved_bytes(&self, query_id: &str) -> i64 {
        let guard = self.state.lock().expect("memory pool lock");
        guard.per_query.get(query_id).copied().unwrap_or(0)
    }

    fn check_limits(&self, query_id: &str, bytes: i64) -> ExchangeResult<()> {
        if bytes > self.max_bytes || bytes > self.max_bytes_per_query {
            return Err(ExchangeError::MemoryLimitExceeded(format!(
                "query {} asked for {} bytes, pool limit={} per-query limit={}",
                query_id, bytes, self.max_bytes, self.max_bytes_per_query
            )));
        }
        Ok(())
    }

    fn fits(&self, state: &PoolState, query_id: &str, bytes: i64) -> bool {
        let query_reserved = state.per_query.get(query_id).copied().unwrap_or(0);
        state.reserved + bytes <= self.max_bytes
            && query_reserved + bytes <= self.max_bytes_per_query
    }

    fn commit(&self, state: &mut PoolState, query_id: &str, bytes: i64) {
        state.reserved += bytes;
        *state.per_query.entry(query_id.to_string()).or_insert(0) += bytes;
        self.tracker.consume(bytes);
    }

    /// Reserve `bytes` for `query_id`, blocking until quota is available.
    ///
    /// Returns `Aborted` once `cancelled` reports true while waiting.
    pub fn reserve(
        &self,
        query_id: &str,
        bytes: i64,
        cancelled: &dyn Fn() -> bool,
    ) -> ExchangeResult<()> {
        if bytes <= 0 {
            return Ok(());
        }
        self.check_limits(query_id, bytes)?;
        let mut guard = self.state.lock().expect("memory pool lock");
        loop {
            if self.fits(&guard, query_id, bytes) {
                self.commit(&mut guard, query_id, bytes);
                return Ok(());
            }
            if cancelled() {
                return Err(ExchangeError::Aborted(format!(
                    "memory reservation for query {} cancelled while waiting",
                    query_id
                )));
            }
            if should_log_reserve_wait() {
                debug!(
                    "memory pool wait: query_id={} bytes={} reserved={} limit={}",
                    query_id, bytes, guard.reserved, self.max_bytes
                );
            }
            let (next, _) = self
                .cv
                .wait_timeout(guard, RESERVE_WAIT_SLICE)
                .expect("memory pool wait");
            guard = next;
        }
    }

    /// Reserve immediately if possible. Otherwise register `observable` to be
    /// notified once after the next release and return `Ok(false)`.
    pub fn try_reserve_or_observe(
        &self,
        query_id: &str,
        bytes: i64,
        observable: Option<&Arc<Observable>>,
    ) -> ExchangeResult<bool> {
        if bytes <= 0 {
            return Ok(true);
        }
        self.check_limits(query_id, bytes)?;
        let mut guard = self.state.lock().expect("memory pool lock");
        if self.fits(&guard, query_id, bytes) {
            self.commit(&mut guard, query_id, bytes);
            return Ok(true);
        }
        if let Some(observable) = observable {
            guard.waiters.push(Arc::downgrade(observable));
        }
        Ok(false)
    }

    pub fn release(&self, query_id: &str, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let waiters = {
            let mut guard = self.state.lock().expect("memory pool lock");
            guard.reserved = (guard.reserved - bytes).max(0);
            let remove = match guard.per_query.get_mut(query_id) {
                Some(value) => {
                    *value -= bytes;
                    *value <= 0
                }
                None => false,
            };
            if remove {
                guard.per_query.remove(query_id);
            }
            self.tracker.release(bytes);
            std::mem::take(&mut guard.waiters)
        };
        self.cv.notify_all();
        for waiter in waiters {
            if let Some(observable) = waiter.upgrade() {
                observable.notify_observers();
            }
        }
    }

    /// Wake blocked `reserve` calls so they re-check their cancel condition.
    pub fn wake_waiters(&self) {
        let _guard = self.state.lock().expect("memory pool lock");
        self.cv.notify_all();
    }
}

/// Bytes held against a `MemoryPool` on behalf of one handle or queue.
///
/// `release_all` closes the reservation and returns everything it still holds
/// exactly once; any later reservation attempt is rejected.
pub struct MemoryReservation {
    pool: Arc<MemoryPool>,
    query_id: String,
    tracker: Arc<MemTracker>,
    reserved: Mutex<i64>,
    closed: AtomicBool,
}

impl MemoryReservation {
    pub fn new(
        pool: &Arc<MemoryPool>,
        query_id: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            pool: Arc::clone(pool),
            query_id: query_id.into(),
            tracker: MemTracker::new_child(label, pool.tracker()),
            reserved: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn reserved_bytes(&self) -> i64 {
        *self.reserved.lock().expect("memory reservation lock")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed_error(&self) -> ExchangeError {
        ExchangeError::Closed(format!("memory reservation {}", self.tracker.label()))
    }

    // Record bytes the pool already granted, or hand them back if closed meanwhile.
    fn accept(&self, bytes: i64) -> ExchangeResult<()> {
        let mut guard = self.reserved.lock().expect("memory reservation lock");
        if self.closed.load(Ordering::Acquire) {
            drop(guard);
            self.pool.release(&self.query_id, bytes);
            return Err(self.closed_error());
        }
        *guard += bytes;
        self.tracker.consume(bytes);
        Ok(())
    }

    /// Block until `bytes` are granted or the reservation is closed.
    pub fn reserve_blocking(&self, bytes: i64) -> ExchangeResult<()> {
        if bytes <= 0 {
            return Ok(());
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let closed = || self.closed.load(Ordering::Acquire);
        self.pool.reserve(&self.query_id, bytes, &closed)?;
        self.accept(bytes)
    }

    /// Non-blocking variant; see `MemoryPool::try_reserve_or_observe`.
    pub fn try_reserve(
        &self,
        bytes: i64,
        observable: Option<&Arc<Observable>>,
    ) -> ExchangeResult<bool> {
        if bytes <= 0 {
            return Ok(true);
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if !self
            .pool
            .try_reserve_or_observe(&self.query_id, bytes, observable)?
        {
            return Ok(false);
        }
        self.accept(bytes).map(|_| true)
    }

    /// Return up to `bytes` to the pool. Returns how much was actually released.
    pub fn release(&self, bytes: i64) -> i64 {
        if bytes <= 0 {
            return 0;
        }
        let freed = {
            let mut guard = self.reserved.lock().expect("memory reservation lock");
            let freed = bytes.min(*guard);
            *guard -= freed;
            freed
        };
        if freed > 0 {
            self.tracker.release(freed);
            self.pool.release(&self.query_id, freed);
        }
        freed
    }

    /// Close the reservation and return everything it holds.
    pub fn release_all(&self) -> i64 {
        let freed = {
            let mut guard = self.reserved.lock().expect("memory reservation lock");
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        if freed > 0 {
            self.tracker.release(freed);
            self.pool.release(&self.query_id, freed);
        }
        self.pool.wake_waiters();
        freed
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        let freed = std::mem::take(self.reserved.get_mut().unwrap_or_else(|e| e.into_inner()));
        if freed > 0 {
            self.tracker.release(freed);
            self.pool.release(&self.query_id, freed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::{MemoryPool, MemoryReservation};
    use crate::exchange::error::ExchangeError;
    use crate::runtime::observer::Observable;

    #[test]
    fn reservation_larger_than_limit_fails() {
        let pool = MemoryPool::new("test", 100, 50);
        let reservation = MemoryReservation::new(&pool, "q1", "q1.sink");
        let err = reservation.reserve_blocking(60).unwrap_err();
        assert!(matches!(err, ExchangeError::MemoryLimitExceeded(_)));
        assert_eq!(pool.reserved_bytes(), 0);
    }

    #[test]
    fn blocked_reserve_resumes_after_release() {
        let pool = MemoryPool::new("test", 100, 100);
        let holder = Arc::new(MemoryReservation::new(&pool, "q1", "holder"));
        holder.reserve_blocking(80).expect("reserve");

        let waiter = Arc::new(MemoryReservation::new(&pool, "q1", "waiter"));
        let waiter_clone = Arc::clone(&waiter);
        let join = thread::spawn(move || waiter_clone.reserve_blocking(40));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(waiter.reserved_bytes(), 0);
        assert_eq!(holder.release(50), 50);
        join.join().expect("join").expect("reserve after release");
        assert_eq!(waiter.reserved_bytes(), 40);
        assert_eq!(pool.reserved_bytes(), 70);
        assert_eq!(pool.query_reserved_bytes("q1"), 70);
    }

    #[test]
    fn closing_reservation_cancels_blocked_reserve() {
        let pool = MemoryPool::new("test", 10, 10);
        let holder = MemoryReservation::new(&pool, "q1", "holder");
        holder.reserve_blocking(10).expect("reserve");

        let waiter = Arc::new(MemoryReservation::new(&pool, "q1", "waiter"));
        let waiter_clone = Arc::clone(&waiter);
        let join = thread::spawn(move || waiter_clone.reserve_blocking(5));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(waiter.release_all(), 0);
        let err = join.join().expect("join").unwrap_err();
        assert!(matches!(err, ExchangeError::Aborted(_) | ExchangeError::Closed(_)));
        assert_eq!(pool.reserved_bytes(), 10);
    }

    #[test]
    fn release_all_returns_bytes_exactly_once() {
        let pool = MemoryPool::new("test", 1000, 1000);
        let reservation = MemoryReservation::new(&pool, "q1", "queue");
        reservation.reserve_blocking(30).expect("reserve");
        reservation.reserve_blocking(20).expect("reserve");
        assert_eq!(reservation.tracker().current(), 50);
        assert_eq!(reservation.release_all(), 50);
        assert_eq!(reservation.release_all(), 0);
        assert_eq!(reservation.release(10), 0);
        assert_eq!(pool.reserved_bytes(), 0);
        assert!(matches!(
            reservation.reserve_blocking(1),
            Err(ExchangeError::Closed(_))
        ));
    }

    #[test]
    fn per_query_limit_is_independent() {
        let pool = MemoryPool::new("test", 1000, 100);
        let q1 = MemoryReservation::new(&pool, "q1", "q1");
        let q2 = MemoryReservation::new(&pool, "q2", "q2");
        q1.reserve_blocking(100).expect("q1");
        assert!(q2.try_reserve(100, None).expect("q2"));
        assert!(!q1.try_reserve(1, None).expect("q1 over limit"));
        assert_eq!(pool.reserved_bytes(), 200);
    }

    #[test]
    fn observer_notified_once_on_release() {
        let pool = MemoryPool::new("test", 10, 10);
        let holder = MemoryReservation::new(&pool, "q1", "holder");
        holder.reserve_blocking(10).expect("reserve");

        let observable = Arc::new(Observable::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        observable.add_observer(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let source = MemoryReservation::new(&pool, "q1", "source");
        assert!(!source.try_reserve(4, Some(&observable)).expect("try"));
        holder.release(5);
        holder.release(5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(source.try_reserve(4, Some(&observable)).expect("retry"));
    }

    #[test]
    fn dropped_reservation_returns_bytes() {
        let pool = MemoryPool::new("test", 100, 100);
        {
            let reservation = MemoryReservation::new(&pool, "q1", "tmp");
            reservation.reserve_blocking(42).expect("reserve");
            assert_eq!(pool.reserved_bytes(), 42);
        }
        assert_eq!(pool.reserved_bytes(), 0);
        assert_eq!(pool.tracker().current(), 0);
    }
}
