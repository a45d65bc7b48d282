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
//! Blocking worker pool for exchange RPCs and event delivery.
//!
//! Responsibilities:
//! - Runs fetches, acknowledgements and data-block events off the producer and
//!   consumer threads.
//! - Hands out `IoTaskHandle`s so owners can cancel pending work on abort.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::config::exchange_io_threads;
use crate::mpp_logging::{debug, info};

static SUBMIT_COUNT: AtomicU64 = AtomicU64::new(0);

pub struct IoTaskContext {
    cancelled: Arc<AtomicBool>,
}

impl IoTaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct IoTaskCompletion {
    done: AtomicBool,
    cv: Condvar,
    mu: Mutex<()>,
}

impl IoTaskCompletion {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            cv: Condvar::new(),
            mu: Mutex::new(()),
        }
    }

    fn mark_done(&self) {
        let _guard = self.mu.lock().expect("io task completion lock");
        self.done.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.done.load(Ordering::Acquire) {
            return true;
        }
        let guard = self.mu.lock().expect("io task completion lock");
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |_| !self.done.load(Ordering::Acquire))
            .expect("io task completion wait");
        drop(guard);
        self.done.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct IoTaskHandle {
    cancelled: Arc<AtomicBool>,
    completion: Arc<IoTaskCompletion>,
}

impl IoTaskHandle {
    /// Request cancellation. A task that has not started yet is skipped; a
    /// running task observes it through `IoTaskContext::is_cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.completion.done.load(Ordering::Acquire)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }
}

pub struct IoExecutor {
    pool: ThreadPool,
}

impl IoExecutor {
    pub fn new(num_threads: usize) -> Self {
        let threads = num_threads.max(1);
        let pool = ThreadPool::with_name("exchange_io".to_string(), threads);
        Self { pool }
    }

    pub fn submit<F>(&self, task: F) -> IoTaskHandle
    where
        F: FnOnce(IoTaskContext) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let completion = Arc::new(IoTaskCompletion::new());
        let ctx = IoTaskContext {
            cancelled: Arc::clone(&cancelled),
        };
        let completion_clone = Arc::clone(&completion);
        let cancelled_clone = Arc::clone(&cancelled);
        let submitted = SUBMIT_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if submitted % 4096 == 0 {
            debug!(
                "exchange io executor: submitted={} queued={} active={}",
                submitted,
                self.pool.queued_count(),
                self.pool.active_count()
            );
        }
        self.pool.execute(move || {
            if !cancelled_clone.load(Ordering::Acquire) {
                task(ctx);
            }
            completion_clone.mark_done();
        });
        IoTaskHandle {
            cancelled,
            completion,
        }
    }

    pub fn queued_count(&self) -> usize {
        self.pool.queued_count()
    }
}

static IO_EXECUTOR: OnceLock<IoExecutor> = OnceLock::new();

pub fn io_executor() -> &'static IoExecutor {
    IO_EXECUTOR.get_or_init(|| {
        let threads = exchange_io_threads();
        info!("exchange io executor started: threads={}", threads);
        IoExecutor::new(threads)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::IoExecutor;

    #[test]
    fn cancelled_task_is_skipped_but_completes() {
        let executor = IoExecutor::new(1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let blocker = executor.submit(move |_| {
            let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let queued = executor.submit(move |_| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        queued.cancel();
        gate_tx.send(()).expect("release blocker");
        assert!(blocker.wait_timeout(Duration::from_secs(5)));
        assert!(queued.wait_timeout(Duration::from_secs(5)));
        assert!(queued.is_finished());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
