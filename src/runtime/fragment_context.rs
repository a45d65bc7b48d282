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
//! Execution-context capabilities that exchange handles report into.
//!
//! Handles only see the narrow `InstanceContext` surface; the concrete
//! `FragmentInstanceContext` tracks the instance state and its first failure.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::ids::FragmentInstanceId;
use crate::exchange::error::ExchangeError;
use crate::exchange::listener::FailureCallback;
use crate::mpp_logging::{debug, warn};

/// The capability set a sink or source needs from its owning instance.
pub trait InstanceContext: Send + Sync {
    fn finished(&self);
    fn failed(&self, cause: &ExchangeError);
    fn transition_to_flushing(&self);
    fn failure_cause(&self) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Flushing,
    Finished,
    Failed,
}

impl InstanceState {
    pub fn is_done(self) -> bool {
        matches!(self, InstanceState::Finished | InstanceState::Failed)
    }
}

pub struct FragmentInstanceContext {
    instance_id: FragmentInstanceId,
    state: Mutex<InstanceState>,
    cv: Condvar,
    error_state: RuntimeErrorState,
}

impl FragmentInstanceContext {
    pub fn new(instance_id: FragmentInstanceId) -> Arc<Self> {
        Arc::new(Self {
            instance_id,
            state: Mutex::new(InstanceState::Running),
            cv: Condvar::new(),
            error_state: RuntimeErrorState::default(),
        })
    }

    pub fn instance_id(&self) -> &FragmentInstanceId {
        &self.instance_id
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock().expect("fragment context lock")
    }

    /// Callback handed to source handles; records the failure on this instance.
    pub fn failure_callback(self: &Arc<Self>) -> FailureCallback {
        let ctx = Arc::clone(self);
        Arc::new(move |err: &ExchangeError| ctx.failed(err))
    }

    /// Wait until the instance reaches a terminal state.
    pub fn wait_done(&self, timeout: Duration) -> Option<InstanceState> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().expect("fragment context lock");
        while !guard.is_done() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .expect("fragment context wait");
            guard = next;
        }
        Some(*guard)
    }

    fn transition(&self, from: &[InstanceState], to: InstanceState) -> bool {
        let mut guard = self.state.lock().expect("fragment context lock");
        if !from.contains(&*guard) {
            return false;
        }
        debug!(
            "fragment instance {} state {:?} -> {:?}",
            self.instance_id, *guard, to
        );
        *guard = to;
        self.cv.notify_all();
        true
    }
}

impl InstanceContext for FragmentInstanceContext {
    fn finished(&self) {
        self.transition(
            &[InstanceState::Running, InstanceState::Flushing],
            InstanceState::Finished,
        );
    }

    fn failed(&self, cause: &ExchangeError) {
        self.error_state.set_error(cause.to_string());
        if self.transition(
            &[InstanceState::Running, InstanceState::Flushing],
            InstanceState::Failed,
        ) {
            warn!("fragment instance {} failed: {}", self.instance_id, cause);
        }
    }

    fn transition_to_flushing(&self) {
        self.transition(&[InstanceState::Running], InstanceState::Flushing);
    }

    fn failure_cause(&self) -> Option<String> {
        self.error_state.error()
    }
}
