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
//! Lifecycle bridges between exchange handles and their owners.
//!
//! A handle reports finish, end-of-blocks, abort and failure through one of
//! these listeners. Fragment-level listeners also remove the handle from the
//! manager's registry; pipeline-level listeners only forward to the context;
//! channel listeners report into the owning shuffle sink.

use std::sync::{Arc, Weak};

use crate::common::ids::{FragmentInstanceId, PlanNodeId};
use crate::exchange::error::ExchangeError;
use crate::exchange::registry::ExchangeRegistry;
use crate::exchange::shuffle_sink::ShuffleSinkHandle;
use crate::mpp_logging::debug;
use crate::runtime::fragment_context::InstanceContext;

/// Receives the failure of a source handle.
pub type FailureCallback = Arc<dyn Fn(&ExchangeError) + Send + Sync>;

pub enum SinkListener {
    Fragment {
        registry: Weak<ExchangeRegistry>,
        instance_id: FragmentInstanceId,
        handle_id: u64,
        context: Arc<dyn InstanceContext>,
    },
    Pipeline {
        context: Arc<dyn InstanceContext>,
    },
    Channel {
        parent: Weak<ShuffleSinkHandle>,
        channel_index: usize,
    },
}

impl SinkListener {
    fn deregister(&self) {
        if let SinkListener::Fragment {
            registry,
            instance_id,
            handle_id,
            ..
        } = self
            && let Some(registry) = registry.upgrade()
            && registry.remove_sink_if(instance_id, *handle_id)
        {
            debug!("sink handle deregistered: instance={}", instance_id);
        }
    }

    pub fn on_finish(&self) {
        match self {
            SinkListener::Fragment { context, .. } => {
                self.deregister();
                context.finished();
            }
            SinkListener::Pipeline { .. } => {}
            SinkListener::Channel {
                parent,
                channel_index,
            } => {
                if let Some(parent) = parent.upgrade() {
                    parent.on_channel_finished(*channel_index);
                }
            }
        }
    }

    pub fn on_end_of_blocks(&self) {
        match self {
            SinkListener::Fragment { context, .. } => context.transition_to_flushing(),
            SinkListener::Pipeline { .. } => {}
            SinkListener::Channel {
                parent,
                channel_index,
            } => {
                if let Some(parent) = parent.upgrade() {
                    parent.on_channel_end_of_blocks(*channel_index);
                }
            }
        }
    }

    /// Returns the failure cause of the owner, if any, to pass downstream.
    pub fn on_aborted(&self) -> Option<String> {
        match self {
            SinkListener::Fragment { context, .. } => {
                self.deregister();
                context.failure_cause()
            }
            SinkListener::Pipeline { context } => context.failure_cause(),
            SinkListener::Channel { parent, .. } => {
                parent.upgrade().and_then(|parent| parent.failure_cause())
            }
        }
    }

    pub fn on_failure(&self, err: &ExchangeError) {
        match self {
            SinkListener::Fragment { context, .. } => {
                self.deregister();
                context.failed(err);
            }
            SinkListener::Pipeline { context } => context.failed(err),
            SinkListener::Channel {
                parent,
                channel_index,
            } => {
                if let Some(parent) = parent.upgrade() {
                    parent.on_channel_failure(*channel_index, err);
                }
            }
        }
    }

    pub fn failure_cause(&self) -> Option<String> {
        match self {
            SinkListener::Fragment { context, .. } | SinkListener::Pipeline { context } => {
                context.failure_cause()
            }
            SinkListener::Channel { parent, .. } => {
                parent.upgrade().and_then(|parent| parent.failure_cause())
            }
        }
    }
}

pub enum SourceListener {
    Fragment {
        registry: Weak<ExchangeRegistry>,
        instance_id: FragmentInstanceId,
        plan_node_id: PlanNodeId,
        handle_id: u64,
        on_failure: FailureCallback,
    },
    Pipeline {
        on_failure: FailureCallback,
    },
}

impl SourceListener {
    fn deregister(&self) {
        if let SourceListener::Fragment {
            registry,
            instance_id,
            plan_node_id,
            handle_id,
            ..
        } = self
            && let Some(registry) = registry.upgrade()
            && registry.remove_source_if(instance_id, plan_node_id, *handle_id)
        {
            debug!(
                "source handle deregistered: instance={} plan_node={}",
                instance_id, plan_node_id
            );
        }
    }

    pub fn on_finished(&self) {
        self.deregister();
    }

    pub fn on_aborted(&self) {
        self.deregister();
    }

    pub fn on_failure(&self, err: &ExchangeError) {
        self.deregister();
        match self {
            SourceListener::Fragment { on_failure, .. }
            | SourceListener::Pipeline { on_failure } => on_failure(err),
        }
    }
}
