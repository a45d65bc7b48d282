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
//! Messages exchanged between a remote sink and a remote source.
//!
//! Sequence ranges are half-open: `[start_sequence_id, end_sequence_id)`.

use crate::common::ids::{FragmentInstanceId, PlanNodeId, SequenceId};

/// Source asks the sink that lives in `source_fragment_instance_id` for blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetDataBlocksRequest {
    pub source_fragment_instance_id: FragmentInstanceId,
    pub channel_index: i32,
    pub start_sequence_id: SequenceId,
    pub end_sequence_id: SequenceId,
}

/// Source tells the sink that a range of blocks has been consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcknowledgeDataBlockEvent {
    pub source_fragment_instance_id: FragmentInstanceId,
    pub channel_index: i32,
    pub start_sequence_id: SequenceId,
    pub end_sequence_id: SequenceId,
}

/// Sink announces blocks `[start_sequence_id, start_sequence_id + block_sizes.len())`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDataBlockEvent {
    pub target_fragment_instance_id: FragmentInstanceId,
    pub target_plan_node_id: PlanNodeId,
    pub source_fragment_instance_id: FragmentInstanceId,
    pub start_sequence_id: SequenceId,
    pub block_sizes: Vec<i64>,
}

impl NewDataBlockEvent {
    pub fn end_sequence_id(&self) -> SequenceId {
        self.start_sequence_id + self.block_sizes.len() as SequenceId
    }
}

/// Sink announces that `last_sequence_id` is the final block; `-1` means none were produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndOfDataBlockEvent {
    pub target_fragment_instance_id: FragmentInstanceId,
    pub target_plan_node_id: PlanNodeId,
    pub source_fragment_instance_id: FragmentInstanceId,
    pub last_sequence_id: SequenceId,
}
