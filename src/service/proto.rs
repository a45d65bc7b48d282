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
//! Generated gRPC types and conversions to the exchange protocol structs.

use crate::common::ids::{FragmentInstanceId, PlanNodeId, SequenceId};
use crate::exchange::data_block::DataBlock;
use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::protocol::{
    AcknowledgeDataBlockEvent, EndOfDataBlockEvent, GetDataBlocksRequest, NewDataBlockEvent,
};

pub mod mpp_exchange {
    tonic::include_proto!("mpp_exchange");
}

use mpp_exchange::{
    PAcknowledgeDataBlockEvent, PEndOfDataBlockEvent, PFragmentInstanceId, PGetDataBlockRequest,
    PGetDataBlockResponse, PNewDataBlockEvent,
};

impl From<&FragmentInstanceId> for PFragmentInstanceId {
    fn from(id: &FragmentInstanceId) -> Self {
        Self {
            query_id: id.query_id.clone(),
            fragment_id: id.fragment_id,
            instance_id: id.instance_id.clone(),
        }
    }
}

impl From<PFragmentInstanceId> for FragmentInstanceId {
    fn from(id: PFragmentInstanceId) -> Self {
        FragmentInstanceId::new(id.query_id, id.fragment_id, id.instance_id)
    }
}

fn required_instance(
    id: Option<PFragmentInstanceId>,
    field: &str,
) -> ExchangeResult<FragmentInstanceId> {
    id.map(FragmentInstanceId::from)
        .ok_or_else(|| ExchangeError::InvalidState(format!("missing {}", field)))
}

fn checked_range(start: SequenceId, end: SequenceId) -> ExchangeResult<(SequenceId, SequenceId)> {
    if start > end {
        return Err(ExchangeError::InvalidState(format!(
            "inverted sequence range [{}, {})",
            start, end
        )));
    }
    Ok((start, end))
}

impl From<&GetDataBlocksRequest> for PGetDataBlockRequest {
    fn from(req: &GetDataBlocksRequest) -> Self {
        Self {
            source_fragment_instance_id: Some((&req.source_fragment_instance_id).into()),
            channel_index: req.channel_index,
            start_sequence_id: req.start_sequence_id,
            end_sequence_id: req.end_sequence_id,
        }
    }
}

impl TryFrom<PGetDataBlockRequest> for GetDataBlocksRequest {
    type Error = ExchangeError;

    fn try_from(req: PGetDataBlockRequest) -> ExchangeResult<Self> {
        let (start_sequence_id, end_sequence_id) =
            checked_range(req.start_sequence_id, req.end_sequence_id)?;
        Ok(Self {
            source_fragment_instance_id: required_instance(
                req.source_fragment_instance_id,
                "source_fragment_instance_id",
            )?,
            channel_index: req.channel_index,
            start_sequence_id,
            end_sequence_id,
        })
    }
}

impl From<Vec<DataBlock>> for PGetDataBlockResponse {
    fn from(blocks: Vec<DataBlock>) -> Self {
        Self {
            data_blocks: blocks.into_iter().map(DataBlock::into_payload).collect(),
        }
    }
}

impl From<PGetDataBlockResponse> for Vec<DataBlock> {
    fn from(resp: PGetDataBlockResponse) -> Self {
        resp.data_blocks.into_iter().map(DataBlock::new).collect()
    }
}

impl From<&AcknowledgeDataBlockEvent> for PAcknowledgeDataBlockEvent {
    fn from(event: &AcknowledgeDataBlockEvent) -> Self {
        Self {
            source_fragment_instance_id: Some((&event.source_fragment_instance_id).into()),
            channel_index: event.channel_index,
            start_sequence_id: event.start_sequence_id,
            end_sequence_id: event.end_sequence_id,
        }
    }
}

impl TryFrom<PAcknowledgeDataBlockEvent> for AcknowledgeDataBlockEvent {
    type Error = ExchangeError;

    fn try_from(event: PAcknowledgeDataBlockEvent) -> ExchangeResult<Self> {
        let (start_sequence_id, end_sequence_id) =
            checked_range(event.start_sequence_id, event.end_sequence_id)?;
        Ok(Self {
            source_fragment_instance_id: required_instance(
                event.source_fragment_instance_id,
                "source_fragment_instance_id",
            )?,
            channel_index: event.channel_index,
            start_sequence_id,
            end_sequence_id,
        })
    }
}

impl From<&NewDataBlockEvent> for PNewDataBlockEvent {
    fn from(event: &NewDataBlockEvent) -> Self {
        Self {
            target_fragment_instance_id: Some((&event.target_fragment_instance_id).into()),
            target_plan_node_id: event.target_plan_node_id.as_str().to_string(),
            source_fragment_instance_id: Some((&event.source_fragment_instance_id).into()),
            start_sequence_id: event.start_sequence_id,
            block_sizes: event.block_sizes.clone(),
        }
    }
}

impl TryFrom<PNewDataBlockEvent> for NewDataBlockEvent {
    type Error = ExchangeError;

    fn try_from(event: PNewDataBlockEvent) -> ExchangeResult<Self> {
        Ok(Self {
            target_fragment_instance_id: required_instance(
                event.target_fragment_instance_id,
                "target_fragment_instance_id",
            )?,
            target_plan_node_id: PlanNodeId::new(event.target_plan_node_id),
            source_fragment_instance_id: required_instance(
                event.source_fragment_instance_id,
                "source_fragment_instance_id",
            )?,
            start_sequence_id: event.start_sequence_id,
            block_sizes: event.block_sizes,
        })
    }
}

impl From<&EndOfDataBlockEvent> for PEndOfDataBlockEvent {
    fn from(event: &EndOfDataBlockEvent) -> Self {
        Self {
            target_fragment_instance_id: Some((&event.target_fragment_instance_id).into()),
            target_plan_node_id: event.target_plan_node_id.as_str().to_string(),
            source_fragment_instance_id: Some((&event.source_fragment_instance_id).into()),
            last_sequence_id: event.last_sequence_id,
        }
    }
}

impl TryFrom<PEndOfDataBlockEvent> for EndOfDataBlockEvent {
    type Error = ExchangeError;

    fn try_from(event: PEndOfDataBlockEvent) -> ExchangeResult<Self> {
        Ok(Self {
            target_fragment_instance_id: required_instance(
                event.target_fragment_instance_id,
                "target_fragment_instance_id",
            )?,
            target_plan_node_id: PlanNodeId::new(event.target_plan_node_id),
            source_fragment_instance_id: required_instance(
                event.source_fragment_instance_id,
                "source_fragment_instance_id",
            )?,
            last_sequence_id: event.last_sequence_id,
        })
    }
}
