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
//! Error kinds surfaced by exchange handles, the manager and the transport.

/// Failure reported by an exchange operation.
///
/// Variants carry a human readable message; `Failed` and `Aborted` keep the
/// cause that the owning fragment instance recorded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("handle already registered: {0}")]
    AlreadyExists(String),
    #[error("sink handle not found: {0}")]
    SinkNotFound(String),
    #[error("data block not found: {0}")]
    BlockNotFound(String),
    #[error("exchange aborted: {0}")]
    Aborted(String),
    #[error("exchange handle closed: {0}")]
    Closed(String),
    #[error("exchange failed: {0}")]
    Failed(String),
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ExchangeError {
    /// True for failures worth retrying at the transport layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transport(_) | ExchangeError::Timeout(_))
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
