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
use bytes::Bytes;

/// An opaque, serialized batch of rows moved between fragment instances.
///
/// The exchange layer never inspects the payload; it only needs the retained
/// size for memory accounting. Cloning shares the underlying buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataBlock {
    payload: Bytes,
}

impl DataBlock {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Bytes charged against the memory pool while this block is buffered.
    pub fn retained_size(&self) -> i64 {
        self.payload.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl From<Vec<u8>> for DataBlock {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&'static str> for DataBlock {
    fn from(value: &'static str) -> Self {
        Self::new(Bytes::from_static(value.as_bytes()))
    }
}
