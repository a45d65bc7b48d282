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
use std::fmt;
use std::str::FromStr;

/// Position of a block inside one sink's stream. Assigned from zero without gaps.
pub type SequenceId = i64;

/// Identifies one runtime execution unit of a distributed query plan.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FragmentInstanceId {
    pub query_id: String,
    pub fragment_id: i32,
    pub instance_id: String,
}

impl FragmentInstanceId {
    pub fn new(
        query_id: impl Into<String>,
        fragment_id: i32,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            fragment_id,
            instance_id: instance_id.into(),
        }
    }

    /// `queryId.fragmentId.instanceId`, used to label logs and memory trackers.
    pub fn full_id(&self) -> String {
        format!("{}.{}.{}", self.query_id, self.fragment_id, self.instance_id)
    }

    /// `full_id()` followed by `.suffix`, e.g. `q.1.0.exchange_3.SourceHandle`.
    pub fn full_id_with(&self, suffix: &str) -> String {
        format!("{}.{}", self.full_id(), suffix)
    }
}

impl fmt::Display for FragmentInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.query_id, self.fragment_id, self.instance_id)
    }
}

/// Names one exchange endpoint inside a fragment instance.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PlanNodeId(String);

impl PlanNodeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanNodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PlanNodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Network address of a peer exchange service.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid endpoint '{}': expected host:port", s))?;
        if host.is_empty() {
            return Err(format!("invalid endpoint '{}': empty host", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid endpoint port in '{}': {}", s, e))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::{Endpoint, FragmentInstanceId, PlanNodeId};

    #[test]
    fn full_id_joins_all_parts() {
        let id = FragmentInstanceId::new("20261019_000001", 3, "7");
        assert_eq!(id.full_id(), "20261019_000001.3.7");
        assert_eq!(id.full_id_with("SinkHandle"), "20261019_000001.3.7.SinkHandle");
        assert_eq!(id.to_string(), id.full_id());
    }

    #[test]
    fn endpoint_parses_host_and_port() {
        let ep: Endpoint = "10.0.0.5:10740".parse().expect("parse endpoint");
        assert_eq!(ep, Endpoint::new("10.0.0.5", 10740));
        assert_eq!(ep.to_string(), "10.0.0.5:10740");
        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn plan_node_id_conversions() {
        let a = PlanNodeId::from("exchange_1");
        let b = PlanNodeId::new(String::from("exchange_1"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "exchange_1");
    }
}
