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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<ExchangeServiceConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static ExchangeServiceConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = ExchangeServiceConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("config was not installed: {}", path.display()))
}

pub fn init_from_env_or_default() -> Result<&'static ExchangeServiceConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static ExchangeServiceConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("MPP_EXCHANGE_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("mpp_exchange.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $MPP_EXCHANGE_CONFIG or create ./mpp_exchange.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeServiceConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "mpp_exchange=debug,h2=off,hyper=off,tonic=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub exchange: ExchangeConfig,
}

impl ExchangeServiceConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: ExchangeServiceConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        cfg.exchange
            .validate()
            .with_context(|| format!("validate config: {}", path.display()))?;
        Ok(cfg)
    }

    /// The tracing filter to install: `log_filter` when present, `log_level` otherwise.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(&self.log_level)
    }
}

impl Default for ExchangeServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            server: ServerConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_exchange_port")]
    pub exchange_port: u16,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}
fn default_exchange_port() -> u16 {
    10740
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            exchange_port: default_exchange_port(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeConfig {
    /// Worker threads for outbound notifications and scheduled fetches. 0 means CPU cores.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: i64,
    #[serde(default = "default_max_memory_bytes_per_query")]
    pub max_memory_bytes_per_query: i64,
    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_rpc_connect_timeout_ms")]
    pub rpc_connect_timeout_ms: u64,
    #[serde(default = "default_rpc_retry_times")]
    pub rpc_retry_times: u32,
    #[serde(default = "default_rpc_retry_interval_ms")]
    pub rpc_retry_interval_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_max_blocks_per_fetch")]
    pub max_blocks_per_fetch: usize,
}

fn default_io_threads() -> usize {
    4
}
fn default_max_memory_bytes() -> i64 {
    512 * 1024 * 1024
}
fn default_max_memory_bytes_per_query() -> i64 {
    128 * 1024 * 1024
}
fn default_receive_wait_ms() -> u64 {
    120_000
}
fn default_rpc_timeout_ms() -> u64 {
    60_000
}
fn default_rpc_connect_timeout_ms() -> u64 {
    10_000
}
fn default_rpc_retry_times() -> u32 {
    3
}
fn default_rpc_retry_interval_ms() -> u64 {
    100
}
fn default_max_message_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_max_blocks_per_fetch() -> usize {
    64
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            io_threads: default_io_threads(),
            max_memory_bytes: default_max_memory_bytes(),
            max_memory_bytes_per_query: default_max_memory_bytes_per_query(),
            receive_wait_ms: default_receive_wait_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            rpc_connect_timeout_ms: default_rpc_connect_timeout_ms(),
            rpc_retry_times: default_rpc_retry_times(),
            rpc_retry_interval_ms: default_rpc_retry_interval_ms(),
            max_message_bytes: default_max_message_bytes(),
            max_blocks_per_fetch: default_max_blocks_per_fetch(),
        }
    }
}

impl ExchangeConfig {
    /// Get the actual number of io threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_io_threads(&self) -> usize {
        if self.io_threads > 0 {
            self.io_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_memory_bytes <= 0 {
            return Err(anyhow!(
                "exchange.max_memory_bytes must be positive, got {}",
                self.max_memory_bytes
            ));
        }
        if self.max_memory_bytes_per_query <= 0
            || self.max_memory_bytes_per_query > self.max_memory_bytes
        {
            return Err(anyhow!(
                "exchange.max_memory_bytes_per_query must be in (0, {}], got {}",
                self.max_memory_bytes,
                self.max_memory_bytes_per_query
            ));
        }
        if self.max_blocks_per_fetch == 0 {
            return Err(anyhow!("exchange.max_blocks_per_fetch must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ExchangeServiceConfig;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: ExchangeServiceConfig = toml::from_str("").expect("parse config");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.server.exchange_port, 10740);
        assert_eq!(cfg.exchange.rpc_retry_times, 3);
        assert_eq!(cfg.exchange.max_memory_bytes, 536_870_912);
        assert_eq!(cfg.exchange.max_blocks_per_fetch, 64);
    }

    #[test]
    fn test_exchange_section_can_be_overridden() {
        let cfg: ExchangeServiceConfig = toml::from_str(
            r#"
log_filter = "mpp_exchange=debug,tonic=off"

[exchange]
io_threads = 2
max_memory_bytes = 4096
max_memory_bytes_per_query = 1024
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.exchange.actual_io_threads(), 2);
        assert_eq!(cfg.exchange.max_memory_bytes_per_query, 1024);
        assert_eq!(cfg.effective_log_filter(), "mpp_exchange=debug,tonic=off");
        assert!(cfg.exchange.validate().is_ok());
    }

    #[test]
    fn test_per_query_limit_must_fit_global_limit() {
        let cfg: ExchangeServiceConfig = toml::from_str(
            r#"
[exchange]
max_memory_bytes = 1024
max_memory_bytes_per_query = 4096
"#,
        )
        .expect("parse config");
        assert!(cfg.exchange.validate().is_err());
    }
}
