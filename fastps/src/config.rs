/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Transport configuration.
//!
//! A [`TransportConfig`] starts from [`Default`], and can be overridden from
//! `FASTPS_*` environment variables or loaded from a YAML file.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Port the server listens on and clients connect to unless configured.
pub const DEFAULT_PORT: u16 = 20079;

/// Configuration shared by the producer, consumer and server endpoints.
///
/// The queue pair and connect parameters mirror what every connection is
/// built with; the buffer sizes bound the largest record and the server's
/// shared log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `port` - server listen port, and the port clients connect to.
    pub port: u16,
    /// `resolve_timeout_ms` - bound on address and route resolution.
    pub resolve_timeout_ms: u64,
    /// `listen_backlog` - pending connection requests the listener queues.
    pub listen_backlog: i32,
    /// `cq_entries` - completion queue capacity.
    pub cq_entries: i32,
    /// `max_send_wr` - maximum outstanding send work requests.
    pub max_send_wr: u32,
    /// `max_recv_wr` - maximum outstanding receive work requests.
    pub max_recv_wr: u32,
    /// `max_send_sge` - scatter/gather entries per send.
    pub max_send_sge: u32,
    /// `max_recv_sge` - scatter/gather entries per receive.
    pub max_recv_sge: u32,
    /// `initiator_depth` - outstanding RDMA reads this side may issue.
    pub initiator_depth: u8,
    /// `responder_resources` - outstanding RDMA reads this side serves.
    pub responder_resources: u8,
    /// `rnr_retry_count` - receiver-not-ready retries; 7 means unlimited.
    pub rnr_retry_count: u8,
    /// `record_buffer_size` - size of each per-connection registered buffer.
    pub record_buffer_size: usize,
    /// `log_capacity` - size of the server's shared consumer log.
    pub log_capacity: usize,
    /// `backlog_capacity` - slots in the producer backlog ring.
    pub backlog_capacity: usize,
    /// `probe_backoff_us` - delay before re-probing an unwritten length
    /// prefix; zero only yields the dispatcher thread.
    pub probe_backoff_us: u64,
    /// `poll_interval_ms` - how long blocking event and completion waits
    /// last before re-checking for shutdown.
    pub poll_interval_ms: u64,
    /// `seal_log_on_producer_exit` - write an end-of-stream marker into the
    /// shared log once the last active producer finished.
    pub seal_log_on_producer_exit: bool,
    /// `abort_on_fault` - terminate the process on any transport fault.
    pub abort_on_fault: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            resolve_timeout_ms: 500,
            listen_backlog: 10,
            cq_entries: 10,
            max_send_wr: 10,
            max_recv_wr: 10,
            max_send_sge: 1,
            max_recv_sge: 1,
            initiator_depth: 1,
            responder_resources: 1,
            rnr_retry_count: 7,
            record_buffer_size: 16 * 1024,
            log_capacity: 16 * 1024 * 1024,
            backlog_capacity: 1000,
            probe_backoff_us: 0,
            poll_interval_ms: 100,
            seal_log_on_producer_exit: false,
            abort_on_fault: false,
        }
    }
}

fn env_override<T>(name: &str, slot: &mut T) -> Result<(), anyhow::Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(val) = env::var(name) {
        *slot = val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value {:?} for {}: {}", val, name, e))?;
    }
    Ok(())
}

impl TransportConfig {
    /// Builds a configuration from the defaults overridden by `FASTPS_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error naming the variable if a value does not parse.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let mut config = Self::default();
        env_override("FASTPS_PORT", &mut config.port)?;
        env_override("FASTPS_RESOLVE_TIMEOUT_MS", &mut config.resolve_timeout_ms)?;
        env_override("FASTPS_LISTEN_BACKLOG", &mut config.listen_backlog)?;
        env_override("FASTPS_CQ_ENTRIES", &mut config.cq_entries)?;
        env_override("FASTPS_RECORD_BUFFER_SIZE", &mut config.record_buffer_size)?;
        env_override("FASTPS_LOG_CAPACITY", &mut config.log_capacity)?;
        env_override("FASTPS_BACKLOG_CAPACITY", &mut config.backlog_capacity)?;
        env_override("FASTPS_PROBE_BACKOFF_US", &mut config.probe_backoff_us)?;
        env_override("FASTPS_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        env_override("FASTPS_SEAL_LOG", &mut config.seal_log_on_producer_exit)?;
        env_override("FASTPS_ABORT_ON_FAULT", &mut config.abort_on_fault)?;
        Ok(config)
    }

    /// Loads a configuration from a YAML file. Missing fields keep their
    /// defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(contents: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, anyhow::Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_backoff(&self) -> Duration {
        Duration::from_micros(self.probe_backoff_us)
    }
}

/// Renders the configuration as the YAML that [`TransportConfig::from_yaml_str`]
/// reads back.
impl std::fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let yaml = serde_yaml::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(yaml.trim_end())
    }
}
