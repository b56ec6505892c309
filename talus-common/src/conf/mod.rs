// Copyright 2025 OPPO.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Replication factors above this value cannot be represented on the wire.
pub const REPLICATION_HARD_MAX: u16 = i16::MAX as u16;

/// Cluster configuration root, loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConf {
    #[serde(default)]
    pub master: MasterConf,
}

impl ClusterConf {
    pub fn from_file(path: impl AsRef<Path>) -> FsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let conf: ClusterConf =
            toml::from_str(&text).map_err(|e| FsError::Conf(e.to_string()))?;
        conf.master.validate()?;
        Ok(conf)
    }
}

/// Master-side block management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConf {
    /// Writes requesting fewer replicas than this are rejected; block
    /// completion requires this many live replicas.
    pub replication_min: u16,
    pub replication_max: u16,
    pub replication_default: u16,

    /// Outbound replication streams per node for non-highest priority work.
    pub replication_max_streams: u32,
    /// Outbound stream cap regardless of priority.
    pub replication_streams_hard_limit: u32,

    /// Replication monitor tick.
    pub replication_interval_ms: u64,
    /// In-flight replication entries older than this are recycled.
    pub replication_pending_timeout_ms: u64,
    /// Blocks scheduled per live node on each monitor tick.
    pub replication_work_multiplier: u32,
    /// Fraction of live nodes handed invalidation work per tick.
    pub invalidate_work_pct: f32,
    /// Deletions dispatched to one node in a single batch.
    pub block_invalidate_limit: usize,
    /// Grace period before deletions queued after startup are dispatched.
    pub startup_delay_block_deletion_ms: u64,

    /// Chunk size for the asynchronous mis-replication scan.
    pub misreplication_batch_size: usize,
    /// Per-report cap on per-block log lines.
    pub max_blocks_to_log: usize,
    /// Fixed capacity of the block index.
    pub blocks_map_capacity: usize,

    pub block_token_enable: bool,
    pub block_key_update_interval_ms: u64,
    pub block_token_lifetime_ms: u64,
    pub encrypt_data_transfer: bool,
    pub data_encryption_algorithm: String,
}

impl Default for MasterConf {
    fn default() -> Self {
        Self {
            replication_min: 1,
            replication_max: 512,
            replication_default: 3,
            replication_max_streams: 2,
            replication_streams_hard_limit: 4,
            replication_interval_ms: 3_000,
            replication_pending_timeout_ms: 5 * 60 * 1_000,
            replication_work_multiplier: 2,
            invalidate_work_pct: 0.32,
            block_invalidate_limit: 1_000,
            startup_delay_block_deletion_ms: 0,
            misreplication_batch_size: 10_000,
            max_blocks_to_log: 1_000,
            blocks_map_capacity: 1 << 21,
            block_token_enable: false,
            block_key_update_interval_ms: 600 * 60 * 1_000,
            block_token_lifetime_ms: 600 * 60 * 1_000,
            encrypt_data_transfer: false,
            data_encryption_algorithm: String::new(),
        }
    }
}

impl MasterConf {
    pub fn validate(&self) -> FsResult<()> {
        if self.replication_min == 0 {
            return Err(FsError::Conf(format!(
                "replication_min = {} <= 0",
                self.replication_min
            )));
        }
        if self.replication_max > REPLICATION_HARD_MAX {
            return Err(FsError::Conf(format!(
                "replication_max = {} > {}",
                self.replication_max, REPLICATION_HARD_MAX
            )));
        }
        if self.replication_min > self.replication_max {
            return Err(FsError::Conf(format!(
                "replication_min = {} > replication_max = {}",
                self.replication_min, self.replication_max
            )));
        }
        if !(0.0..=1.0).contains(&self.invalidate_work_pct) {
            return Err(FsError::Conf(format!(
                "invalidate_work_pct = {} is not within [0.0, 1.0]",
                self.invalidate_work_pct
            )));
        }
        Ok(())
    }

    pub fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_pending_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_conf_is_valid() {
        let conf = MasterConf::default();
        assert!(conf.validate().is_ok());
        assert_eq!(conf.replication_min, 1);
        assert_eq!(conf.replication_max, 512);
        assert_eq!(conf.replication_work_multiplier, 2);
        assert_eq!(conf.replication_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_replication_range_checks() {
        let mut conf = MasterConf::default();
        conf.replication_min = 0;
        assert!(conf.validate().is_err());

        conf.replication_min = 10;
        conf.replication_max = 5;
        assert!(conf.validate().is_err());

        conf.replication_min = 1;
        conf.replication_max = REPLICATION_HARD_MAX + 1;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            [master]
            replication_default = 2
            block_token_enable = true
        "#;
        let conf: ClusterConf = toml::from_str(text).unwrap();
        assert_eq!(conf.master.replication_default, 2);
        assert!(conf.master.block_token_enable);
        // untouched fields keep their defaults
        assert_eq!(conf.master.replication_max_streams, 2);
    }
}
