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

use crate::master::node::StorageRef;
use fxhash::FxHashMap;
use log::{info, warn};
use std::io::Write;
use talus_common::utils::LocalTime;

struct PendingBlockInfo {
    time_stamp_ms: u64,
    targets: Vec<StorageRef>,
}

/// In-flight replication work: block id → outstanding targets plus the
/// time the work was (re-)scheduled. Entries that outlive the timeout are
/// swept to a timed-out list the orchestrator drains back into the
/// under-replication queues.
pub struct PendingReplications {
    pending: FxHashMap<i64, PendingBlockInfo>,
    timed_out: Vec<i64>,
    timeout_ms: u64,
}

impl PendingReplications {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            pending: FxHashMap::default(),
            timed_out: Vec::new(),
            timeout_ms,
        }
    }

    /// Record newly dispatched work for `block_id` toward `targets`.
    pub fn increment(&mut self, block_id: i64, targets: Vec<StorageRef>) {
        let now = LocalTime::mills();
        match self.pending.get_mut(&block_id) {
            Some(entry) => {
                entry.time_stamp_ms = now;
                entry.targets.extend(targets);
            }
            None => {
                self.pending.insert(
                    block_id,
                    PendingBlockInfo {
                        time_stamp_ms: now,
                        targets,
                    },
                );
            }
        }
    }

    /// One expected replica arrived on `node`; drop that target. The
    /// entry disappears when no targets remain.
    pub fn decrement(&mut self, block_id: i64, node: &str) {
        if let Some(entry) = self.pending.get_mut(&block_id) {
            if let Some(pos) = entry.targets.iter().position(|t| t.node == node) {
                entry.targets.remove(pos);
            }
            if entry.targets.is_empty() {
                self.pending.remove(&block_id);
            }
        }
    }

    pub fn remove(&mut self, block_id: i64) {
        self.pending.remove(&block_id);
    }

    pub fn num_replicas(&self, block_id: i64) -> usize {
        self.pending
            .get(&block_id)
            .map(|e| e.targets.len())
            .unwrap_or(0)
    }

    /// Number of blocks with work in flight.
    pub fn size(&self) -> usize {
        self.pending.len()
    }

    /// Move entries past the timeout to the timed-out list.
    pub fn check_timeouts(&mut self) {
        let now = LocalTime::mills();
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, e)| now > e.time_stamp_ms + self.timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.pending.remove(&id);
            warn!("pending replication of blk_{} timed out", id);
            self.timed_out.push(id);
        }
    }

    /// Hand over (and clear) the timed-out list.
    pub fn take_timed_out(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.timed_out)
    }

    pub fn meta_save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "Metasave: Blocks being replicated: {}",
            self.pending.len()
        )?;
        for (id, entry) in &self.pending {
            writeln!(
                out,
                "blk_{} StartTime: {} NumReplicaInProgress: {}",
                id,
                entry.time_stamp_ms,
                entry.targets.len()
            )?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            info!("clearing {} pending replications", self.pending.len());
        }
        self.pending.clear();
        self.timed_out.clear();
    }
}
