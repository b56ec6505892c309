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

mod block_info;
mod block_manager;
mod block_token;
mod blocks_map;
mod corrupt_replicas;
mod excess_replicas;
mod invalidate_blocks;
mod pending_messages;
mod pending_replication;
mod replication_monitor;
mod under_replicated;

pub use block_info::{BlockInfo, ReplicaUnderConstruction, UnderConstructionState};
pub use block_manager::{BlockManager, MisReplicationResult};
pub use block_token::{BlockKeyManager, BlockTokenIssuer};
pub use blocks_map::BlocksMap;
pub use corrupt_replicas::{CorruptReason, CorruptReplicas};
pub use excess_replicas::ExcessReplicas;
pub use invalidate_blocks::InvalidateBlocks;
pub use pending_messages::{PendingDatanodeMessages, ReportedBlockInfo};
pub use pending_replication::PendingReplications;
pub use replication_monitor::{PendingReplicationMonitor, ReplicationMonitor};
pub use under_replicated::UnderReplicatedBlocks;

/// Replica census for one block: the storages recorded in the block map
/// partitioned into disjoint classes, plus the count of replicas sitting
/// on stale storages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NumberReplicas {
    pub live: usize,
    pub decommissioned: usize,
    pub corrupt: usize,
    pub excess: usize,
    pub stale: usize,
}

impl NumberReplicas {
    pub fn total(&self) -> usize {
        self.live + self.decommissioned + self.corrupt + self.excess
    }
}
