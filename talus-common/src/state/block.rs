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

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Length marker on invalidation commands for blocks being removed from
/// the namespace entirely; such deletions need no acknowledgement.
pub const BLOCK_NO_ACK: i64 = i64::MAX;

/// A contiguous byte range of a file; the unit of placement and
/// replication. Two blocks are the same block iff their ids are equal;
/// length and generation stamp carry freshness, not identity.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Block {
    pub id: i64,
    pub num_bytes: i64,
    pub gen_stamp: i64,
}

impl Block {
    pub fn new(id: i64, num_bytes: i64, gen_stamp: i64) -> Self {
        Self {
            id,
            num_bytes,
            gen_stamp,
        }
    }

    pub fn with_id(id: i64) -> Self {
        Self::new(id, 0, 0)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Block {}

impl std::hash::Hash for Block {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}_{}", self.id, self.gen_stamp)
    }
}

/// A block qualified by the pool it belongs to, as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExtendedBlock {
    pub pool_id: String,
    pub block: Block,
}

impl ExtendedBlock {
    pub fn new(pool_id: impl Into<String>, block: Block) -> Self {
        Self {
            pool_id: pool_id.into(),
            block,
        }
    }
}

impl fmt::Display for ExtendedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool_id, self.block)
    }
}

/// Construction state of a block record on the master.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(i8)]
pub enum BlockUcState {
    Complete = 0,
    Committed = 1,
    UnderConstruction = 2,
    UnderRecovery = 3,
}

impl fmt::Display for BlockUcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of one replica as reported by a storage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(i8)]
pub enum ReplicaState {
    Finalized = 0,
    /// Receiving, being written.
    Rbw = 1,
    /// Receiving, waiting for recovery.
    Rwr = 2,
    /// Under recovery.
    Rur = 3,
    Temporary = 4,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of a full block report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReportedBlock {
    pub block: Block,
    pub state: ReplicaState,
}

impl ReportedBlock {
    pub fn finalized(block: Block) -> Self {
        Self {
            block,
            state: ReplicaState::Finalized,
        }
    }
}

/// Incremental report event kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(i8)]
pub enum ReportedBlockStatus {
    Receiving = 0,
    Received = 1,
    Deleted = 2,
}

/// One entry of an incremental block report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReceivedDeletedBlock {
    pub block: Block,
    pub status: ReportedBlockStatus,
    /// Node the client prefers to drop during pipeline recovery.
    pub del_hint: Option<String>,
}

impl ReceivedDeletedBlock {
    pub fn received(block: Block) -> Self {
        Self {
            block,
            status: ReportedBlockStatus::Received,
            del_hint: None,
        }
    }

    pub fn receiving(block: Block) -> Self {
        Self {
            block,
            status: ReportedBlockStatus::Receiving,
            del_hint: None,
        }
    }

    pub fn deleted(block: Block) -> Self {
        Self {
            block,
            status: ReportedBlockStatus::Deleted,
            del_hint: None,
        }
    }
}
