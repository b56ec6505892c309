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

use super::{Block, ExportedBlockKeys};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a datanode. Equality and hashing use the uuid only; the
/// address fields are advisory.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatanodeId {
    pub uuid: String,
    pub hostname: String,
    pub ip_addr: String,
    pub xfer_port: u16,
    /// Rack path, e.g. "/rack-a".
    pub location: String,
}

impl DatanodeId {
    pub fn new(uuid: impl Into<String>, hostname: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            hostname: hostname.into(),
            ip_addr: String::new(),
            xfer_port: 0,
            location: location.into(),
        }
    }
}

impl PartialEq for DatanodeId {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for DatanodeId {}

impl std::hash::Hash for DatanodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Display for DatanodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.hostname, self.uuid)
    }
}

/// Media type backing a storage directory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(i8)]
pub enum StorageType {
    Disk = 0,
    Ssd = 1,
    Archive = 2,
    RamDisk = 3,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Disk
    }
}

/// Health of a storage directory as reported by its node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(i8)]
pub enum StorageState {
    Normal = 0,
    ReadOnlyShared = 1,
    Failed = 2,
}

/// Storage identity carried in report headers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DatanodeStorage {
    pub storage_id: String,
    pub state: StorageState,
    pub storage_type: StorageType,
}

impl DatanodeStorage {
    pub fn new(storage_id: impl Into<String>) -> Self {
        Self {
            storage_id: storage_id.into(),
            state: StorageState::Normal,
            storage_type: StorageType::Disk,
        }
    }
}

/// One replica location handed to clients and balancers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageLocation {
    pub datanode: DatanodeId,
    pub storage_id: String,
    pub storage_type: StorageType,
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.datanode, self.storage_id)
    }
}

/// Commands queued for a datanode, delivered with heartbeat responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum DatanodeCommand {
    /// Copy `block` from the receiving node to each target.
    Replicate {
        block: Block,
        targets: Vec<StorageLocation>,
    },
    /// Delete the listed replicas.
    Invalidate { blocks: Vec<Block> },
    /// Fresh access-key material.
    KeyUpdate { keys: ExportedBlockKeys },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datanode_id_identity() {
        let a = DatanodeId::new("dn-1", "host-a", "/rack-a");
        let mut b = DatanodeId::new("dn-1", "host-b", "/rack-b");
        b.xfer_port = 9000;
        assert_eq!(a, b);
    }

    #[test]
    fn test_storage_type_roundtrip() {
        assert_eq!(StorageType::try_from(2i8).unwrap(), StorageType::Archive);
        assert_eq!(i8::from(StorageType::RamDisk), 3);
    }
}
