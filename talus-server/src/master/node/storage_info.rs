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

use talus_common::state::{DatanodeStorage, StorageState, StorageType};

/// Master-side record of one storage directory on a datanode.
///
/// The storage threads the head of an intrusive list through the block
/// records it carries, so its blocks can be enumerated without a
/// secondary index. Contents are considered stale from registration (and
/// again after a failover) until the storage produces a full block
/// report.
#[derive(Debug, Clone)]
pub struct DatanodeStorageInfo {
    pub storage_id: String,
    pub storage_type: StorageType,
    pub state: StorageState,
    node_uuid: String,

    pub capacity: i64,
    pub remaining: i64,

    /// Head of the intrusive block list (block id).
    pub(crate) head: Option<i64>,
    pub(crate) num_blocks: usize,

    block_report_count: u32,
    content_stale: bool,

    /// Replicas scheduled to land on this storage but not yet reported.
    blocks_scheduled: u32,
}

impl DatanodeStorageInfo {
    pub fn new(node_uuid: &str, storage: &DatanodeStorage) -> Self {
        Self {
            storage_id: storage.storage_id.clone(),
            storage_type: storage.storage_type,
            state: storage.state,
            node_uuid: node_uuid.to_string(),
            capacity: 0,
            remaining: 0,
            head: None,
            num_blocks: 0,
            block_report_count: 0,
            content_stale: true,
            blocks_scheduled: 0,
        }
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_report_count(&self) -> u32 {
        self.block_report_count
    }

    /// The storage has not reported since the master became active; its
    /// contents cannot be trusted for deletions.
    pub fn is_content_stale(&self) -> bool {
        self.content_stale
    }

    pub fn received_block_report(&mut self) {
        self.block_report_count += 1;
        self.content_stale = false;
    }

    pub fn mark_stale_after_failover(&mut self) {
        self.content_stale = true;
    }

    pub fn blocks_scheduled(&self) -> u32 {
        self.blocks_scheduled
    }

    pub fn increment_blocks_scheduled(&mut self) {
        self.blocks_scheduled += 1;
    }

    pub fn decrement_blocks_scheduled(&mut self) {
        self.blocks_scheduled = self.blocks_scheduled.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_until_first_report() {
        let storage = DatanodeStorage::new("s1");
        let mut info = DatanodeStorageInfo::new("dn-1", &storage);
        assert!(info.is_content_stale());

        info.received_block_report();
        assert!(!info.is_content_stale());
        assert_eq!(info.block_report_count(), 1);

        info.mark_stale_after_failover();
        assert!(info.is_content_stale());
    }

    #[test]
    fn test_scheduled_counter_saturates() {
        let storage = DatanodeStorage::new("s1");
        let mut info = DatanodeStorageInfo::new("dn-1", &storage);
        info.decrement_blocks_scheduled();
        assert_eq!(info.blocks_scheduled(), 0);
        info.increment_blocks_scheduled();
        info.increment_blocks_scheduled();
        info.decrement_blocks_scheduled();
        assert_eq!(info.blocks_scheduled(), 1);
    }
}
