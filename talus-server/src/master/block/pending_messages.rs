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
use std::collections::VecDeque;
use talus_common::state::{Block, ReplicaState};

/// One report entry deferred on the standby.
#[derive(Debug, Clone)]
pub struct ReportedBlockInfo {
    pub storage: StorageRef,
    pub block: Block,
    pub state: ReplicaState,
}

/// Reports a standby cannot judge yet because its namespace is behind
/// the edit stream. Entries are replayed in arrival order once the edits
/// for the block have been applied.
#[derive(Default)]
pub struct PendingDatanodeMessages {
    map: FxHashMap<i64, VecDeque<ReportedBlockInfo>>,
    count: usize,
}

impl PendingDatanodeMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, storage: StorageRef, block: Block, state: ReplicaState) {
        self.map
            .entry(block.id)
            .or_default()
            .push_back(ReportedBlockInfo {
                storage,
                block,
                state,
            });
        self.count += 1;
    }

    pub fn take_block_queue(&mut self, block_id: i64) -> Vec<ReportedBlockInfo> {
        match self.map.remove(&block_id) {
            Some(queue) => {
                self.count -= queue.len();
                queue.into()
            }
            None => Vec::new(),
        }
    }

    pub fn take_all(&mut self) -> Vec<ReportedBlockInfo> {
        let mut all = Vec::with_capacity(self.count);
        for (_, queue) in std::mem::take(&mut self.map) {
            all.extend(queue);
        }
        self.count = 0;
        all
    }

    pub fn remove_all_for_node(&mut self, node: &str) {
        for queue in self.map.values_mut() {
            let before = queue.len();
            queue.retain(|m| m.storage.node != node);
            self.count -= before - queue.len();
        }
        self.map.retain(|_, q| !q.is_empty());
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
