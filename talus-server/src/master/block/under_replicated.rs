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

use linked_hash_map::LinkedHashMap;
use log::debug;

/// Number of priority queues.
pub const LEVEL: usize = 6;
/// Blocks whose only remaining copies sit on decommissioning nodes.
pub const QUEUE_HIGHEST_PRIORITY: usize = 0;
/// Blocks down to a single live replica.
pub const QUEUE_SINGLE_REPLICA: usize = 1;
/// Blocks with less than a third of their target replicas.
pub const QUEUE_VERY_UNDER_REPLICATED: usize = 2;
/// Everything else below target.
pub const QUEUE_UNDER_REPLICATED: usize = 3;
/// Replica count met, but every replica sits on one rack.
pub const QUEUE_REPLICAS_BADLY_DISTRIBUTED: usize = 4;
/// No usable copies anywhere.
pub const QUEUE_WITH_CORRUPT_BLOCKS: usize = 5;

/// Blocks below their replication target, bucketed by urgency. A
/// persistent bookmark per queue round-robins the selection so late
/// entries cannot be starved by a hot prefix.
pub struct UnderReplicatedBlocks {
    queues: Vec<LinkedHashMap<i64, ()>>,
    repl_index: Vec<usize>,
}

impl UnderReplicatedBlocks {
    pub fn new() -> Self {
        Self {
            queues: (0..LEVEL).map(|_| LinkedHashMap::new()).collect(),
            repl_index: vec![0; LEVEL],
        }
    }

    /// Urgency bucket for a block with the given replica census.
    pub fn priority(live: usize, decommissioned: usize, expected: u16) -> usize {
        let expected = expected as usize;
        if live == 0 {
            if decommissioned > 0 {
                QUEUE_HIGHEST_PRIORITY
            } else {
                QUEUE_WITH_CORRUPT_BLOCKS
            }
        } else if live == 1 && expected > 1 {
            QUEUE_SINGLE_REPLICA
        } else if live * 3 < expected {
            QUEUE_VERY_UNDER_REPLICATED
        } else if live >= expected {
            QUEUE_REPLICAS_BADLY_DISTRIBUTED
        } else {
            QUEUE_UNDER_REPLICATED
        }
    }

    pub fn add(&mut self, block_id: i64, live: usize, decommissioned: usize, expected: u16) -> bool {
        let pri = Self::priority(live, decommissioned, expected);
        if self.queues[pri].insert(block_id, ()).is_none() {
            debug!(
                "blk_{} added to under-replicated queue {} (live={}, expected={})",
                block_id, pri, live, expected
            );
            true
        } else {
            false
        }
    }

    /// Remove using the census to locate the bucket, falling back to a
    /// full scan if the block moved.
    pub fn remove(
        &mut self,
        block_id: i64,
        live: usize,
        decommissioned: usize,
        expected: u16,
    ) -> bool {
        let pri = Self::priority(live, decommissioned, expected);
        self.remove_with_priority(block_id, pri) || self.remove_all(block_id)
    }

    pub fn remove_with_priority(&mut self, block_id: i64, priority: usize) -> bool {
        priority < LEVEL && self.queues[priority].remove(&block_id).is_some()
    }

    pub fn remove_all(&mut self, block_id: i64) -> bool {
        let mut removed = false;
        for queue in &mut self.queues {
            removed |= queue.remove(&block_id).is_some();
        }
        removed
    }

    /// Replica counts changed; move the block between buckets if its
    /// urgency changed. The caller has already established the block
    /// still needs replication.
    pub fn update(
        &mut self,
        block_id: i64,
        live: usize,
        decommissioned: usize,
        expected: u16,
        live_delta: isize,
        expected_delta: isize,
    ) {
        let old_live = (live as isize - live_delta).max(0) as usize;
        let old_expected = (expected as isize - expected_delta).max(0) as u16;
        let cur_pri = Self::priority(live, decommissioned, expected);
        let old_pri = Self::priority(old_live, decommissioned, old_expected);
        if cur_pri != old_pri {
            self.remove_with_priority(block_id, old_pri);
        }
        self.queues[cur_pri].insert(block_id, ());
    }

    pub fn contains(&self, block_id: i64) -> bool {
        self.queues.iter().any(|q| q.contains_key(&block_id))
    }

    pub fn size(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Blocks that are under-replicated but still have usable copies.
    pub fn under_replicated_count(&self) -> usize {
        self.size() - self.corrupt_count()
    }

    pub fn corrupt_count(&self) -> usize {
        self.queues[QUEUE_WITH_CORRUPT_BLOCKS].len()
    }

    pub fn iter_level(&self, priority: usize) -> impl Iterator<Item = i64> + '_ {
        self.queues[priority].keys().copied()
    }

    pub fn iter_all(&self) -> impl Iterator<Item = i64> + '_ {
        self.queues.iter().flat_map(|q| q.keys().copied())
    }

    /// Select up to `blocks_to_process` blocks, highest priority first,
    /// resuming each queue at its bookmark. When a pass reaches the end
    /// of the last queue without filling the quota, all bookmarks reset
    /// so the next pass starts over.
    pub fn choose_under_replicated(&mut self, blocks_to_process: usize) -> Vec<Vec<i64>> {
        let mut result: Vec<Vec<i64>> = (0..LEVEL).map(|_| Vec::new()).collect();
        let mut taken = 0;
        for priority in 0..LEVEL {
            let queue = &self.queues[priority];
            let mut idx = self.repl_index[priority].min(queue.len());
            for id in queue.keys().skip(idx) {
                if taken >= blocks_to_process {
                    break;
                }
                result[priority].push(*id);
                taken += 1;
                idx += 1;
            }
            self.repl_index[priority] = idx;
        }

        if taken < blocks_to_process {
            // scanned everything there was; restart from the beginning
            for idx in &mut self.repl_index {
                *idx = 0;
            }
        }
        result
    }

    /// A selected block was consumed (or discarded); pull the bookmark
    /// back so the slot is not skipped on the next pass.
    pub fn decrement_repl_index(&mut self, priority: usize) {
        if priority < LEVEL {
            self.repl_index[priority] = self.repl_index[priority].saturating_sub(1);
        }
    }

    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        for idx in &mut self.repl_index {
            *idx = 0;
        }
    }
}

impl Default for UnderReplicatedBlocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_levels() {
        // salvageable: only decommissioning copies left
        assert_eq!(UnderReplicatedBlocks::priority(0, 1, 3), QUEUE_HIGHEST_PRIORITY);
        // lost: no copies at all
        assert_eq!(UnderReplicatedBlocks::priority(0, 0, 3), QUEUE_WITH_CORRUPT_BLOCKS);
        assert_eq!(UnderReplicatedBlocks::priority(1, 0, 3), QUEUE_SINGLE_REPLICA);
        // 2 live of 10 expected: severely under-replicated
        assert_eq!(UnderReplicatedBlocks::priority(2, 0, 10), QUEUE_VERY_UNDER_REPLICATED);
        assert_eq!(UnderReplicatedBlocks::priority(2, 0, 3), QUEUE_UNDER_REPLICATED);
        // target met: only queued for rack spread
        assert_eq!(UnderReplicatedBlocks::priority(3, 0, 3), QUEUE_REPLICAS_BADLY_DISTRIBUTED);
    }

    #[test]
    fn test_add_remove_update() {
        let mut queues = UnderReplicatedBlocks::new();
        assert!(queues.add(1, 2, 0, 3));
        assert!(!queues.add(1, 2, 0, 3));
        assert!(queues.contains(1));
        assert_eq!(queues.size(), 1);

        // one replica died: moves from L3 to L1
        queues.update(1, 1, 0, 3, -1, 0);
        assert_eq!(queues.iter_level(QUEUE_SINGLE_REPLICA).collect::<Vec<_>>(), vec![1]);
        assert_eq!(queues.size(), 1);

        assert!(queues.remove(1, 1, 0, 3));
        assert!(!queues.contains(1));
    }

    #[test]
    fn test_remove_falls_back_to_scan() {
        let mut queues = UnderReplicatedBlocks::new();
        queues.add(1, 1, 0, 3);
        // stale census pointing at the wrong bucket still removes it
        assert!(queues.remove(1, 2, 0, 3));
        assert!(!queues.contains(1));
    }

    #[test]
    fn test_choose_respects_priority_order_and_quota() {
        let mut queues = UnderReplicatedBlocks::new();
        queues.add(10, 1, 0, 3); // L1
        queues.add(20, 2, 0, 3); // L3
        queues.add(21, 2, 0, 3); // L3
        queues.add(30, 0, 1, 3); // L0

        let chosen = queues.choose_under_replicated(3);
        assert_eq!(chosen[QUEUE_HIGHEST_PRIORITY], vec![30]);
        assert_eq!(chosen[QUEUE_SINGLE_REPLICA], vec![10]);
        assert_eq!(chosen[QUEUE_UNDER_REPLICATED], vec![20]);
    }

    #[test]
    fn test_bookmark_round_robins_without_starvation() {
        let mut queues = UnderReplicatedBlocks::new();
        for id in 0..4 {
            queues.add(id, 2, 0, 3); // all L3
        }
        let first = queues.choose_under_replicated(2);
        let second = queues.choose_under_replicated(2);
        assert_eq!(first[QUEUE_UNDER_REPLICATED], vec![0, 1]);
        assert_eq!(second[QUEUE_UNDER_REPLICATED], vec![2, 3]);

        // quota not filled on the third pass: bookmarks reset
        let third = queues.choose_under_replicated(2);
        assert!(third[QUEUE_UNDER_REPLICATED].is_empty());
        let fourth = queues.choose_under_replicated(2);
        assert_eq!(fourth[QUEUE_UNDER_REPLICATED], vec![0, 1]);
    }
}
