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

use log::{debug, info};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use talus_common::state::Block;
use talus_common::utils::LocalTime;

struct NodeInvalidates {
    blocks: BTreeMap<i64, Block>,
    /// When this node's set was first populated; deletions are held back
    /// until the startup grace elapses.
    first_added_ms: u64,
}

/// Replicas queued for deletion, per node. Dispatch respects a startup
/// grace period so a restarted master cannot mass-delete based on state
/// it has not finished rebuilding.
pub struct InvalidateBlocks {
    map: HashMap<String, NodeInvalidates>,
    num_blocks: usize,
    startup_delay_ms: u64,
}

impl InvalidateBlocks {
    pub fn new(startup_delay_ms: u64) -> Self {
        Self {
            map: HashMap::new(),
            num_blocks: 0,
            startup_delay_ms,
        }
    }

    /// Queue `block` for deletion on `node`. Idempotent per `(block,
    /// node)`; re-adding refreshes the stored length/genstamp.
    pub fn add(&mut self, block: Block, node: &str, log: bool) -> bool {
        let entry = self
            .map
            .entry(node.to_string())
            .or_insert_with(|| NodeInvalidates {
                blocks: BTreeMap::new(),
                first_added_ms: LocalTime::mills(),
            });
        let newly = entry.blocks.insert(block.id, block).is_none();
        if newly {
            self.num_blocks += 1;
            if log {
                info!("{} is added to invalidSet of {}", block, node);
            }
        }
        newly
    }

    pub fn contains(&self, node: &str, block_id: i64) -> bool {
        self.map
            .get(node)
            .map(|e| e.blocks.contains_key(&block_id))
            .unwrap_or(false)
    }

    pub fn remove(&mut self, node: &str, block_id: i64) -> bool {
        let removed = match self.map.get_mut(node) {
            Some(entry) => entry.blocks.remove(&block_id).is_some(),
            None => false,
        };
        if removed {
            self.num_blocks -= 1;
            if self.map.get(node).map(|e| e.blocks.is_empty()).unwrap_or(false) {
                self.map.remove(node);
            }
        }
        removed
    }

    pub fn remove_node(&mut self, node: &str) {
        if let Some(entry) = self.map.remove(node) {
            self.num_blocks -= entry.blocks.len();
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_blocks_for(&self, node: &str) -> usize {
        self.map.get(node).map(|e| e.blocks.len()).unwrap_or(0)
    }

    /// Nodes that currently have deletions queued.
    pub fn nodes(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    /// Pull up to `limit` deletions for `node`. Returns nothing while the
    /// node's startup grace is still running.
    pub fn invalidate_work(&mut self, node: &str, limit: usize) -> Option<Vec<Block>> {
        let now = LocalTime::mills();
        let entry = self.map.get_mut(node)?;
        if now < entry.first_added_ms + self.startup_delay_ms {
            debug!(
                "invalidation of {} blocks on {} deferred during startup grace",
                entry.blocks.len(),
                node
            );
            return None;
        }

        let ids: Vec<i64> = entry.blocks.keys().take(limit).copied().collect();
        let blocks: Vec<Block> = ids
            .iter()
            .filter_map(|id| entry.blocks.remove(id))
            .collect();
        self.num_blocks -= blocks.len();
        if entry.blocks.is_empty() {
            self.map.remove(node);
        }
        if blocks.is_empty() {
            None
        } else {
            Some(blocks)
        }
    }

    pub fn dump(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            out,
            "Metasave: Blocks {} waiting deletion from {} datanodes.",
            self.num_blocks,
            self.map.len()
        )?;
        for (node, entry) in &self.map {
            let blocks: Vec<String> = entry.blocks.values().map(|b| b.to_string()).collect();
            writeln!(out, "{}: {}", node, blocks.join(" "))?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.num_blocks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_idempotent() {
        let mut inv = InvalidateBlocks::new(0);
        assert!(inv.add(Block::new(1, 10, 1), "dn-1", false));
        assert!(!inv.add(Block::new(1, 10, 1), "dn-1", false));
        assert_eq!(inv.num_blocks(), 1);
        assert!(inv.contains("dn-1", 1));

        assert!(inv.remove("dn-1", 1));
        assert!(!inv.remove("dn-1", 1));
        assert_eq!(inv.num_blocks(), 0);
    }

    #[test]
    fn test_invalidate_work_drains_in_id_order() {
        let mut inv = InvalidateBlocks::new(0);
        for id in [5, 2, 9, 1] {
            inv.add(Block::with_id(id), "dn-1", false);
        }
        let first = inv.invalidate_work("dn-1", 3).unwrap();
        let ids: Vec<i64> = first.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2, 5]);
        assert_eq!(inv.num_blocks(), 1);

        let rest = inv.invalidate_work("dn-1", 3).unwrap();
        assert_eq!(rest[0].id, 9);
        assert!(inv.invalidate_work("dn-1", 3).is_none());
    }

    #[test]
    fn test_startup_grace_defers_work() {
        let mut inv = InvalidateBlocks::new(60_000);
        inv.add(Block::with_id(1), "dn-1", false);
        assert!(inv.invalidate_work("dn-1", 10).is_none());
        // the entry is retained for later
        assert_eq!(inv.num_blocks(), 1);
    }

    #[test]
    fn test_remove_node_drops_all() {
        let mut inv = InvalidateBlocks::new(0);
        inv.add(Block::with_id(1), "dn-1", false);
        inv.add(Block::with_id(2), "dn-1", false);
        inv.add(Block::with_id(3), "dn-2", false);
        inv.remove_node("dn-1");
        assert_eq!(inv.num_blocks(), 1);
        assert!(!inv.contains("dn-1", 1));
        assert!(inv.contains("dn-2", 3));
    }
}
