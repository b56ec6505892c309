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

use log::info;
use std::collections::{BTreeMap, HashMap};

/// Why a replica was flagged corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    None,
    Any,
    GenstampMismatch,
    SizeMismatch,
    InvalidState,
    CorruptionReported,
}

/// Replicas flagged corrupt, per block: block id → node uuid → reason.
/// A block is lost only when every replica ends up here.
#[derive(Default)]
pub struct CorruptReplicas {
    map: BTreeMap<i64, HashMap<String, CorruptReason>>,
}

impl CorruptReplicas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag `(block, node)`. Idempotent; re-adding updates the reason.
    /// Returns true if the pair was newly flagged.
    pub fn add(&mut self, block_id: i64, node: &str, reason: CorruptReason) -> bool {
        let nodes = self.map.entry(block_id).or_default();
        let newly = !nodes.contains_key(node);
        if newly {
            info!(
                "blk_{} added as corrupt on {}, reason: {:?}, total corrupt replicas: {}",
                block_id,
                node,
                reason,
                nodes.len() + 1
            );
        }
        nodes.insert(node.to_string(), reason);
        newly
    }

    pub fn is_corrupt(&self, block_id: i64, node: &str) -> bool {
        self.map
            .get(&block_id)
            .map(|nodes| nodes.contains_key(node))
            .unwrap_or(false)
    }

    /// Unflag `(block, node)` regardless of the recorded reason.
    pub fn remove_node(&mut self, block_id: i64, node: &str) -> bool {
        self.remove_node_for_reason(block_id, node, CorruptReason::Any)
    }

    /// Unflag `(block, node)` only if the recorded reason matches (or
    /// `Any` was passed).
    pub fn remove_node_for_reason(
        &mut self,
        block_id: i64,
        node: &str,
        reason: CorruptReason,
    ) -> bool {
        let nodes = match self.map.get_mut(&block_id) {
            Some(v) => v,
            None => return false,
        };
        let matches = match nodes.get(node) {
            Some(stored) => reason == CorruptReason::Any || *stored == reason,
            None => false,
        };
        if !matches {
            return false;
        }
        nodes.remove(node);
        if nodes.is_empty() {
            self.map.remove(&block_id);
        }
        true
    }

    pub fn remove_block(&mut self, block_id: i64) -> bool {
        self.map.remove(&block_id).is_some()
    }

    pub fn nodes(&self, block_id: i64) -> Vec<String> {
        self.map
            .get(&block_id)
            .map(|nodes| nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn num_corrupt_replicas(&self, block_id: i64) -> usize {
        self.map.get(&block_id).map(|n| n.len()).unwrap_or(0)
    }

    /// Number of blocks with at least one corrupt replica.
    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Up to `count` corrupt block ids after `start_after`, in id order;
    /// paging cursor for admin tooling.
    pub fn block_ids_from(&self, count: usize, start_after: Option<i64>) -> Vec<i64> {
        let iter: Box<dyn Iterator<Item = &i64>> = match start_after {
            Some(start) => Box::new(self.map.range((start + 1)..).map(|(k, _)| k)),
            None => Box::new(self.map.keys()),
        };
        iter.take(count).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &HashMap<String, CorruptReason>)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut corrupt = CorruptReplicas::new();
        assert!(corrupt.add(1, "dn-1", CorruptReason::GenstampMismatch));
        assert!(!corrupt.add(1, "dn-1", CorruptReason::SizeMismatch));
        assert_eq!(corrupt.num_corrupt_replicas(1), 1);
        assert_eq!(corrupt.size(), 1);
        assert!(corrupt.is_corrupt(1, "dn-1"));
        assert!(!corrupt.is_corrupt(1, "dn-2"));
    }

    #[test]
    fn test_remove_by_reason() {
        let mut corrupt = CorruptReplicas::new();
        corrupt.add(1, "dn-1", CorruptReason::SizeMismatch);
        // wrong reason leaves the entry alone
        assert!(!corrupt.remove_node_for_reason(1, "dn-1", CorruptReason::GenstampMismatch));
        assert!(corrupt.is_corrupt(1, "dn-1"));

        assert!(corrupt.remove_node_for_reason(1, "dn-1", CorruptReason::SizeMismatch));
        assert_eq!(corrupt.size(), 0);
    }

    #[test]
    fn test_remove_block_and_paging() {
        let mut corrupt = CorruptReplicas::new();
        for id in [5, 1, 9, 3] {
            corrupt.add(id, "dn-1", CorruptReason::Any);
        }
        assert_eq!(corrupt.block_ids_from(10, None), vec![1, 3, 5, 9]);
        assert_eq!(corrupt.block_ids_from(2, Some(1)), vec![3, 5]);

        assert!(corrupt.remove_block(3));
        assert_eq!(corrupt.block_ids_from(10, None), vec![1, 5, 9]);
    }
}
