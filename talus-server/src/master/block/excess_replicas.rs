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

use fxhash::FxHashSet;
use std::collections::HashMap;

/// Surplus replicas chosen for removal, per node. Entries stay until the
/// node confirms the deletion through an incremental report.
#[derive(Default)]
pub struct ExcessReplicas {
    map: HashMap<String, FxHashSet<i64>>,
}

impl ExcessReplicas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: &str, block_id: i64) -> bool {
        self.map.entry(node.to_string()).or_default().insert(block_id)
    }

    pub fn remove(&mut self, node: &str, block_id: i64) -> bool {
        match self.map.get_mut(node) {
            Some(blocks) => {
                let removed = blocks.remove(&block_id);
                if blocks.is_empty() {
                    self.map.remove(node);
                }
                removed
            }
            None => false,
        }
    }

    pub fn contains(&self, node: &str, block_id: i64) -> bool {
        self.map
            .get(node)
            .map(|blocks| blocks.contains(&block_id))
            .unwrap_or(false)
    }

    pub fn num_for_node(&self, node: &str) -> usize {
        self.map.get(node).map(|b| b.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_roundtrip() {
        let mut excess = ExcessReplicas::new();
        assert!(excess.add("dn-1", 1));
        assert!(!excess.add("dn-1", 1));
        assert!(excess.add("dn-1", 2));
        assert!(excess.add("dn-2", 1));
        assert_eq!(excess.len(), 3);
        assert_eq!(excess.num_for_node("dn-1"), 2);

        assert!(excess.contains("dn-1", 1));
        assert!(excess.remove("dn-1", 1));
        assert!(!excess.remove("dn-1", 1));
        assert!(!excess.contains("dn-1", 1));
        assert_eq!(excess.len(), 2);
    }
}
