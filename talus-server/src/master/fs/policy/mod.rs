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

use crate::master::node::NodeSnapshot;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use talus_common::state::StorageType;

/// One placement request. Captured under the namespace lock; the policy
/// itself runs without it.
#[derive(Debug, Clone, Default)]
pub struct ChooseContext {
    /// Path the block belongs to.
    pub src: String,
    pub num_replicas: usize,
    /// Hostname of the writing client, if it runs on a cluster node.
    pub client: Option<String>,
    /// Storages that already hold (or will hold) a replica.
    pub chosen: Vec<TargetStorage>,
    /// Return `chosen` as part of the result.
    pub return_chosen: bool,
    /// Node uuids that must not be targeted.
    pub excluded: HashSet<String>,
    pub block_size: i64,
}

impl ChooseContext {
    pub fn with_num(src: impl Into<String>, num_replicas: usize, block_size: i64) -> Self {
        Self {
            src: src.into(),
            num_replicas,
            block_size,
            ..Default::default()
        }
    }
}

/// A storage selected to receive a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStorage {
    pub node_uuid: String,
    pub storage_id: String,
    pub storage_type: StorageType,
    pub rack: String,
}

/// A replica considered for deletion by the over-replication reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaCandidate {
    pub node_uuid: String,
    pub storage_id: String,
    pub storage_type: StorageType,
    pub rack: String,
    pub remaining: i64,
}

/// Candidates bucketed by how many replicas their rack holds. Removing a
/// replica from a rack in `more_than_one` cannot reduce rack diversity.
#[derive(Debug, Default)]
pub struct RackBuckets {
    rack_counts: HashMap<String, usize>,
    pub more_than_one: Vec<ReplicaCandidate>,
    pub exactly_one: Vec<ReplicaCandidate>,
}

impl RackBuckets {
    pub fn build(candidates: &[ReplicaCandidate]) -> Self {
        let mut rack_counts: HashMap<String, usize> = HashMap::new();
        for c in candidates {
            *rack_counts.entry(c.rack.clone()).or_insert(0) += 1;
        }

        let mut buckets = RackBuckets {
            rack_counts,
            more_than_one: Vec::new(),
            exactly_one: Vec::new(),
        };
        for c in candidates {
            if buckets.rack_counts[&c.rack] > 1 {
                buckets.more_than_one.push(c.clone());
            } else {
                buckets.exactly_one.push(c.clone());
            }
        }
        buckets
    }

    pub fn in_more_than_one(&self, c: &ReplicaCandidate) -> bool {
        self.more_than_one.contains(c)
    }

    /// Rebalance after `chosen` was picked as a victim.
    pub fn remove_chosen(&mut self, chosen: &ReplicaCandidate) {
        self.more_than_one.retain(|c| c != chosen);
        self.exactly_one.retain(|c| c != chosen);

        let count = match self.rack_counts.get_mut(&chosen.rack) {
            Some(v) => {
                *v -= 1;
                *v
            }
            None => return,
        };
        if count == 0 {
            self.rack_counts.remove(&chosen.rack);
        } else if count == 1 {
            // the rack's last replica can no longer be removed freely
            if let Some(pos) = self
                .more_than_one
                .iter()
                .position(|c| c.rack == chosen.rack)
            {
                let moved = self.more_than_one.remove(pos);
                self.exactly_one.push(moved);
            }
        }
    }
}

/// Pluggable replica placement strategy.
pub trait BlockPlacementPolicy: Send + Sync {
    /// Choose up to `ctx.num_replicas` target storages from `cluster`.
    /// Fewer targets than requested is not an error; the caller decides
    /// whether the result is sufficient.
    fn choose_target(&self, ctx: &ChooseContext, cluster: &[NodeSnapshot]) -> Vec<TargetStorage>;

    /// Choose an excess replica to drop, preferring victims whose removal
    /// keeps every rack populated.
    fn choose_replica_to_delete(&self, buckets: &RackBuckets) -> Option<ReplicaCandidate>;
}

/// Default strategy: spread replicas across racks, write-local when the
/// client runs on a cluster node, free space as the tie-breaker.
#[derive(Debug, Default)]
pub struct DefaultPlacementPolicy;

impl DefaultPlacementPolicy {
    fn pick_storage(node: &NodeSnapshot, block_size: i64) -> Option<(String, StorageType)> {
        node.storages
            .iter()
            .filter(|s| s.remaining >= block_size)
            .max_by_key(|s| s.remaining)
            .map(|s| (s.storage_id.clone(), s.storage_type))
    }
}

impl BlockPlacementPolicy for DefaultPlacementPolicy {
    fn choose_target(&self, ctx: &ChooseContext, cluster: &[NodeSnapshot]) -> Vec<TargetStorage> {
        let mut rng = rand::thread_rng();
        let chosen_nodes: HashSet<&str> =
            ctx.chosen.iter().map(|t| t.node_uuid.as_str()).collect();

        let mut usable: Vec<&NodeSnapshot> = cluster
            .iter()
            .filter(|n| {
                n.alive
                    && n.admin_normal
                    && !ctx.excluded.contains(&n.uuid)
                    && !chosen_nodes.contains(n.uuid.as_str())
                    && Self::pick_storage(n, ctx.block_size).is_some()
            })
            .collect();

        let mut racks_used: HashSet<String> =
            ctx.chosen.iter().map(|t| t.rack.clone()).collect();
        let mut results: Vec<TargetStorage> = Vec::new();

        while results.len() < ctx.num_replicas && !usable.is_empty() {
            // writer-local node first, then rack spread, then anywhere
            let pick_idx = if results.is_empty() && ctx.chosen.is_empty() {
                ctx.client
                    .as_deref()
                    .and_then(|host| usable.iter().position(|n| n.hostname == host))
            } else {
                None
            };

            let idx = match pick_idx {
                Some(i) => i,
                None => {
                    let fresh_racks: Vec<usize> = usable
                        .iter()
                        .enumerate()
                        .filter(|(_, n)| !racks_used.contains(&n.rack))
                        .map(|(i, _)| i)
                        .collect();
                    match fresh_racks.choose(&mut rng) {
                        Some(i) => *i,
                        None => match (0..usable.len()).collect::<Vec<_>>().choose(&mut rng) {
                            Some(i) => *i,
                            None => break,
                        },
                    }
                }
            };

            let node = usable.swap_remove(idx);
            let (storage_id, storage_type) = match Self::pick_storage(node, ctx.block_size) {
                Some(v) => v,
                None => continue,
            };
            racks_used.insert(node.rack.clone());
            results.push(TargetStorage {
                node_uuid: node.uuid.clone(),
                storage_id,
                storage_type,
                rack: node.rack.clone(),
            });
        }

        if ctx.return_chosen {
            let mut all = ctx.chosen.clone();
            all.extend(results);
            all
        } else {
            results
        }
    }

    fn choose_replica_to_delete(&self, buckets: &RackBuckets) -> Option<ReplicaCandidate> {
        let pool = if !buckets.more_than_one.is_empty() {
            &buckets.more_than_one
        } else {
            &buckets.exactly_one
        };
        pool.iter().min_by_key(|c| c.remaining).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::node::StorageSnapshot;

    fn node(uuid: &str, rack: &str, remaining: i64) -> NodeSnapshot {
        NodeSnapshot {
            uuid: uuid.to_string(),
            hostname: format!("host-{}", uuid),
            rack: rack.to_string(),
            remaining,
            alive: true,
            admin_normal: true,
            storages: vec![StorageSnapshot {
                storage_id: format!("{}-s1", uuid),
                storage_type: StorageType::Disk,
                remaining,
            }],
        }
    }

    fn candidate(uuid: &str, rack: &str, remaining: i64) -> ReplicaCandidate {
        ReplicaCandidate {
            node_uuid: uuid.to_string(),
            storage_id: format!("{}-s1", uuid),
            storage_type: StorageType::Disk,
            rack: rack.to_string(),
            remaining,
        }
    }

    #[test]
    fn test_choose_target_spreads_racks() {
        let cluster = vec![
            node("dn-1", "/rack-a", 100),
            node("dn-2", "/rack-a", 100),
            node("dn-3", "/rack-b", 100),
        ];
        let policy = DefaultPlacementPolicy;
        let ctx = ChooseContext::with_num("/f", 2, 10);
        let targets = policy.choose_target(&ctx, &cluster);
        assert_eq!(targets.len(), 2);
        let racks: HashSet<_> = targets.iter().map(|t| t.rack.clone()).collect();
        assert_eq!(racks.len(), 2);
    }

    #[test]
    fn test_choose_target_respects_exclusions() {
        let cluster = vec![node("dn-1", "/rack-a", 100), node("dn-2", "/rack-a", 100)];
        let policy = DefaultPlacementPolicy;
        let mut ctx = ChooseContext::with_num("/f", 2, 10);
        ctx.excluded.insert("dn-1".to_string());
        let targets = policy.choose_target(&ctx, &cluster);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].node_uuid, "dn-2");
    }

    #[test]
    fn test_choose_target_skips_full_storages() {
        let cluster = vec![node("dn-1", "/rack-a", 5)];
        let policy = DefaultPlacementPolicy;
        let ctx = ChooseContext::with_num("/f", 1, 10);
        assert!(policy.choose_target(&ctx, &cluster).is_empty());
    }

    #[test]
    fn test_rack_buckets_rebalance() {
        let a1 = candidate("dn-1", "/rack-a", 10);
        let a2 = candidate("dn-2", "/rack-a", 20);
        let b1 = candidate("dn-3", "/rack-b", 30);
        let mut buckets = RackBuckets::build(&[a1.clone(), a2.clone(), b1.clone()]);
        assert_eq!(buckets.more_than_one.len(), 2);
        assert_eq!(buckets.exactly_one, vec![b1.clone()]);

        buckets.remove_chosen(&a1);
        // rack-a dropped to one replica; dn-2 is no longer a free victim
        assert!(buckets.more_than_one.is_empty());
        assert_eq!(buckets.exactly_one.len(), 2);
    }

    #[test]
    fn test_choose_replica_to_delete_prefers_crowded_racks() {
        let a1 = candidate("dn-1", "/rack-a", 50);
        let a2 = candidate("dn-2", "/rack-a", 20);
        let b1 = candidate("dn-3", "/rack-b", 5);
        let buckets = RackBuckets::build(&[a1, a2.clone(), b1]);
        let policy = DefaultPlacementPolicy;
        // dn-3 has the least space but sits alone on its rack
        assert_eq!(policy.choose_replica_to_delete(&buckets), Some(a2));
    }
}
