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

use super::{AdminState, DatanodeDescriptor, DatanodeStorageInfo};
use fxhash::FxHashSet;
use log::info;
use std::collections::HashMap;
use talus_common::state::{DatanodeId, DatanodeStorage, StorageType};

/// Placement-visible facts about one storage.
#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub storage_id: String,
    pub storage_type: StorageType,
    pub remaining: i64,
}

/// Placement-visible facts about one node, captured under the lock so the
/// placement policy can run without it.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub uuid: String,
    pub hostname: String,
    pub rack: String,
    pub remaining: i64,
    pub alive: bool,
    pub admin_normal: bool,
    pub storages: Vec<StorageSnapshot>,
}

/// Registry of datanodes known to the master. Membership events arrive
/// from the heartbeat subsystem; the block manager reads and annotates.
#[derive(Default)]
pub struct NodeManager {
    nodes: HashMap<String, DatanodeDescriptor>,
    racks_ever_seen: FxHashSet<String>,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node(&mut self, id: DatanodeId) -> &mut DatanodeDescriptor {
        self.racks_ever_seen.insert(id.location.clone());
        let uuid = id.uuid.clone();
        self.nodes
            .entry(uuid)
            .or_insert_with(|| DatanodeDescriptor::new(id))
    }

    pub fn remove_node(&mut self, uuid: &str) -> Option<DatanodeDescriptor> {
        self.nodes.remove(uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<&DatanodeDescriptor> {
        self.nodes.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut DatanodeDescriptor> {
        self.nodes.get_mut(uuid)
    }

    pub fn get_storage(&self, uuid: &str, storage_id: &str) -> Option<&DatanodeStorageInfo> {
        self.nodes.get(uuid).and_then(|n| n.get_storage(storage_id))
    }

    pub fn get_storage_mut(
        &mut self,
        uuid: &str,
        storage_id: &str,
    ) -> Option<&mut DatanodeStorageInfo> {
        self.nodes
            .get_mut(uuid)
            .and_then(|n| n.get_storage_mut(storage_id))
    }

    pub fn update_storage(
        &mut self,
        uuid: &str,
        storage: &DatanodeStorage,
    ) -> Option<&mut DatanodeStorageInfo> {
        self.nodes.get_mut(uuid).map(|n| n.update_storage(storage))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatanodeDescriptor> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DatanodeDescriptor> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_alive).count()
    }

    /// Whether more than one rack has ever joined. With a single rack the
    /// rack-diversity predicate is vacuously satisfied.
    pub fn has_cluster_ever_been_multi_rack(&self) -> bool {
        self.racks_ever_seen.len() > 1
    }

    pub fn start_decommission(&mut self, uuid: &str) {
        if let Some(node) = self.nodes.get_mut(uuid) {
            if node.admin_state == AdminState::Normal {
                info!("Starting decommission of {}", node.id);
                node.admin_state = AdminState::DecommissionInProgress;
            }
        }
    }

    pub fn finish_decommission(&mut self, uuid: &str) {
        if let Some(node) = self.nodes.get_mut(uuid) {
            node.admin_state = AdminState::Decommissioned;
        }
    }

    pub fn stop_decommission(&mut self, uuid: &str) {
        if let Some(node) = self.nodes.get_mut(uuid) {
            node.admin_state = AdminState::Normal;
        }
    }

    /// After a failover every storage must re-report before its contents
    /// can drive deletions again.
    pub fn mark_all_storages_stale(&mut self) {
        for node in self.nodes.values_mut() {
            for storage in node.storages_mut() {
                storage.mark_stale_after_failover();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.nodes
            .values()
            .map(|n| NodeSnapshot {
                uuid: n.id.uuid.clone(),
                hostname: n.id.hostname.clone(),
                rack: n.id.location.clone(),
                remaining: n.remaining(),
                alive: n.is_alive,
                admin_normal: n.admin_state == AdminState::Normal,
                storages: n
                    .storages()
                    .map(|s| StorageSnapshot {
                        storage_id: s.storage_id.clone(),
                        storage_type: s.storage_type,
                        remaining: s.remaining,
                    })
                    .collect(),
            })
            .collect()
    }
}
