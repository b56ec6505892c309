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

use super::DatanodeStorageInfo;
use std::collections::HashMap;
use std::collections::VecDeque;
use talus_common::state::{DatanodeCommand, DatanodeId, DatanodeStorage};

/// Administrative lifecycle of a datanode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    Normal,
    DecommissionInProgress,
    Decommissioned,
}

/// Replication progress recorded while a node is decommissioning.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecommissioningStatus {
    pub under_replicated_blocks: usize,
    pub decommission_only_replicas: usize,
    pub under_replicated_in_open_files: usize,
}

/// Master-side record of one datanode: its storages, admin state and the
/// outgoing command queue drained by the heartbeat responder.
pub struct DatanodeDescriptor {
    pub id: DatanodeId,
    pub is_alive: bool,
    pub admin_state: AdminState,
    pub needs_key_update: bool,
    pub decommissioning_status: DecommissioningStatus,

    storages: HashMap<String, DatanodeStorageInfo>,
    commands: VecDeque<DatanodeCommand>,

    /// Replicate commands queued but not yet picked up.
    pending_replicate_cmds: usize,
    /// Work items between source selection and target selection.
    pending_repl_without_targets: usize,
}

impl DatanodeDescriptor {
    pub fn new(id: DatanodeId) -> Self {
        Self {
            id,
            is_alive: true,
            admin_state: AdminState::Normal,
            needs_key_update: false,
            decommissioning_status: DecommissioningStatus::default(),
            storages: HashMap::new(),
            commands: VecDeque::new(),
            pending_replicate_cmds: 0,
            pending_repl_without_targets: 0,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.id.uuid
    }

    pub fn rack(&self) -> &str {
        &self.id.location
    }

    pub fn is_decommissioned(&self) -> bool {
        self.admin_state == AdminState::Decommissioned
    }

    pub fn is_decommission_in_progress(&self) -> bool {
        self.admin_state == AdminState::DecommissionInProgress
    }

    pub fn get_storage(&self, storage_id: &str) -> Option<&DatanodeStorageInfo> {
        self.storages.get(storage_id)
    }

    pub fn get_storage_mut(&mut self, storage_id: &str) -> Option<&mut DatanodeStorageInfo> {
        self.storages.get_mut(storage_id)
    }

    /// Creates the storage record if the node reported an unknown storage
    /// id, and returns it.
    pub fn update_storage(&mut self, storage: &DatanodeStorage) -> &mut DatanodeStorageInfo {
        let uuid = self.id.uuid.clone();
        self.storages
            .entry(storage.storage_id.clone())
            .or_insert_with(|| DatanodeStorageInfo::new(&uuid, storage))
    }

    pub fn remove_storage(&mut self, storage_id: &str) -> Option<DatanodeStorageInfo> {
        self.storages.remove(storage_id)
    }

    pub fn storages(&self) -> impl Iterator<Item = &DatanodeStorageInfo> {
        self.storages.values()
    }

    pub fn storages_mut(&mut self) -> impl Iterator<Item = &mut DatanodeStorageInfo> {
        self.storages.values_mut()
    }

    pub fn num_blocks(&self) -> usize {
        self.storages.values().map(|s| s.num_blocks()).sum()
    }

    pub fn has_stale_storages(&self) -> bool {
        self.storages.values().any(|s| s.is_content_stale())
    }

    pub fn remaining(&self) -> i64 {
        self.storages.values().map(|s| s.remaining).sum()
    }

    /// Outbound replication load used by source-node selection.
    pub fn blocks_to_be_replicated(&self) -> usize {
        self.pending_replicate_cmds + self.pending_repl_without_targets
    }

    pub fn increment_pending_without_targets(&mut self) {
        self.pending_repl_without_targets += 1;
    }

    pub fn decrement_pending_without_targets(&mut self) {
        self.pending_repl_without_targets = self.pending_repl_without_targets.saturating_sub(1);
    }

    pub fn add_command(&mut self, cmd: DatanodeCommand) {
        if matches!(cmd, DatanodeCommand::Replicate { .. }) {
            self.pending_replicate_cmds += 1;
        }
        self.commands.push_back(cmd);
    }

    /// Drains the queue; called from the heartbeat response path.
    pub fn take_commands(&mut self) -> Vec<DatanodeCommand> {
        self.pending_replicate_cmds = 0;
        self.commands.drain(..).collect()
    }

    pub fn num_pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn clear_command_queue(&mut self) {
        self.pending_replicate_cmds = 0;
        self.pending_repl_without_targets = 0;
        self.commands.clear();
    }
}
