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
use talus_common::state::{Block, BlockUcState, ReplicaState};
use talus_common::{err_box, FsResult};

/// One expected replica of a block in an active write pipeline.
#[derive(Debug, Clone)]
pub struct ReplicaUnderConstruction {
    pub storage: StorageRef,
    pub state: ReplicaState,
    pub chosen_as_primary: bool,
}

/// Extra state carried while a block is not yet `Complete`.
#[derive(Debug, Clone)]
pub struct UnderConstructionState {
    pub uc_state: BlockUcState,
    /// Locations the write pipeline is expected to land replicas on.
    pub expected_locations: Vec<ReplicaUnderConstruction>,
    /// Generation stamp of the latest initiated recovery.
    pub recovery_id: i64,
}

/// Per-storage link slot. Slots of one storage across many blocks form a
/// doubly-linked list threaded through the block records, headed at the
/// storage, so the storage can enumerate its blocks with no extra index.
#[derive(Debug, Clone)]
pub(crate) struct StorageSlot {
    pub node: String,
    pub storage_id: String,
    pub prev: Option<i64>,
    pub next: Option<i64>,
}

/// A block record: identity, owning file, replica edges and, while the
/// block is open, the pipeline state.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub block: Block,
    /// Owning block collection; `None` once the file is gone.
    pub bc_id: Option<i64>,
    pub(crate) slots: Vec<StorageSlot>,
    uc: Option<Box<UnderConstructionState>>,
}

impl BlockInfo {
    pub fn new_complete(block: Block, bc_id: i64) -> Self {
        Self {
            block,
            bc_id: Some(bc_id),
            slots: Vec::new(),
            uc: None,
        }
    }

    pub fn new_under_construction(block: Block, bc_id: i64, expected: Vec<StorageRef>) -> Self {
        Self {
            block,
            bc_id: Some(bc_id),
            slots: Vec::new(),
            uc: Some(Box::new(UnderConstructionState {
                uc_state: BlockUcState::UnderConstruction,
                expected_locations: expected
                    .into_iter()
                    .map(|storage| ReplicaUnderConstruction {
                        storage,
                        state: ReplicaState::Rbw,
                        chosen_as_primary: false,
                    })
                    .collect(),
                recovery_id: 0,
            })),
        }
    }

    pub fn id(&self) -> i64 {
        self.block.id
    }

    pub fn uc_state(&self) -> BlockUcState {
        self.uc
            .as_ref()
            .map(|u| u.uc_state)
            .unwrap_or(BlockUcState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.uc.is_none()
    }

    pub fn uc(&self) -> Option<&UnderConstructionState> {
        self.uc.as_deref()
    }

    pub fn num_storages(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn find_slot(&self, storage_id: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.storage_id == storage_id)
    }

    pub fn find_node_slot(&self, node: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.node == node)
    }

    pub fn storages(&self) -> impl Iterator<Item = StorageRef> + '_ {
        self.slots
            .iter()
            .map(|s| StorageRef::new(s.node.clone(), s.storage_id.clone()))
    }

    /// Client committed the block: adopt the client-reported length and
    /// generation stamp. Returns false if already committed.
    pub fn commit(&mut self, commit_block: &Block) -> FsResult<bool> {
        if commit_block.num_bytes < self.block.num_bytes {
            return err_box!(
                "commit length {} is less than the stored length {} of {}",
                commit_block.num_bytes,
                self.block.num_bytes,
                self.block
            );
        }
        let uc = match self.uc.as_mut() {
            Some(uc) => uc,
            None => {
                return err_box!("{} is already complete and cannot be committed", self.block)
            }
        };
        if uc.uc_state == BlockUcState::Committed {
            return Ok(false);
        }
        uc.uc_state = BlockUcState::Committed;
        self.block.num_bytes = commit_block.num_bytes;
        self.block.gen_stamp = commit_block.gen_stamp;
        Ok(true)
    }

    /// `Committed → Complete`. The record keeps its identity; only the
    /// construction extension is dropped.
    pub fn convert_to_complete(&mut self) {
        self.uc = None;
    }

    /// Reopen for append: attach a fresh pipeline with the given expected
    /// locations.
    pub fn convert_to_under_construction(&mut self, expected: Vec<StorageRef>) {
        self.uc = Some(Box::new(UnderConstructionState {
            uc_state: BlockUcState::UnderConstruction,
            expected_locations: expected
                .into_iter()
                .map(|storage| ReplicaUnderConstruction {
                    storage,
                    state: ReplicaState::Rbw,
                    chosen_as_primary: false,
                })
                .collect(),
            recovery_id: 0,
        }));
    }

    /// Start pipeline recovery under a new recovery generation stamp.
    pub fn init_recovery(&mut self, recovery_id: i64) -> FsResult<()> {
        match self.uc.as_mut() {
            Some(uc) => {
                uc.uc_state = BlockUcState::UnderRecovery;
                uc.recovery_id = recovery_id;
                Ok(())
            }
            None => err_box!("cannot recover completed {}", self.block),
        }
    }

    /// Recovery finished; the pipeline keeps writing.
    pub fn recovery_done(&mut self) {
        if let Some(uc) = self.uc.as_mut() {
            uc.uc_state = BlockUcState::UnderConstruction;
        }
    }

    /// Record a replica reported for the open pipeline, updating its
    /// state if the storage is already expected.
    pub fn add_uc_replica_if_not_present(
        &mut self,
        storage: StorageRef,
        _reported: &Block,
        state: ReplicaState,
    ) {
        if let Some(uc) = self.uc.as_mut() {
            if let Some(existing) = uc
                .expected_locations
                .iter_mut()
                .find(|r| r.storage == storage)
            {
                existing.state = state;
            } else {
                uc.expected_locations.push(ReplicaUnderConstruction {
                    storage,
                    state,
                    chosen_as_primary: false,
                });
            }
        }
    }
}
