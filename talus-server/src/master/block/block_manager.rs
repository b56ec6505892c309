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

use super::{
    BlockKeyManager, BlockTokenIssuer, BlocksMap, CorruptReason, CorruptReplicas, ExcessReplicas,
    InvalidateBlocks, NumberReplicas, PendingDatanodeMessages, PendingReplications,
    UnderReplicatedBlocks,
};
use crate::master::block::block_info::BlockInfo;
use crate::master::block::replication_monitor::{PendingReplicationMonitor, ReplicationMonitor};
use crate::master::fs::policy::{BlockPlacementPolicy, ChooseContext, RackBuckets, ReplicaCandidate, TargetStorage};
use crate::master::fs::{BlockCollection, Namesystem};
use crate::master::node::{NodeManager, StorageRef};
use crate::master::MasterMonitor;
use fxhash::FxHashSet;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rand::Rng;
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use talus_common::conf::MasterConf;
use talus_common::runtime::LoopRunner;
use talus_common::state::{
    Block, BlockUcState, DataEncryptionKey, DatanodeCommand, DatanodeId, DatanodeStorage,
    ExtendedBlock, LocatedBlock, LocatedBlocks, ReceivedDeletedBlock, ReplicaState,
    ReportedBlock, ReportedBlockStatus, StorageLocation, TokenAccessMode, BLOCK_NO_ACK,
};
use talus_common::utils::TimeSpent;
use talus_common::{err_box, FsError, FsResult};

/// Outcome of classifying one block during the mis-replication scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisReplicationResult {
    /// Orphaned; queued for deletion everywhere.
    Invalid,
    UnderReplicated,
    OverReplicated,
    /// Stale storages make the census untrustworthy.
    Postpone,
    UnderConstruction,
    Ok,
}

/// A replica that a report proved wrong, carried to the corruption path.
#[derive(Debug, Clone)]
pub(crate) struct BlockToMarkCorrupt {
    pub block_id: i64,
    /// Generation stamp of the bad on-disk replica; the deletion command
    /// must name it, not the stored one.
    pub corrupt_gs: i64,
    pub reason: String,
    pub reason_code: CorruptReason,
}

/// Everything guarded by the namespace-global lock. The block map is the
/// single source of truth; the queues are caches that every mutation
/// keeps consistent with it before the lock is released.
pub(crate) struct BmState {
    pub blocks_map: BlocksMap,
    pub corrupt_replicas: CorruptReplicas,
    pub invalidate_blocks: InvalidateBlocks,
    pub excess_replicas: ExcessReplicas,
    pub needed_replications: UnderReplicatedBlocks,
    pub pending_replications: PendingReplications,
    pub pending_messages: PendingDatanodeMessages,
    pub postponed_misreplicated: FxHashSet<i64>,
    pub nodes: NodeManager,
    /// Standby behavior: defer instead of judging stale evidence.
    pub postpone_blocks_from_future: bool,
}

/// The block manager: the authoritative block → storage index plus the
/// machinery that converges every file back to its replication target.
#[derive(Clone)]
pub struct BlockManager {
    pub(crate) conf: Arc<MasterConf>,
    pub(crate) ns: Arc<dyn Namesystem>,
    pub(crate) monitor: MasterMonitor,
    pub(crate) placement: Arc<dyn BlockPlacementPolicy>,
    pub(crate) token_issuer: Option<Arc<dyn BlockTokenIssuer>>,
    pub(crate) state: Arc<RwLock<BmState>>,

    excess_blocks_count: Arc<AtomicI64>,
    postponed_blocks_count: Arc<AtomicI64>,
    scheduled_repl_count: Arc<AtomicI64>,
    scan_progress_bits: Arc<AtomicU64>,
    pub(crate) scan_stop: Arc<AtomicBool>,
    scan_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    workers: Arc<Mutex<Vec<LoopRunner>>>,
}

impl BlockManager {
    pub fn new(
        conf: MasterConf,
        ns: Arc<dyn Namesystem>,
        monitor: MasterMonitor,
        placement: Arc<dyn BlockPlacementPolicy>,
    ) -> FsResult<Self> {
        conf.validate()?;
        let token_issuer: Option<Arc<dyn BlockTokenIssuer>> = if conf.block_token_enable {
            Some(Arc::new(BlockKeyManager::new(
                conf.block_key_update_interval_ms,
                conf.block_token_lifetime_ms,
                conf.data_encryption_algorithm.clone(),
            )))
        } else {
            None
        };

        info!(
            "BlockManager: min={} max={} default={} maxStreams={} recheck={}ms",
            conf.replication_min,
            conf.replication_max,
            conf.replication_default,
            conf.replication_max_streams,
            conf.replication_interval_ms
        );

        let state = BmState {
            blocks_map: BlocksMap::new(conf.blocks_map_capacity),
            corrupt_replicas: CorruptReplicas::new(),
            invalidate_blocks: InvalidateBlocks::new(conf.startup_delay_block_deletion_ms),
            excess_replicas: ExcessReplicas::new(),
            needed_replications: UnderReplicatedBlocks::new(),
            pending_replications: PendingReplications::new(conf.replication_pending_timeout_ms),
            pending_messages: PendingDatanodeMessages::new(),
            postponed_misreplicated: FxHashSet::default(),
            nodes: NodeManager::new(),
            postpone_blocks_from_future: false,
        };

        Ok(Self {
            conf: Arc::new(conf),
            ns,
            monitor,
            placement,
            token_issuer,
            state: Arc::new(RwLock::new(state)),
            excess_blocks_count: Arc::new(AtomicI64::new(0)),
            postponed_blocks_count: Arc::new(AtomicI64::new(0)),
            scheduled_repl_count: Arc::new(AtomicI64::new(0)),
            scan_progress_bits: Arc::new(AtomicU64::new(0)),
            scan_stop: Arc::new(AtomicBool::new(false)),
            scan_handle: Arc::new(Mutex::new(None)),
            workers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Start the background workers.
    pub fn activate(&self) {
        let mut workers = self.workers.lock();
        workers.push(LoopRunner::spawn_critical(
            "ReplicationMonitor",
            self.conf.replication_interval(),
            ReplicationMonitor::new(self.clone()),
        ));
        let pending_tick = (self.conf.replication_pending_timeout_ms / 2).max(1_000);
        workers.push(LoopRunner::spawn(
            "PendingReplicationMonitor",
            std::time::Duration::from_millis(pending_tick),
            PendingReplicationMonitor::new(self.clone()),
        ));
    }

    pub fn close(&self) {
        self.monitor.stop();
        self.stop_replication_initializer();
        for worker in self.workers.lock().iter_mut() {
            worker.join();
        }
    }

    /// Replication and invalidation decisions are only made while this
    /// master is active and finished with startup safe mode.
    pub fn is_populating_repl_queues(&self) -> bool {
        self.monitor.is_active() && !self.ns.is_in_startup_safe_mode()
    }

    pub fn set_postpone_blocks_from_future(&self, postpone: bool) {
        self.state.write().postpone_blocks_from_future = postpone;
    }

    // ---- role transitions ----

    /// Become the active master: replay deferred reports, distrust every
    /// storage until it reports again, and rebuild the replication
    /// queues in the background.
    pub fn transition_to_active(&self) -> FsResult<()> {
        self.monitor.set_active(true);
        self.set_postpone_blocks_from_future(false);
        self.process_all_pending_messages()?;
        self.state.write().nodes.mark_all_storages_stale();
        self.process_misreplicated_blocks();
        Ok(())
    }

    pub fn transition_to_standby(&self) {
        self.monitor.set_active(false);
        self.set_postpone_blocks_from_future(true);
        self.stop_replication_initializer();
        self.clear_queues();
    }

    // ---- counters ----

    pub fn total_blocks(&self) -> usize {
        self.state.read().blocks_map.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.read().blocks_map.capacity()
    }

    pub fn pending_replication_count(&self) -> usize {
        self.state.read().pending_replications.size()
    }

    pub fn under_replicated_count(&self) -> usize {
        self.state.read().needed_replications.size()
    }

    pub fn under_replicated_not_missing_count(&self) -> usize {
        self.state.read().needed_replications.under_replicated_count()
    }

    pub fn missing_blocks_count(&self) -> usize {
        self.state.read().needed_replications.corrupt_count()
    }

    pub fn corrupt_replica_blocks_count(&self) -> usize {
        self.state.read().corrupt_replicas.size()
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.state.read().invalidate_blocks.num_blocks()
    }

    pub fn excess_blocks_count(&self) -> i64 {
        self.excess_blocks_count.load(Ordering::Relaxed)
    }

    pub fn postponed_misreplicated_blocks_count(&self) -> i64 {
        self.postponed_blocks_count.load(Ordering::Relaxed)
    }

    pub fn scheduled_replication_count(&self) -> i64 {
        self.scheduled_repl_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_scheduled_replication_count(&self, v: i64) {
        self.scheduled_repl_count.store(v, Ordering::Relaxed);
    }

    pub fn pending_message_count(&self) -> usize {
        self.state.read().pending_messages.count()
    }

    pub fn replication_queues_init_progress(&self) -> f64 {
        f64::from_bits(self.scan_progress_bits.load(Ordering::Relaxed))
    }

    pub fn corrupt_replica_block_ids(&self, count: usize, start_after: Option<i64>) -> Vec<i64> {
        self.state
            .read()
            .corrupt_replicas
            .block_ids_from(count.min(100), start_after)
    }

    // ---- node registry seam (membership events arrive from outside) ----

    pub fn register_datanode(&self, id: DatanodeId) {
        let mut state = self.state.write();
        let node = state.nodes.register_node(id);
        node.is_alive = true;
        node.needs_key_update = self.token_issuer.is_some();
    }

    pub fn register_storage(
        &self,
        node_uuid: &str,
        storage: &DatanodeStorage,
        capacity: i64,
        remaining: i64,
    ) -> FsResult<()> {
        let mut state = self.state.write();
        match state.nodes.update_storage(node_uuid, storage) {
            Some(info) => {
                info.capacity = capacity;
                info.remaining = remaining;
                Ok(())
            }
            None => Err(FsError::NodeNotFound(node_uuid.to_string())),
        }
    }

    /// Permanent node loss: scrub every edge and re-evaluate each block.
    pub fn remove_datanode(&self, node_uuid: &str) {
        let mut state = self.state.write();
        self.remove_blocks_associated_to_node(&mut state, node_uuid);
        state.nodes.remove_node(node_uuid);
    }

    pub fn start_decommission(&self, node_uuid: &str) {
        self.state.write().nodes.start_decommission(node_uuid);
    }

    /// Node re-commissioned: its replicas rejoin the live population and
    /// may now be surplus.
    pub fn stop_decommission(&self, node_uuid: &str) {
        let mut state = self.state.write();
        state.nodes.stop_decommission(node_uuid);
        if self.is_populating_repl_queues() {
            self.process_over_replicated_blocks_on_recommission(&mut state, node_uuid);
        }
    }

    /// Heartbeat responder seam: drain the node's command queue, leading
    /// with a key update when one is owed.
    pub fn take_datanode_commands(&self, node_uuid: &str) -> Vec<DatanodeCommand> {
        let mut state = self.state.write();
        let issuer = self.token_issuer.clone();
        match state.nodes.get_mut(node_uuid) {
            Some(node) => {
                let mut cmds = Vec::new();
                if let Some(issuer) = issuer {
                    if node.needs_key_update {
                        cmds.push(DatanodeCommand::KeyUpdate {
                            keys: issuer.export_keys(),
                        });
                        node.needs_key_update = false;
                    }
                }
                cmds.extend(node.take_commands());
                cmds
            }
            None => Vec::new(),
        }
    }

    /// Rotate access keys if due; marks every node for a key update.
    pub fn update_block_keys(&self) -> bool {
        let rotated = self
            .token_issuer
            .as_ref()
            .map(|t| t.update_keys())
            .unwrap_or(false);
        if rotated {
            let mut state = self.state.write();
            for node in state.nodes.iter_mut() {
                node.needs_key_update = true;
            }
        }
        rotated
    }

    pub fn generate_data_encryption_key(&self) -> Option<DataEncryptionKey> {
        if !self.conf.encrypt_data_transfer {
            return None;
        }
        self.token_issuer
            .as_ref()
            .and_then(|t| t.generate_data_encryption_key().ok())
    }

    // ---- replication parameters ----

    /// Clamp a requested replication into the configured range.
    pub fn adjust_replication(&self, replication: u16) -> u16 {
        replication
            .max(self.conf.replication_min)
            .min(self.conf.replication_max)
    }

    pub fn verify_replication(
        &self,
        src: &str,
        replication: u16,
        _client: Option<&str>,
    ) -> FsResult<()> {
        if replication >= self.conf.replication_min && replication <= self.conf.replication_max {
            return Ok(());
        }
        Err(FsError::Replication {
            src: src.to_string(),
            requested: replication,
            min: self.conf.replication_min,
            max: self.conf.replication_max,
        })
    }

    pub fn check_min_replication(&self, block_id: i64) -> bool {
        let state = self.state.read();
        Self::count_nodes_in(&state, block_id).live >= self.conf.replication_min as usize
    }

    pub fn is_sufficiently_replicated(&self, block_id: i64) -> bool {
        let state = self.state.read();
        let threshold = (self.conf.replication_min as usize).min(state.nodes.live_count());
        Self::count_nodes_in(&state, block_id).live >= threshold
    }

    pub fn count_nodes(&self, block_id: i64) -> NumberReplicas {
        Self::count_nodes_in(&self.state.read(), block_id)
    }

    // ---- namespace-facing block lifecycle ----

    /// Record a new block of `bc`. With `expected` locations the record
    /// starts under construction (the normal client write path);
    /// otherwise it is complete on arrival (edit replay).
    pub fn add_block_collection(
        &self,
        block: Block,
        bc_id: i64,
        expected: Option<Vec<StorageRef>>,
    ) {
        let mut state = self.state.write();
        let info = match expected {
            Some(expected) => BlockInfo::new_under_construction(block, bc_id, expected),
            None => {
                self.ns.adjust_safe_mode_block_totals(0, 1);
                BlockInfo::new_complete(block, bc_id)
            }
        };
        state.blocks_map.insert(info);
    }

    /// Commit the file's last block with the client-reported length and
    /// generation stamp; complete it if enough replicas are already
    /// known. Returns whether the commit changed state.
    pub fn commit_or_complete_last_block(
        &self,
        bc: &dyn BlockCollection,
        commit_block: Option<&Block>,
    ) -> FsResult<bool> {
        let commit_block = match commit_block {
            Some(b) => b,
            None => return Ok(false), // block allocation retry
        };
        let mut state = self.state.write();
        let last = match bc.last_block_id() {
            Some(id) => id,
            None => return Ok(false), // no blocks in file yet
        };
        let committed = match state.blocks_map.get_mut(last) {
            None => return Ok(false),
            Some(info) => {
                if info.is_complete() {
                    return Ok(false); // already completed, e.g. by recovery
                }
                info.commit(commit_block)?
            }
        };

        if Self::count_nodes_in(&state, last).live >= self.conf.replication_min as usize {
            self.complete_block(&mut state, last, false)?;
        }
        Ok(committed)
    }

    /// Standby replay: complete the block with whatever metadata is
    /// stored, regardless of replica count.
    pub fn force_complete_block(&self, _bc: &dyn BlockCollection, block_id: i64) -> FsResult<()> {
        let mut state = self.state.write();
        match state.blocks_map.get_mut(block_id) {
            None => Err(FsError::BlockNotFound(block_id)),
            Some(info) => {
                if info.is_complete() {
                    return Ok(());
                }
                let own = info.block;
                let _ = info.commit(&own)?;
                self.complete_block(&mut state, block_id, true)
            }
        }
    }

    fn complete_block(
        &self,
        state: &mut BmState,
        block_id: i64,
        force: bool,
    ) -> FsResult<()> {
        let min = self.conf.replication_min as usize;
        let info = state
            .blocks_map
            .get_mut(block_id)
            .ok_or(FsError::BlockNotFound(block_id))?;
        if info.is_complete() {
            return Ok(());
        }
        let num_nodes = info.num_storages();
        if !force && num_nodes < min {
            return err_box!(
                "Cannot complete {}: it does not satisfy the minimal replication requirement",
                info.block
            );
        }
        if !force && info.uc_state() != BlockUcState::Committed {
            return err_box!("Cannot complete {}: it has not been committed by the client", info.block);
        }
        info.convert_to_complete();

        // Complete blocks start counting toward safe mode; this one may
        // already be safe.
        self.ns.adjust_safe_mode_block_totals(0, 1);
        self.ns
            .increment_safe_block_count(num_nodes.min(min) as u16);
        Ok(())
    }

    /// Reopen the file's last block for append if it is partial. Returns
    /// its current locations for the new pipeline, or nothing when the
    /// file is empty or block-aligned.
    pub fn convert_last_block_to_under_construction(
        &self,
        bc: &dyn BlockCollection,
        client_name: &str,
    ) -> FsResult<Option<LocatedBlock>> {
        let mut state = self.state.write();
        let last = match bc.last_block_id() {
            Some(id) => id,
            None => return Ok(None),
        };
        let (block, targets) = match state.blocks_map.get_mut(last) {
            None => return Ok(None),
            Some(info) => {
                if info.block.num_bytes == bc.preferred_block_size() {
                    return Ok(None);
                }
                let targets: Vec<StorageRef> = info.storages().collect();
                info.convert_to_under_construction(targets.clone());
                (info.block, targets)
            }
        };

        // scrub every queue that still references the block
        let num = Self::count_nodes_in(&state, last);
        let expected = Self::replication_of(&*self.ns, &state, last);
        state
            .needed_replications
            .remove(last, num.live, num.decommissioned, expected);
        state.pending_replications.remove(last);
        for target in &targets {
            state.invalidate_blocks.remove(&target.node, last);
        }

        // under-construction blocks leave the safe-mode census
        let min = self.conf.replication_min as usize;
        let safe_delta = if targets.len() >= min { -1 } else { 0 };
        self.ns.adjust_safe_mode_block_totals(safe_delta, -1);

        let file_length: i64 = bc
            .block_ids()
            .iter()
            .filter_map(|id| state.blocks_map.get(*id))
            .map(|b| b.block.num_bytes)
            .sum();
        let pos = file_length - block.num_bytes;
        let locations = targets
            .iter()
            .filter_map(|t| Self::storage_location(&state, t))
            .collect();
        let mut lb = LocatedBlock::new(
            ExtendedBlock::new(self.ns.pool_id(), block),
            locations,
            pos,
        );
        self.set_block_token(&mut lb, client_name, TokenAccessMode::Write)?;
        Ok(Some(lb))
    }

    /// File closed: queue replication or surplus cleanup for any block
    /// off its target.
    pub fn check_replication(&self, bc: &dyn BlockCollection) {
        let mut state = self.state.write();
        let expected = bc.replication();
        for block_id in bc.block_ids() {
            let num = Self::count_nodes_in(&state, block_id);
            if self.is_needed_replication(&state, block_id, expected, num.live) {
                state
                    .needed_replications
                    .add(block_id, num.live, num.decommissioned, expected);
            } else if num.live > expected as usize {
                self.process_over_replicated_block(&mut state, block_id, expected, None, None);
            }
        }
    }

    /// Replication factor changed on `src`'s blocks.
    pub fn set_replication(&self, old_repl: u16, new_repl: u16, src: &str, blocks: &[i64]) {
        if old_repl == new_repl {
            return;
        }
        let mut state = self.state.write();
        let delta = new_repl as isize - old_repl as isize;
        for block_id in blocks {
            self.update_needed_replications(&mut state, *block_id, 0, delta);
        }
        if old_repl > new_repl {
            info!("Decreasing replication from {} to {} for {}", old_repl, new_repl, src);
            for block_id in blocks {
                self.process_over_replicated_block(&mut state, *block_id, new_repl, None, None);
            }
        } else {
            info!("Increasing replication from {} to {} for {}", old_repl, new_repl, src);
        }
    }

    /// The namespace dropped the block: purge it everywhere and tell all
    /// holders to delete (no acknowledgement expected).
    pub fn remove_block(&self, block_id: i64) {
        let mut state = self.state.write();
        let (mut block, storages) = match state.blocks_map.get(block_id) {
            None => return,
            Some(info) => (info.block, info.storages().collect::<Vec<_>>()),
        };
        block.num_bytes = BLOCK_NO_ACK;

        if self.is_populating_repl_queues() {
            for storage in &storages {
                if Self::storage_is_normal(&state, storage) {
                    state.invalidate_blocks.add(block, &storage.node, false);
                }
            }
        }
        state.corrupt_replicas.remove_block(block_id);
        for storage in &storages {
            let BmState {
                blocks_map, nodes, ..
            } = &mut *state;
            if let Some(info) = nodes.get_storage_mut(&storage.node, &storage.storage) {
                blocks_map.remove_from_storage_list(info, block_id);
            }
        }
        state.blocks_map.remove(block_id);
        state.pending_replications.remove(block_id);
        state.needed_replications.remove_all(block_id);
        if state.postponed_misreplicated.remove(&block_id) {
            self.postponed_blocks_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    // ---- target selection ----

    pub fn choose_target_for_new_block(
        &self,
        src: &str,
        num_replicas: usize,
        client: Option<&str>,
        excluded: HashSet<String>,
        block_size: i64,
    ) -> FsResult<Vec<TargetStorage>> {
        let cluster = self.state.read().nodes.snapshot();
        let ctx = ChooseContext {
            src: src.to_string(),
            num_replicas,
            client: client.map(|c| c.to_string()),
            chosen: Vec::new(),
            return_chosen: false,
            excluded,
            block_size,
        };
        let targets = self.placement.choose_target(&ctx, &cluster);
        if targets.len() < self.conf.replication_min as usize {
            return err_box!(
                "File {} could only be replicated to {} nodes instead of minReplication (={}); {} datanode(s) running",
                src,
                targets.len(),
                self.conf.replication_min,
                cluster.len()
            );
        }
        Ok(targets)
    }

    /// Extend an existing pipeline with additional nodes.
    pub fn choose_target_for_additional_datanode(
        &self,
        src: &str,
        num_additional: usize,
        chosen: Vec<TargetStorage>,
        excluded: HashSet<String>,
        block_size: i64,
    ) -> Vec<TargetStorage> {
        let cluster = self.state.read().nodes.snapshot();
        let ctx = ChooseContext {
            src: src.to_string(),
            num_replicas: num_additional,
            client: None,
            chosen,
            return_chosen: true,
            excluded,
            block_size,
        };
        self.placement.choose_target(&ctx, &cluster)
    }

    /// Single-node redirection target for HTTP access.
    pub fn choose_target_for_http(
        &self,
        src: &str,
        client: Option<&str>,
        excluded: HashSet<String>,
        block_size: i64,
    ) -> Vec<TargetStorage> {
        let cluster = self.state.read().nodes.snapshot();
        let ctx = ChooseContext {
            src: src.to_string(),
            num_replicas: 1,
            client: client.map(|c| c.to_string()),
            chosen: Vec::new(),
            return_chosen: false,
            excluded,
            block_size,
        };
        self.placement.choose_target(&ctx, &cluster)
    }

    // ---- reader locations ----

    /// Locations for the slice `[offset, offset + length)` of a file.
    pub fn create_located_blocks(
        &self,
        block_ids: &[i64],
        file_size_excluding_uc: i64,
        is_file_under_construction: bool,
        offset: i64,
        length: i64,
        need_token: bool,
        client_name: &str,
    ) -> FsResult<LocatedBlocks> {
        let state = self.state.read();
        if block_ids.is_empty() {
            return Ok(LocatedBlocks {
                file_length: 0,
                under_construction: is_file_under_construction,
                blocks: Vec::new(),
                last_block: None,
                last_block_complete: false,
            });
        }

        let mode = need_token.then_some(TokenAccessMode::Read);
        let mut blocks = Vec::new();
        let mut cur_pos = 0i64;
        let end_off = offset.saturating_add(length);
        for id in block_ids {
            let info = state
                .blocks_map
                .get(*id)
                .ok_or(FsError::BlockNotFound(*id))?;
            let size = info.block.num_bytes;
            if cur_pos + size > offset && cur_pos < end_off {
                blocks.push(self.make_located_block(&state, *id, cur_pos, client_name, mode)?);
            }
            cur_pos += size;
            if cur_pos >= end_off {
                break;
            }
        }

        let last_id = *block_ids.last().unwrap();
        let last_info = state
            .blocks_map
            .get(last_id)
            .ok_or(FsError::BlockNotFound(last_id))?;
        let last_complete = last_info.is_complete();
        let last_pos = if last_complete {
            file_size_excluding_uc - last_info.block.num_bytes
        } else {
            file_size_excluding_uc
        };
        let last_block =
            Some(self.make_located_block(&state, last_id, last_pos, client_name, mode)?);

        Ok(LocatedBlocks {
            file_length: file_size_excluding_uc,
            under_construction: is_file_under_construction,
            blocks,
            last_block,
            last_block_complete: last_complete,
        })
    }

    fn make_located_block(
        &self,
        state: &BmState,
        block_id: i64,
        pos: i64,
        client_name: &str,
        mode: Option<TokenAccessMode>,
    ) -> FsResult<LocatedBlock> {
        let info = state
            .blocks_map
            .get(block_id)
            .ok_or(FsError::BlockNotFound(block_id))?;
        let eb = ExtendedBlock::new(self.ns.pool_id(), info.block);

        if !info.is_complete() {
            let locations = info
                .uc()
                .map(|uc| {
                    uc.expected_locations
                        .iter()
                        .filter_map(|r| Self::storage_location(state, &r.storage))
                        .collect()
                })
                .unwrap_or_default();
            let mut lb = LocatedBlock::new(eb, locations, pos);
            if let Some(mode) = mode {
                self.set_block_token(&mut lb, client_name, mode)?;
            }
            return Ok(lb);
        }

        let num_corrupt_nodes = Self::count_nodes_in(state, block_id).corrupt;
        let num_corrupt_replicas = state.corrupt_replicas.num_corrupt_replicas(block_id);
        if num_corrupt_nodes != num_corrupt_replicas {
            warn!(
                "Inconsistent number of corrupt replicas for {}: blocksMap has {} but the corrupt replicas map has {}",
                info.block, num_corrupt_nodes, num_corrupt_replicas
            );
        }

        // readable copies first, corrupt ones as a last resort
        let mut live = Vec::new();
        let mut corrupt = Vec::new();
        for storage in info.storages() {
            let Some(loc) = Self::storage_location(state, &storage) else {
                continue;
            };
            if state.corrupt_replicas.is_corrupt(block_id, &storage.node) {
                corrupt.push(loc);
            } else {
                live.push(loc);
            }
        }
        let all_corrupt = info.num_storages() > 0 && live.is_empty();
        let mut locations = live;
        locations.extend(corrupt);

        let mut lb = LocatedBlock::new(eb, locations, pos);
        lb.corrupt = all_corrupt;
        if let Some(mode) = mode {
            self.set_block_token(&mut lb, client_name, mode)?;
        }
        Ok(lb)
    }

    fn set_block_token(
        &self,
        lb: &mut LocatedBlock,
        client_name: &str,
        mode: TokenAccessMode,
    ) -> FsResult<()> {
        if let Some(issuer) = &self.token_issuer {
            lb.token = Some(issuer.generate_token(client_name, &lb.block, &[mode])?);
        }
        Ok(())
    }

    /// Roughly `size` bytes of `(block, locations)` pairs sampled from a
    /// node, starting at a random offset in its block list; balancer
    /// input.
    pub fn get_blocks(
        &self,
        node_uuid: &str,
        size: i64,
    ) -> FsResult<Vec<(Block, Vec<StorageLocation>)>> {
        let state = self.state.read();
        let node = state
            .nodes
            .get(node_uuid)
            .ok_or_else(|| FsError::NodeNotFound(node_uuid.to_string()))?;

        let mut all: Vec<i64> = Vec::with_capacity(node.num_blocks());
        for storage in node.storages() {
            all.extend(state.blocks_map.storage_block_ids(storage));
        }
        if all.is_empty() {
            return Ok(Vec::new());
        }

        let start = rand::thread_rng().gen_range(0..all.len());
        let mut results = Vec::new();
        let mut total = 0i64;
        for i in 0..all.len() {
            if total >= size {
                break;
            }
            let id = all[(start + i) % all.len()];
            let info = match state.blocks_map.get(id) {
                Some(info) if info.is_complete() => info,
                _ => continue,
            };
            let locations: Vec<StorageLocation> = info
                .storages()
                .filter(|s| !state.invalidate_blocks.contains(&s.node, id))
                .filter_map(|s| Self::storage_location(&state, &s))
                .collect();
            if locations.is_empty() {
                continue;
            }
            total += info.block.num_bytes;
            results.push((info.block, locations));
        }
        Ok(results)
    }

    // ---- corruption ----

    /// A scanner or client proved a specific replica bad.
    pub fn find_and_mark_block_as_corrupt(
        &self,
        blk: &ExtendedBlock,
        node_uuid: &str,
        storage_id: Option<&str>,
        reason: &str,
    ) -> FsResult<()> {
        let mut state = self.state.write();
        if state.blocks_map.get(blk.block.id).is_none() {
            // a datanode may report a bad replica before its first full
            // report introduces the block
            info!("findAndMarkBlockAsCorrupt: {} not found", blk.block);
            return Ok(());
        }
        if state.nodes.get(node_uuid).is_none() {
            return err_box!(
                "Cannot mark {} as corrupt because datanode {} does not exist",
                blk.block,
                node_uuid
            );
        }
        let to_mark = BlockToMarkCorrupt {
            block_id: blk.block.id,
            corrupt_gs: blk.block.gen_stamp,
            reason: reason.to_string(),
            reason_code: CorruptReason::CorruptionReported,
        };
        let storage = storage_id.map(|sid| StorageRef::new(node_uuid, sid));
        self.mark_block_as_corrupt(&mut state, to_mark, storage, node_uuid)
    }

    pub(crate) fn mark_block_as_corrupt(
        &self,
        state: &mut BmState,
        to_mark: BlockToMarkCorrupt,
        storage: Option<StorageRef>,
        node_uuid: &str,
    ) -> FsResult<()> {
        let block_id = to_mark.block_id;
        let (bc_id, stored_block) = match state.blocks_map.get(block_id) {
            Some(info) => (info.bc_id, info.block),
            None => return Ok(()),
        };
        let bc = bc_id.and_then(|id| self.ns.get_block_collection(id));
        let bc = match bc {
            Some(bc) => bc,
            None => {
                // replica of an already-deleted file; just drop it
                info!(
                    "markBlockAsCorrupt: {} cannot be marked as corrupt as it does not belong to any file",
                    stored_block
                );
                let mut del = stored_block;
                del.gen_stamp = to_mark.corrupt_gs;
                self.add_to_invalidates(state, del, node_uuid);
                return Ok(());
            }
        };

        // make sure the edge exists before flagging it
        if let Some(storage) = &storage {
            let BmState {
                blocks_map, nodes, ..
            } = state;
            if let Some(info) = nodes.get_storage_mut(&storage.node, &storage.storage) {
                blocks_map.add_to_storage_list(info, block_id);
            }
        }

        state
            .corrupt_replicas
            .add(block_id, node_uuid, to_mark.reason_code);

        let num = Self::count_nodes_in(state, block_id);
        let min = self.conf.replication_min as usize;
        let target = bc.replication() as usize;
        let has_enough_live = num.live >= target;
        let min_satisfied = num.live >= min;
        let has_more_corrupt = min_satisfied && num.live + num.corrupt > target;
        let corrupted_during_write =
            min_satisfied && stored_block.gen_stamp > to_mark.corrupt_gs;

        if has_enough_live || has_more_corrupt || corrupted_during_write {
            // surplus or stale-write replica: delete it right away
            self.invalidate_block(state, &to_mark, node_uuid);
        } else if self.is_populating_repl_queues() {
            // every copy matters; replicate before deleting anything
            self.update_needed_replications(state, block_id, -1, 0);
        }
        debug!(
            "marked {} corrupt on {}: {}",
            stored_block, node_uuid, to_mark.reason
        );
        Ok(())
    }

    /// Delete one corrupt replica if the block can afford it. Returns
    /// true when the replica was dropped from the index.
    pub(crate) fn invalidate_block(
        &self,
        state: &mut BmState,
        to_mark: &BlockToMarkCorrupt,
        node_uuid: &str,
    ) -> bool {
        let num = Self::count_nodes_in(state, to_mark.block_id);
        if num.stale > 0 {
            info!(
                "postponing invalidation of blk_{} on {}: {} replica(s) sit on storages with out-of-date reports",
                to_mark.block_id, node_uuid, num.stale
            );
            self.postpone_block(state, to_mark.block_id);
            false
        } else if num.live >= 1 {
            let mut del = match state.blocks_map.get(to_mark.block_id) {
                Some(info) => info.block,
                None => return false,
            };
            del.gen_stamp = to_mark.corrupt_gs;
            self.add_to_invalidates(state, del, node_uuid);
            self.remove_stored_block(state, to_mark.block_id, node_uuid);
            debug!("blk_{} on {} listed for deletion", to_mark.block_id, node_uuid);
            true
        } else {
            info!(
                "blk_{} on {} is the only copy and was not deleted",
                to_mark.block_id, node_uuid
            );
            false
        }
    }

    /// With enough live copies, every corrupt replica can go.
    fn invalidate_corrupt_replicas(&self, state: &mut BmState, block_id: i64) {
        let nodes = state.corrupt_replicas.nodes(block_id);
        let gs = match state.blocks_map.get(block_id) {
            Some(info) => info.block.gen_stamp,
            None => return,
        };
        let mut removed_all = true;
        for node in nodes {
            let to_mark = BlockToMarkCorrupt {
                block_id,
                corrupt_gs: gs,
                reason: String::new(),
                reason_code: CorruptReason::Any,
            };
            if !self.invalidate_block(state, &to_mark, &node) {
                removed_all = false;
            }
        }
        if removed_all {
            state.corrupt_replicas.remove_block(block_id);
        }
    }

    // ---- invalidation bookkeeping ----

    pub(crate) fn add_to_invalidates(&self, state: &mut BmState, block: Block, node_uuid: &str) {
        if !self.is_populating_repl_queues() {
            return;
        }
        state.invalidate_blocks.add(block, node_uuid, true);
    }

    fn add_to_invalidates_all_holders(&self, state: &mut BmState, block: Block) {
        if !self.is_populating_repl_queues() {
            return;
        }
        let holders: Vec<StorageRef> = match state.blocks_map.get(block.id) {
            Some(info) => info.storages().collect(),
            None => return,
        };
        let mut datanodes = String::new();
        for holder in holders {
            if Self::storage_is_normal(state, &holder) {
                state.invalidate_blocks.add(block, &holder.node, false);
                datanodes.push_str(&holder.node);
                datanodes.push(' ');
            }
        }
        if !datanodes.is_empty() {
            info!("addToInvalidates: {} {}", block, datanodes);
        }
    }

    // ---- stored-block maintenance ----

    pub(crate) fn postpone_block(&self, state: &mut BmState, block_id: i64) {
        if state.postponed_misreplicated.insert(block_id) {
            self.postponed_blocks_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A replica landed on `storage`. Keeps every queue consistent and
    /// kicks off completion, replication or surplus cleanup as needed.
    pub(crate) fn add_stored_block(
        &self,
        state: &mut BmState,
        block_id: i64,
        storage: &StorageRef,
        del_hint: Option<&str>,
        log_it: bool,
    ) -> FsResult<()> {
        let node_uuid = storage.node.clone();
        let (bc_id, stored_block) = match state.blocks_map.get(block_id) {
            Some(info) => (info.bc_id, info.block),
            None => return Ok(()),
        };
        let bc = match bc_id.and_then(|id| self.ns.get_block_collection(id)) {
            Some(bc) => bc,
            None => {
                info!(
                    "addStoredBlock: {} on {} but it does not belong to any file",
                    stored_block, node_uuid
                );
                return Ok(());
            }
        };

        // replica moved between storages of one node: drop the old edge
        if let Some(info) = state.blocks_map.get(block_id) {
            if let Some(idx) = info.find_node_slot(&node_uuid) {
                let old_sid = info.slots[idx].storage_id.clone();
                if old_sid != storage.storage {
                    let BmState {
                        blocks_map, nodes, ..
                    } = state;
                    if let Some(old) = nodes.get_storage_mut(&node_uuid, &old_sid) {
                        blocks_map.remove_from_storage_list(old, block_id);
                    }
                }
            }
        }

        let added = {
            let BmState {
                blocks_map, nodes, ..
            } = state;
            match nodes.get_storage_mut(&storage.node, &storage.storage) {
                Some(info) => blocks_map.add_to_storage_list(info, block_id),
                None => return Err(FsError::NodeNotFound(storage.to_string())),
            }
        };

        let cur_delta = if added {
            if log_it {
                info!("addStoredBlock: {} is added to {}", node_uuid, stored_block);
            }
            1
        } else {
            // a replica that was corrupt for a stale genstamp may come
            // back clean after recovery
            state.corrupt_replicas.remove_node_for_reason(
                block_id,
                &node_uuid,
                CorruptReason::GenstampMismatch,
            );
            warn!(
                "Redundant addStoredBlock request received for {} on {}",
                stored_block, node_uuid
            );
            0
        };

        let num = Self::count_nodes_in(state, block_id);
        let num_current = num.live + state.pending_replications.num_replicas(block_id);
        let min = self.conf.replication_min as usize;

        let uc_state = state
            .blocks_map
            .get(block_id)
            .map(|i| i.uc_state())
            .unwrap_or(BlockUcState::Complete);
        if uc_state == BlockUcState::Committed && num.live >= min {
            self.complete_block(state, block_id, false)?;
        } else if uc_state == BlockUcState::Complete && added {
            self.ns.increment_safe_block_count(num_current as u16);
        }

        if bc.is_under_construction() || !self.is_populating_repl_queues() {
            return Ok(());
        }

        let file_replication = bc.replication();
        if !self.is_needed_replication(state, block_id, file_replication, num_current) {
            state.needed_replications.remove(
                block_id,
                num_current,
                num.decommissioned,
                file_replication,
            );
        } else {
            self.update_needed_replications(state, block_id, cur_delta, 0);
        }
        if num_current > file_replication as usize {
            self.process_over_replicated_block(
                state,
                block_id,
                file_replication,
                Some(&node_uuid),
                del_hint,
            );
        }

        let corrupt_replicas = state.corrupt_replicas.num_corrupt_replicas(block_id);
        if corrupt_replicas != num.corrupt {
            warn!(
                "Inconsistent number of corrupt replicas for {}: blocksMap has {} but the corrupt replicas map has {}",
                stored_block, num.corrupt, corrupt_replicas
            );
        }
        if corrupt_replicas > 0 && num.live >= file_replication as usize {
            self.invalidate_corrupt_replicas(state, block_id);
        }
        Ok(())
    }

    /// Startup fast path: record the replica and maintain the safe-mode
    /// census, skipping the replication checks (report storms at startup
    /// would drown them and safe mode suppresses them anyway).
    fn add_stored_block_immediate(
        &self,
        state: &mut BmState,
        block_id: i64,
        storage: &StorageRef,
    ) -> FsResult<()> {
        if !self.ns.is_in_startup_safe_mode() || self.is_populating_repl_queues() {
            return self.add_stored_block(state, block_id, storage, None, false);
        }

        {
            let BmState {
                blocks_map, nodes, ..
            } = state;
            match nodes.get_storage_mut(&storage.node, &storage.storage) {
                Some(info) => blocks_map.add_to_storage_list(info, block_id),
                None => return Err(FsError::NodeNotFound(storage.to_string())),
            };
        }

        let min = self.conf.replication_min as usize;
        let live = self.count_live_nodes(state, block_id);
        let uc_state = state
            .blocks_map
            .get(block_id)
            .map(|i| i.uc_state())
            .unwrap_or(BlockUcState::Complete);
        if uc_state == BlockUcState::Committed && live >= min {
            self.complete_block(state, block_id, false)?;
        } else if uc_state == BlockUcState::Complete {
            self.ns.increment_safe_block_count(live as u16);
        }
        Ok(())
    }

    /// Fast live count used only inside startup safe mode, where excess
    /// and decommission states cannot exist yet.
    fn count_live_nodes(&self, state: &BmState, block_id: i64) -> usize {
        if !self.ns.is_in_startup_safe_mode() {
            return Self::count_nodes_in(state, block_id).live;
        }
        let info = match state.blocks_map.get(block_id) {
            Some(info) => info,
            None => return 0,
        };
        info.storages()
            .filter(|s| Self::storage_is_normal(state, s))
            .filter(|s| !state.corrupt_replicas.is_corrupt(block_id, &s.node))
            .count()
    }

    /// Drop the `(block, node)` edge and re-evaluate the block.
    pub(crate) fn remove_stored_block(&self, state: &mut BmState, block_id: i64, node_uuid: &str) {
        let storage_ids: Vec<String> = match state.blocks_map.get(block_id) {
            Some(info) => info
                .slots
                .iter()
                .filter(|s| s.node == node_uuid)
                .map(|s| s.storage_id.clone())
                .collect(),
            None => Vec::new(),
        };
        if storage_ids.is_empty() {
            debug!(
                "removeStoredBlock: blk_{} has already been removed from node {}",
                block_id, node_uuid
            );
            return;
        }
        for sid in storage_ids {
            let BmState {
                blocks_map, nodes, ..
            } = state;
            if let Some(info) = nodes.get_storage_mut(node_uuid, &sid) {
                blocks_map.remove_from_storage_list(info, block_id);
            }
        }

        let still_owned = state
            .blocks_map
            .get(block_id)
            .and_then(|info| info.bc_id)
            .and_then(|id| self.ns.get_block_collection(id))
            .is_some();
        if still_owned {
            // the node may have died with the block still valid
            if state
                .blocks_map
                .get(block_id)
                .map(|i| i.is_complete())
                .unwrap_or(false)
            {
                let live = Self::count_nodes_in(state, block_id).live;
                self.ns.decrement_safe_block_count(live as u16);
            }
            self.update_needed_replications(state, block_id, -1, 0);
        }

        if state.excess_replicas.remove(node_uuid, block_id) {
            self.excess_blocks_count.fetch_sub(1, Ordering::Relaxed);
        }
        state.corrupt_replicas.remove_node(block_id, node_uuid);
    }

    /// Permanent loss of a whole node.
    pub(crate) fn remove_blocks_associated_to_node(&self, state: &mut BmState, node_uuid: &str) {
        let block_ids: Vec<i64> = match state.nodes.get(node_uuid) {
            Some(node) => node
                .storages()
                .flat_map(|s| state.blocks_map.storage_block_ids(s))
                .collect(),
            None => return,
        };
        for block_id in block_ids {
            self.remove_stored_block(state, block_id, node_uuid);
        }
        state.pending_messages.remove_all_for_node(node_uuid);
        state.invalidate_blocks.remove_node(node_uuid);

        let was_stale = state
            .nodes
            .get(node_uuid)
            .map(|n| n.has_stale_storages())
            .unwrap_or(false);
        if was_stale {
            // its missing report can no longer arrive; stop waiting on it
            self.rescan_postponed_misreplicated_blocks(state);
        }
    }

    /// Permanent loss of one storage (disk failure).
    pub fn remove_blocks_associated_to_storage(&self, node_uuid: &str, storage_id: &str) {
        let mut state = self.state.write();
        let block_ids: Vec<i64> = match state.nodes.get_storage(node_uuid, storage_id) {
            Some(storage) => state.blocks_map.storage_block_ids(storage),
            None => return,
        };
        for block_id in block_ids {
            self.remove_stored_block(&mut state, block_id, node_uuid);
            state.invalidate_blocks.remove(node_uuid, block_id);
        }
        if let Some(node) = state.nodes.get_mut(node_uuid) {
            node.remove_storage(storage_id);
        }
    }

    // ---- replica census ----

    pub(crate) fn storage_is_normal(state: &BmState, storage: &StorageRef) -> bool {
        state
            .nodes
            .get_storage(&storage.node, &storage.storage)
            .map(|s| s.state == talus_common::state::StorageState::Normal)
            .unwrap_or(false)
    }

    fn storage_location(state: &BmState, storage: &StorageRef) -> Option<StorageLocation> {
        let node = state.nodes.get(&storage.node)?;
        let info = node.get_storage(&storage.storage)?;
        Some(StorageLocation {
            datanode: node.id.clone(),
            storage_id: info.storage_id.clone(),
            storage_type: info.storage_type,
        })
    }

    pub(crate) fn count_nodes_in(state: &BmState, block_id: i64) -> NumberReplicas {
        let mut num = NumberReplicas::default();
        let info = match state.blocks_map.get(block_id) {
            Some(info) => info,
            None => return num,
        };
        let corrupt_nodes = state.corrupt_replicas.nodes(block_id);
        for slot in &info.slots {
            let node = match state.nodes.get(&slot.node) {
                Some(node) => node,
                None => continue,
            };
            let storage = match node.get_storage(&slot.storage_id) {
                Some(storage) => storage,
                None => continue,
            };
            if storage.state != talus_common::state::StorageState::Normal {
                continue;
            }
            if corrupt_nodes.iter().any(|n| n == &slot.node) {
                num.corrupt += 1;
            } else if node.is_decommission_in_progress() || node.is_decommissioned() {
                num.decommissioned += 1;
            } else if state.excess_replicas.contains(&slot.node, block_id) {
                num.excess += 1;
            } else {
                num.live += 1;
            }
            if storage.is_content_stale() {
                num.stale += 1;
            }
        }
        num
    }

    pub(crate) fn replication_of(ns: &dyn Namesystem, state: &BmState, block_id: i64) -> u16 {
        state
            .blocks_map
            .get(block_id)
            .and_then(|info| info.bc_id)
            .and_then(|id| ns.get_block_collection(id))
            .map(|bc| bc.replication())
            .unwrap_or(0)
    }

    /// Rack diversity predicate: vacuously true on single-rack clusters
    /// and single-replica blocks.
    pub(crate) fn block_has_enough_racks(&self, state: &BmState, block_id: i64) -> bool {
        let expected = Self::replication_of(&*self.ns, state, block_id);
        if expected <= 1 || !state.nodes.has_cluster_ever_been_multi_rack() {
            return true;
        }
        let info = match state.blocks_map.get(block_id) {
            Some(info) => info,
            None => return true,
        };
        let corrupt_nodes = state.corrupt_replicas.nodes(block_id);
        let mut first_rack: Option<&str> = None;
        for slot in &info.slots {
            let node = match state.nodes.get(&slot.node) {
                Some(node) => node,
                None => continue,
            };
            if node.is_decommission_in_progress() || node.is_decommissioned() {
                continue;
            }
            if corrupt_nodes.iter().any(|n| n == &slot.node) {
                continue;
            }
            match first_rack {
                None => first_rack = Some(node.rack()),
                Some(rack) if rack != node.rack() => return true,
                Some(_) => {}
            }
        }
        false
    }

    pub(crate) fn is_needed_replication(
        &self,
        state: &BmState,
        block_id: i64,
        expected: u16,
        current: usize,
    ) -> bool {
        current < expected as usize || !self.block_has_enough_racks(state, block_id)
    }

    pub(crate) fn update_needed_replications(
        &self,
        state: &mut BmState,
        block_id: i64,
        cur_delta: isize,
        expected_delta: isize,
    ) {
        if !self.is_populating_repl_queues() {
            return;
        }
        let num = Self::count_nodes_in(state, block_id);
        let expected = Self::replication_of(&*self.ns, state, block_id);
        if self.is_needed_replication(state, block_id, expected, num.live) {
            state.needed_replications.update(
                block_id,
                num.live,
                num.decommissioned,
                expected,
                cur_delta,
                expected_delta,
            );
        } else {
            let old_live = (num.live as isize - cur_delta).max(0) as usize;
            let old_expected = (expected as isize - expected_delta).max(0) as u16;
            state
                .needed_replications
                .remove(block_id, old_live, num.decommissioned, old_expected);
        }
    }

    // ---- over-replication reducer ----

    pub(crate) fn process_over_replicated_block(
        &self,
        state: &mut BmState,
        block_id: i64,
        replication: u16,
        added_node: Option<&str>,
        del_hint: Option<&str>,
    ) {
        let del_hint = if added_node.is_some() && added_node == del_hint {
            None
        } else {
            del_hint
        };
        let corrupt_nodes = state.corrupt_replicas.nodes(block_id);
        let storages: Vec<StorageRef> = match state.blocks_map.get(block_id) {
            Some(info) => info.storages().collect(),
            None => return,
        };

        let mut candidates: Vec<ReplicaCandidate> = Vec::new();
        for sref in storages {
            let node = match state.nodes.get(&sref.node) {
                Some(node) => node,
                None => continue,
            };
            let storage = match node.get_storage(&sref.storage) {
                Some(storage) => storage,
                None => continue,
            };
            if storage.state != talus_common::state::StorageState::Normal {
                continue;
            }
            if storage.is_content_stale() {
                // a storage with an overdue report may already have
                // deleted its copy; counts cannot be trusted
                info!(
                    "postponing over-replication processing of blk_{}: storage {} on {} has no up-to-date report",
                    block_id, sref.storage, sref.node
                );
                self.postpone_block(state, block_id);
                return;
            }
            if state.excess_replicas.contains(&sref.node, block_id)
                || node.is_decommission_in_progress()
                || node.is_decommissioned()
                || corrupt_nodes.iter().any(|n| n == &sref.node)
            {
                continue;
            }
            candidates.push(ReplicaCandidate {
                node_uuid: sref.node.clone(),
                storage_id: sref.storage.clone(),
                storage_type: storage.storage_type,
                rack: node.rack().to_string(),
                remaining: storage.remaining,
            });
        }
        self.choose_excess_replicates(state, candidates, block_id, replication, added_node, del_hint);
    }

    fn choose_excess_replicates(
        &self,
        state: &mut BmState,
        mut candidates: Vec<ReplicaCandidate>,
        block_id: i64,
        replication: u16,
        added_node: Option<&str>,
        del_hint: Option<&str>,
    ) {
        let mut buckets = RackBuckets::build(&candidates);
        let hint = del_hint.and_then(|h| candidates.iter().find(|c| c.node_uuid == h).cloned());
        let added = added_node.and_then(|a| candidates.iter().find(|c| c.node_uuid == a).cloned());
        let mut first = true;

        while candidates.len() > replication as usize {
            let cur = if Self::use_del_hint(first, &hint, &added, &buckets) {
                hint.clone().unwrap()
            } else {
                match self.placement.choose_replica_to_delete(&buckets) {
                    Some(c) => c,
                    None => break,
                }
            };
            first = false;

            buckets.remove_chosen(&cur);
            candidates.retain(|c| c != &cur);

            self.add_to_excess(state, &cur.node_uuid, block_id);
            let block = match state.blocks_map.get(block_id) {
                Some(info) => info.block,
                None => break,
            };
            self.add_to_invalidates(state, block, &cur.node_uuid);
            info!(
                "chooseExcessReplicates: ({}, {}) is added to invalidated blocks set",
                cur.node_uuid, block
            );
        }
    }

    /// The delete hint wins only for the first victim, and only when
    /// honoring it cannot reduce rack diversity.
    fn use_del_hint(
        is_first: bool,
        hint: &Option<ReplicaCandidate>,
        added: &Option<ReplicaCandidate>,
        buckets: &RackBuckets,
    ) -> bool {
        if !is_first {
            return false;
        }
        let hint = match hint {
            Some(h) => h,
            None => return false,
        };
        if buckets.in_more_than_one(hint) {
            true
        } else {
            // the newly added replica opened a new rack, so the hinted
            // rack is not the last of its kind
            added
                .as_ref()
                .map(|a| !buckets.in_more_than_one(a))
                .unwrap_or(false)
        }
    }

    fn add_to_excess(&self, state: &mut BmState, node_uuid: &str, block_id: i64) {
        if state.excess_replicas.add(node_uuid, block_id) {
            self.excess_blocks_count.fetch_add(1, Ordering::Relaxed);
            debug!("addToExcessReplicate: ({}, blk_{})", node_uuid, block_id);
        }
    }

    /// A node rejoined with its replicas intact; some blocks may now
    /// exceed their target.
    fn process_over_replicated_blocks_on_recommission(
        &self,
        state: &mut BmState,
        node_uuid: &str,
    ) {
        let block_ids: Vec<i64> = match state.nodes.get(node_uuid) {
            Some(node) => node
                .storages()
                .flat_map(|s| state.blocks_map.storage_block_ids(s))
                .collect(),
            None => return,
        };
        let mut num_over_replicated = 0;
        for block_id in block_ids {
            let expected = Self::replication_of(&*self.ns, state, block_id);
            let num = Self::count_nodes_in(state, block_id);
            if num.live > expected as usize {
                self.process_over_replicated_block(state, block_id, expected, None, None);
                num_over_replicated += 1;
            }
        }
        info!(
            "invalidated {} over-replicated blocks on {} during recommissioning",
            num_over_replicated, node_uuid
        );
    }

    /// Decommission progress: true while any block on the node still
    /// needs copies elsewhere. Records the tallies on the descriptor.
    pub fn is_replication_in_progress(&self, node_uuid: &str) -> bool {
        let mut state = self.state.write();
        let block_ids: Vec<i64> = match state.nodes.get(node_uuid) {
            Some(node) => node
                .storages()
                .flat_map(|s| state.blocks_map.storage_block_ids(s))
                .collect(),
            None => return false,
        };

        let mut status = false;
        let mut under_replicated = 0;
        let mut decommission_only = 0;
        let mut under_replicated_open = 0;

        for block_id in block_ids {
            let bc = state
                .blocks_map
                .get(block_id)
                .and_then(|i| i.bc_id)
                .and_then(|id| self.ns.get_block_collection(id));
            let bc = match bc {
                Some(bc) => bc,
                None => continue,
            };
            let expected = bc.replication();
            let num = Self::count_nodes_in(&state, block_id);
            if !self.is_needed_replication(&state, block_id, expected, num.live) {
                continue;
            }

            if (expected as usize) > num.live {
                if bc.is_under_construction() {
                    if Some(block_id) == bc.last_block_id()
                        && num.live > self.conf.replication_min as usize
                    {
                        continue;
                    }
                    under_replicated_open += 1;
                }
                status = true;
                if num.live >= self.conf.replication_default as usize {
                    status = false;
                }
                under_replicated += 1;
                if num.live == 0 && num.decommissioned > 0 {
                    decommission_only += 1;
                }
            }

            if !state.needed_replications.contains(block_id)
                && state.pending_replications.num_replicas(block_id) == 0
                && self.is_populating_repl_queues()
            {
                // reported while decommission was already under way
                state
                    .needed_replications
                    .add(block_id, num.live, num.decommissioned, expected);
            }
        }

        if let Some(node) = state.nodes.get_mut(node_uuid) {
            node.decommissioning_status.under_replicated_blocks = under_replicated;
            node.decommissioning_status.decommission_only_replicas = decommission_only;
            node.decommissioning_status.under_replicated_in_open_files = under_replicated_open;
        }
        status
    }

    // ---- report processing ----

    /// Full report for one storage. Returns true once every storage of
    /// the node has reported (the node is no longer stale).
    pub fn process_report(
        &self,
        node_uuid: &str,
        storage: &DatanodeStorage,
        report: &[ReportedBlock],
    ) -> FsResult<bool> {
        let spend = TimeSpent::new();
        let mut state = self.state.write();

        match state.nodes.get(node_uuid) {
            Some(node) if node.is_alive => {}
            _ => {
                return err_box!("processReport from dead or unregistered node {}", node_uuid)
            }
        }
        state.nodes.update_storage(node_uuid, storage);
        let sref = StorageRef::new(node_uuid, &storage.storage_id);

        let (report_count, num_blocks) = {
            let info = state
                .nodes
                .get_storage(node_uuid, &storage.storage_id)
                .unwrap();
            (info.block_report_count(), info.num_blocks())
        };

        // second and later reports during startup carry nothing new
        // worth the processing cost; drop them
        if self.ns.is_in_startup_safe_mode() && report_count > 0 {
            info!(
                "processReport: discarded non-initial block report from {} because the master is still in startup phase",
                node_uuid
            );
            return Ok(!state.nodes.get(node_uuid).unwrap().has_stale_storages());
        }

        if num_blocks == 0 {
            self.process_first_block_report(&mut state, &sref, report)?;
        } else {
            self.process_report_diff(&mut state, &sref, report)?;
        }

        let stale_before = state
            .nodes
            .get_storage(node_uuid, &storage.storage_id)
            .map(|s| s.is_content_stale())
            .unwrap_or(false);
        if let Some(info) = state.nodes.get_storage_mut(node_uuid, &storage.storage_id) {
            info.received_block_report();
        }
        if stale_before {
            info!(
                "processReport: received first block report from {} after becoming active; its contents are no longer stale",
                sref
            );
            self.rescan_postponed_misreplicated_blocks(&mut state);
        }

        let has_stale = state
            .nodes
            .get(node_uuid)
            .map(|n| n.has_stale_storages())
            .unwrap_or(false);
        info!(
            "processReport: from storage {} node {}, blocks: {}, hasStaleStorages: {}, processing time: {} ms",
            storage.storage_id,
            node_uuid,
            report.len(),
            has_stale,
            spend.used_ms()
        );
        Ok(!has_stale)
    }

    /// Diff an ordinary (non-first) report against the index.
    fn process_report_diff(
        &self,
        state: &mut BmState,
        storage: &StorageRef,
        report: &[ReportedBlock],
    ) -> FsResult<()> {
        let mut to_add: Vec<i64> = Vec::new();
        let mut to_remove: Vec<i64> = Vec::new();
        let mut to_invalidate: Vec<Block> = Vec::new();
        let mut to_corrupt: Vec<BlockToMarkCorrupt> = Vec::new();
        let mut to_uc: Vec<(i64, ReportedBlock)> = Vec::new();

        // every stored block the report accounted for; list members not
        // in here at the end were not reported and must go
        let mut reported: FxHashSet<i64> = FxHashSet::default();
        for entry in report {
            let stored = self.process_reported_block(
                state,
                storage,
                &entry.block,
                entry.state,
                &mut to_add,
                &mut to_invalidate,
                &mut to_corrupt,
                &mut to_uc,
            );
            if let Some(id) = stored {
                reported.insert(id);
            }
        }
        if let Some(info) = state.nodes.get_storage(&storage.node, &storage.storage) {
            for id in state.blocks_map.storage_block_ids(info) {
                if !reported.contains(&id) {
                    to_remove.push(id);
                }
            }
        }

        for (block_id, entry) in to_uc {
            self.add_stored_block_under_construction(state, block_id, storage, &entry)?;
        }
        for block_id in to_remove {
            self.remove_stored_block(state, block_id, &storage.node);
        }
        let max_log = self.conf.max_blocks_to_log;
        for (logged, block_id) in to_add.into_iter().enumerate() {
            self.add_stored_block(state, block_id, storage, None, logged < max_log)?;
        }
        for block in to_invalidate {
            info!(
                "processReport: {} on {} size {} does not belong to any file",
                block, storage.node, block.num_bytes
            );
            self.add_to_invalidates(state, block, &storage.node);
        }
        for to_mark in to_corrupt {
            self.mark_block_as_corrupt(state, to_mark, Some(storage.clone()), &storage.node.clone())?;
        }
        Ok(())
    }

    /// First report from a storage: no removal diffing, no invalidation
    /// of unknown blocks (a restarting cluster must not mass-delete),
    /// and a cheap add path.
    fn process_first_block_report(
        &self,
        state: &mut BmState,
        storage: &StorageRef,
        report: &[ReportedBlock],
    ) -> FsResult<()> {
        for entry in report {
            if state.postpone_blocks_from_future && self.ns.is_gen_stamp_in_future(&entry.block) {
                self.queue_reported_block(state, storage, &entry.block, entry.state, "future genstamp");
                continue;
            }

            let (uc_state, is_uc) = match state.blocks_map.get(entry.block.id) {
                None => continue, // unknown: defer to the next report
                Some(info) => (info.uc_state(), !info.is_complete()),
            };

            if let Some(to_mark) = Self::check_replica_corrupt(
                &entry.block,
                entry.state,
                state.blocks_map.get(entry.block.id).unwrap(),
                &storage.node,
            ) {
                if state.postpone_blocks_from_future {
                    self.queue_reported_block(state, storage, &entry.block, entry.state, "corrupt state");
                } else {
                    self.mark_block_as_corrupt(state, to_mark, Some(storage.clone()), &storage.node.clone())?;
                }
                continue;
            }

            if is_uc && Self::is_reported_for_under_construction(uc_state, entry.state) {
                if let Some(info) = state.blocks_map.get_mut(entry.block.id) {
                    info.add_uc_replica_if_not_present(storage.clone(), &entry.block, entry.state);
                }
            }
            if entry.state == ReplicaState::Finalized {
                self.add_stored_block_immediate(state, entry.block.id, storage)?;
            }
        }
        Ok(())
    }

    /// Classify one reported replica. Pure except for standby queueing;
    /// the verdict lands in exactly one of the to-do lists. Returns the
    /// stored block id when the report accounted for it.
    #[allow(clippy::too_many_arguments)]
    fn process_reported_block(
        &self,
        state: &mut BmState,
        storage: &StorageRef,
        block: &Block,
        reported_state: ReplicaState,
        to_add: &mut Vec<i64>,
        to_invalidate: &mut Vec<Block>,
        to_corrupt: &mut Vec<BlockToMarkCorrupt>,
        to_uc: &mut Vec<(i64, ReportedBlock)>,
    ) -> Option<i64> {
        debug!(
            "reported block {} on {} size {} replicaState = {}",
            block, storage.node, block.num_bytes, reported_state
        );
        if state.postpone_blocks_from_future && self.ns.is_gen_stamp_in_future(block) {
            self.queue_reported_block(state, storage, block, reported_state, "future genstamp");
            return None;
        }

        let (block_id, verdict, uc_state, slot_present) = match state.blocks_map.get(block.id) {
            Some(info) => (
                info.id(),
                Self::check_replica_corrupt(block, reported_state, info, &storage.node),
                info.uc_state(),
                info.find_slot(&storage.storage).is_some(),
            ),
            None => {
                // completely unknown replica: the storage should drop it
                to_invalidate.push(*block);
                return None;
            }
        };

        // already sentenced to deletion on this node; ignore
        if state.invalidate_blocks.contains(&storage.node, block_id) {
            return Some(block_id);
        }

        if let Some(to_mark) = verdict {
            if state.postpone_blocks_from_future {
                // stale evidence on a standby is deferred, not judged
                self.queue_reported_block(state, storage, block, reported_state, "corrupt state");
            } else {
                to_corrupt.push(to_mark);
            }
            return Some(block_id);
        }

        if Self::is_reported_for_under_construction(uc_state, reported_state) {
            to_uc.push((
                block_id,
                ReportedBlock {
                    block: *block,
                    state: reported_state,
                },
            ));
            return Some(block_id);
        }

        // a clean finalized replica that the index does not know about
        // yet (or that was flagged corrupt and has healed)
        if reported_state == ReplicaState::Finalized
            && (!slot_present || state.corrupt_replicas.is_corrupt(block_id, &storage.node))
        {
            to_add.push(block_id);
        }
        Some(block_id)
    }

    /// The corruption truth table: reported replica state versus stored
    /// construction state, refereed by generation stamp and length.
    fn check_replica_corrupt(
        reported: &Block,
        reported_state: ReplicaState,
        stored: &BlockInfo,
        node: &str,
    ) -> Option<BlockToMarkCorrupt> {
        let uc_state = stored.uc_state();
        let block_id = stored.id();
        match reported_state {
            ReplicaState::Finalized => match uc_state {
                BlockUcState::Complete | BlockUcState::Committed => {
                    if stored.block.gen_stamp != reported.gen_stamp {
                        Some(BlockToMarkCorrupt {
                            block_id,
                            corrupt_gs: reported.gen_stamp,
                            reason: format!(
                                "block is {} and reported genstamp {} does not match genstamp in block map {}",
                                uc_state, reported.gen_stamp, stored.block.gen_stamp
                            ),
                            reason_code: CorruptReason::GenstampMismatch,
                        })
                    } else if stored.block.num_bytes != reported.num_bytes {
                        Some(BlockToMarkCorrupt {
                            block_id,
                            corrupt_gs: reported.gen_stamp,
                            reason: format!(
                                "block is {} and reported length {} does not match length in block map {}",
                                uc_state, reported.num_bytes, stored.block.num_bytes
                            ),
                            reason_code: CorruptReason::SizeMismatch,
                        })
                    } else {
                        None
                    }
                }
                BlockUcState::UnderConstruction | BlockUcState::UnderRecovery => {
                    if stored.block.gen_stamp > reported.gen_stamp {
                        Some(BlockToMarkCorrupt {
                            block_id,
                            corrupt_gs: reported.gen_stamp,
                            reason: format!(
                                "block is {} and reported genstamp {} is behind the block map genstamp {}",
                                uc_state, reported.gen_stamp, stored.block.gen_stamp
                            ),
                            reason_code: CorruptReason::GenstampMismatch,
                        })
                    } else {
                        None
                    }
                }
            },
            ReplicaState::Rbw | ReplicaState::Rwr => {
                if !stored.is_complete() {
                    None // pipeline still open; nothing to judge
                } else if stored.block.gen_stamp != reported.gen_stamp {
                    Some(BlockToMarkCorrupt {
                        block_id,
                        corrupt_gs: reported.gen_stamp,
                        reason: format!(
                            "reported {} replica with genstamp {} does not match Complete block's genstamp in block map {}",
                            reported_state, reported.gen_stamp, stored.block.gen_stamp
                        ),
                        reason_code: CorruptReason::GenstampMismatch,
                    })
                } else if reported_state == ReplicaState::Rbw {
                    // the report raced a pipeline close; a FINALIZED
                    // follow-up is coming
                    info!(
                        "received an RBW replica for {} on {}: ignoring it, since it is complete with the same genstamp",
                        stored.block, node
                    );
                    None
                } else {
                    Some(BlockToMarkCorrupt {
                        block_id,
                        corrupt_gs: reported.gen_stamp,
                        reason: format!("reported replica has invalid state {}", reported_state),
                        reason_code: CorruptReason::InvalidState,
                    })
                }
            }
            ReplicaState::Rur | ReplicaState::Temporary => {
                let msg = format!(
                    "unexpected replica state {} for {} on {}",
                    reported_state, stored.block, node
                );
                warn!("{}", msg);
                Some(BlockToMarkCorrupt {
                    block_id,
                    corrupt_gs: reported.gen_stamp,
                    reason: msg,
                    reason_code: CorruptReason::InvalidState,
                })
            }
        }
    }

    fn is_reported_for_under_construction(
        uc_state: BlockUcState,
        reported_state: ReplicaState,
    ) -> bool {
        match reported_state {
            ReplicaState::Finalized => matches!(
                uc_state,
                BlockUcState::UnderConstruction | BlockUcState::UnderRecovery
            ),
            ReplicaState::Rbw | ReplicaState::Rwr => uc_state != BlockUcState::Complete,
            ReplicaState::Rur | ReplicaState::Temporary => false,
        }
    }

    fn add_stored_block_under_construction(
        &self,
        state: &mut BmState,
        block_id: i64,
        storage: &StorageRef,
        entry: &ReportedBlock,
    ) -> FsResult<()> {
        let attached = match state.blocks_map.get_mut(block_id) {
            Some(info) => {
                info.add_uc_replica_if_not_present(storage.clone(), &entry.block, entry.state);
                info.find_node_slot(&storage.node).is_some()
            }
            None => return Ok(()),
        };
        if entry.state == ReplicaState::Finalized && !attached {
            self.add_stored_block(state, block_id, storage, None, true)?;
        }
        Ok(())
    }

    // ---- standby postponement ----

    fn queue_reported_block(
        &self,
        state: &mut BmState,
        storage: &StorageRef,
        block: &Block,
        reported_state: ReplicaState,
        reason: &str,
    ) {
        debug_assert!(state.postpone_blocks_from_future);
        debug!(
            "queueing reported block {} in state {} from {} for later processing because {}",
            block, reported_state, storage, reason
        );
        state
            .pending_messages
            .enqueue(storage.clone(), *block, reported_state);
    }

    /// The edit stream caught up for `block_id`; replay what was queued.
    pub fn process_queued_messages_for_block(&self, block_id: i64) -> FsResult<()> {
        let mut state = self.state.write();
        let queue = state.pending_messages.take_block_queue(block_id);
        for message in queue {
            self.process_and_handle_reported_block(
                &mut state,
                &message.storage,
                &message.block,
                message.state,
                None,
            )?;
        }
        Ok(())
    }

    /// Entering active state: nothing can be stale-postponed any more.
    pub fn process_all_pending_messages(&self) -> FsResult<()> {
        let mut state = self.state.write();
        debug_assert!(!state.postpone_blocks_from_future);
        let all = state.pending_messages.take_all();
        if !all.is_empty() {
            info!(
                "processing {} messages from datanodes that were previously queued during standby state",
                all.len()
            );
        }
        for message in all {
            self.process_and_handle_reported_block(
                &mut state,
                &message.storage,
                &message.block,
                message.state,
                None,
            )?;
        }
        Ok(())
    }

    // ---- incremental reports ----

    pub fn process_incremental_block_report(
        &self,
        node_uuid: &str,
        storage: &DatanodeStorage,
        events: &[ReceivedDeletedBlock],
    ) -> FsResult<()> {
        let mut state = self.state.write();
        match state.nodes.get(node_uuid) {
            Some(node) if node.is_alive => {}
            _ => {
                return err_box!(
                    "got incremental block report from dead or unregistered node {}",
                    node_uuid
                )
            }
        }
        state.nodes.update_storage(node_uuid, storage);
        let sref = StorageRef::new(node_uuid, &storage.storage_id);

        let (mut receiving, mut received, mut deleted) = (0, 0, 0);
        for event in events {
            match event.status {
                ReportedBlockStatus::Deleted => {
                    self.remove_stored_block(&mut state, event.block.id, node_uuid);
                    deleted += 1;
                }
                ReportedBlockStatus::Received => {
                    if let Some(info) =
                        state.nodes.get_storage_mut(node_uuid, &storage.storage_id)
                    {
                        info.decrement_blocks_scheduled();
                    }
                    state
                        .pending_replications
                        .decrement(event.block.id, node_uuid);
                    self.process_and_handle_reported_block(
                        &mut state,
                        &sref,
                        &event.block,
                        ReplicaState::Finalized,
                        event.del_hint.as_deref(),
                    )?;
                    received += 1;
                }
                ReportedBlockStatus::Receiving => {
                    self.process_and_handle_reported_block(
                        &mut state,
                        &sref,
                        &event.block,
                        ReplicaState::Rbw,
                        None,
                    )?;
                    receiving += 1;
                }
            }
        }
        debug!(
            "processIncrementalBlockReport: from {} receiving: {}, received: {}, deleted: {}",
            node_uuid, receiving, received, deleted
        );
        Ok(())
    }

    fn process_and_handle_reported_block(
        &self,
        state: &mut BmState,
        storage: &StorageRef,
        block: &Block,
        reported_state: ReplicaState,
        del_hint: Option<&str>,
    ) -> FsResult<()> {
        let mut to_add: Vec<i64> = Vec::new();
        let mut to_invalidate: Vec<Block> = Vec::new();
        let mut to_corrupt: Vec<BlockToMarkCorrupt> = Vec::new();
        let mut to_uc: Vec<(i64, ReportedBlock)> = Vec::new();

        self.process_reported_block(
            state,
            storage,
            block,
            reported_state,
            &mut to_add,
            &mut to_invalidate,
            &mut to_corrupt,
            &mut to_uc,
        );
        debug_assert!(
            to_add.len() + to_invalidate.len() + to_corrupt.len() + to_uc.len() <= 1,
            "the block should be in at most one of the lists"
        );

        for (block_id, entry) in to_uc {
            self.add_stored_block_under_construction(state, block_id, storage, &entry)?;
        }
        for block_id in to_add {
            self.add_stored_block(state, block_id, storage, del_hint, true)?;
        }
        for b in to_invalidate {
            info!(
                "addBlock: {} on {} size {} does not belong to any file",
                b, storage.node, b.num_bytes
            );
            self.add_to_invalidates(state, b, &storage.node);
        }
        for to_mark in to_corrupt {
            self.mark_block_as_corrupt(state, to_mark, Some(storage.clone()), &storage.node.clone())?;
        }
        Ok(())
    }

    // ---- mis-replication scan ----

    /// Classify one block against its target. Adds it to the proper
    /// queue; `Postpone` is reported to the caller, which owns the
    /// postponed set.
    pub(crate) fn process_misreplicated_block(
        &self,
        state: &mut BmState,
        block_id: i64,
    ) -> MisReplicationResult {
        let (bc_id, is_complete, block) = match state.blocks_map.get(block_id) {
            Some(info) => (info.bc_id, info.is_complete(), info.block),
            None => return MisReplicationResult::Invalid,
        };
        if bc_id.and_then(|id| self.ns.get_block_collection(id)).is_none() {
            // orphaned by a deleted file
            self.add_to_invalidates_all_holders(state, block);
            return MisReplicationResult::Invalid;
        }
        if !is_complete {
            // reached again when completed or recovered
            return MisReplicationResult::UnderConstruction;
        }

        let expected = Self::replication_of(&*self.ns, state, block_id);
        let num = Self::count_nodes_in(state, block_id);
        if self.is_needed_replication(state, block_id, expected, num.live)
            && state
                .needed_replications
                .add(block_id, num.live, num.decommissioned, expected)
        {
            return MisReplicationResult::UnderReplicated;
        }

        if num.live > expected as usize {
            if num.stale > 0 {
                return MisReplicationResult::Postpone;
            }
            self.process_over_replicated_block(state, block_id, expected, None, None);
            return MisReplicationResult::OverReplicated;
        }
        MisReplicationResult::Ok
    }

    /// A storage went from stale to fresh; everything postponed on its
    /// account can be judged again.
    pub(crate) fn rescan_postponed_misreplicated_blocks(&self, state: &mut BmState) {
        let ids: Vec<i64> = state.postponed_misreplicated.iter().copied().collect();
        for block_id in ids {
            if state.blocks_map.get(block_id).is_none() {
                if state.postponed_misreplicated.remove(&block_id) {
                    self.postponed_blocks_count.fetch_sub(1, Ordering::Relaxed);
                }
                continue;
            }
            let res = self.process_misreplicated_block(state, block_id);
            debug!("rescanned postponed blk_{}, result is {:?}", block_id, res);
            if res != MisReplicationResult::Postpone
                && state.postponed_misreplicated.remove(&block_id)
            {
                self.postponed_blocks_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Rebuild the replication queues by scanning the whole index in
    /// chunks, releasing the lock between chunks so clients proceed.
    pub fn process_misreplicated_blocks(&self) {
        self.stop_replication_initializer();
        self.state.write().needed_replications.clear();
        self.scan_stop.store(false, Ordering::SeqCst);
        self.scan_progress_bits
            .store(0f64.to_bits(), Ordering::Relaxed);

        let bm = self.clone();
        let handle = std::thread::Builder::new()
            .name("ReplicationQueueInitializer".to_string())
            .spawn(move || bm.process_misreplicates_async())
            .expect("failed to spawn replication queue initializer");
        *self.scan_handle.lock() = Some(handle);
    }

    pub fn stop_replication_initializer(&self) {
        self.scan_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.scan_handle.lock().take() {
            if handle.join().is_err() {
                warn!("replication queue initializer exited abnormally");
            }
        }
    }

    fn process_misreplicates_async(&self) {
        let spend = TimeSpent::new();
        let mut nr_invalid = 0u64;
        let mut nr_over = 0u64;
        let mut nr_under = 0u64;
        let mut nr_postponed = 0u64;
        let mut nr_uc = 0u64;
        let mut total_processed = 0u64;

        let total_blocks = self.state.read().blocks_map.len().max(1) as f64;
        let mut cursor = Some(0usize);
        while self.ns.is_running() && !self.scan_stop.load(Ordering::SeqCst) {
            let mut state = self.state.write();
            let c = match cursor {
                Some(c) => c,
                None => break,
            };
            let (ids, next) = state
                .blocks_map
                .scan_chunk(c, self.conf.misreplication_batch_size);
            for block_id in ids {
                // always re-read: the world may have changed since the
                // last chunk released the lock
                match self.process_misreplicated_block(&mut state, block_id) {
                    MisReplicationResult::Invalid => nr_invalid += 1,
                    MisReplicationResult::UnderReplicated => nr_under += 1,
                    MisReplicationResult::OverReplicated => nr_over += 1,
                    MisReplicationResult::Postpone => {
                        nr_postponed += 1;
                        self.postpone_block(&mut state, block_id);
                    }
                    MisReplicationResult::UnderConstruction => nr_uc += 1,
                    MisReplicationResult::Ok => {}
                }
                total_processed += 1;
            }
            self.scan_progress_bits.store(
                (total_processed as f64 / total_blocks).min(1.0).to_bits(),
                Ordering::Relaxed,
            );
            cursor = next;
            if cursor.is_none() {
                self.scan_progress_bits
                    .store(1f64.to_bits(), Ordering::Relaxed);
                info!("Total number of blocks            = {}", state.blocks_map.len());
                info!("Number of invalid blocks          = {}", nr_invalid);
                info!("Number of under-replicated blocks = {}", nr_under);
                info!(
                    "Number of  over-replicated blocks = {}{}",
                    nr_over,
                    if nr_postponed > 0 {
                        format!(" ({} postponed)", nr_postponed)
                    } else {
                        String::new()
                    }
                );
                info!("Number of blocks being written    = {}", nr_uc);
                info!(
                    "Replication queue initialization scan completed in {} ms",
                    spend.used_ms()
                );
            }
        }
        if self.scan_stop.load(Ordering::SeqCst) {
            info!("interrupted while processing replication queues");
        }
    }

    /// Drop every queued decision; used when this master stops being the
    /// decision maker.
    pub fn clear_queues(&self) {
        let mut state = self.state.write();
        state.needed_replications.clear();
        state.pending_replications.clear();
        state.excess_replicas.clear();
        state.invalidate_blocks.clear();
        for node in state.nodes.iter_mut() {
            node.clear_command_queue();
        }
        self.excess_blocks_count.store(0, Ordering::Relaxed);
    }

    // ---- metasave ----

    /// Human-readable dump of the replication state.
    pub fn meta_save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let state = self.state.write();
        let live = state.nodes.live_count();
        writeln!(out, "Live Datanodes: {}", live)?;
        writeln!(out, "Dead Datanodes: {}", state.nodes.len() - live)?;

        writeln!(
            out,
            "Metasave: Blocks waiting for replication: {}",
            state.needed_replications.size()
        )?;
        let needed: Vec<i64> = state.needed_replications.iter_all().collect();
        for block_id in needed {
            self.dump_block_meta(&state, block_id, out)?;
        }

        writeln!(out, "Mis-replicated blocks that have been postponed:")?;
        for block_id in state.postponed_misreplicated.iter() {
            self.dump_block_meta(&state, *block_id, out)?;
        }

        state.pending_replications.meta_save(out)?;
        state.invalidate_blocks.dump(out)?;

        for node in state.nodes.iter() {
            writeln!(
                out,
                "{} {:?} alive={} blocks={}",
                node.id,
                node.admin_state,
                node.is_alive,
                node.num_blocks()
            )?;
        }
        Ok(())
    }

    fn dump_block_meta(
        &self,
        state: &BmState,
        block_id: i64,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        let info = match state.blocks_map.get(block_id) {
            Some(info) => info,
            None => return Ok(()),
        };
        let file_name = info
            .bc_id
            .and_then(|id| self.ns.get_block_collection(id))
            .map(|bc| bc.name())
            .unwrap_or_else(|| "[orphaned]".to_string());
        let num = Self::count_nodes_in(state, block_id);
        let usable = num.live + num.decommissioned;
        write!(
            out,
            "{}: {}{} (replicas: l: {} d: {} c: {} e: {})",
            file_name,
            info.block,
            if usable > 0 { "" } else { " MISSING" },
            num.live,
            num.decommissioned,
            num.corrupt,
            num.excess
        )?;
        for storage in info.storages() {
            let mut tag = String::new();
            if state.corrupt_replicas.is_corrupt(block_id, &storage.node) {
                tag.push_str("(corrupt)");
            } else if state
                .nodes
                .get(&storage.node)
                .map(|n| n.is_decommissioned() || n.is_decommission_in_progress())
                .unwrap_or(false)
            {
                tag.push_str("(decommissioned)");
            }
            if state
                .nodes
                .get_storage(&storage.node, &storage.storage)
                .map(|s| s.is_content_stale())
                .unwrap_or(false)
            {
                tag.push_str(" (block deletions maybe out of date)");
            }
            write!(out, " {}{} :", storage, tag)?;
        }
        writeln!(out)?;
        Ok(())
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, BmState> {
        self.state.write()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::master::fs::policy::DefaultPlacementPolicy;
    use crate::master::fs::{FileCollection, MemNamesystem};

    pub(crate) struct Harness {
        pub bm: BlockManager,
        pub ns: Arc<MemNamesystem>,
    }

    pub(crate) fn harness(min_replication: u16, nodes: &[(&str, &str)]) -> Harness {
        let mut conf = MasterConf::default();
        conf.replication_min = min_replication;
        conf.blocks_map_capacity = 1 << 10;
        harness_with_conf(conf, nodes)
    }

    pub(crate) fn harness_with_conf(conf: MasterConf, nodes: &[(&str, &str)]) -> Harness {
        let ns = Arc::new(MemNamesystem::new("pool-1", conf.replication_min));
        let monitor = MasterMonitor::new();
        monitor.set_active(true);
        let bm = BlockManager::new(
            conf,
            ns.clone(),
            monitor,
            Arc::new(DefaultPlacementPolicy),
        )
        .unwrap();
        for (uuid, rack) in nodes {
            bm.register_datanode(DatanodeId::new(*uuid, format!("host-{}", uuid), *rack));
            bm.register_storage(uuid, &DatanodeStorage::new(storage_id(uuid)), 1 << 30, 1 << 30)
                .unwrap();
        }
        Harness { bm, ns }
    }

    pub(crate) fn storage_id(uuid: &str) -> String {
        format!("{}-s1", uuid)
    }

    fn new_file(h: &Harness, id: i64, replication: u16) -> Arc<FileCollection> {
        let file = Arc::new(FileCollection::new(id, format!("/f{}", id), replication, 1 << 20));
        h.ns.add_file(file.clone());
        file
    }

    fn report_finalized(h: &Harness, node: &str, blocks: &[Block]) -> bool {
        let entries: Vec<ReportedBlock> = blocks
            .iter()
            .map(|b| ReportedBlock::finalized(*b))
            .collect();
        h.bm.process_report(node, &DatanodeStorage::new(storage_id(node)), &entries)
            .unwrap()
    }

    fn received(h: &Harness, node: &str, block: Block) {
        h.bm.process_incremental_block_report(
            node,
            &DatanodeStorage::new(storage_id(node)),
            &[ReceivedDeletedBlock::received(block)],
        )
        .unwrap();
    }

    /// An empty initial report; marks the storage contents trustworthy,
    /// the way a freshly registered datanode does.
    fn empty_report(h: &Harness, node: &str) {
        h.bm.process_report(node, &DatanodeStorage::new(storage_id(node)), &[])
            .unwrap();
    }

    #[test]
    fn test_commit_then_complete_when_min_replicas_seen() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        let block = Block::new(1, 0, 1);
        file.append_block(1);
        h.bm.add_block_collection(block, 100, Some(vec![]));

        // commit without any reported replica: stays committed
        let committed = h
            .bm
            .commit_or_complete_last_block(file.as_ref(), Some(&Block::new(1, 42, 1)))
            .unwrap();
        assert!(committed);
        {
            let state = h.bm.state.read();
            assert_eq!(state.blocks_map.get(1).unwrap().uc_state(), BlockUcState::Committed);
        }

        // replica arrives: the next commit call completes the block
        received(&h, "dn-1", Block::new(1, 42, 1));
        {
            let state = h.bm.state.read();
            assert!(state.blocks_map.get(1).unwrap().is_complete());
        }

        // committing a complete block reports no change
        let again = h
            .bm
            .commit_or_complete_last_block(file.as_ref(), Some(&Block::new(1, 42, 1)))
            .unwrap();
        assert!(!again);
    }

    #[test]
    fn test_verify_replication_bounds() {
        let h = harness(1, &[]);
        assert!(h.bm.verify_replication("/f", 3, None).is_ok());
        assert!(h.bm.verify_replication("/f", 0, None).is_err());
        assert!(h.bm.verify_replication("/f", 1000, None).is_err());
        assert_eq!(h.bm.adjust_replication(0), 1);
        assert_eq!(h.bm.adjust_replication(1000), 512);
    }

    #[test]
    fn test_report_diff_is_idempotent() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        for id in 1..=3 {
            file.append_block(id);
            h.bm.add_block_collection(Block::new(id, 10, 1), 100, None);
        }
        let blocks: Vec<Block> = (1..=3).map(|id| Block::new(id, 10, 1)).collect();

        report_finalized(&h, "dn-1", &blocks);
        {
            let state = h.bm.state.read();
            for id in 1..=3 {
                assert_eq!(state.blocks_map.get(id).unwrap().num_storages(), 1);
            }
        }

        // the same report again changes nothing
        report_finalized(&h, "dn-1", &blocks);
        {
            let state = h.bm.state.read();
            for id in 1..=3 {
                assert_eq!(state.blocks_map.get(id).unwrap().num_storages(), 1);
            }
            assert_eq!(state.invalidate_blocks.num_blocks(), 0);
            assert_eq!(state.corrupt_replicas.size(), 0);
        }
    }

    #[test]
    fn test_report_removal_detected_by_diff() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        for id in 1..=2 {
            file.append_block(id);
            h.bm.add_block_collection(Block::new(id, 10, 1), 100, None);
        }
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1), Block::new(2, 10, 1)]);

        // second report omits block 2: the edge must disappear
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1)]);
        let state = h.bm.state.read();
        assert_eq!(state.blocks_map.get(1).unwrap().num_storages(), 1);
        assert_eq!(state.blocks_map.get(2).unwrap().num_storages(), 0);
    }

    #[test]
    fn test_first_report_ignores_unknown_blocks() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);

        // block 99 was never allocated; the first report must not queue
        // a deletion for it
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1), Block::new(99, 5, 1)]);
        let state = h.bm.state.read();
        assert_eq!(state.blocks_map.get(1).unwrap().num_storages(), 1);
        assert_eq!(state.invalidate_blocks.num_blocks(), 0);
    }

    #[test]
    fn test_non_first_report_invalidates_unknown_blocks() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);

        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1)]);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1), Block::new(99, 5, 1)]);
        let state = h.bm.state.read();
        assert!(state.invalidate_blocks.contains("dn-1", 99));
    }

    #[test]
    fn test_size_mismatch_marks_corrupt_and_queues_replication() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        let file = new_file(&h, 100, 2);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 5), 100, None);

        report_finalized(&h, "dn-1", &[Block::new(1, 10, 5)]);
        // dn-2 reports a short replica: not enough live copies exist, so
        // the replica is flagged but not deleted yet
        report_finalized(&h, "dn-2", &[Block::new(1, 7, 5)]);

        let state = h.bm.state.read();
        assert!(state.corrupt_replicas.is_corrupt(1, "dn-2"));
        assert!(!state.invalidate_blocks.contains("dn-2", 1));
        assert!(state.needed_replications.contains(1));
    }

    #[test]
    fn test_stale_genstamp_replica_is_invalidated_as_write_corruption() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        let file = new_file(&h, 100, 2);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 5), 100, None);

        report_finalized(&h, "dn-1", &[Block::new(1, 10, 5)]);
        empty_report(&h, "dn-2");
        // a replica left behind by a failed pipeline carries an older
        // genstamp; a valid copy exists, so it can go at once
        report_finalized(&h, "dn-2", &[Block::new(1, 10, 4)]);

        let state = h.bm.state.read();
        assert!(state.invalidate_blocks.contains("dn-2", 1));
        assert!(state.blocks_map.get(1).unwrap().find_node_slot("dn-2").is_none());
    }

    #[test]
    fn test_corrupt_replica_invalidated_when_enough_live_copies() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 5), 100, None);

        report_finalized(&h, "dn-1", &[Block::new(1, 10, 5)]);
        empty_report(&h, "dn-2");
        // target is 1 and a good copy exists: the bad one goes at once
        report_finalized(&h, "dn-2", &[Block::new(1, 10, 4)]);

        let state = h.bm.state.read();
        assert!(state.invalidate_blocks.contains("dn-2", 1));
        assert!(state.blocks_map.get(1).unwrap().find_node_slot("dn-2").is_none());
    }

    #[test]
    fn test_rbw_on_complete_block_with_same_genstamp_is_ignored() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 5), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 5)]);

        let entries = [ReportedBlock {
            block: Block::new(1, 10, 5),
            state: ReplicaState::Rbw,
        }];
        h.bm.process_report("dn-1", &DatanodeStorage::new(storage_id("dn-1")), &entries)
            .unwrap();
        let state = h.bm.state.read();
        assert!(!state.corrupt_replicas.is_corrupt(1, "dn-1"));
    }

    #[test]
    fn test_rwr_on_complete_block_is_corrupt() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 5), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 5)]);
        empty_report(&h, "dn-2");

        let entries = [ReportedBlock {
            block: Block::new(1, 10, 5),
            state: ReplicaState::Rwr,
        }];
        h.bm.process_report("dn-2", &DatanodeStorage::new(storage_id("dn-2")), &entries)
            .unwrap();
        let state = h.bm.state.read();
        // live copy on dn-1, so the invalid-state replica is deleted
        assert!(state.invalidate_blocks.contains("dn-2", 1));
    }

    #[test]
    fn test_standby_queues_future_genstamp_reports() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        h.bm.set_postpone_blocks_from_future(true);
        h.ns.set_gen_stamp(10);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 5), 100, None);

        report_finalized(&h, "dn-1", &[Block::new(1, 10, 99)]);
        assert_eq!(h.bm.pending_message_count(), 1);
        {
            let state = h.bm.state.read();
            assert_eq!(state.corrupt_replicas.size(), 0);
        }

        // edits catch up; the queued report is replayed
        h.ns.set_gen_stamp(100);
        h.bm.set_postpone_blocks_from_future(false);
        h.bm.process_queued_messages_for_block(1).unwrap();
        assert_eq!(h.bm.pending_message_count(), 0);
    }

    #[test]
    fn test_set_replication_decrease_triggers_reducer() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a"), ("dn-3", "/rack-b")]);
        let file = new_file(&h, 100, 3);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);
        for node in ["dn-1", "dn-2", "dn-3"] {
            report_finalized(&h, node, &[Block::new(1, 10, 1)]);
        }
        assert_eq!(h.bm.count_nodes(1).live, 3);

        file.set_replication(1);
        h.bm.set_replication(3, 1, "/f100", &[1]);

        let state = h.bm.state.read();
        assert_eq!(state.excess_replicas.len(), 2);
        assert_eq!(h.bm.excess_blocks_count(), 2);
        assert_eq!(state.invalidate_blocks.num_blocks(), 2);
        // excess replicas are no longer live
        drop(state);
        assert_eq!(h.bm.count_nodes(1).live, 1);
        assert_eq!(h.bm.count_nodes(1).excess, 2);
    }

    #[test]
    fn test_excess_cleared_when_deletion_confirmed() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        let file = new_file(&h, 100, 2);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1)]);
        report_finalized(&h, "dn-2", &[Block::new(1, 10, 1)]);

        file.set_replication(1);
        h.bm.set_replication(2, 1, "/f100", &[1]);
        let victim = {
            let state = h.bm.state.read();
            ["dn-1", "dn-2"]
                .iter()
                .find(|n| state.excess_replicas.contains(n, 1))
                .unwrap()
                .to_string()
        };

        h.bm.process_incremental_block_report(
            &victim,
            &DatanodeStorage::new(storage_id(&victim)),
            &[ReceivedDeletedBlock::deleted(Block::new(1, 10, 1))],
        )
        .unwrap();

        let state = h.bm.state.read();
        assert!(!state.excess_replicas.contains(&victim, 1));
        assert_eq!(h.bm.excess_blocks_count(), 0);
        assert_eq!(state.blocks_map.get(1).unwrap().num_storages(), 1);
    }

    #[test]
    fn test_remove_block_scrubs_every_queue() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        let file = new_file(&h, 100, 2);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1)]);

        h.bm.remove_block(1);
        let state = h.bm.state.read();
        assert!(state.blocks_map.get(1).is_none());
        assert!(!state.needed_replications.contains(1));
        assert_eq!(state.pending_replications.num_replicas(1), 0);
        // the holder is told to delete, without expecting an ack
        assert!(state.invalidate_blocks.contains("dn-1", 1));
    }

    #[test]
    fn test_convert_last_block_to_under_construction() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1)]);

        let lb = h
            .bm
            .convert_last_block_to_under_construction(file.as_ref(), "client-1")
            .unwrap()
            .unwrap();
        assert_eq!(lb.block.block.id, 1);
        assert_eq!(lb.locations.len(), 1);
        let state = h.bm.state.read();
        let info = state.blocks_map.get(1).unwrap();
        assert!(!info.is_complete());
        assert_eq!(info.uc().unwrap().expected_locations.len(), 1);
    }

    #[test]
    fn test_convert_aligned_last_block_returns_none() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1); // preferred block size 1 MiB
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 1 << 20, 1), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 1 << 20, 1)]);

        let lb = h
            .bm
            .convert_last_block_to_under_construction(file.as_ref(), "client-1")
            .unwrap();
        assert!(lb.is_none());
    }

    #[test]
    fn test_create_located_blocks_orders_corrupt_last() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        let file = new_file(&h, 100, 2);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 5), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 5)]);
        report_finalized(&h, "dn-2", &[Block::new(1, 10, 5)]);
        {
            let mut state = h.bm.write_state();
            state.corrupt_replicas.add(1, "dn-2", CorruptReason::CorruptionReported);
        }

        let located = h
            .bm
            .create_located_blocks(&[1], 10, false, 0, 10, false, "client-1")
            .unwrap();
        assert_eq!(located.blocks.len(), 1);
        let lb = &located.blocks[0];
        assert!(!lb.corrupt);
        assert_eq!(lb.locations.len(), 2);
        assert_eq!(lb.locations[0].datanode.uuid, "dn-1");
        assert_eq!(lb.locations[1].datanode.uuid, "dn-2");
        assert!(located.last_block_complete);
    }

    #[test]
    fn test_get_blocks_skips_invalidated_locations() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        for id in 1..=3 {
            file.append_block(id);
            h.bm.add_block_collection(Block::new(id, 10, 1), 100, None);
        }
        report_finalized(
            &h,
            "dn-1",
            &[Block::new(1, 10, 1), Block::new(2, 10, 1), Block::new(3, 10, 1)],
        );
        {
            let mut state = h.bm.write_state();
            state.invalidate_blocks.add(Block::new(2, 10, 1), "dn-1", false);
        }

        let blocks = h.bm.get_blocks("dn-1", i64::MAX).unwrap();
        let ids: Vec<i64> = blocks.iter().map(|(b, _)| b.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&2));
        assert!(h.bm.get_blocks("dn-9", 10).is_err());
    }

    #[test]
    fn test_safe_block_count_tracks_min_replication() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        h.ns.set_startup_safe_mode(true);
        let file = new_file(&h, 100, 1);
        file.set_under_construction(false);
        for id in 1..=5 {
            file.append_block(id);
            h.bm.add_block_collection(Block::new(id, 10, 1), 100, None);
        }
        let known: Vec<Block> = (1..=5).map(|id| Block::new(id, 10, 1)).collect();
        report_finalized(&h, "dn-1", &known);
        assert_eq!(h.ns.safe_block_count(), 5);
    }

    #[test]
    fn test_meta_save_runs() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        let file = new_file(&h, 100, 3);
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);
        report_finalized(&h, "dn-1", &[Block::new(1, 10, 1)]);

        let mut out = Vec::new();
        h.bm.meta_save(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Live Datanodes: 1"));
        assert!(text.contains("waiting for replication"));
    }
}
