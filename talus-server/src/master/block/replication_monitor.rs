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

use super::block_manager::{BlockManager, BmState};
use super::under_replicated::QUEUE_HIGHEST_PRIORITY;
use super::NumberReplicas;
use crate::master::fs::policy::{ChooseContext, TargetStorage};
use crate::master::node::StorageRef;
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use talus_common::runtime::LoopTask;
use talus_common::state::{Block, DatanodeCommand, StorageLocation, StorageState};
use talus_common::{FsError, FsResult};

/// One unit of replication work: a block picked from the queues together
/// with everything the placement step needs, so targets can be chosen
/// without the lock and the decision re-validated when it is retaken.
struct ReplicationWork {
    block: Block,
    bc_name: String,
    priority: usize,
    src: String,
    src_rack: String,
    containing: Vec<String>,
    live_replica_storages: Vec<TargetStorage>,
    additional_required: usize,
    targets: Vec<TargetStorage>,
}

impl BlockManager {
    /// One scheduling round: replication work scaled by the live node
    /// count, then invalidation work over a sample of nodes.
    pub fn compute_datanode_work(&self) -> usize {
        // Checking safe mode without the lock is fine; at worst an extra
        // round of work is scheduled and reconciled later.
        if self.ns.is_in_safe_mode() {
            return 0;
        }

        let num_live = self.state.read().nodes.live_count();
        let blocks_to_process = num_live * self.conf.replication_work_multiplier as usize;
        let nodes_to_process = (num_live as f32 * self.conf.invalidate_work_pct).ceil() as usize;

        let work_found = self.compute_replication_work(blocks_to_process);
        self.set_scheduled_replication_count(work_found as i64);
        work_found + self.compute_invalidate_work(nodes_to_process)
    }

    pub fn compute_replication_work(&self, blocks_to_process: usize) -> usize {
        let blocks_to_replicate = self
            .state
            .write()
            .needed_replications
            .choose_under_replicated(blocks_to_process);
        self.compute_replication_work_for_blocks(blocks_to_replicate)
    }

    pub(crate) fn compute_replication_work_for_blocks(
        &self,
        blocks_to_replicate: Vec<Vec<i64>>,
    ) -> usize {
        let mut work: Vec<ReplicationWork> = Vec::new();

        // step 1: under the lock, pick sources and snapshot the cluster
        let cluster = {
            let mut state = self.state.write();
            for (priority, ids) in blocks_to_replicate.iter().enumerate() {
                for &block_id in ids {
                    let bc = state
                        .blocks_map
                        .get(block_id)
                        .and_then(|info| info.bc_id)
                        .and_then(|id| self.ns.get_block_collection(id));
                    let bc = match bc {
                        // abandoned block, or reopened for append
                        Some(bc)
                            if !(bc.is_under_construction()
                                && bc.last_block_id() == Some(block_id)) =>
                        {
                            bc
                        }
                        _ => {
                            state.needed_replications.remove_with_priority(block_id, priority);
                            state.needed_replications.decrement_repl_index(priority);
                            continue;
                        }
                    };
                    let required = bc.replication();

                    let (src, containing, live_replica_storages, num) =
                        self.choose_source_datanode(&state, block_id, priority);
                    let src = match src {
                        Some(src) => src,
                        None => {
                            debug!("blk_{} cannot be replicated from any node", block_id);
                            continue;
                        }
                    };

                    let pending = state.pending_replications.num_replicas(block_id);
                    let effective = num.live + pending;
                    if effective >= required as usize
                        && (pending > 0 || self.block_has_enough_racks(&state, block_id))
                    {
                        state.needed_replications.remove_with_priority(block_id, priority);
                        state.needed_replications.decrement_repl_index(priority);
                        info!(
                            "removing blk_{} from neededReplications as it has enough replicas",
                            block_id
                        );
                        continue;
                    }

                    let additional_required = if num.live < required as usize {
                        (required as usize - effective).max(1)
                    } else {
                        1 // needed on a new rack
                    };

                    let block = state.blocks_map.get(block_id).map(|i| i.block).unwrap();
                    let src_rack = state
                        .nodes
                        .get(&src)
                        .map(|n| n.rack().to_string())
                        .unwrap_or_default();
                    if let Some(node) = state.nodes.get_mut(&src) {
                        node.increment_pending_without_targets();
                    }
                    work.push(ReplicationWork {
                        block,
                        bc_name: bc.name(),
                        priority,
                        src,
                        src_rack,
                        containing,
                        live_replica_storages,
                        additional_required,
                        targets: Vec::new(),
                    });
                }
            }
            state.nodes.snapshot()
        };

        // step 2: placement runs without the lock
        for rw in work.iter_mut() {
            let ctx = ChooseContext {
                src: rw.bc_name.clone(),
                num_replicas: rw.additional_required,
                client: None,
                chosen: rw.live_replica_storages.clone(),
                return_chosen: false,
                excluded: rw.containing.iter().cloned().collect(),
                block_size: rw.block.num_bytes,
            };
            rw.targets = self.placement.choose_target(&ctx, &cluster);
        }

        // step 3: retake the lock, re-validate, and commit the work
        let mut scheduled = 0;
        {
            let mut state = self.state.write();
            for rw in work.iter_mut() {
                if let Some(node) = state.nodes.get_mut(&rw.src) {
                    node.decrement_pending_without_targets();
                }
                if rw.targets.is_empty() {
                    continue;
                }
                let block_id = rw.block.id;

                let bc = state
                    .blocks_map
                    .get(block_id)
                    .and_then(|info| info.bc_id)
                    .and_then(|id| self.ns.get_block_collection(id));
                let bc = match bc {
                    Some(bc)
                        if !(bc.is_under_construction()
                            && bc.last_block_id() == Some(block_id)) =>
                    {
                        bc
                    }
                    _ => {
                        state.needed_replications.remove_with_priority(block_id, rw.priority);
                        state.needed_replications.decrement_repl_index(rw.priority);
                        rw.targets.clear();
                        continue;
                    }
                };
                let required = bc.replication();

                // counts may have moved while the lock was released
                let num = Self::count_nodes_in(&state, block_id);
                let pending = state.pending_replications.num_replicas(block_id);
                let effective = num.live + pending;
                if effective >= required as usize
                    && (pending > 0 || self.block_has_enough_racks(&state, block_id))
                {
                    state.needed_replications.remove_with_priority(block_id, rw.priority);
                    state.needed_replications.decrement_repl_index(rw.priority);
                    rw.targets.clear();
                    info!(
                        "removing blk_{} from neededReplications as it has enough replicas",
                        block_id
                    );
                    continue;
                }
                if num.live >= required as usize
                    && !self.block_has_enough_racks(&state, block_id)
                    && rw.src_rack == rw.targets[0].rack
                {
                    // no use copying inside the same rack
                    rw.targets.clear();
                    continue;
                }

                let block = state
                    .blocks_map
                    .get(block_id)
                    .map(|i| i.block)
                    .unwrap_or(rw.block);
                let target_locations: Vec<StorageLocation> = rw
                    .targets
                    .iter()
                    .filter_map(|t| {
                        let node = state.nodes.get(&t.node_uuid)?;
                        let storage = node.get_storage(&t.storage_id)?;
                        Some(StorageLocation {
                            datanode: node.id.clone(),
                            storage_id: storage.storage_id.clone(),
                            storage_type: storage.storage_type,
                        })
                    })
                    .collect();
                if let Some(node) = state.nodes.get_mut(&rw.src) {
                    node.add_command(DatanodeCommand::Replicate {
                        block,
                        targets: target_locations,
                    });
                }
                for target in &rw.targets {
                    if let Some(storage) =
                        state.nodes.get_storage_mut(&target.node_uuid, &target.storage_id)
                    {
                        storage.increment_blocks_scheduled();
                    }
                }
                // track the attempt so it can be retried after a timeout
                state.pending_replications.increment(
                    block_id,
                    rw.targets
                        .iter()
                        .map(|t| StorageRef::new(&t.node_uuid, &t.storage_id))
                        .collect(),
                );
                scheduled += 1;
                debug!(
                    "blk_{} is moved from neededReplications to pendingReplications",
                    block_id
                );

                if effective + rw.targets.len() >= required as usize {
                    state.needed_replications.remove_with_priority(block_id, rw.priority);
                    state.needed_replications.decrement_repl_index(rw.priority);
                }
            }
        }

        for rw in &work {
            if !rw.targets.is_empty() {
                let targets: Vec<&str> =
                    rw.targets.iter().map(|t| t.node_uuid.as_str()).collect();
                info!("ask {} to replicate {} to {:?}", rw.src, rw.block, targets);
            }
        }
        scheduled
    }

    /// Pick the node to copy from. Corrupt, excess and decommissioned
    /// holders never qualify; stream limits apply below the highest
    /// priority; decommissioning nodes are preferred (no write traffic);
    /// otherwise ties break randomly so a node that keeps failing is not
    /// re-picked forever.
    pub(crate) fn choose_source_datanode(
        &self,
        state: &BmState,
        block_id: i64,
        priority: usize,
    ) -> (Option<String>, Vec<String>, Vec<TargetStorage>, NumberReplicas) {
        let mut containing: Vec<String> = Vec::new();
        let mut live_replica_storages: Vec<TargetStorage> = Vec::new();
        let mut num = NumberReplicas::default();

        let info = match state.blocks_map.get(block_id) {
            Some(info) => info,
            None => return (None, containing, live_replica_storages, num),
        };
        let corrupt_nodes = state.corrupt_replicas.nodes(block_id);
        let max_streams = self.conf.replication_max_streams as usize;
        let hard_limit = self.conf.replication_streams_hard_limit as usize;
        let mut rng = rand::thread_rng();

        let mut src: Option<String> = None;
        let mut src_decommissioning = false;
        for slot in &info.slots {
            let node = match state.nodes.get(&slot.node) {
                Some(node) => node,
                None => continue,
            };
            let storage = match node.get_storage(&slot.storage_id) {
                Some(storage) => storage,
                None => continue,
            };
            let countable = storage.state == StorageState::Normal;
            let is_corrupt = corrupt_nodes.iter().any(|n| n == &slot.node);
            let is_excess = state.excess_replicas.contains(&slot.node, block_id);
            let is_decommission = node.is_decommission_in_progress() || node.is_decommissioned();

            if countable {
                if is_corrupt {
                    num.corrupt += 1;
                } else if is_decommission {
                    num.decommissioned += 1;
                } else if is_excess {
                    num.excess += 1;
                } else {
                    num.live += 1;
                    live_replica_storages.push(TargetStorage {
                        node_uuid: slot.node.clone(),
                        storage_id: slot.storage_id.clone(),
                        storage_type: storage.storage_type,
                        rack: node.rack().to_string(),
                    });
                }
            }
            containing.push(slot.node.clone());

            if is_corrupt {
                continue;
            }
            let outgoing = node.blocks_to_be_replicated();
            if priority != QUEUE_HIGHEST_PRIORITY && outgoing >= max_streams {
                continue; // already at its replication limit
            }
            if outgoing >= hard_limit {
                continue;
            }
            // the block must not be scheduled for removal on the source
            if is_excess {
                continue;
            }
            if node.is_decommissioned() {
                continue;
            }
            if node.is_decommission_in_progress() || src.is_none() {
                src = Some(slot.node.clone());
                src_decommissioning = node.is_decommission_in_progress();
                continue;
            }
            if src_decommissioning {
                continue;
            }
            if rng.gen_bool(0.5) {
                src = Some(slot.node.clone());
            }
        }
        (src, containing, live_replica_storages, num)
    }

    /// Dispatch queued deletions to a random sample of nodes.
    pub fn compute_invalidate_work(&self, nodes_to_process: usize) -> usize {
        let mut node_ids = self.state.read().invalidate_blocks.nodes();
        node_ids.shuffle(&mut rand::thread_rng());

        let mut remaining = nodes_to_process.min(node_ids.len());
        let mut block_count = 0;
        for node in node_ids {
            if remaining == 0 {
                break;
            }
            let count = self.invalidate_work_for_one_node(&node);
            if count > 0 {
                block_count += count;
                remaining -= 1;
            }
        }
        block_count
    }

    fn invalidate_work_for_one_node(&self, node_uuid: &str) -> usize {
        let mut state = self.state.write();
        // blocks must not be removed while in safe mode
        if self.ns.is_in_safe_mode() {
            debug!("in safemode, not computing invalidation work");
            return 0;
        }
        match state.nodes.get(node_uuid) {
            Some(node) if node.is_alive => {}
            _ => return 0,
        }
        let blocks = match state
            .invalidate_blocks
            .invalidate_work(node_uuid, self.conf.block_invalidate_limit)
        {
            Some(blocks) => blocks,
            None => return 0,
        };
        let count = blocks.len();
        info!("ask {} to delete {} blocks", node_uuid, count);
        if let Some(node) = state.nodes.get_mut(node_uuid) {
            node.add_command(DatanodeCommand::Invalidate { blocks });
        }
        count
    }

    /// Timed-out replication attempts go back to the queues so another
    /// source can be chosen.
    pub fn process_pending_replications(&self) {
        let mut state = self.state.write();
        let timed_out = state.pending_replications.take_timed_out();
        for block_id in timed_out {
            let num = Self::count_nodes_in(&state, block_id);
            let expected = Self::replication_of(&*self.ns, &state, block_id);
            if self.is_needed_replication(&state, block_id, expected, num.live) {
                state
                    .needed_replications
                    .add(block_id, num.live, num.decommissioned, expected);
            }
        }
    }

    pub fn check_pending_timeouts(&self) {
        self.state.write().pending_replications.check_timeouts();
    }
}

/// The convergence loop: schedules replication and invalidation work and
/// recycles timed-out attempts, while the master is active and out of
/// safe mode.
pub struct ReplicationMonitor {
    bm: BlockManager,
}

impl ReplicationMonitor {
    pub(crate) fn new(bm: BlockManager) -> Self {
        Self { bm }
    }
}

impl LoopTask for ReplicationMonitor {
    type Error = FsError;

    fn run(&self) -> FsResult<()> {
        if self.bm.is_populating_repl_queues() {
            self.bm.compute_datanode_work();
            self.bm.process_pending_replications();
        }
        Ok(())
    }

    fn terminate(&self) -> bool {
        self.bm.monitor.is_stop() || !self.bm.ns.is_running()
    }
}

/// Sweeps the in-flight replication table for expired entries.
pub struct PendingReplicationMonitor {
    bm: BlockManager,
}

impl PendingReplicationMonitor {
    pub(crate) fn new(bm: BlockManager) -> Self {
        Self { bm }
    }
}

impl LoopTask for PendingReplicationMonitor {
    type Error = FsError;

    fn run(&self) -> FsResult<()> {
        self.bm.check_pending_timeouts();
        Ok(())
    }

    fn terminate(&self) -> bool {
        self.bm.monitor.is_stop() || !self.bm.ns.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::super::block_manager::tests::{harness, storage_id};
    use super::*;
    use crate::master::fs::FileCollection;
    use std::sync::Arc;
    use talus_common::state::{DatanodeStorage, ReceivedDeletedBlock, ReportedBlock};

    fn setup_under_replicated(
        h: &super::super::block_manager::tests::Harness,
        replication: u16,
        holders: &[&str],
    ) -> Arc<FileCollection> {
        let file = Arc::new(FileCollection::new(100, "/f100", replication, 1 << 20));
        h.ns.add_file(file.clone());
        file.set_under_construction(false);
        file.append_block(1);
        h.bm.add_block_collection(Block::new(1, 10, 1), 100, None);
        for node in holders {
            let report = [ReportedBlock::finalized(Block::new(1, 10, 1))];
            h.bm.process_report(node, &DatanodeStorage::new(storage_id(node)), &report)
                .unwrap();
        }
        file
    }

    #[test]
    fn test_replication_work_schedules_to_missing_node() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a"), ("dn-3", "/rack-b")]);
        setup_under_replicated(&h, 3, &["dn-1", "dn-2"]);
        assert!(h.bm.under_replicated_count() > 0);

        let scheduled = h.bm.compute_datanode_work();
        assert_eq!(scheduled, 1);

        // the source is one of the two holders, chosen at random
        let (src, cmds) = ["dn-1", "dn-2"]
            .iter()
            .find_map(|n| {
                let cmds = h.bm.take_datanode_commands(n);
                (!cmds.is_empty()).then(|| (n.to_string(), cmds))
            })
            .expect("one holder must carry the replicate command");
        match &cmds[0] {
            DatanodeCommand::Replicate { block, targets } => {
                assert_eq!(block.id, 1);
                assert_eq!(targets.len(), 1);
                assert_eq!(targets[0].datanode.uuid, "dn-3");
            }
            other => panic!("unexpected command on {}: {:?}", src, other),
        }

        // the attempt is tracked and the block left the queues
        assert_eq!(h.bm.pending_replication_count(), 1);
        assert_eq!(h.bm.under_replicated_count(), 0);

        // the expected replica arrives: nothing is pending any more
        h.bm.process_incremental_block_report(
            "dn-3",
            &DatanodeStorage::new(storage_id("dn-3")),
            &[ReceivedDeletedBlock::received(Block::new(1, 10, 1))],
        )
        .unwrap();
        assert_eq!(h.bm.pending_replication_count(), 0);
        assert_eq!(h.bm.count_nodes(1).live, 3);
    }

    #[test]
    fn test_source_selection_skips_unusable_holders() {
        let h = harness(
            1,
            &[("dn-1", "/rack-a"), ("dn-2", "/rack-a"), ("dn-3", "/rack-b")],
        );
        setup_under_replicated(&h, 4, &["dn-1", "dn-2", "dn-3"]);
        {
            let mut state = h.bm.write_state();
            state
                .corrupt_replicas
                .add(1, "dn-1", super::super::CorruptReason::CorruptionReported);
            state.nodes.finish_decommission("dn-2");
        }
        let state = h.bm.state.read();
        for _ in 0..8 {
            let (src, containing, _, num) = h.bm.choose_source_datanode(&state, 1, 3);
            assert_eq!(src.as_deref(), Some("dn-3"));
            assert_eq!(containing.len(), 3);
            assert_eq!(num.corrupt, 1);
            assert_eq!(num.decommissioned, 1);
            assert_eq!(num.live, 1);
        }
    }

    #[test]
    fn test_source_selection_prefers_decommissioning_node() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-a")]);
        setup_under_replicated(&h, 3, &["dn-1", "dn-2"]);
        h.bm.start_decommission("dn-2");

        let state = h.bm.state.read();
        for _ in 0..8 {
            let (src, _, _, _) = h.bm.choose_source_datanode(&state, 1, 3);
            assert_eq!(src.as_deref(), Some("dn-2"));
        }
    }

    #[test]
    fn test_stream_limit_blocks_low_priority_sources() {
        let h = harness(1, &[("dn-1", "/rack-a"), ("dn-2", "/rack-b")]);
        setup_under_replicated(&h, 3, &["dn-1"]);
        {
            let mut state = h.bm.write_state();
            let node = state.nodes.get_mut("dn-1").unwrap();
            for _ in 0..2 {
                node.add_command(DatanodeCommand::Replicate {
                    block: Block::with_id(50),
                    targets: vec![],
                });
            }
        }
        let state = h.bm.state.read();
        // at the soft limit, ordinary work finds no source
        let (src, _, _, _) = h.bm.choose_source_datanode(&state, 1, 3);
        assert!(src.is_none());
        // highest priority work still does
        let (src, _, _, _) = h.bm.choose_source_datanode(&state, 1, QUEUE_HIGHEST_PRIORITY);
        assert_eq!(src.as_deref(), Some("dn-1"));
    }

    #[test]
    fn test_invalidate_work_batches_per_node() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        {
            let mut state = h.bm.write_state();
            for id in 1..=5 {
                state.invalidate_blocks.add(Block::with_id(id), "dn-1", false);
            }
        }
        let count = h.bm.compute_invalidate_work(4);
        assert_eq!(count, 5);
        let cmds = h.bm.take_datanode_commands("dn-1");
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            DatanodeCommand::Invalidate { blocks } => assert_eq!(blocks.len(), 5),
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(h.bm.pending_deletion_count(), 0);
    }

    #[test]
    fn test_invalidation_suppressed_in_safe_mode() {
        let h = harness(1, &[("dn-1", "/rack-a")]);
        h.ns.set_safe_mode(true);
        {
            let mut state = h.bm.write_state();
            state.invalidate_blocks.add(Block::with_id(1), "dn-1", false);
        }
        assert_eq!(h.bm.compute_invalidate_work(1), 0);
        assert_eq!(h.bm.pending_deletion_count(), 1);
    }

    #[test]
    fn test_timed_out_replication_requeues_block() {
        let mut conf = talus_common::conf::MasterConf::default();
        conf.replication_min = 1;
        conf.replication_pending_timeout_ms = 0;
        conf.blocks_map_capacity = 1 << 10;
        let h = super::super::block_manager::tests::harness_with_conf(
            conf,
            &[("dn-1", "/rack-a"), ("dn-2", "/rack-b")],
        );
        setup_under_replicated(&h, 2, &["dn-1"]);

        let scheduled = h.bm.compute_replication_work(10);
        assert_eq!(scheduled, 1);
        assert_eq!(h.bm.pending_replication_count(), 1);
        assert_eq!(h.bm.under_replicated_count(), 0);

        // dn-2 never confirms; the sweep expires the attempt and the
        // block goes back to the queues
        std::thread::sleep(std::time::Duration::from_millis(5));
        h.bm.check_pending_timeouts();
        h.bm.process_pending_replications();
        assert_eq!(h.bm.pending_replication_count(), 0);
        assert!(h.bm.under_replicated_count() > 0);
    }
}
