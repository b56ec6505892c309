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

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use talus_common::conf::MasterConf;
use talus_common::state::{
    Block, DatanodeCommand, DatanodeId, DatanodeStorage, ExtendedBlock, ReceivedDeletedBlock,
    ReportedBlock,
};
use talus_server::master::block::BlockManager;
use talus_server::master::fs::policy::DefaultPlacementPolicy;
use talus_server::master::fs::{FileCollection, MemNamesystem};
use talus_server::master::MasterMonitor;

struct Cluster {
    bm: BlockManager,
    ns: Arc<MemNamesystem>,
}

fn storage_id(node: &str) -> String {
    format!("{}-s1", node)
}

fn cluster(conf: MasterConf, nodes: &[(&str, &str)]) -> Cluster {
    let _ = env_logger::builder().is_test(true).try_init();
    let ns = Arc::new(MemNamesystem::new("pool-1", conf.replication_min));
    let monitor = MasterMonitor::new();
    monitor.set_active(true);
    let bm = BlockManager::new(conf, ns.clone(), monitor, Arc::new(DefaultPlacementPolicy))
        .unwrap();
    for (uuid, rack) in nodes {
        bm.register_datanode(DatanodeId::new(*uuid, format!("host-{}", uuid), *rack));
        bm.register_storage(uuid, &DatanodeStorage::new(storage_id(uuid)), 1 << 30, 1 << 30)
            .unwrap();
    }
    Cluster { bm, ns }
}

fn small_conf() -> MasterConf {
    let mut conf = MasterConf::default();
    conf.blocks_map_capacity = 1 << 12;
    conf.replication_interval_ms = 20;
    conf
}

fn add_closed_file(c: &Cluster, bc_id: i64, replication: u16, blocks: &[Block]) -> Arc<FileCollection> {
    let file = Arc::new(FileCollection::new(
        bc_id,
        format!("/f{}", bc_id),
        replication,
        1 << 20,
    ));
    c.ns.add_file(file.clone());
    for block in blocks {
        file.append_block(block.id);
        c.bm.add_block_collection(*block, bc_id, None);
    }
    file.set_under_construction(false);
    file
}

fn report_all(c: &Cluster, node: &str, blocks: &[Block]) -> bool {
    let report: Vec<ReportedBlock> = blocks.iter().map(|b| ReportedBlock::finalized(*b)).collect();
    c.bm.process_report(node, &DatanodeStorage::new(storage_id(node)), &report)
        .unwrap()
}

fn received(c: &Cluster, node: &str, block: Block) {
    c.bm.process_incremental_block_report(
        node,
        &DatanodeStorage::new(storage_id(node)),
        &[ReceivedDeletedBlock::received(block)],
    )
    .unwrap();
}

fn replicate_targets(cmds: &[DatanodeCommand]) -> Vec<String> {
    cmds.iter()
        .filter_map(|c| match c {
            DatanodeCommand::Replicate { targets, .. } => {
                Some(targets.iter().map(|t| t.datanode.uuid.clone()).collect::<Vec<_>>())
            }
            _ => None,
        })
        .flatten()
        .collect()
}

fn wait_for_scan(bm: &BlockManager) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while bm.replication_queues_init_progress() < 1.0 {
        assert!(Instant::now() < deadline, "mis-replication scan did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
    bm.stop_replication_initializer();
}

/// A file with one triple-replicated block has only two live replicas;
/// one scheduling round restores the third and the queues drain.
#[test]
fn test_three_replica_restore() {
    let c = cluster(small_conf(), &[("dn-1", "/r1"), ("dn-2", "/r1"), ("dn-3", "/r2")]);
    let block = Block::new(1, 1024, 1);
    add_closed_file(&c, 10, 3, &[block]);
    report_all(&c, "dn-1", &[block]);
    report_all(&c, "dn-2", &[block]);

    assert_eq!(c.bm.count_nodes(1).live, 2);
    assert!(c.bm.under_replicated_count() > 0);

    let scheduled = c.bm.compute_datanode_work();
    assert_eq!(scheduled, 1);
    assert_eq!(c.bm.pending_replication_count(), 1);
    assert_eq!(c.bm.under_replicated_count(), 0);

    // the replicate command sits on one of the two holders and targets
    // the empty node
    let mut targets = Vec::new();
    for node in ["dn-1", "dn-2"] {
        targets.extend(replicate_targets(&c.bm.take_datanode_commands(node)));
    }
    assert_eq!(targets, vec!["dn-3".to_string()]);

    received(&c, "dn-3", block);
    assert_eq!(c.bm.count_nodes(1).live, 3);
    assert_eq!(c.bm.pending_replication_count(), 0);
    assert_eq!(c.bm.under_replicated_count(), 0);
}

/// A corrupt replica of a fully replicated block is not deleted while it
/// is still needed; once re-replication restores the target count the
/// bad copy is invalidated.
#[test]
fn test_corrupt_replica_repair_cycle() {
    let c = cluster(
        small_conf(),
        &[("dn-1", "/r1"), ("dn-2", "/r1"), ("dn-3", "/r2"), ("dn-4", "/r2")],
    );
    let block = Block::new(1, 1024, 7);
    add_closed_file(&c, 10, 3, &[block]);
    for node in ["dn-1", "dn-2", "dn-3"] {
        report_all(&c, node, &[block]);
    }
    // dn-4 registers and reports empty, so its contents are trusted
    report_all(&c, "dn-4", &[]);
    assert_eq!(c.bm.count_nodes(1).live, 3);

    c.bm.find_and_mark_block_as_corrupt(
        &ExtendedBlock::new("pool-1", block),
        "dn-2",
        Some(&storage_id("dn-2")),
        "client reported checksum failure",
    )
    .unwrap();

    // live dropped below target: the replica survives for now and the
    // block queues for replication
    let num = c.bm.count_nodes(1);
    assert_eq!(num.live, 2);
    assert_eq!(num.corrupt, 1);
    assert_eq!(c.bm.pending_deletion_count(), 0);
    assert!(c.bm.under_replicated_count() > 0);

    let scheduled = c.bm.compute_datanode_work();
    assert_eq!(scheduled, 1);
    received(&c, "dn-4", block);

    // back at full strength: the corrupt copy on dn-2 is now expendable
    assert_eq!(c.bm.count_nodes(1).live, 3);
    assert_eq!(c.bm.count_nodes(1).corrupt, 0);
    assert!(c.bm.pending_deletion_count() > 0);
    c.bm.compute_invalidate_work(4);
    let cmds = c.bm.take_datanode_commands("dn-2");
    assert!(cmds.iter().any(|cmd| matches!(
        cmd,
        DatanodeCommand::Invalidate { blocks } if blocks.iter().any(|b| b.id == 1)
    )));
}

/// Dropping the replication factor from 3 to 1 sends two replicas
/// through the over-replication reducer.
#[test]
fn test_set_replication_three_to_one() {
    let c = cluster(small_conf(), &[("dn-1", "/r1"), ("dn-2", "/r1"), ("dn-3", "/r2")]);
    let block = Block::new(1, 1024, 1);
    let file = add_closed_file(&c, 10, 3, &[block]);
    for node in ["dn-1", "dn-2", "dn-3"] {
        report_all(&c, node, &[block]);
    }

    file.set_replication(1);
    c.bm.set_replication(3, 1, "/f10", &[1]);

    assert_eq!(c.bm.excess_blocks_count(), 2);
    assert_eq!(c.bm.pending_deletion_count(), 2);
    let num = c.bm.count_nodes(1);
    assert_eq!(num.live, 1);
    assert_eq!(num.excess, 2);

    // deletions are dispatched and confirmed
    c.bm.compute_invalidate_work(4);
    let mut deleted_on = Vec::new();
    for node in ["dn-1", "dn-2", "dn-3"] {
        for cmd in c.bm.take_datanode_commands(node) {
            if let DatanodeCommand::Invalidate { blocks } = cmd {
                assert!(blocks.iter().any(|b| b.id == 1));
                deleted_on.push(node.to_string());
            }
        }
    }
    assert_eq!(deleted_on.len(), 2);
    for node in &deleted_on {
        c.bm.process_incremental_block_report(
            node,
            &DatanodeStorage::new(storage_id(node)),
            &[ReceivedDeletedBlock::deleted(block)],
        )
        .unwrap();
    }
    assert_eq!(c.bm.excess_blocks_count(), 0);
    assert_eq!(c.bm.count_nodes(1).live, 1);
    assert_eq!(c.bm.count_nodes(1).excess, 0);
}

/// After failover every storage is stale; an over-replicated block is
/// postponed until the last holder reports again, then reduced.
#[test]
fn test_failover_postpones_misreplication_until_reports() {
    let c = cluster(small_conf(), &[("dn-1", "/r1"), ("dn-2", "/r2")]);
    let block = Block::new(1, 1024, 1);
    let file = add_closed_file(&c, 10, 2, &[block]);
    report_all(&c, "dn-1", &[block]);
    report_all(&c, "dn-2", &[block]);
    file.set_replication(1);

    // new active master: everything is stale, the surplus cannot be
    // trusted yet
    c.bm.transition_to_active().unwrap();
    wait_for_scan(&c.bm);
    assert_eq!(c.bm.postponed_misreplicated_blocks_count(), 1);
    assert_eq!(c.bm.excess_blocks_count(), 0);

    // one fresh report is not enough; the other storage is still stale
    report_all(&c, "dn-1", &[block]);
    assert_eq!(c.bm.postponed_misreplicated_blocks_count(), 1);

    // the second report clears the staleness and the reducer runs
    report_all(&c, "dn-2", &[block]);
    assert_eq!(c.bm.postponed_misreplicated_blocks_count(), 0);
    assert_eq!(c.bm.excess_blocks_count(), 1);
}

/// First report of a freshly registered storage: known blocks attach via
/// the fast path and count toward the safe threshold; unknown blocks are
/// silently ignored instead of queued for deletion.
#[test]
fn test_first_report_fast_path_and_unknown_blocks() {
    let mut conf = small_conf();
    conf.replication_min = 1;
    let c = cluster(conf, &[("dn-1", "/r1")]);
    c.ns.set_startup_safe_mode(true);

    let known: Vec<Block> = (1..=990).map(|id| Block::new(id, 512, 1)).collect();
    add_closed_file(&c, 10, 1, &known);

    let mut report = known.clone();
    report.extend((10_001..=10_010).map(|id| Block::new(id, 512, 1)));
    report_all(&c, "dn-1", &report);

    assert_eq!(c.ns.safe_block_count(), 990);
    assert_eq!(c.bm.total_blocks(), 990);
    // the ten unknown replicas were dropped, not sentenced
    assert_eq!(c.bm.pending_deletion_count(), 0);
}

/// A replication attempt whose target never reports back times out and
/// the block is rescheduled, possibly from another source.
#[test]
fn test_replication_timeout_allows_retry() {
    let mut conf = small_conf();
    conf.replication_pending_timeout_ms = 0;
    let c = cluster(conf, &[("dn-1", "/r1"), ("dn-2", "/r2"), ("dn-3", "/r2")]);
    let block = Block::new(1, 1024, 1);
    add_closed_file(&c, 10, 2, &[block]);
    report_all(&c, "dn-1", &[block]);

    assert_eq!(c.bm.compute_replication_work(10), 1);
    let first_targets: HashSet<String> =
        replicate_targets(&c.bm.take_datanode_commands("dn-1")).into_iter().collect();
    assert_eq!(first_targets.len(), 1);

    std::thread::sleep(Duration::from_millis(5));
    c.bm.check_pending_timeouts();
    c.bm.process_pending_replications();
    assert_eq!(c.bm.pending_replication_count(), 0);
    assert!(c.bm.under_replicated_count() > 0);

    // a new round schedules the work again
    assert_eq!(c.bm.compute_replication_work(10), 1);
    let second_targets: HashSet<String> =
        replicate_targets(&c.bm.take_datanode_commands("dn-1")).into_iter().collect();
    assert_eq!(second_targets.len(), 1);
    assert_eq!(c.bm.pending_replication_count(), 1);
}

/// The background workers start, converge a cluster and shut down within
/// the grace period.
#[test]
fn test_monitor_lifecycle_converges() {
    let c = cluster(small_conf(), &[("dn-1", "/r1"), ("dn-2", "/r1"), ("dn-3", "/r2")]);
    let block = Block::new(1, 1024, 1);
    add_closed_file(&c, 10, 3, &[block]);
    report_all(&c, "dn-1", &[block]);
    report_all(&c, "dn-2", &[block]);

    c.bm.activate();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if c.bm.pending_replication_count() == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "monitor never scheduled the work");
        std::thread::sleep(Duration::from_millis(10));
    }
    received(&c, "dn-3", block);
    assert_eq!(c.bm.count_nodes(1).live, 3);

    c.bm.close();
}

/// Commit/complete drives the client-visible write lifecycle end to end.
#[test]
fn test_commit_complete_and_append_cycle() {
    let c = cluster(small_conf(), &[("dn-1", "/r1")]);
    let file = Arc::new(FileCollection::new(10, "/f10", 1, 1 << 20));
    c.ns.add_file(file.clone());
    file.append_block(1);
    c.bm.add_block_collection(Block::new(1, 0, 1), 10, Some(vec![]));

    received(&c, "dn-1", Block::new(1, 4096, 1));
    let committed = c
        .bm
        .commit_or_complete_last_block(file.as_ref(), Some(&Block::new(1, 4096, 1)))
        .unwrap();
    assert!(committed);
    file.set_under_construction(false);
    assert!(c.bm.check_min_replication(1));

    // reopen for append: the partial block converts back and its
    // location comes with the pipeline
    file.set_under_construction(true);
    let lb = c
        .bm
        .convert_last_block_to_under_construction(file.as_ref(), "client-1")
        .unwrap()
        .expect("partial last block must convert");
    assert_eq!(lb.block.block.id, 1);
    assert_eq!(lb.locations.len(), 1);
    assert_eq!(lb.locations[0].datanode.uuid, "dn-1");

    // and closes again at a larger size
    let committed = c
        .bm
        .commit_or_complete_last_block(file.as_ref(), Some(&Block::new(1, 8192, 2)))
        .unwrap();
    assert!(committed);
    file.set_under_construction(false);
    let located = c
        .bm
        .create_located_blocks(&[1], 8192, false, 0, 8192, false, "client-1")
        .unwrap();
    assert!(located.last_block_complete);
    assert_eq!(located.blocks.len(), 1);
}
