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

use super::{BlockCollection, Namesystem};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use talus_common::state::Block;

/// In-memory [`BlockCollection`]: one open or closed file.
pub struct FileCollection {
    id: i64,
    name: String,
    preferred_block_size: i64,
    inner: RwLock<FileInner>,
}

struct FileInner {
    replication: u16,
    block_ids: Vec<i64>,
    under_construction: bool,
}

impl FileCollection {
    pub fn new(id: i64, name: impl Into<String>, replication: u16, block_size: i64) -> Self {
        Self {
            id,
            name: name.into(),
            preferred_block_size: block_size,
            inner: RwLock::new(FileInner {
                replication,
                block_ids: Vec::new(),
                under_construction: true,
            }),
        }
    }

    pub fn append_block(&self, block_id: i64) {
        self.inner.write().block_ids.push(block_id);
    }

    pub fn set_replication(&self, replication: u16) {
        self.inner.write().replication = replication;
    }

    pub fn set_under_construction(&self, uc: bool) {
        self.inner.write().under_construction = uc;
    }
}

impl BlockCollection for FileCollection {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn replication(&self) -> u16 {
        self.inner.read().replication
    }

    fn preferred_block_size(&self) -> i64 {
        self.preferred_block_size
    }

    fn block_ids(&self) -> Vec<i64> {
        self.inner.read().block_ids.clone()
    }

    fn last_block_id(&self) -> Option<i64> {
        self.inner.read().block_ids.last().copied()
    }

    fn is_under_construction(&self) -> bool {
        self.inner.read().under_construction
    }
}

/// In-memory [`Namesystem`]: the file registry, safe-mode counters and
/// the generation-stamp high-water mark. Backs the integration tests and
/// any embedding that does not bring its own namespace.
pub struct MemNamesystem {
    pool_id: String,
    min_replication: u16,
    running: AtomicBool,
    safe_mode: AtomicBool,
    startup_safe_mode: AtomicBool,
    gen_stamp: AtomicI64,
    block_total: AtomicI64,
    safe_blocks: AtomicI64,
    files: RwLock<HashMap<i64, Arc<FileCollection>>>,
}

impl MemNamesystem {
    pub fn new(pool_id: impl Into<String>, min_replication: u16) -> Self {
        Self {
            pool_id: pool_id.into(),
            min_replication,
            running: AtomicBool::new(true),
            safe_mode: AtomicBool::new(false),
            startup_safe_mode: AtomicBool::new(false),
            gen_stamp: AtomicI64::new(i64::MAX),
            block_total: AtomicI64::new(0),
            safe_blocks: AtomicI64::new(0),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_file(&self, file: Arc<FileCollection>) {
        self.files.write().insert(file.id(), file);
    }

    pub fn remove_file(&self, bc_id: i64) -> Option<Arc<FileCollection>> {
        self.files.write().remove(&bc_id)
    }

    pub fn set_safe_mode(&self, on: bool) {
        self.safe_mode.store(on, Ordering::SeqCst);
    }

    pub fn set_startup_safe_mode(&self, on: bool) {
        self.startup_safe_mode.store(on, Ordering::SeqCst);
        if on {
            self.safe_mode.store(true, Ordering::SeqCst);
        }
    }

    /// Highest generation stamp the namespace has issued; reports beyond
    /// it are "from the future".
    pub fn set_gen_stamp(&self, gs: i64) {
        self.gen_stamp.store(gs, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn safe_block_count(&self) -> i64 {
        self.safe_blocks.load(Ordering::SeqCst)
    }

    pub fn block_total(&self) -> i64 {
        self.block_total.load(Ordering::SeqCst)
    }
}

impl Namesystem for MemNamesystem {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    fn is_in_startup_safe_mode(&self) -> bool {
        self.startup_safe_mode.load(Ordering::SeqCst)
    }

    fn is_gen_stamp_in_future(&self, block: &Block) -> bool {
        block.gen_stamp > self.gen_stamp.load(Ordering::SeqCst)
    }

    fn pool_id(&self) -> String {
        self.pool_id.clone()
    }

    fn get_block_collection(&self, bc_id: i64) -> Option<Arc<dyn BlockCollection>> {
        self.files
            .read()
            .get(&bc_id)
            .cloned()
            .map(|f| f as Arc<dyn BlockCollection>)
    }

    fn increment_safe_block_count(&self, live: u16) {
        if live == self.min_replication {
            self.safe_blocks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn decrement_safe_block_count(&self, live: u16) {
        if live + 1 == self.min_replication {
            self.safe_blocks.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn adjust_safe_mode_block_totals(&self, safe_delta: i64, total_delta: i64) {
        self.safe_blocks.fetch_add(safe_delta, Ordering::SeqCst);
        self.block_total.fetch_add(total_delta, Ordering::SeqCst);
    }
}
