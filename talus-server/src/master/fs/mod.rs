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

mod mem;
pub mod policy;

pub use mem::{FileCollection, MemNamesystem};

use std::sync::Arc;
use talus_common::state::Block;

/// A file handle as the block manager sees it: an ordered list of block
/// ids plus the replication parameters the namespace tracks per file.
pub trait BlockCollection: Send + Sync {
    fn id(&self) -> i64;

    /// Path-like name, used for placement and logging.
    fn name(&self) -> String;

    fn replication(&self) -> u16;

    fn preferred_block_size(&self) -> i64;

    fn block_ids(&self) -> Vec<i64>;

    fn last_block_id(&self) -> Option<i64>;

    /// The file is open for write.
    fn is_under_construction(&self) -> bool;
}

/// The namespace layer the block manager runs inside: lifecycle flags,
/// safe-mode accounting and file resolution. Safe-mode bookkeeping only
/// counts `Complete` blocks; the caller reports the live replica count at
/// each transition and the namespace decides whether the safe threshold
/// moved.
pub trait Namesystem: Send + Sync {
    fn is_running(&self) -> bool;

    fn is_in_safe_mode(&self) -> bool;

    /// Startup safe mode: block totals are still being established from
    /// first reports.
    fn is_in_startup_safe_mode(&self) -> bool;

    /// A reported generation stamp is ahead of everything the namespace
    /// has seen; on a standby this means edits are still catching up.
    fn is_gen_stamp_in_future(&self, block: &Block) -> bool;

    fn pool_id(&self) -> String;

    fn get_block_collection(&self, bc_id: i64) -> Option<Arc<dyn BlockCollection>>;

    /// A block reached `live` replicas; counts toward the safe threshold
    /// when it crosses the minimum.
    fn increment_safe_block_count(&self, live: u16);

    /// A complete block dropped to `live` replicas.
    fn decrement_safe_block_count(&self, live: u16);

    /// Blocks entered or left the `Complete` population.
    fn adjust_safe_mode_block_totals(&self, safe_delta: i64, total_delta: i64);
}
