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

use super::{BlockToken, ExtendedBlock, StorageLocation};
use serde::{Deserialize, Serialize};

/// A block plus the storages a reader (or writer) can reach it on.
/// Live locations come first; corrupt ones are appended last so clients
/// try them only as a last resort.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocatedBlock {
    pub block: ExtendedBlock,
    pub locations: Vec<StorageLocation>,
    /// Offset of this block within the file.
    pub offset: i64,
    /// All replicas are corrupt; the locations are best-effort.
    pub corrupt: bool,
    pub token: Option<BlockToken>,
}

impl LocatedBlock {
    pub fn new(block: ExtendedBlock, locations: Vec<StorageLocation>, offset: i64) -> Self {
        Self {
            block,
            locations,
            offset,
            corrupt: false,
            token: None,
        }
    }
}

/// Locations for a slice of a file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocatedBlocks {
    /// File length excluding any block still under construction.
    pub file_length: i64,
    pub under_construction: bool,
    pub blocks: Vec<LocatedBlock>,
    pub last_block: Option<LocatedBlock>,
    pub last_block_complete: bool,
}
