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

mod datanode_descriptor;
mod node_manager;
mod storage_info;

pub use datanode_descriptor::{AdminState, DatanodeDescriptor, DecommissioningStatus};
pub use node_manager::{NodeManager, NodeSnapshot, StorageSnapshot};
pub use storage_info::DatanodeStorageInfo;

use std::fmt;

/// A `(node, storage)` pair; the endpoint of one replica edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageRef {
    pub node: String,
    pub storage: String,
}

impl StorageRef {
    pub fn new(node: impl Into<String>, storage: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            storage: storage.into(),
        }
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.storage)
    }
}
