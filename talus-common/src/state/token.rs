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

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What a block token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum TokenAccessMode {
    Read,
    Write,
    Copy,
    Replace,
}

/// Opaque credential a client presents to a datanode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlockToken {
    /// Serialized claim: user, block, modes, expiry, issuing key id.
    pub identifier: Bytes,
    /// MAC over the identifier.
    pub password: Bytes,
}

/// One secret key used to mint tokens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BlockKey {
    pub key_id: u32,
    pub expiry_ms: u64,
    pub material: Bytes,
}

/// Key material pushed to datanodes so they can verify tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExportedBlockKeys {
    pub current: Option<BlockKey>,
    pub all: Vec<BlockKey>,
    pub token_lifetime_ms: u64,
}

/// Ephemeral key for encrypting a data-transfer connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataEncryptionKey {
    pub key_id: u32,
    pub nonce: Bytes,
    pub key: Bytes,
    pub expiry_ms: u64,
    pub algorithm: String,
}
