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
use log::info;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use talus_common::state::{
    BlockKey, BlockToken, DataEncryptionKey, ExportedBlockKeys, ExtendedBlock, TokenAccessMode,
};
use talus_common::utils::LocalTime;
use talus_common::FsResult;

/// Issues opaque block access credentials and the key material datanodes
/// need to verify them.
pub trait BlockTokenIssuer: Send + Sync {
    fn generate_token(
        &self,
        user: &str,
        block: &ExtendedBlock,
        modes: &[TokenAccessMode],
    ) -> FsResult<BlockToken>;

    fn export_keys(&self) -> ExportedBlockKeys;

    /// Rotate the current key if the update interval elapsed. Returns
    /// true when new material was produced and nodes need a key update.
    fn update_keys(&self) -> bool;

    fn generate_data_encryption_key(&self) -> FsResult<DataEncryptionKey>;
}

const KEY_LEN: usize = 32;

struct KeyState {
    current: BlockKey,
    previous: Vec<BlockKey>,
    next_serial: u32,
    last_update_ms: u64,
}

/// Key manager with a rotating current key. Old keys are retained until
/// every token minted under them has expired.
pub struct BlockKeyManager {
    state: Mutex<KeyState>,
    update_interval_ms: u64,
    token_lifetime_ms: u64,
    algorithm: String,
}

impl BlockKeyManager {
    pub fn new(update_interval_ms: u64, token_lifetime_ms: u64, algorithm: String) -> Self {
        let now = LocalTime::mills();
        let first = Self::make_key(1, now + update_interval_ms + token_lifetime_ms);
        info!(
            "block keys enabled, update interval {} ms, token lifetime {} ms",
            update_interval_ms, token_lifetime_ms
        );
        Self {
            state: Mutex::new(KeyState {
                current: first,
                previous: Vec::new(),
                next_serial: 2,
                last_update_ms: now,
            }),
            update_interval_ms,
            token_lifetime_ms,
            algorithm,
        }
    }

    fn make_key(key_id: u32, expiry_ms: u64) -> BlockKey {
        let mut material = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut material);
        BlockKey {
            key_id,
            expiry_ms,
            material: Bytes::from(material),
        }
    }

    fn mac(key: &BlockKey, identifier: &[u8]) -> Bytes {
        let mut hasher = Sha256::new();
        hasher.update(&key.material);
        hasher.update(identifier);
        Bytes::copy_from_slice(&hasher.finalize())
    }
}

impl BlockTokenIssuer for BlockKeyManager {
    fn generate_token(
        &self,
        user: &str,
        block: &ExtendedBlock,
        modes: &[TokenAccessMode],
    ) -> FsResult<BlockToken> {
        let state = self.state.lock();
        let expiry = LocalTime::mills() + self.token_lifetime_ms;
        let identifier = format!(
            "{}:{}:{}:{}:{:?}:{}",
            user, block.pool_id, block.block.id, expiry, modes, state.current.key_id
        );
        let identifier = Bytes::from(identifier.into_bytes());
        let password = Self::mac(&state.current, &identifier);
        Ok(BlockToken {
            identifier,
            password,
        })
    }

    fn export_keys(&self) -> ExportedBlockKeys {
        let state = self.state.lock();
        let mut all = state.previous.clone();
        all.push(state.current.clone());
        ExportedBlockKeys {
            current: Some(state.current.clone()),
            all,
            token_lifetime_ms: self.token_lifetime_ms,
        }
    }

    fn update_keys(&self) -> bool {
        let now = LocalTime::mills();
        let mut state = self.state.lock();
        if now < state.last_update_ms + self.update_interval_ms {
            return false;
        }

        let serial = state.next_serial;
        state.next_serial += 1;
        let fresh = Self::make_key(serial, now + self.update_interval_ms + self.token_lifetime_ms);
        let retired = std::mem::replace(&mut state.current, fresh);
        state.previous.push(retired);
        state.previous.retain(|k| k.expiry_ms > now);
        state.last_update_ms = now;
        info!("rotated block key, current id {}", serial);
        true
    }

    fn generate_data_encryption_key(&self) -> FsResult<DataEncryptionKey> {
        let state = self.state.lock();
        let mut nonce = vec![0u8; 16];
        let mut key = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        rand::thread_rng().fill_bytes(&mut key);
        Ok(DataEncryptionKey {
            key_id: state.current.key_id,
            nonce: Bytes::from(nonce),
            key: Bytes::from(key),
            expiry_ms: state.current.expiry_ms,
            algorithm: self.algorithm.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talus_common::state::Block;

    fn block() -> ExtendedBlock {
        ExtendedBlock::new("pool-1", Block::new(7, 100, 1))
    }

    #[test]
    fn test_token_is_bound_to_current_key() {
        let mgr = BlockKeyManager::new(0, 60_000, "AES/CTR/NoPadding".into());
        let t1 = mgr
            .generate_token("alice", &block(), &[TokenAccessMode::Read])
            .unwrap();
        assert!(!t1.identifier.is_empty());
        assert_eq!(t1.password.len(), 32);

        // same claim, same key: same mac; rotated key: different mac
        let t2 = mgr
            .generate_token("alice", &block(), &[TokenAccessMode::Read])
            .unwrap();
        assert!(mgr.update_keys());
        let t3 = mgr
            .generate_token("alice", &block(), &[TokenAccessMode::Read])
            .unwrap();
        assert_ne!(t2.password, t3.password);
    }

    #[test]
    fn test_update_keys_respects_interval() {
        let mgr = BlockKeyManager::new(60 * 60 * 1_000, 60_000, String::new());
        assert!(!mgr.update_keys());
    }

    #[test]
    fn test_export_keys_contains_history() {
        let mgr = BlockKeyManager::new(0, 60_000, String::new());
        mgr.update_keys();
        let keys = mgr.export_keys();
        assert_eq!(keys.current.as_ref().unwrap().key_id, 2);
        assert_eq!(keys.all.len(), 2);
        assert_eq!(keys.token_lifetime_ms, 60_000);
    }

    #[test]
    fn test_encryption_key_material_is_fresh() {
        let mgr = BlockKeyManager::new(0, 60_000, "AES/CTR/NoPadding".into());
        let a = mgr.generate_data_encryption_key().unwrap();
        let b = mgr.generate_data_encryption_key().unwrap();
        assert_ne!(a.key, b.key);
        assert_eq!(a.algorithm, "AES/CTR/NoPadding");
    }
}
