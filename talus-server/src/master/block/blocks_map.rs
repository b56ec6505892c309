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

use super::block_info::{BlockInfo, StorageSlot};
use crate::master::node::DatanodeStorageInfo;
use log::warn;

enum Slot {
    Empty,
    Tombstone,
    Occupied(Box<BlockInfo>),
}

/// The canonical block index: an open-addressed table from block id to
/// [`BlockInfo`], sized once at construction. The per-storage block lists
/// are threaded through the records' storage slots; all link surgery goes
/// through this map so the list and the index cannot diverge.
pub struct BlocksMap {
    slots: Vec<Slot>,
    mask: usize,
    len: usize,
    /// Occupied plus tombstoned slots; drives cleanup rehashes.
    used: usize,
}

impl BlocksMap {
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(16).next_power_of_two();
        Self {
            slots: (0..cap).map(|_| Slot::Empty).collect(),
            mask: cap - 1,
            len: 0,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_index(&self, id: i64) -> usize {
        fxhash::hash64(&id) as usize & self.mask
    }

    fn probe(&self, id: i64) -> Option<usize> {
        let mut idx = self.slot_index(id);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(info) if info.id() == id => return Some(idx),
                _ => idx = (idx + 1) & self.mask,
            }
        }
        None
    }

    pub fn contains(&self, id: i64) -> bool {
        self.probe(id).is_some()
    }

    pub fn get(&self, id: i64) -> Option<&BlockInfo> {
        self.probe(id).map(|idx| match &self.slots[idx] {
            Slot::Occupied(info) => info.as_ref(),
            _ => unreachable!(),
        })
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut BlockInfo> {
        let idx = self.probe(id)?;
        match &mut self.slots[idx] {
            Slot::Occupied(info) => Some(info.as_mut()),
            _ => unreachable!(),
        }
    }

    /// Insert a record, replacing any record with the same id. The
    /// replaced record's replica edges are carried over.
    pub fn insert(&mut self, mut info: BlockInfo) -> Option<BlockInfo> {
        if self.used * 8 >= self.slots.len() * 7 {
            self.rehash();
        }

        let mut idx = self.slot_index(info.id());
        let mut insert_at = None;
        for _ in 0..self.slots.len() {
            match &mut self.slots[idx] {
                Slot::Empty => {
                    let at = insert_at.unwrap_or(idx);
                    let reused_tombstone = insert_at.is_some();
                    self.slots[at] = Slot::Occupied(Box::new(info));
                    self.len += 1;
                    if !reused_tombstone {
                        self.used += 1;
                    }
                    return None;
                }
                Slot::Tombstone => {
                    if insert_at.is_none() {
                        insert_at = Some(idx);
                    }
                    idx = (idx + 1) & self.mask;
                }
                Slot::Occupied(existing) if existing.id() == info.id() => {
                    // keep the replica edges; only the record changes
                    info.slots = std::mem::take(&mut existing.slots);
                    let old = std::mem::replace(existing.as_mut(), info);
                    return Some(old);
                }
                Slot::Occupied(_) => idx = (idx + 1) & self.mask,
            }
        }
        unreachable!("blocks map probe exhausted all slots");
    }

    /// Remove a record. The caller must have unlinked every replica edge
    /// first.
    pub fn remove(&mut self, id: i64) -> Option<BlockInfo> {
        let idx = self.probe(id)?;
        let slot = std::mem::replace(&mut self.slots[idx], Slot::Tombstone);
        self.len -= 1;
        match slot {
            Slot::Occupied(info) => {
                debug_assert!(
                    info.slots.is_empty(),
                    "removing {} with live replica edges",
                    info.block
                );
                Some(*info)
            }
            _ => unreachable!(),
        }
    }

    fn rehash(&mut self) {
        let grow = self.len * 8 >= self.slots.len() * 7;
        let new_cap = if grow {
            warn!(
                "BlocksMap grew past its configured capacity ({} blocks); doubling",
                self.len
            );
            self.slots.len() * 2
        } else {
            self.slots.len()
        };

        let old = std::mem::replace(
            &mut self.slots,
            (0..new_cap).map(|_| Slot::Empty).collect(),
        );
        self.mask = new_cap - 1;
        self.len = 0;
        self.used = 0;
        for slot in old {
            if let Slot::Occupied(info) = slot {
                self.insert(*info);
            }
        }
    }

    /// Collect up to `limit` block ids starting at table slot `cursor`.
    /// Returns the ids and the next cursor; `None` means the scan
    /// reached the end of the table.
    pub fn scan_chunk(&self, cursor: usize, limit: usize) -> (Vec<i64>, Option<usize>) {
        let mut ids = Vec::with_capacity(limit.min(self.len));
        let mut idx = cursor;
        while idx < self.slots.len() && ids.len() < limit {
            if let Slot::Occupied(info) = &self.slots[idx] {
                ids.push(info.id());
            }
            idx += 1;
        }
        let next = if idx >= self.slots.len() { None } else { Some(idx) };
        (ids, next)
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(info) => Some(info.id()),
            _ => None,
        })
    }

    // ---- per-storage intrusive list ----

    /// Record that `storage` holds a replica of `block_id`, linking the
    /// block at the head of the storage's list. Returns false if the edge
    /// already exists or the block is unknown.
    pub fn add_to_storage_list(
        &mut self,
        storage: &mut DatanodeStorageInfo,
        block_id: i64,
    ) -> bool {
        let node = storage.node_uuid().to_string();
        let storage_id = storage.storage_id.clone();
        let old_head = storage.head;

        match self.get_mut(block_id) {
            None => return false,
            Some(info) => {
                if info.find_slot(&storage_id).is_some() {
                    return false;
                }
                info.slots.push(StorageSlot {
                    node,
                    storage_id: storage_id.clone(),
                    prev: None,
                    next: old_head,
                });
            }
        }

        if let Some(head_id) = old_head {
            if let Some(head) = self.get_mut(head_id) {
                if let Some(idx) = head.find_slot(&storage_id) {
                    head.slots[idx].prev = Some(block_id);
                }
            }
        }
        storage.head = Some(block_id);
        storage.num_blocks += 1;
        true
    }

    /// Drop the `(block, storage)` edge, unlinking the block from the
    /// storage's list in O(1). Returns false if there was no such edge.
    pub fn remove_from_storage_list(
        &mut self,
        storage: &mut DatanodeStorageInfo,
        block_id: i64,
    ) -> bool {
        let storage_id = storage.storage_id.clone();
        let (prev, next) = match self.get_mut(block_id) {
            None => return false,
            Some(info) => match info.find_slot(&storage_id) {
                None => return false,
                Some(idx) => {
                    let slot = info.slots.remove(idx);
                    (slot.prev, slot.next)
                }
            },
        };

        match prev {
            Some(prev_id) => {
                if let Some(prev_info) = self.get_mut(prev_id) {
                    if let Some(idx) = prev_info.find_slot(&storage_id) {
                        prev_info.slots[idx].next = next;
                    }
                }
            }
            None => storage.head = next,
        }
        if let Some(next_id) = next {
            if let Some(next_info) = self.get_mut(next_id) {
                if let Some(idx) = next_info.find_slot(&storage_id) {
                    next_info.slots[idx].prev = prev;
                }
            }
        }
        storage.num_blocks = storage.num_blocks.saturating_sub(1);
        true
    }

    /// Walk the storage's block list from its head.
    pub fn storage_block_ids(&self, storage: &DatanodeStorageInfo) -> Vec<i64> {
        let mut ids = Vec::with_capacity(storage.num_blocks());
        let mut cur = storage.head;
        while let Some(id) = cur {
            ids.push(id);
            cur = self
                .get(id)
                .and_then(|info| info.find_slot(&storage.storage_id))
                .and_then(|idx| self.get(id).unwrap().slots[idx].next);
        }
        ids
    }
}
