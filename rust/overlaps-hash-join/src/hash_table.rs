// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::sync::Arc;

use datafusion_execution::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use overlaps_geometry::bounding_extent::BoundingExtent;

use crate::bucket::{BucketSize, Cell, TupleCountEstimate, EMPTY_CELL};

/// How build rows are assigned to grid cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashLayout {
    /// Each row is stored in exactly one cell, the cell of its minimum corner
    OneToMany,
    /// Each row is stored in every cell its extent overlaps
    ManyToMany,
}

/// Home slot of `cell` in a table of `slot_count` slots
fn slot_hash(cell: &Cell, slot_count: usize) -> usize {
    let mut h = (cell[0] as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= (cell[1] as u64)
        .rotate_left(32)
        .wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= h >> 29;
    (h % slot_count as u64) as usize
}

/// Linear probe for the slot holding `cell`, or the first empty slot on its probe path.
/// Returns `None` if the table is full and does not contain `cell`.
pub(crate) fn find_slot(keys: &[Cell], cell: &Cell) -> Option<usize> {
    let slot_count = keys.len();
    if slot_count == 0 {
        return None;
    }
    let home = slot_hash(cell, slot_count);
    (0..slot_count)
        .map(|i| (home + i) % slot_count)
        .find(|&slot| keys[slot] == *cell || keys[slot] == EMPTY_CELL)
}

/// The hash table built on one device.
///
/// `keys` holds the cell of each slot, `offsets[slot]..offsets[slot + 1]` delimits the
/// rows of that slot in `row_indices`. The memory is charged to the device's pool for as
/// long as the table lives.
#[derive(Debug)]
pub struct DeviceHashTable {
    device_id: usize,
    keys: Vec<Cell>,
    offsets: Vec<u32>,
    row_indices: Vec<u32>,
    reservation: MemoryReservation,
}

impl DeviceHashTable {
    pub(crate) fn new(
        device_id: usize,
        keys: Vec<Cell>,
        offsets: Vec<u32>,
        row_indices: Vec<u32>,
        reservation: MemoryReservation,
    ) -> Self {
        Self {
            device_id,
            keys,
            offsets,
            row_indices,
            reservation,
        }
    }

    /// A table without keys
    pub(crate) fn empty(device_id: usize, pool: &Arc<dyn MemoryPool>) -> Self {
        let reservation =
            MemoryConsumer::new(format!("OverlapsHashTable[{device_id}]")).register(pool);
        Self::new(device_id, Vec::new(), vec![0], Vec::new(), reservation)
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn entry_count(&self) -> usize {
        self.keys.len()
    }

    pub fn emitted_keys_count(&self) -> usize {
        self.row_indices.len()
    }

    pub fn keys(&self) -> &[Cell] {
        &self.keys
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn row_indices(&self) -> &[u32] {
        &self.row_indices
    }

    /// Bytes reserved for this table
    pub fn memory_size(&self) -> usize {
        self.reservation.size()
    }

    /// Number of slots holding a cell
    pub fn occupied_slots(&self) -> usize {
        self.keys.iter().filter(|k| **k != EMPTY_CELL).count()
    }

    /// Rows stored in `cell`, in ascending row order
    pub fn rows_for_cell(&self, cell: &Cell) -> &[u32] {
        match find_slot(&self.keys, cell) {
            Some(slot) if self.keys[slot] == *cell => {
                let start = self.offsets[slot] as usize;
                let end = self.offsets[slot + 1] as usize;
                &self.row_indices[start..end]
            }
            _ => &[],
        }
    }
}

/// An overlaps hash table built for one join condition.
///
/// Shared by every query that resolves to the same cache key; all state is immutable
/// after the build.
#[derive(Debug)]
pub struct OverlapsHashTable {
    layout: HashLayout,
    bucket_size: BucketSize,
    estimate: TupleCountEstimate,
    bucket_threshold: f64,
    max_size_bytes: usize,
    device_tables: Vec<DeviceHashTable>,
}

impl OverlapsHashTable {
    pub(crate) fn new(
        layout: HashLayout,
        bucket_size: BucketSize,
        estimate: TupleCountEstimate,
        bucket_threshold: f64,
        max_size_bytes: usize,
        device_tables: Vec<DeviceHashTable>,
    ) -> Self {
        Self {
            layout,
            bucket_size,
            estimate,
            bucket_threshold,
            max_size_bytes,
            device_tables,
        }
    }

    pub fn layout(&self) -> HashLayout {
        self.layout
    }

    pub fn bucket_size(&self) -> &BucketSize {
        &self.bucket_size
    }

    pub fn entry_count(&self) -> usize {
        self.estimate.entry_count
    }

    pub fn emitted_keys_count(&self) -> usize {
        self.estimate.emitted_keys_count
    }

    /// The bucket threshold the table was built with
    pub fn bucket_threshold(&self) -> f64 {
        self.bucket_threshold
    }

    /// The size bound the table was built under
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.estimate.entry_count == 0
    }

    pub fn device_tables(&self) -> &[DeviceHashTable] {
        &self.device_tables
    }

    pub fn device_table(&self, device_id: usize) -> Option<&DeviceHashTable> {
        self.device_tables.iter().find(|t| t.device_id == device_id)
    }

    /// Bytes reserved on all devices
    pub fn memory_size(&self) -> usize {
        self.device_tables.iter().map(|t| t.memory_size()).sum()
    }

    /// Build rows on `device_id` whose cells overlap `probe`, sorted and deduplicated.
    /// Returns `None` for an unknown device.
    ///
    /// Candidates still need an exact geometry test.
    pub fn candidate_rows(&self, device_id: usize, probe: &BoundingExtent) -> Option<Vec<u32>> {
        let table = self.device_table(device_id)?;
        let Some(range) = self.bucket_size.cell_range(probe) else {
            return Some(Vec::new());
        };
        let mut rows: Vec<u32> = range
            .cells()
            .flat_map(|cell| table.rows_for_cell(&cell).iter().copied())
            .collect();
        rows.sort_unstable();
        rows.dedup();
        Some(rows)
    }
}
