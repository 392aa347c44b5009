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
use std::collections::HashSet;

use log::debug;
use rayon::prelude::*;

use crate::bucket::{BucketSize, Cell, TupleCountEstimate, ROW_INDEX_BYTES};
use crate::columns::{BuildColumns, FragmentExtents};
use crate::error::Result;
use crate::hash_table::HashLayout;

/// Below this many emitted keys distinct cells are always enumerated
const MIN_EXACT_COUNT_KEYS: usize = 1 << 16;

/// Count the keys and payload rows a hash table over `fragments` would have.
///
/// Distinct cells are counted exactly, and the key table is sized at twice that for a load
/// factor of one half. If the payload alone would exceed `max_size_bytes` the table is
/// too big regardless of its keys, so the distinct count is replaced by the upper bound
/// `emitted_keys_count` without enumerating cells.
pub fn approximate_tuple_count(
    fragments: &[&FragmentExtents],
    bucket_size: &BucketSize,
    layout: HashLayout,
    max_size_bytes: usize,
) -> TupleCountEstimate {
    let emitted_keys_count = fragments
        .par_iter()
        .flat_map(|f| f.extents.par_iter())
        .map(|extent| bucket_size.row_cell_count(extent, layout))
        .reduce(|| 0, usize::saturating_add);

    let exact_limit = (max_size_bytes / ROW_INDEX_BYTES).max(MIN_EXACT_COUNT_KEYS);
    let distinct_cells = if emitted_keys_count > exact_limit {
        debug!(
            "Skipping distinct cell count: {emitted_keys_count} emitted keys exceed {max_size_bytes} bytes"
        );
        emitted_keys_count
    } else {
        fragments
            .par_iter()
            .flat_map(|f| f.extents.par_iter())
            .fold(HashSet::<Cell>::new, |mut cells, extent| {
                cells.extend(bucket_size.row_cells(extent, layout));
                cells
            })
            .reduce(HashSet::new, |mut a, mut b| {
                if a.len() < b.len() {
                    std::mem::swap(&mut a, &mut b);
                }
                a.extend(b);
                a
            })
            .len()
    };

    TupleCountEstimate::new(distinct_cells.saturating_mul(2), emitted_keys_count)
}

/// Turn per-fragment-group estimates into the sizes each device's table is built with.
///
/// Unsharded columns are replicated, so every device builds the full table. For sharded
/// columns the key table of a device is sized for its share of shards at the entry count
/// of the largest shard, and the emitted count is the total over all shards.
pub fn compute_hash_table_counts<F>(
    columns: &BuildColumns,
    mut approximate: F,
) -> Result<TupleCountEstimate>
where
    F: FnMut(&[&FragmentExtents]) -> Result<TupleCountEstimate>,
{
    if !columns.is_sharded() {
        return approximate(&columns.distinct_fragments());
    }

    let mut entries_per_shard = 0;
    let mut emitted_keys_count = 0usize;
    for (shard, fragments) in columns.fragments_by_shard() {
        let estimate = approximate(&fragments)?;
        debug!(
            "Shard {shard}: {} entries, {} emitted keys",
            estimate.entry_count, estimate.emitted_keys_count
        );
        entries_per_shard = entries_per_shard.max(estimate.entry_count);
        emitted_keys_count = emitted_keys_count.saturating_add(estimate.emitted_keys_count);
    }

    let shards_per_device = columns
        .shard_count()
        .div_ceil(columns.device_count().max(1));
    Ok(TupleCountEstimate::new(
        entries_per_shard.saturating_mul(shards_per_device),
        emitted_keys_count,
    ))
}
