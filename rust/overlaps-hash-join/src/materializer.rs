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
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use datafusion_common::DataFusionError;
use datafusion_execution::memory_pool::{MemoryConsumer, MemoryPool};
use log::{debug, warn};
use overlaps_common::overlaps_internal_err;
use overlaps_geometry::bounding_extent::BoundingExtent;
use rayon::prelude::*;

use crate::bucket::{hash_table_size_bytes, BucketSize, Cell, TupleCountEstimate, EMPTY_CELL};
use crate::columns::{BuildColumns, ColumnsForDevice};
use crate::error::{OverlapsJoinError, Result};
use crate::hash_table::{find_slot, DeviceHashTable, HashLayout};

/// Smallest row chunk of the parallel passes
const MIN_CHUNK_ROWS: usize = 4096;

/// Everything needed to build the per-device tables of one hash table
#[derive(Debug, Clone, Copy)]
pub struct MaterializeRequest<'a> {
    pub columns: &'a BuildColumns,
    pub bucket_size: BucketSize,
    pub layout: HashLayout,
    pub estimate: TupleCountEstimate,
    /// Memory pool of each device, indexed by device id
    pub pools: &'a [Arc<dyn MemoryPool>],
}

/// Build the hash table of every device in parallel.
///
/// Each device reserves the exact size of its table from its own pool before allocating.
/// The emitted keys counted while building must match the estimate the table was sized
/// with: per device for replicated columns and in total for sharded ones. On any failure
/// the tables already built are dropped, releasing their reservations.
pub fn materialize(request: &MaterializeRequest<'_>) -> Result<Vec<DeviceHashTable>> {
    let columns = request.columns;
    if request.pools.len() != columns.device_count() {
        return overlaps_internal_err!(
            "{} memory pools for {} devices",
            request.pools.len(),
            columns.device_count()
        )
        .map_err(OverlapsJoinError::from);
    }

    let tables = columns
        .per_device()
        .par_iter()
        .zip(request.pools.par_iter())
        .map(|(device, pool)| materialize_device(request, device, pool))
        .collect::<Result<Vec<_>>>()?;

    if columns.is_sharded() {
        let emitted: usize = tables.iter().map(|t| t.emitted_keys_count()).sum();
        if emitted != request.estimate.emitted_keys_count {
            return Err(OverlapsJoinError::InconsistentCountEstimate(format!(
                "devices emitted {emitted} keys in total, estimated {}",
                request.estimate.emitted_keys_count
            )));
        }
    }

    Ok(tables)
}

fn materialize_device(
    request: &MaterializeRequest<'_>,
    device: &ColumnsForDevice,
    pool: &Arc<dyn MemoryPool>,
) -> Result<DeviceHashTable> {
    let rows: Vec<_> = device.rows().collect();
    let chunk_rows = rows
        .len()
        .div_ceil(rayon::current_num_threads())
        .max(MIN_CHUNK_ROWS);
    materialize_device_in_chunks(request, device.device_id, &rows, chunk_rows, pool)
}

/// Builds one device table with both passes split into row chunks of `chunk_rows`.
///
/// Keys are placed in sorted cell order and every chunk scatters from its own cursors,
/// so the table does not depend on the chunking.
fn materialize_device_in_chunks(
    request: &MaterializeRequest<'_>,
    device_id: usize,
    rows: &[(usize, &BoundingExtent)],
    chunk_rows: usize,
    pool: &Arc<dyn MemoryPool>,
) -> Result<DeviceHashTable> {
    let bucket_size = &request.bucket_size;
    let layout = request.layout;
    let entry_count = request.estimate.entry_count;
    let chunk_rows = chunk_rows.max(1);

    let emitted = rows
        .par_iter()
        .map(|(_, extent)| bucket_size.row_cell_count(extent, layout))
        .reduce(|| 0, usize::saturating_add);
    if !request.columns.is_sharded() && emitted != request.estimate.emitted_keys_count {
        return Err(OverlapsJoinError::InconsistentCountEstimate(format!(
            "device {device_id} emits {emitted} keys, estimated {}",
            request.estimate.emitted_keys_count
        )));
    }
    if u32::try_from(emitted).is_err() {
        return Err(DataFusionError::ResourcesExhausted(format!(
            "{emitted} emitted keys on device {device_id} exceed the 32-bit row index range"
        ))
        .into());
    }

    let size_bytes = hash_table_size_bytes(entry_count, emitted);
    let mut reservation =
        MemoryConsumer::new(format!("OverlapsHashTable[{device_id}]")).register(pool);
    reservation
        .try_grow(size_bytes)
        .map_err(|source| {
            warn!("Cannot reserve {size_bytes} bytes on device {device_id}: {source}");
            OverlapsJoinError::DeviceAllocationFailure {
                device_id,
                requested_bytes: size_bytes,
                source,
            }
        })?;

    // Pass 1: place keys, then count rows per slot and chunk
    let mut cells: Vec<Cell> = rows
        .par_chunks(chunk_rows)
        .fold(HashSet::<Cell>::new, |mut cells, chunk| {
            for (_, extent) in chunk {
                cells.extend(bucket_size.row_cells(extent, layout));
            }
            cells
        })
        .reduce(HashSet::new, |mut a, mut b| {
            if a.len() < b.len() {
                std::mem::swap(&mut a, &mut b);
            }
            a.extend(b);
            a
        })
        .into_iter()
        .collect();
    cells.par_sort_unstable();

    let mut keys = vec![EMPTY_CELL; entry_count];
    for cell in &cells {
        let Some(slot) = find_slot(&keys, cell) else {
            return Err(OverlapsJoinError::InconsistentCountEstimate(format!(
                "device {device_id} has more distinct cells than its {entry_count} slots"
            )));
        };
        keys[slot] = *cell;
    }

    let mut chunk_counts = rows
        .par_chunks(chunk_rows)
        .map(|chunk| {
            let mut counts = vec![0u32; entry_count];
            for (_, extent) in chunk {
                for cell in bucket_size.row_cells(extent, layout) {
                    let Some(slot) = find_slot(&keys, &cell) else {
                        return overlaps_internal_err!(
                            "Cell {cell:?} vanished from device {device_id}"
                        );
                    };
                    counts[slot] += 1;
                }
            }
            Ok(counts)
        })
        .collect::<datafusion_common::Result<Vec<_>>>()?;

    // Prefix sum over slots. Each chunk's counts become its first write position per slot.
    let mut offsets = Vec::with_capacity(entry_count + 1);
    let mut total = 0u32;
    offsets.push(total);
    for slot in 0..entry_count {
        for counts in chunk_counts.iter_mut() {
            let count = counts[slot];
            counts[slot] = total;
            total += count;
        }
        offsets.push(total);
    }

    // Pass 2: scatter row ids, chunks write disjoint positions
    let row_indices: Vec<AtomicU32> = (0..emitted).map(|_| AtomicU32::new(0)).collect();
    rows.par_chunks(chunk_rows)
        .zip(chunk_counts.into_par_iter())
        .try_for_each(|(chunk, mut cursors)| {
            for (row, extent) in chunk {
                let row = u32::try_from(*row).map_err(|_| {
                    DataFusionError::ResourcesExhausted(format!(
                        "Row {row} exceeds the 32-bit row index range"
                    ))
                })?;
                for cell in bucket_size.row_cells(extent, layout) {
                    let Some(slot) = find_slot(&keys, &cell) else {
                        return overlaps_internal_err!(
                            "Cell {cell:?} vanished from device {device_id}"
                        );
                    };
                    row_indices[cursors[slot] as usize].store(row, Ordering::Relaxed);
                    cursors[slot] += 1;
                }
            }
            Ok(())
        })?;
    let row_indices = row_indices
        .into_iter()
        .map(AtomicU32::into_inner)
        .collect();

    debug!(
        "Materialized overlaps hash table on device {device_id}: {entry_count} entries, \
         {emitted} emitted keys, {size_bytes} bytes"
    );
    Ok(DeviceHashTable::new(
        device_id,
        keys,
        offsets,
        row_indices,
        reservation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::FragmentExtents;
    use crate::counter::approximate_tuple_count;
    use datafusion_execution::memory_pool::{GreedyMemoryPool, UnboundedMemoryPool};
    use overlaps_geometry::bounding_extent::BoundingExtent;

    fn polygon_columns(device_count: usize) -> BuildColumns {
        let extents = vec![
            BoundingExtent::xy((0.0, 2.0), (0.0, 2.0)),
            BoundingExtent::xy((0.0, 2.0), (0.0, 2.0)),
            BoundingExtent::xy((2.0, 4.0), (2.0, 4.0)),
            BoundingExtent::xy((0.0, 50.0), (0.0, 50.0)),
        ];
        let per_device = (0..device_count)
            .map(|device_id| ColumnsForDevice {
                device_id,
                fragments: vec![FragmentExtents {
                    fragment_id: 0,
                    shard: None,
                    row_offset: 0,
                    extents: extents.clone(),
                }],
            })
            .collect();
        BuildColumns::new(per_device, 0)
    }

    fn unbounded_pools(n: usize) -> Vec<Arc<dyn MemoryPool>> {
        (0..n)
            .map(|_| Arc::new(UnboundedMemoryPool::default()) as Arc<dyn MemoryPool>)
            .collect()
    }

    fn estimate(columns: &BuildColumns, bucket_size: &BucketSize) -> TupleCountEstimate {
        approximate_tuple_count(
            &columns.distinct_fragments(),
            bucket_size,
            HashLayout::ManyToMany,
            usize::MAX,
        )
    }

    #[test]
    fn test_materialize_offsets_and_rows() {
        let columns = polygon_columns(1);
        let bucket_size = BucketSize::new([50.0, 50.0]);
        let pools = unbounded_pools(1);
        let request = MaterializeRequest {
            columns: &columns,
            bucket_size,
            layout: HashLayout::ManyToMany,
            estimate: estimate(&columns, &bucket_size),
            pools: &pools,
        };
        let tables = materialize(&request).unwrap();
        let table = &tables[0];

        assert_eq!(table.entry_count(), 8);
        assert_eq!(table.emitted_keys_count(), 7);
        assert_eq!(table.occupied_slots(), 4);
        assert_eq!(table.offsets().len(), 9);
        assert_eq!(table.offsets()[8], 7);
        assert_eq!(table.rows_for_cell(&[0, 0]), &[0, 1, 2, 3]);
        assert_eq!(table.rows_for_cell(&[1, 1]), &[3]);
        assert!(table.rows_for_cell(&[2, 2]).is_empty());
        assert_eq!(table.memory_size(), 192);
        assert_eq!(pools[0].reserved(), 192);

        drop(tables);
        assert_eq!(pools[0].reserved(), 0);
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let columns = polygon_columns(2);
        let bucket_size = BucketSize::new([2.0, 2.0]);
        let pools = unbounded_pools(2);
        let request = MaterializeRequest {
            columns: &columns,
            bucket_size,
            layout: HashLayout::ManyToMany,
            estimate: estimate(&columns, &bucket_size),
            pools: &pools,
        };
        let first = materialize(&request).unwrap();
        let second = materialize(&request).unwrap();
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.keys(), b.keys());
            assert_eq!(a.offsets(), b.offsets());
            assert_eq!(a.row_indices(), b.row_indices());
        }
        // Replicated devices build identical tables
        assert_eq!(first[0].row_indices(), first[1].row_indices());
        assert_eq!(first[0].emitted_keys_count(), 688);
    }

    #[test]
    fn test_chunked_passes_match_single_chunk() {
        let columns = polygon_columns(1);
        let bucket_size = BucketSize::new([2.0, 2.0]);
        let pools = unbounded_pools(1);
        let request = MaterializeRequest {
            columns: &columns,
            bucket_size,
            layout: HashLayout::ManyToMany,
            estimate: estimate(&columns, &bucket_size),
            pools: &pools,
        };
        let rows: Vec<_> = columns.per_device()[0].rows().collect();
        let single =
            materialize_device_in_chunks(&request, 0, &rows, rows.len(), &pools[0]).unwrap();

        for chunk_rows in [1, 3] {
            let chunked =
                materialize_device_in_chunks(&request, 0, &rows, chunk_rows, &pools[0]).unwrap();
            assert_eq!(chunked.keys(), single.keys());
            assert_eq!(chunked.offsets(), single.offsets());
            assert_eq!(chunked.row_indices(), single.row_indices());
        }
        // Rows of a slot keep ascending row order across chunks
        assert_eq!(single.rows_for_cell(&[0, 0]), &[0, 1, 3]);
        assert_eq!(single.rows_for_cell(&[1, 1]), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_allocation_failure_releases_memory() {
        let columns = polygon_columns(2);
        let bucket_size = BucketSize::new([2.0, 2.0]);
        let pools: Vec<Arc<dyn MemoryPool>> = vec![
            Arc::new(UnboundedMemoryPool::default()),
            Arc::new(GreedyMemoryPool::new(1024)),
        ];
        let request = MaterializeRequest {
            columns: &columns,
            bucket_size,
            layout: HashLayout::ManyToMany,
            estimate: estimate(&columns, &bucket_size),
            pools: &pools,
        };
        let err = materialize(&request).unwrap_err();
        assert!(matches!(
            err,
            OverlapsJoinError::DeviceAllocationFailure {
                device_id: 1,
                requested_bytes: 29796,
                ..
            }
        ));
        assert_eq!(pools[0].reserved(), 0);
        assert_eq!(pools[1].reserved(), 0);
    }

    #[test]
    fn test_inconsistent_estimate() {
        let columns = polygon_columns(1);
        let bucket_size = BucketSize::new([2.0, 2.0]);
        let pools = unbounded_pools(1);

        let mut request = MaterializeRequest {
            columns: &columns,
            bucket_size,
            layout: HashLayout::ManyToMany,
            estimate: TupleCountEstimate::new(1352, 100),
            pools: &pools,
        };
        assert!(matches!(
            materialize(&request),
            Err(OverlapsJoinError::InconsistentCountEstimate(_))
        ));

        // Too few slots for the distinct cells
        request.estimate = TupleCountEstimate::new(100, 688);
        assert!(matches!(
            materialize(&request),
            Err(OverlapsJoinError::InconsistentCountEstimate(_))
        ));
        assert_eq!(pools[0].reserved(), 0);
    }

    #[test]
    fn test_materialize_sharded() {
        let fragment = |fragment_id, shard, row_offset, extents| FragmentExtents {
            fragment_id,
            shard: Some(shard),
            row_offset,
            extents,
        };
        let columns = BuildColumns::new(
            vec![
                ColumnsForDevice {
                    device_id: 0,
                    fragments: vec![fragment(0, 0, 0, vec![BoundingExtent::point(0.5, 0.5)])],
                },
                ColumnsForDevice {
                    device_id: 1,
                    fragments: vec![fragment(
                        1,
                        1,
                        1,
                        vec![
                            BoundingExtent::point(0.5, 0.5),
                            BoundingExtent::point(3.5, 0.5),
                        ],
                    )],
                },
            ],
            2,
        );
        let pools = unbounded_pools(2);
        let request = MaterializeRequest {
            columns: &columns,
            bucket_size: BucketSize::new([1.0, 1.0]),
            layout: HashLayout::OneToMany,
            estimate: TupleCountEstimate::new(4, 3),
            pools: &pools,
        };
        let tables = materialize(&request).unwrap();
        assert_eq!(tables[0].rows_for_cell(&[0, 0]), &[0]);
        assert_eq!(tables[1].rows_for_cell(&[0, 0]), &[1]);
        assert_eq!(tables[1].rows_for_cell(&[3, 0]), &[2]);

        let request = MaterializeRequest {
            estimate: TupleCountEstimate::new(4, 5),
            ..request
        };
        assert!(matches!(
            materialize(&request),
            Err(OverlapsJoinError::InconsistentCountEstimate(_))
        ));
    }
}
