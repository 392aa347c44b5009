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
use std::collections::BTreeMap;
use std::sync::Arc;

use datafusion_common::{DataFusionError, Result};
use datafusion_common_runtime::JoinSet;
use datafusion_execution::memory_pool::MemoryPool;
use futures::future::try_join_all;
use log::debug;
use overlaps_common::overlaps_internal_err;
use overlaps_geometry::bounding_extent::BoundingExtent;

use crate::accessor::{BoundingExtentAccessor, FragmentInfo};
use crate::bucket::ExtentSummary;
use crate::join_condition::ColumnRef;

/// Memory tier hash tables are built in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    /// Host memory. Always a single logical device.
    Cpu,
    /// Accelerator memory with one table per device
    Device,
}

/// Where a hash table lives. Tables are only interchangeable between equal placements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePlacement {
    pub tier: MemoryTier,
    pub device_count: usize,
}

impl DevicePlacement {
    pub fn new(tier: MemoryTier, device_count: usize) -> Self {
        Self { tier, device_count }
    }
}

/// The devices of one build, each with the memory pool its hash table is charged to
#[derive(Debug, Clone)]
pub struct DeviceSet {
    tier: MemoryTier,
    pools: Vec<Arc<dyn MemoryPool>>,
}

impl DeviceSet {
    pub fn try_new(tier: MemoryTier, pools: Vec<Arc<dyn MemoryPool>>) -> Result<Self> {
        match (tier, pools.len()) {
            (_, 0) => Err(DataFusionError::Configuration(
                "An overlaps hash table needs at least one device".to_string(),
            )),
            (MemoryTier::Cpu, n) if n > 1 => Err(DataFusionError::Configuration(format!(
                "The CPU memory tier has a single device, got {n} memory pools"
            ))),
            _ => Ok(Self { tier, pools }),
        }
    }

    /// Host-memory build charged to `pool`
    pub fn cpu(pool: Arc<dyn MemoryPool>) -> Self {
        Self {
            tier: MemoryTier::Cpu,
            pools: vec![pool],
        }
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    pub fn device_count(&self) -> usize {
        self.pools.len()
    }

    pub fn placement(&self) -> DevicePlacement {
        DevicePlacement::new(self.tier, self.device_count())
    }

    pub fn pools(&self) -> &[Arc<dyn MemoryPool>] {
        &self.pools
    }
}

/// Bounding extents of one fragment as fetched for one device
#[derive(Debug, Clone)]
pub struct FragmentExtents {
    pub fragment_id: usize,
    /// Shard of the fragment, `None` for unsharded columns
    pub shard: Option<usize>,
    /// Global row id of the first row of this fragment
    pub row_offset: usize,
    pub extents: Vec<BoundingExtent>,
}

impl FragmentExtents {
    /// Rows of this fragment with their global row ids
    pub fn rows(&self) -> impl Iterator<Item = (usize, &BoundingExtent)> {
        self.extents
            .iter()
            .enumerate()
            .map(move |(i, extent)| (self.row_offset + i, extent))
    }
}

/// The fragments of the build column assigned to one device
#[derive(Debug, Clone)]
pub struct ColumnsForDevice {
    pub device_id: usize,
    pub fragments: Vec<FragmentExtents>,
}

impl ColumnsForDevice {
    pub fn num_rows(&self) -> usize {
        self.fragments.iter().map(|f| f.extents.len()).sum()
    }

    pub fn rows(&self) -> impl Iterator<Item = (usize, &BoundingExtent)> {
        self.fragments.iter().flat_map(|f| f.rows())
    }
}

/// Build column data of all devices.
///
/// Unsharded columns are replicated: every device holds every fragment. Sharded columns
/// are partitioned: device `d` holds the shards `s` with `s % device_count == d`.
#[derive(Debug, Clone)]
pub struct BuildColumns {
    per_device: Vec<ColumnsForDevice>,
    shard_count: usize,
}

impl BuildColumns {
    pub fn new(per_device: Vec<ColumnsForDevice>, shard_count: usize) -> Self {
        Self {
            per_device,
            shard_count,
        }
    }

    pub fn per_device(&self) -> &[ColumnsForDevice] {
        &self.per_device
    }

    pub fn device_count(&self) -> usize {
        self.per_device.len()
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn is_sharded(&self) -> bool {
        self.shard_count > 0
    }

    /// Every fragment of the column exactly once
    pub fn distinct_fragments(&self) -> Vec<&FragmentExtents> {
        if self.is_sharded() {
            self.per_device.iter().flat_map(|d| &d.fragments).collect()
        } else {
            self.per_device
                .first()
                .map(|d| d.fragments.iter().collect())
                .unwrap_or_default()
        }
    }

    /// Fragments grouped by shard. Only meaningful for sharded columns.
    pub fn fragments_by_shard(&self) -> BTreeMap<usize, Vec<&FragmentExtents>> {
        let mut shards: BTreeMap<usize, Vec<&FragmentExtents>> = BTreeMap::new();
        for fragment in self.distinct_fragments() {
            shards
                .entry(fragment.shard.unwrap_or_default())
                .or_default()
                .push(fragment);
        }
        shards
    }

    pub fn num_rows(&self) -> usize {
        self.distinct_fragments()
            .iter()
            .map(|f| f.extents.len())
            .sum()
    }

    pub fn summary(&self) -> ExtentSummary {
        ExtentSummary::new(
            self.distinct_fragments()
                .into_iter()
                .flat_map(|f| f.extents.iter()),
        )
    }
}

/// Fragment metadata of a build column with global row offsets, sorted by fragment id
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    pub column: ColumnRef,
    pub shard_count: usize,
    fragments: Vec<(FragmentInfo, usize)>,
}

impl ColumnLayout {
    pub fn try_new(accessor: &dyn BoundingExtentAccessor, column: ColumnRef) -> Result<Self> {
        let mut infos = accessor.fragments(&column)?;
        infos.sort_by_key(|f| f.fragment_id);
        let shard_count = accessor.shard_count(&column);

        let mut row_offset = 0;
        let mut fragments = Vec::with_capacity(infos.len());
        for mut info in infos {
            if shard_count > 0 {
                let shard = info.shard.unwrap_or(info.fragment_id % shard_count);
                if shard >= shard_count {
                    return Err(DataFusionError::Execution(format!(
                        "Fragment {} of column {column} is in shard {shard}, but the column has {shard_count} shards",
                        info.fragment_id
                    )));
                }
                info.shard = Some(shard);
            } else {
                info.shard = None;
            }
            fragments.push((info, row_offset));
            row_offset += info.num_rows;
        }

        Ok(Self {
            column,
            shard_count,
            fragments,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.fragments.iter().map(|(f, _)| f.num_rows).sum()
    }

    /// Fragments that `device_id` materializes
    fn fragments_for_device(
        &self,
        device_id: usize,
        devices: &DeviceSet,
    ) -> Vec<(FragmentInfo, usize)> {
        let device_count = devices.device_count();
        self.fragments
            .iter()
            .filter(|(info, _)| match info.shard {
                Some(shard) if devices.tier() == MemoryTier::Device => {
                    shard % device_count == device_id
                }
                _ => true,
            })
            .copied()
            .collect()
    }
}

/// Fetch the bounding extents every device needs for its part of the hash table.
///
/// With `concurrent` set, each device is fetched in its own spawned task; otherwise devices
/// are fetched one after another on the calling task, for contexts that cannot spawn.
pub async fn fetch_build_columns(
    accessor: Arc<dyn BoundingExtentAccessor>,
    layout: &ColumnLayout,
    devices: &DeviceSet,
    concurrent: bool,
) -> Result<BuildColumns> {
    let device_count = devices.device_count();
    let assignments: Vec<_> = (0..device_count)
        .map(|device_id| layout.fragments_for_device(device_id, devices))
        .collect();
    debug!(
        "Fetching bounding extents of {} fragments of column {} for {device_count} devices",
        layout.fragments.len(),
        layout.column
    );

    let per_device = if concurrent {
        let mut join_set = JoinSet::new();
        for (device_id, fragments) in assignments.into_iter().enumerate() {
            let accessor = Arc::clone(&accessor);
            let column = layout.column;
            join_set.spawn(async move {
                let result = fetch_device(accessor.as_ref(), column, device_id, fragments).await;
                (device_id, result)
            });
        }

        // Results arrive in completion order
        let results = join_set.join_all().await;
        let mut per_device: Vec<Option<ColumnsForDevice>> = Vec::with_capacity(results.len());
        per_device.resize_with(results.len(), || None);
        for (device_id, result) in results {
            per_device[device_id] = Some(result?);
        }
        let mut ordered = Vec::with_capacity(per_device.len());
        for (device_id, columns) in per_device.into_iter().enumerate() {
            match columns {
                Some(columns) => ordered.push(columns),
                None => return overlaps_internal_err!("Missing extents of device {device_id}"),
            }
        }
        ordered
    } else {
        let mut per_device = Vec::with_capacity(device_count);
        for (device_id, fragments) in assignments.into_iter().enumerate() {
            per_device
                .push(fetch_device(accessor.as_ref(), layout.column, device_id, fragments).await?);
        }
        per_device
    };

    Ok(BuildColumns::new(per_device, layout.shard_count))
}

async fn fetch_device(
    accessor: &dyn BoundingExtentAccessor,
    column: ColumnRef,
    device_id: usize,
    fragments: Vec<(FragmentInfo, usize)>,
) -> Result<ColumnsForDevice> {
    let fetched = try_join_all(fragments.iter().map(|(info, row_offset)| async move {
        let extents = accessor
            .bounding_extents(&column, info.fragment_id, device_id)
            .await?;
        if extents.len() != info.num_rows {
            return Err(DataFusionError::Execution(format!(
                "Fragment {} of column {column} has {} rows but {} extents were returned",
                info.fragment_id,
                info.num_rows,
                extents.len()
            )));
        }
        for (i, extent) in extents.iter().enumerate() {
            extent.validate().map_err(|e| {
                DataFusionError::Execution(format!(
                    "Invalid extent of row {} in fragment {} of column {column}: {e}",
                    row_offset + i,
                    info.fragment_id
                ))
            })?;
        }
        Ok::<_, DataFusionError>(FragmentExtents {
            fragment_id: info.fragment_id,
            shard: info.shard,
            row_offset: *row_offset,
            extents,
        })
    }))
    .await?;

    Ok(ColumnsForDevice {
        device_id,
        fragments: fetched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::InMemoryExtentAccessor;
    use datafusion_execution::memory_pool::UnboundedMemoryPool;
    use rstest::rstest;

    fn pools(n: usize) -> Vec<Arc<dyn MemoryPool>> {
        (0..n)
            .map(|_| Arc::new(UnboundedMemoryPool::default()) as Arc<dyn MemoryPool>)
            .collect()
    }

    fn extents(n: usize, x: f64) -> Vec<BoundingExtent> {
        (0..n).map(|i| BoundingExtent::point(x, i as f64)).collect()
    }

    #[test]
    fn test_device_set_validation() {
        assert!(DeviceSet::try_new(MemoryTier::Cpu, pools(0)).is_err());
        assert!(DeviceSet::try_new(MemoryTier::Cpu, pools(2)).is_err());
        assert_eq!(
            DeviceSet::try_new(MemoryTier::Device, pools(3))
                .unwrap()
                .device_count(),
            3
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_replicated_fetch(#[values(true, false)] concurrent: bool) {
        let column = ColumnRef::new(1, 1);
        let accessor = InMemoryExtentAccessor::new()
            .with_fragment(column, extents(2, 0.0))
            .with_fragment(column, extents(3, 1.0));
        let layout = ColumnLayout::try_new(&accessor, column).unwrap();
        assert_eq!(layout.num_rows(), 5);

        let devices = DeviceSet::try_new(MemoryTier::Device, pools(2)).unwrap();
        let columns = fetch_build_columns(Arc::new(accessor), &layout, &devices, concurrent)
            .await
            .unwrap();

        assert!(!columns.is_sharded());
        assert_eq!(columns.device_count(), 2);
        for (device_id, device) in columns.per_device().iter().enumerate() {
            assert_eq!(device.device_id, device_id);
            assert_eq!(device.num_rows(), 5);
            let row_ids: Vec<_> = device.rows().map(|(row, _)| row).collect();
            assert_eq!(row_ids, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(columns.num_rows(), 5);
        assert_eq!(columns.distinct_fragments().len(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_sharded_fetch(#[values(true, false)] concurrent: bool) {
        let column = ColumnRef::new(1, 1);
        let accessor = InMemoryExtentAccessor::new()
            .with_shard_count(column, 3)
            .with_sharded_fragment(column, 0, extents(1, 0.0))
            .with_sharded_fragment(column, 1, extents(2, 1.0))
            .with_sharded_fragment(column, 2, extents(3, 2.0))
            .with_sharded_fragment(column, 2, extents(1, 3.0));
        let layout = ColumnLayout::try_new(&accessor, column).unwrap();

        let devices = DeviceSet::try_new(MemoryTier::Device, pools(2)).unwrap();
        let columns = fetch_build_columns(Arc::new(accessor), &layout, &devices, concurrent)
            .await
            .unwrap();

        assert!(columns.is_sharded());
        let device_0: Vec<_> = columns.per_device()[0]
            .fragments
            .iter()
            .map(|f| (f.fragment_id, f.shard, f.row_offset))
            .collect();
        assert_eq!(device_0, vec![(0, Some(0), 0), (2, Some(2), 3), (3, Some(2), 6)]);
        let device_1: Vec<_> = columns.per_device()[1]
            .fragments
            .iter()
            .map(|f| (f.fragment_id, f.shard, f.row_offset))
            .collect();
        assert_eq!(device_1, vec![(1, Some(1), 1)]);

        assert_eq!(columns.num_rows(), 7);
        let shards = columns.fragments_by_shard();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[&2].len(), 2);
    }

    #[tokio::test]
    async fn test_cpu_tier_fetches_all_shards() {
        let column = ColumnRef::new(1, 1);
        let accessor = InMemoryExtentAccessor::new()
            .with_shard_count(column, 2)
            .with_sharded_fragment(column, 0, extents(1, 0.0))
            .with_sharded_fragment(column, 1, extents(1, 1.0));
        let layout = ColumnLayout::try_new(&accessor, column).unwrap();
        let devices = DeviceSet::cpu(pools(1).remove(0));
        let columns = fetch_build_columns(Arc::new(accessor), &layout, &devices, true)
            .await
            .unwrap();
        assert_eq!(columns.per_device()[0].fragments.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_extent_fails_fetch() {
        let column = ColumnRef::new(1, 1);
        let accessor = InMemoryExtentAccessor::new()
            .with_fragment(column, extents(2, 0.0))
            .with_fragment(
                column,
                vec![
                    BoundingExtent::empty(),
                    BoundingExtent::xy((0.0, f64::NAN), (0.0, 1.0)),
                ],
            );
        let layout = ColumnLayout::try_new(&accessor, column).unwrap();
        let devices = DeviceSet::cpu(pools(1).remove(0));
        let err = fetch_build_columns(Arc::new(accessor), &layout, &devices, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid extent of row 3 in fragment 1"));
    }

    #[test]
    fn test_invalid_shard() {
        let column = ColumnRef::new(1, 1);
        let accessor = InMemoryExtentAccessor::new()
            .with_shard_count(column, 2)
            .with_sharded_fragment(column, 5, extents(1, 0.0));
        assert!(ColumnLayout::try_new(&accessor, column).is_err());
    }
}
