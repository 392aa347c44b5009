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
use std::collections::HashMap;

use async_trait::async_trait;
use datafusion_common::{DataFusionError, Result};
use geo::BoundingRect;
use geo_types::Geometry;
use overlaps_geometry::bounding_extent::BoundingExtent;

use crate::join_condition::ColumnRef;

/// Metadata of one fragment of a build column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub fragment_id: usize,
    pub num_rows: usize,
    /// Shard the fragment belongs to, if the column is sharded
    pub shard: Option<usize>,
}

/// Source of the per-row bounding extents of a geometry column.
///
/// This is the boundary to the storage layer. Implementations own fragment metadata
/// and return extents for a fragment materialized on a given device.
#[async_trait]
pub trait BoundingExtentAccessor: Send + Sync {
    /// All fragments of `column`
    fn fragments(&self, column: &ColumnRef) -> Result<Vec<FragmentInfo>>;

    /// Number of shards of `column`, 0 for unsharded columns
    fn shard_count(&self, _column: &ColumnRef) -> usize {
        0
    }

    /// One extent per row of the fragment, in row order
    async fn bounding_extents(
        &self,
        column: &ColumnRef,
        fragment_id: usize,
        device_id: usize,
    ) -> Result<Vec<BoundingExtent>>;
}

#[derive(Debug, Default)]
struct InMemoryColumn {
    shard_count: usize,
    fragments: Vec<(Option<usize>, Vec<BoundingExtent>)>,
}

/// A [BoundingExtentAccessor] over extents held in memory. Fragment ids are assigned in
/// insertion order.
#[derive(Debug, Default)]
pub struct InMemoryExtentAccessor {
    columns: HashMap<ColumnRef, InMemoryColumn>,
}

impl InMemoryExtentAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fragment(mut self, column: ColumnRef, extents: Vec<BoundingExtent>) -> Self {
        self.columns
            .entry(column)
            .or_default()
            .fragments
            .push((None, extents));
        self
    }

    /// Add a fragment of geometries; geometries without a bounding rectangle (such as
    /// empty collections) get an empty extent.
    pub fn with_geometries(self, column: ColumnRef, geometries: &[Geometry<f64>]) -> Self {
        let extents = geometries
            .iter()
            .map(|geom| {
                geom.bounding_rect()
                    .map(BoundingExtent::from)
                    .unwrap_or_else(BoundingExtent::empty)
            })
            .collect();
        self.with_fragment(column, extents)
    }

    /// Declare `column` as sharded into `shard_count` shards
    pub fn with_shard_count(mut self, column: ColumnRef, shard_count: usize) -> Self {
        self.columns.entry(column).or_default().shard_count = shard_count;
        self
    }

    pub fn with_sharded_fragment(
        mut self,
        column: ColumnRef,
        shard: usize,
        extents: Vec<BoundingExtent>,
    ) -> Self {
        self.columns
            .entry(column)
            .or_default()
            .fragments
            .push((Some(shard), extents));
        self
    }

    fn column(&self, column: &ColumnRef) -> Result<&InMemoryColumn> {
        self.columns
            .get(column)
            .ok_or_else(|| DataFusionError::Plan(format!("Unknown geometry column {column}")))
    }
}

#[async_trait]
impl BoundingExtentAccessor for InMemoryExtentAccessor {
    fn fragments(&self, column: &ColumnRef) -> Result<Vec<FragmentInfo>> {
        Ok(self
            .column(column)?
            .fragments
            .iter()
            .enumerate()
            .map(|(fragment_id, (shard, extents))| FragmentInfo {
                fragment_id,
                num_rows: extents.len(),
                shard: *shard,
            })
            .collect())
    }

    fn shard_count(&self, column: &ColumnRef) -> usize {
        self.columns
            .get(column)
            .map(|c| c.shard_count)
            .unwrap_or_default()
    }

    async fn bounding_extents(
        &self,
        column: &ColumnRef,
        fragment_id: usize,
        _device_id: usize,
    ) -> Result<Vec<BoundingExtent>> {
        let column_data = self.column(column)?;
        let (_, extents) = column_data.fragments.get(fragment_id).ok_or_else(|| {
            DataFusionError::Execution(format!(
                "Fragment {fragment_id} of column {column} does not exist"
            ))
        })?;
        Ok(extents.clone())
    }
}
