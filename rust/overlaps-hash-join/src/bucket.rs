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
use overlaps_geometry::bounding_extent::{BoundingExtent, NUM_DIMENSIONS};

use crate::hash_table::HashLayout;

/// Coordinates of one bucket of the spatial grid
pub type Cell = [i64; NUM_DIMENSIONS];

/// Marks an unused slot of a device hash table. Cell indices never take this value.
pub(crate) const EMPTY_CELL: Cell = [i64::MIN; NUM_DIMENSIONS];

/// Bytes of one hash table key
pub const HASH_KEY_BYTES: usize = NUM_DIMENSIONS * std::mem::size_of::<i64>();
/// Bytes of one entry of the offsets array
pub const OFFSET_BYTES: usize = std::mem::size_of::<u32>();
/// Bytes of one emitted row index
pub const ROW_INDEX_BYTES: usize = std::mem::size_of::<u32>();

/// Size in bytes of a hash table with `entry_count` keys and `emitted_keys_count` payload
/// rows: the key slots, the `entry_count + 1` offsets and the row indices.
pub fn hash_table_size_bytes(entry_count: usize, emitted_keys_count: usize) -> usize {
    entry_count
        .saturating_mul(HASH_KEY_BYTES)
        .saturating_add(entry_count.saturating_add(1).saturating_mul(OFFSET_BYTES))
        .saturating_add(emitted_keys_count.saturating_mul(ROW_INDEX_BYTES))
}

/// Widths of the grid cells in each dimension.
///
/// A width of `f64::INFINITY` collapses the dimension into a single bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSize {
    widths: [f64; NUM_DIMENSIONS],
}

impl BucketSize {
    /// Create a bucket size from positive widths
    pub fn new(widths: [f64; NUM_DIMENSIONS]) -> Self {
        debug_assert!(widths.iter().all(|w| *w > 0.0));
        Self { widths }
    }

    /// A grid with a single bucket
    pub fn unbounded() -> Self {
        Self {
            widths: [f64::INFINITY; NUM_DIMENSIONS],
        }
    }

    pub fn widths(&self) -> &[f64; NUM_DIMENSIONS] {
        &self.widths
    }

    pub fn is_unbounded(&self) -> bool {
        self.widths.iter().all(|w| w.is_infinite())
    }

    /// Index of the cell containing `coord` along `dim`
    pub fn cell_index(&self, dim: usize, coord: f64) -> i64 {
        let width = self.widths[dim];
        if !width.is_finite() {
            return 0;
        }
        // `as` saturates; i64::MIN is reserved for EMPTY_CELL
        ((coord / width).floor() as i64).max(i64::MIN + 1)
    }

    /// Range of cells covered by `extent`, both ends inclusive. Empty extents cover no cell.
    pub fn cell_range(&self, extent: &BoundingExtent) -> Option<CellRange> {
        if extent.is_empty() {
            return None;
        }
        let mut min = [0; NUM_DIMENSIONS];
        let mut max = [0; NUM_DIMENSIONS];
        for dim in 0..NUM_DIMENSIONS {
            min[dim] = self.cell_index(dim, extent.min()[dim]);
            max[dim] = self.cell_index(dim, extent.max()[dim]);
        }
        Some(CellRange { min, max })
    }

    /// The single cell a row is bucketed into by the one-to-many layout
    pub fn representative_cell(&self, extent: &BoundingExtent) -> Option<Cell> {
        self.cell_range(extent).map(|range| range.min)
    }

    /// Cells a build row occupies under `layout`
    pub(crate) fn row_cells(
        &self,
        extent: &BoundingExtent,
        layout: HashLayout,
    ) -> impl Iterator<Item = Cell> {
        let range = match layout {
            HashLayout::ManyToMany => self.cell_range(extent),
            HashLayout::OneToMany => self
                .representative_cell(extent)
                .map(|cell| CellRange {
                    min: cell,
                    max: cell,
                }),
        };
        range.into_iter().flat_map(CellRange::cells)
    }

    /// Number of cells a build row occupies under `layout`
    pub(crate) fn row_cell_count(&self, extent: &BoundingExtent, layout: HashLayout) -> usize {
        match (layout, self.cell_range(extent)) {
            (_, None) => 0,
            (HashLayout::OneToMany, Some(_)) => 1,
            (HashLayout::ManyToMany, Some(range)) => range.num_cells(),
        }
    }
}

/// An inclusive box of grid cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    min: Cell,
    max: Cell,
}

impl CellRange {
    pub fn min(&self) -> &Cell {
        &self.min
    }

    pub fn max(&self) -> &Cell {
        &self.max
    }

    /// Number of cells in the range, saturating at `usize::MAX`
    pub fn num_cells(&self) -> usize {
        (0..NUM_DIMENSIONS).fold(1usize, |acc, dim| {
            let span = self.max[dim] as i128 - self.min[dim] as i128 + 1;
            acc.saturating_mul(usize::try_from(span).unwrap_or(usize::MAX))
        })
    }

    pub fn cells(self) -> impl Iterator<Item = Cell> {
        let (min, max) = (self.min, self.max);
        (min[0]..=max[0]).flat_map(move |x| (min[1]..=max[1]).map(move |y| [x, y]))
    }
}

/// Number of distinct keys and emitted payload rows of a hash table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TupleCountEstimate {
    pub entry_count: usize,
    pub emitted_keys_count: usize,
}

impl TupleCountEstimate {
    pub fn new(entry_count: usize, emitted_keys_count: usize) -> Self {
        Self {
            entry_count,
            emitted_keys_count,
        }
    }

    /// Average number of payload rows per key, the fan-out of a probe
    pub fn keys_per_bin(&self) -> f64 {
        if self.entry_count == 0 {
            return 0.0;
        }
        self.emitted_keys_count as f64 / self.entry_count as f64
    }

    pub fn size_bytes(&self) -> usize {
        hash_table_size_bytes(self.entry_count, self.emitted_keys_count)
    }
}

/// Statistics of the build side's bounding extents that bucket sizes are derived from
#[derive(Debug, Clone)]
pub struct ExtentSummary {
    domain: BoundingExtent,
    num_rows: usize,
    sorted_widths: [Vec<f64>; NUM_DIMENSIONS],
}

impl ExtentSummary {
    /// Summarize the given extents. Empty extents are skipped.
    pub fn new<'a>(extents: impl IntoIterator<Item = &'a BoundingExtent>) -> Self {
        let mut domain = BoundingExtent::empty();
        let mut num_rows = 0;
        let mut sorted_widths: [Vec<f64>; NUM_DIMENSIONS] = Default::default();
        for extent in extents.into_iter().filter(|e| !e.is_empty()) {
            domain.update_extent(extent);
            num_rows += 1;
            for (dim, widths) in sorted_widths.iter_mut().enumerate() {
                widths.push(extent.width(dim));
            }
        }
        for widths in sorted_widths.iter_mut() {
            widths.sort_by(|a, b| a.total_cmp(b));
        }

        Self {
            domain,
            num_rows,
            sorted_widths,
        }
    }

    /// Bounding extent of all non-empty rows
    pub fn domain(&self) -> &BoundingExtent {
        &self.domain
    }

    /// Number of rows with a non-empty extent
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Derive the bucket size for a relative threshold.
    ///
    /// In each dimension the threshold is scaled by the width of the domain. For the
    /// many-to-many layout the bucket width is the smallest row width exceeding it, or a
    /// single bucket if no row is that wide. Point rows have no width, so the one-to-many
    /// layout uses the scaled threshold itself.
    pub fn bucket_size_for_threshold(&self, threshold: f64, layout: HashLayout) -> BucketSize {
        let mut widths = [f64::INFINITY; NUM_DIMENSIONS];
        for (dim, width) in widths.iter_mut().enumerate() {
            let scaled = threshold * self.domain.width(dim);
            *width = match layout {
                HashLayout::ManyToMany => {
                    let row_widths = &self.sorted_widths[dim];
                    let idx = row_widths.partition_point(|w| *w <= scaled);
                    row_widths.get(idx).copied().unwrap_or(f64::INFINITY)
                }
                HashLayout::OneToMany if scaled > 0.0 => scaled,
                HashLayout::OneToMany => f64::INFINITY,
            };
        }
        BucketSize { widths }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn polygon_extents() -> Vec<BoundingExtent> {
        vec![
            BoundingExtent::xy((0.0, 2.0), (0.0, 2.0)),
            BoundingExtent::xy((0.0, 2.0), (0.0, 2.0)),
            BoundingExtent::xy((2.0, 4.0), (2.0, 4.0)),
            BoundingExtent::xy((0.0, 50.0), (0.0, 50.0)),
        ]
    }

    #[test]
    fn test_hash_table_size_bytes() {
        assert_eq!(hash_table_size_bytes(8, 7), 192);
        assert_eq!(hash_table_size_bytes(2, 4), 60);
        assert_eq!(hash_table_size_bytes(1352, 688), 29796);
        assert_eq!(hash_table_size_bytes(0, 0), OFFSET_BYTES);
        assert_eq!(hash_table_size_bytes(usize::MAX, 1), usize::MAX);
    }

    #[test]
    fn test_cell_range_is_inclusive() {
        let bucket_size = BucketSize::new([2.0, 2.0]);
        let range = bucket_size
            .cell_range(&BoundingExtent::xy((0.0, 2.0), (0.0, 2.0)))
            .unwrap();
        assert_eq!(range.min(), &[0, 0]);
        assert_eq!(range.max(), &[1, 1]);
        assert_eq!(range.num_cells(), 4);
        assert_eq!(
            range.cells().collect::<Vec<_>>(),
            vec![[0, 0], [0, 1], [1, 0], [1, 1]]
        );

        let range = bucket_size
            .cell_range(&BoundingExtent::xy((-3.0, -0.5), (1.0, 1.5)))
            .unwrap();
        assert_eq!(range.min(), &[-2, 0]);
        assert_eq!(range.max(), &[-1, 0]);
    }

    #[test]
    fn test_unbounded_bucket_size() {
        let bucket_size = BucketSize::unbounded();
        assert!(bucket_size.is_unbounded());
        let range = bucket_size
            .cell_range(&BoundingExtent::xy((-1e300, 1e300), (0.0, 50.0)))
            .unwrap();
        assert_eq!(range.num_cells(), 1);
        assert!(bucket_size.cell_range(&BoundingExtent::empty()).is_none());
    }

    #[test]
    fn test_row_cells_by_layout() {
        let bucket_size = BucketSize::new([1.0, 1.0]);
        let extent = BoundingExtent::xy((0.5, 2.5), (0.5, 1.5));
        assert_eq!(bucket_size.row_cell_count(&extent, HashLayout::ManyToMany), 6);
        assert_eq!(
            bucket_size.row_cells(&extent, HashLayout::ManyToMany).count(),
            6
        );
        assert_eq!(bucket_size.row_cell_count(&extent, HashLayout::OneToMany), 1);
        assert_eq!(
            bucket_size
                .row_cells(&extent, HashLayout::OneToMany)
                .collect::<Vec<_>>(),
            vec![[0, 0]]
        );
        assert_eq!(
            bucket_size.row_cell_count(&BoundingExtent::empty(), HashLayout::OneToMany),
            0
        );
    }

    #[rstest]
    #[case(0.1, 50.0)]
    #[case(0.01, 2.0)]
    #[case(0.001, 2.0)]
    #[case(1.0, f64::INFINITY)]
    #[case(10.0, f64::INFINITY)]
    fn test_bucket_size_for_threshold(#[case] threshold: f64, #[case] expected_width: f64) {
        let extents = polygon_extents();
        let summary = ExtentSummary::new(&extents);
        let bucket_size = summary.bucket_size_for_threshold(threshold, HashLayout::ManyToMany);
        assert_eq!(bucket_size.widths(), &[expected_width, expected_width]);
    }

    #[test]
    fn test_bucket_size_for_points() {
        let extents = vec![
            BoundingExtent::point(0.0, 0.0),
            BoundingExtent::point(100.0, 10.0),
        ];
        let summary = ExtentSummary::new(&extents);
        let bucket_size = summary.bucket_size_for_threshold(0.1, HashLayout::OneToMany);
        assert_eq!(bucket_size.widths(), &[10.0, 1.0]);

        let same_location = vec![BoundingExtent::point(3.0, 3.0); 3];
        let summary = ExtentSummary::new(&same_location);
        assert!(summary
            .bucket_size_for_threshold(0.1, HashLayout::OneToMany)
            .is_unbounded());
    }

    #[test]
    fn test_summary_skips_empty_extents() {
        let extents = vec![
            BoundingExtent::empty(),
            BoundingExtent::xy((1.0, 3.0), (-1.0, 1.0)),
        ];
        let summary = ExtentSummary::new(&extents);
        assert_eq!(summary.num_rows(), 1);
        assert_eq!(summary.domain(), &BoundingExtent::xy((1.0, 3.0), (-1.0, 1.0)));
    }

    #[test]
    fn test_keys_per_bin() {
        assert_eq!(TupleCountEstimate::new(8, 7).keys_per_bin(), 0.875);
        assert_eq!(TupleCountEstimate::default().keys_per_bin(), 0.0);
        assert_eq!(TupleCountEstimate::new(2, 4).size_bytes(), 60);
    }
}
