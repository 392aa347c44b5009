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
use geo_types::{Coord, Rect};

use crate::error::GeometryError;

/// Number of spatial dimensions the overlaps join buckets on.
pub const NUM_DIMENSIONS: usize = 2;

/// Axis-aligned bounding extent of one row's geometry
///
/// An extent with `min > max` in any dimension is empty: it carries no spatial
/// information (null or empty geometries) and overlaps nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingExtent {
    min: [f64; NUM_DIMENSIONS],
    max: [f64; NUM_DIMENSIONS],
}

impl BoundingExtent {
    /// Create an extent from x and y intervals
    ///
    /// No validation is performed; reversed intervals produce an empty extent.
    pub fn xy(x: (f64, f64), y: (f64, f64)) -> Self {
        Self {
            min: [x.0, y.0],
            max: [x.1, y.1],
        }
    }

    /// Create an extent from its corners, rejecting NaN and reversed bounds
    pub fn try_new(
        min: [f64; NUM_DIMENSIONS],
        max: [f64; NUM_DIMENSIONS],
    ) -> Result<Self, GeometryError> {
        for dim in 0..NUM_DIMENSIONS {
            if min[dim].is_nan() || max[dim].is_nan() {
                return Err(GeometryError::Invalid(format!(
                    "NaN bound in dimension {dim}"
                )));
            }
            if min[dim] > max[dim] {
                return Err(GeometryError::Invalid(format!(
                    "min {} is greater than max {} in dimension {dim}",
                    min[dim], max[dim]
                )));
            }
        }
        Ok(Self { min, max })
    }

    /// The extent of a single point
    pub fn point(x: f64, y: f64) -> Self {
        Self::xy((x, x), (y, y))
    }

    /// An extent that contains nothing and is the identity of [Self::update_extent]
    pub fn empty() -> Self {
        Self {
            min: [f64::INFINITY; NUM_DIMENSIONS],
            max: [f64::NEG_INFINITY; NUM_DIMENSIONS],
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..NUM_DIMENSIONS).any(|dim| {
            self.min[dim] > self.max[dim] || self.min[dim].is_nan() || self.max[dim].is_nan()
        })
    }

    pub fn min(&self) -> &[f64; NUM_DIMENSIONS] {
        &self.min
    }

    pub fn max(&self) -> &[f64; NUM_DIMENSIONS] {
        &self.max
    }

    /// Width of the extent along `dim`, or 0 for empty extents
    pub fn width(&self, dim: usize) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.max[dim] - self.min[dim]
        }
    }

    /// Check an extent read from storage: either the canonical [Self::empty] extent or
    /// one that [Self::try_new] accepts
    pub fn validate(&self) -> Result<(), GeometryError> {
        if *self == Self::empty() {
            return Ok(());
        }
        Self::try_new(self.min, self.max).map(|_| ())
    }

    /// Update this extent to include the bounds of another
    pub fn update_extent(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        for dim in 0..NUM_DIMENSIONS {
            self.min[dim] = self.min[dim].min(other.min[dim]);
            self.max[dim] = self.max[dim].max(other.max[dim]);
        }
    }
}

impl From<Rect<f64>> for BoundingExtent {
    fn from(rect: Rect<f64>) -> Self {
        let (min, max) = (rect.min(), rect.max());
        Self::xy((min.x, max.x), (min.y, max.y))
    }
}

impl From<Coord<f64>> for BoundingExtent {
    fn from(coord: Coord<f64>) -> Self {
        Self::point(coord.x, coord.y)
    }
}
