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
use overlaps_common::option::OverlapsJoinOptions;

use crate::error::{OverlapsJoinError, Result};
use crate::hash_table::HashLayout;

/// Identity of a geometry-derived column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub table_id: u32,
    pub column_id: u32,
}

impl ColumnRef {
    pub fn new(table_id: u32, column_id: u32) -> Self {
        Self {
            table_id,
            column_id,
        }
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}.c{}", self.table_id, self.column_id)
    }
}

/// Geometry type of a join operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    Polygon,
    MultiPolygon,
}

impl GeometryKind {
    pub fn is_point(&self) -> bool {
        matches!(self, GeometryKind::Point)
    }
}

impl std::fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeometryKind::Point => write!(f, "POINT"),
            GeometryKind::Polygon => write!(f, "POLYGON"),
            GeometryKind::MultiPolygon => write!(f, "MULTIPOLYGON"),
        }
    }
}

/// Spatial relationship of an overlaps join condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlapsPredicate {
    Intersects,
    Contains,
}

impl std::fmt::Display for OverlapsPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlapsPredicate::Intersects => write!(f, "Intersects"),
            OverlapsPredicate::Contains => write!(f, "Contains"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryOperand {
    pub column: ColumnRef,
    pub kind: GeometryKind,
}

impl GeometryOperand {
    pub fn new(column: ColumnRef, kind: GeometryKind) -> Self {
        Self { column, kind }
    }
}

/// An overlaps join condition `ST_<predicate>(build, probe)`.
///
/// The first operand of the predicate is always the build side: its rows are bucketed
/// into the hash table and the rows of the probe operand are looked up against it.
/// Operand order is taken as given and never normalized, so `ST_Intersects(pt, poly)`
/// and `ST_Intersects(poly, pt)` are different builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinCondition {
    pub predicate: OverlapsPredicate,
    pub build: GeometryOperand,
    pub probe: GeometryOperand,
}

impl JoinCondition {
    pub fn new(predicate: OverlapsPredicate, build: GeometryOperand, probe: GeometryOperand) -> Self {
        Self {
            predicate,
            build,
            probe,
        }
    }

    /// Check that this condition can be served by an overlaps hash table under the given
    /// policy and pick the table layout.
    pub fn hash_layout(&self, options: &OverlapsJoinOptions) -> Result<HashLayout> {
        if self.predicate == OverlapsPredicate::Contains
            && (self.build.kind == GeometryKind::MultiPolygon
                || self.probe.kind == GeometryKind::MultiPolygon)
        {
            return Err(OverlapsJoinError::UnsupportedPredicate(format!(
                "{self}: ST_Contains is not supported for {} and {} operands",
                self.build.kind, self.probe.kind
            )));
        }

        if self.build.kind.is_point() && !self.probe.kind.is_point() {
            let reason = format!(
                "{self}: {} build operand cannot be probed with {} extents",
                self.build.kind, self.probe.kind
            );
            return if options.enable_many_to_many {
                Err(OverlapsJoinError::UnsupportedPredicate(reason))
            } else {
                Err(OverlapsJoinError::NotApplicable(reason))
            };
        }

        if self.build.kind.is_point() {
            return Ok(HashLayout::OneToMany);
        }

        if !options.enable_many_to_many {
            return Err(OverlapsJoinError::NotApplicable(format!(
                "{self}: {} build operand needs the many-to-many layout, which is disabled",
                self.build.kind
            )));
        }
        Ok(HashLayout::ManyToMany)
    }
}

impl std::fmt::Display for JoinCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ST_{}({}, {})",
            self.predicate, self.build.column, self.probe.column
        )
    }
}
