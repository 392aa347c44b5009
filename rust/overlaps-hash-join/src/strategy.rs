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
use crate::bucket::{BucketSize, TupleCountEstimate};
use crate::columns::{BuildColumns, FragmentExtents};
use crate::counter;
use crate::error::Result;
use crate::hash_table::{DeviceHashTable, HashLayout};
use crate::materializer::{self, MaterializeRequest};

/// The counting and materialization steps of an overlaps hash table build.
///
/// The bucket size tuner and the hash table builder only talk to this trait. The provided
/// methods are the production implementation; an implementation may override any of them
/// to observe or replace a step.
pub trait OverlapsBuildStrategy: Send + Sync {
    /// Count keys and emitted rows of a table over `fragments`
    fn approximate_tuple_count(
        &self,
        fragments: &[&FragmentExtents],
        bucket_size: &BucketSize,
        layout: HashLayout,
        max_size_bytes: usize,
    ) -> Result<TupleCountEstimate> {
        Ok(counter::approximate_tuple_count(
            fragments,
            bucket_size,
            layout,
            max_size_bytes,
        ))
    }

    /// Sizes of the per-device tables at tuning step `step`
    fn compute_hash_table_counts(
        &self,
        _step: usize,
        bucket_size: &BucketSize,
        layout: HashLayout,
        columns: &BuildColumns,
        max_size_bytes: usize,
    ) -> Result<TupleCountEstimate> {
        counter::compute_hash_table_counts(columns, |fragments| {
            self.approximate_tuple_count(fragments, bucket_size, layout, max_size_bytes)
        })
    }

    fn materialize(&self, request: &MaterializeRequest<'_>) -> Result<Vec<DeviceHashTable>> {
        materializer::materialize(request)
    }
}

/// The production build strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBuildStrategy;

impl OverlapsBuildStrategy for DefaultBuildStrategy {}
