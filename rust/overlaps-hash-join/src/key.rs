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
use crate::columns::{DevicePlacement, DeviceSet};
use crate::join_condition::{ColumnRef, JoinCondition, OverlapsPredicate};

/// The part of a join condition that identifies a hash table regardless of tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinShape {
    pub build_column: ColumnRef,
    pub probe_column: ColumnRef,
    pub predicate: OverlapsPredicate,
}

impl From<&JoinCondition> for JoinShape {
    fn from(condition: &JoinCondition) -> Self {
        Self {
            build_column: condition.build.column,
            probe_column: condition.probe.column,
            predicate: condition.predicate,
        }
    }
}

/// Identifies a built hash table. Two builds with equal keys produce identical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashTableKey {
    pub shape: JoinShape,
    pub placement: DevicePlacement,
    threshold_bits: u64,
    pub max_size_bytes: usize,
}

impl HashTableKey {
    pub fn new(
        shape: JoinShape,
        placement: DevicePlacement,
        bucket_threshold: f64,
        max_size_bytes: usize,
    ) -> Self {
        Self {
            shape,
            placement,
            // Bit equality: thresholds are compared exactly as given
            threshold_bits: bucket_threshold.to_bits(),
            max_size_bytes,
        }
    }

    pub fn bucket_threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits)
    }
}

/// Identifies the outcome of auto tuning a shape under a size bound.
/// Sharded counts depend on the device count, so the placement is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TuningParamsKey {
    pub shape: JoinShape,
    pub placement: DevicePlacement,
    pub max_size_bytes: usize,
}

/// Derives cache keys of one join condition built on one device set
#[derive(Debug, Clone, Copy)]
pub struct HashTableKeyBuilder {
    shape: JoinShape,
    placement: DevicePlacement,
}

impl HashTableKeyBuilder {
    pub fn new(condition: &JoinCondition, devices: &DeviceSet) -> Self {
        Self {
            shape: condition.into(),
            placement: devices.placement(),
        }
    }

    pub fn shape(&self) -> &JoinShape {
        &self.shape
    }

    pub fn placement(&self) -> DevicePlacement {
        self.placement
    }

    pub fn hash_table_key(&self, bucket_threshold: f64, max_size_bytes: usize) -> HashTableKey {
        HashTableKey::new(self.shape, self.placement, bucket_threshold, max_size_bytes)
    }

    pub fn tuning_params_key(&self, max_size_bytes: usize) -> TuningParamsKey {
        TuningParamsKey {
            shape: self.shape,
            placement: self.placement,
            max_size_bytes,
        }
    }
}
