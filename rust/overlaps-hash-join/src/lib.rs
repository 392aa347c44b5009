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
pub mod accessor;
pub mod bucket;
pub mod builder;
pub mod cache;
pub mod columns;
pub mod counter;
pub mod error;
pub mod hash_table;
pub mod hints;
pub mod join_condition;
pub mod key;
pub mod materializer;
pub mod strategy;
pub mod tuner;

pub use accessor::{BoundingExtentAccessor, FragmentInfo, InMemoryExtentAccessor};
pub use builder::{OverlapsBuildMetrics, OverlapsHashTableBuilder};
pub use cache::HashTableCache;
pub use columns::{DevicePlacement, DeviceSet, MemoryTier};
pub use error::OverlapsJoinError;
pub use hash_table::{HashLayout, OverlapsHashTable};
pub use hints::QueryTuningHints;
pub use join_condition::{
    ColumnRef, GeometryKind, GeometryOperand, JoinCondition, OverlapsPredicate,
};
pub use overlaps_common::option::{
    add_overlaps_option_extension, HashTableSizeLimit, OverlapsJoinOptions, OverlapsOptions,
};
pub use strategy::{DefaultBuildStrategy, OverlapsBuildStrategy};
