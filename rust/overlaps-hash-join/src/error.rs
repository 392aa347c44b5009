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
use datafusion_common::DataFusionError;

/// Failures of an overlaps hash table build. None of them are retried inside this crate; a
/// caller may retry a failed build with different hints or fall back to another join.
#[derive(Debug, thiserror::Error)]
pub enum OverlapsJoinError {
    #[error(
        "Overlaps hash table of {size_bytes} bytes exceeds the limit of {max_size_bytes} bytes \
         after {steps} tuning steps"
    )]
    OversizedHashTable {
        size_bytes: usize,
        max_size_bytes: usize,
        steps: usize,
    },

    #[error("Failed to allocate {requested_bytes} bytes for the overlaps hash table on device {device_id}: {source}")]
    DeviceAllocationFailure {
        device_id: usize,
        requested_bytes: usize,
        source: DataFusionError,
    },

    #[error("Inconsistent count estimate: {0}")]
    InconsistentCountEstimate(String),

    #[error("Unsupported overlaps join predicate: {0}")]
    UnsupportedPredicate(String),

    /// The build was declined by the execution policy; the planner should pick another join
    #[error("Overlaps hash join not applicable: {0}")]
    NotApplicable(String),

    #[error("Invalid overlaps query hint: {0}")]
    InvalidHint(String),

    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),
}

pub type Result<T> = std::result::Result<T, OverlapsJoinError>;

impl From<OverlapsJoinError> for DataFusionError {
    fn from(value: OverlapsJoinError) -> Self {
        match value {
            OverlapsJoinError::DataFusion(e) => e,
            other => DataFusionError::External(Box::new(other)),
        }
    }
}
