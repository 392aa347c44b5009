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
use log::debug;
use overlaps_common::option::OverlapsJoinOptions;

use crate::error::{OverlapsJoinError, Result};

/// Per-query overrides of the overlaps hash table build.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueryTuningHints {
    /// Use this bucket threshold as is and skip auto tuning
    pub bucket_threshold: Option<f64>,
    /// Upper bound of the hash table size for auto tuning
    pub max_hash_table_size_bytes: Option<usize>,
    /// Neither read from nor write to the hash table cache
    pub no_cache: bool,
}

impl QueryTuningHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket_threshold(mut self, threshold: f64) -> Self {
        self.bucket_threshold = Some(threshold);
        self
    }

    pub fn with_max_hash_table_size_bytes(mut self, max_size_bytes: usize) -> Self {
        self.max_hash_table_size_bytes = Some(max_size_bytes);
        self
    }

    pub fn with_no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Combine these hints with the session defaults.
    ///
    /// An explicit bucket threshold disables tuning, so a max size hint given together
    /// with it has nothing to bound and the session default is used in its place.
    pub fn resolve(&self, options: &OverlapsJoinOptions) -> Result<ResolvedHints> {
        if let Some(threshold) = self.bucket_threshold {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(OverlapsJoinError::InvalidHint(format!(
                    "bucket threshold must be a positive number, got {threshold}"
                )));
            }
        }
        if self.max_hash_table_size_bytes == Some(0) {
            return Err(OverlapsJoinError::InvalidHint(
                "max hash table size must be positive".to_string(),
            ));
        }

        let max_size_bytes = match (self.bucket_threshold, self.max_hash_table_size_bytes) {
            (Some(_), Some(ignored)) => {
                debug!(
                    "Ignoring max hash table size hint of {ignored} bytes: bucket threshold is given"
                );
                options.max_hash_table_size_bytes()
            }
            (None, Some(max_size_bytes)) => max_size_bytes,
            (_, None) => options.max_hash_table_size_bytes(),
        };

        Ok(ResolvedHints {
            bucket_threshold: self.bucket_threshold,
            max_size_bytes,
            no_cache: self.no_cache,
        })
    }
}

/// Hints after defaulting, as used by one build
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedHints {
    pub bucket_threshold: Option<f64>,
    pub max_size_bytes: usize,
    pub no_cache: bool,
}

impl ResolvedHints {
    pub fn is_tuned(&self) -> bool {
        self.bucket_threshold.is_none()
    }
}
