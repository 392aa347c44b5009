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
use log::{debug, info};

use crate::bucket::{BucketSize, ExtentSummary, TupleCountEstimate};
use crate::columns::BuildColumns;
use crate::error::{OverlapsJoinError, Result};
use crate::hash_table::HashLayout;
use crate::strategy::OverlapsBuildStrategy;

/// One evaluated candidate of the bucket size search
#[derive(Debug, Clone, PartialEq)]
pub struct TuningStep {
    /// 0 for the initial threshold, counting up with every evaluation
    pub index: usize,
    pub threshold: f64,
    pub bucket_size: BucketSize,
    pub estimate: TupleCountEstimate,
}

impl TuningStep {
    pub fn size_bytes(&self) -> usize {
        self.estimate.size_bytes()
    }
}

/// Outcome of the bucket size search
#[derive(Debug, Clone)]
pub struct TunedBucketSize {
    pub chosen: TuningStep,
    /// Every evaluated step in evaluation order
    pub steps: Vec<TuningStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TuningDirection {
    /// Refining buckets for a lower fan-out
    Smaller,
    /// Coarsening buckets to fit the size bound
    Larger,
}

/// Searches for the bucket threshold of a hash table.
///
/// Starting from an initial threshold the search divides the threshold by the tuning
/// step while buckets get finer and the fan-out (emitted keys per entry) keeps dropping.
/// It stops at the last step that fan-out improved on, or when a finer grid would exceed
/// the size bound. If the initial grid is already too big, the search reverses and
/// multiplies the threshold until the table fits, failing once a coarser grid no longer
/// shrinks the table or the step budget runs out.
pub struct BucketSizeTuner<'a> {
    strategy: &'a dyn OverlapsBuildStrategy,
    columns: &'a BuildColumns,
    summary: &'a ExtentSummary,
    layout: HashLayout,
    max_size_bytes: usize,
    tuning_step: f64,
    max_tuning_steps: usize,
}

impl<'a> BucketSizeTuner<'a> {
    pub fn new(
        strategy: &'a dyn OverlapsBuildStrategy,
        columns: &'a BuildColumns,
        summary: &'a ExtentSummary,
        layout: HashLayout,
        max_size_bytes: usize,
    ) -> Self {
        Self {
            strategy,
            columns,
            summary,
            layout,
            max_size_bytes,
            tuning_step: overlaps_common::option::DEFAULT_TUNING_STEP,
            max_tuning_steps: overlaps_common::option::DEFAULT_MAX_TUNING_STEPS,
        }
    }

    pub fn with_tuning_step(mut self, tuning_step: f64) -> Self {
        self.tuning_step = tuning_step;
        self
    }

    /// Limit the number of steps after the initial one
    pub fn with_max_tuning_steps(mut self, max_tuning_steps: usize) -> Self {
        self.max_tuning_steps = max_tuning_steps;
        self
    }

    /// Evaluate a single given threshold without checking the size bound
    pub fn evaluate_threshold(&self, threshold: f64) -> Result<TunedBucketSize> {
        let step = self.evaluate(0, threshold)?;
        Ok(TunedBucketSize {
            chosen: step.clone(),
            steps: vec![step],
        })
    }

    pub fn tune(&self, initial_threshold: f64) -> Result<TunedBucketSize> {
        let mut steps: Vec<TuningStep> = Vec::new();
        let mut accepted: Option<TuningStep> = None;
        let mut direction = TuningDirection::Smaller;
        let mut threshold = initial_threshold;

        loop {
            let step = self.evaluate(steps.len(), threshold)?;
            steps.push(step.clone());

            if step.estimate.entry_count == 0 {
                debug!("Build side has no cells, nothing to tune");
                return Ok(TunedBucketSize {
                    chosen: step,
                    steps,
                });
            }

            let too_big = step.size_bytes() > self.max_size_bytes;
            let budget_left = steps.len() <= self.max_tuning_steps;

            match direction {
                TuningDirection::Smaller => {
                    if let Some(previous) = accepted.take() {
                        if too_big {
                            debug!(
                                "Step {} needs {} bytes, over the {} byte limit; keeping step {}",
                                step.index,
                                step.size_bytes(),
                                self.max_size_bytes,
                                previous.index
                            );
                            return Ok(Self::finish(previous, steps));
                        }
                        if step.estimate.keys_per_bin() >= previous.estimate.keys_per_bin() {
                            debug!(
                                "Step {} does not lower keys per bin ({} >= {}); keeping step {}",
                                step.index,
                                step.estimate.keys_per_bin(),
                                previous.estimate.keys_per_bin(),
                                previous.index
                            );
                            return Ok(Self::finish(previous, steps));
                        }
                    } else if too_big {
                        // The initial grid does not fit, search coarser grids instead
                        debug!(
                            "Initial threshold {threshold} needs {} bytes, over the {} byte limit",
                            step.size_bytes(),
                            self.max_size_bytes
                        );
                        direction = TuningDirection::Larger;
                        threshold *= self.tuning_step;
                        continue;
                    }

                    if !budget_left {
                        return Ok(Self::finish(step, steps));
                    }
                    accepted = Some(step);
                    threshold /= self.tuning_step;
                }
                TuningDirection::Larger => {
                    if !too_big {
                        return Ok(Self::finish(step, steps));
                    }
                    let not_shrinking = steps
                        .len()
                        .checked_sub(2)
                        .map(|i| step.size_bytes() >= steps[i].size_bytes())
                        .unwrap_or(false);
                    if not_shrinking || !budget_left {
                        return Err(OverlapsJoinError::OversizedHashTable {
                            size_bytes: step.size_bytes(),
                            max_size_bytes: self.max_size_bytes,
                            steps: steps.len(),
                        });
                    }
                    threshold *= self.tuning_step;
                }
            }
        }
    }

    fn evaluate(&self, index: usize, threshold: f64) -> Result<TuningStep> {
        let bucket_size = self.summary.bucket_size_for_threshold(threshold, self.layout);
        let estimate = self.strategy.compute_hash_table_counts(
            index,
            &bucket_size,
            self.layout,
            self.columns,
            self.max_size_bytes,
        )?;
        debug!(
            "Tuning step {index}: threshold {threshold}, bucket size {:?}, {} entries, \
             {} emitted keys, {} bytes",
            bucket_size.widths(),
            estimate.entry_count,
            estimate.emitted_keys_count,
            estimate.size_bytes()
        );
        Ok(TuningStep {
            index,
            threshold,
            bucket_size,
            estimate,
        })
    }

    fn finish(chosen: TuningStep, steps: Vec<TuningStep>) -> TunedBucketSize {
        info!(
            "Chose bucket threshold {} after {} tuning steps: {} entries, {} emitted keys",
            chosen.threshold,
            steps.len(),
            chosen.estimate.entry_count,
            chosen.estimate.emitted_keys_count
        );
        TunedBucketSize { chosen, steps }
    }
}
