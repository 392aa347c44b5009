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
use std::sync::Arc;

use datafusion_common::DataFusionError;
use datafusion_execution::memory_pool::MemoryPool;
use datafusion_physical_plan::metrics::{self, ExecutionPlanMetricsSet, MetricBuilder};
use log::{debug, info, warn};
use overlaps_common::option::OverlapsJoinOptions;

use crate::accessor::BoundingExtentAccessor;
use crate::bucket::{BucketSize, TupleCountEstimate};
use crate::cache::{HashTableCache, TunedParameters};
use crate::columns::{fetch_build_columns, BuildColumns, ColumnLayout, DeviceSet};
use crate::error::{OverlapsJoinError, Result};
use crate::hash_table::{DeviceHashTable, HashLayout, OverlapsHashTable};
use crate::hints::{QueryTuningHints, ResolvedHints};
use crate::join_condition::JoinCondition;
use crate::key::HashTableKeyBuilder;
use crate::materializer::MaterializeRequest;
use crate::strategy::{DefaultBuildStrategy, OverlapsBuildStrategy};
use crate::tuner::BucketSizeTuner;

/// Metrics of overlaps hash table builds
#[derive(Debug, Clone)]
pub struct OverlapsBuildMetrics {
    /// Time spent fetching extents, tuning and materializing
    pub(crate) build_time: metrics::Time,
    /// Bucket sizes evaluated
    pub(crate) tuning_steps: metrics::Count,
    pub(crate) cache_hits: metrics::Count,
    pub(crate) cache_misses: metrics::Count,
    /// Bytes reserved by built hash tables
    pub(crate) build_mem_used: metrics::Gauge,
}

impl OverlapsBuildMetrics {
    pub fn new(partition: usize, metrics: &ExecutionPlanMetricsSet) -> Self {
        Self {
            build_time: MetricBuilder::new(metrics).subset_time("overlaps_build_time", partition),
            tuning_steps: MetricBuilder::new(metrics).counter("overlaps_tuning_steps", partition),
            cache_hits: MetricBuilder::new(metrics).counter("overlaps_cache_hits", partition),
            cache_misses: MetricBuilder::new(metrics).counter("overlaps_cache_misses", partition),
            build_mem_used: MetricBuilder::new(metrics).gauge("overlaps_build_mem_used", partition),
        }
    }

    pub fn tuning_steps(&self) -> usize {
        self.tuning_steps.value()
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.value()
    }

    pub fn cache_misses(&self) -> usize {
        self.cache_misses.value()
    }

    pub fn build_mem_used(&self) -> usize {
        self.build_mem_used.value()
    }
}

/// Builds overlaps hash tables for join conditions, going through the cache.
///
/// A build resolves the query hints against the session options, declines conditions the
/// policy does not cover, and serves the table from the cache when an equivalent one was
/// built before. Otherwise it fetches the build side extents, picks a bucket size (given
/// by hint, reused from an earlier auto tuning, or freshly tuned), materializes the
/// per-device tables and publishes the result to the cache.
pub struct OverlapsHashTableBuilder {
    accessor: Arc<dyn BoundingExtentAccessor>,
    cache: Arc<HashTableCache>,
    strategy: Arc<dyn OverlapsBuildStrategy>,
    metrics: OverlapsBuildMetrics,
}

impl OverlapsHashTableBuilder {
    pub fn new(
        accessor: Arc<dyn BoundingExtentAccessor>,
        cache: Arc<HashTableCache>,
        metrics: OverlapsBuildMetrics,
    ) -> Self {
        Self {
            accessor,
            cache,
            strategy: Arc::new(DefaultBuildStrategy),
            metrics,
        }
    }

    /// Replace the counting and materialization steps
    pub fn with_strategy(mut self, strategy: Arc<dyn OverlapsBuildStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn metrics(&self) -> &OverlapsBuildMetrics {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<HashTableCache> {
        &self.cache
    }

    /// Get the hash table for `condition`, building it if no equivalent table is cached.
    pub async fn build(
        &self,
        condition: &JoinCondition,
        hints: &QueryTuningHints,
        options: &OverlapsJoinOptions,
        devices: &DeviceSet,
    ) -> Result<Arc<OverlapsHashTable>> {
        options.validate()?;
        if !options.enable {
            warn!("Declining overlaps hash table for {condition}: overlaps hash join is disabled");
            return Err(OverlapsJoinError::NotApplicable(
                "overlaps hash join is disabled".to_string(),
            ));
        }
        let layout = condition
            .hash_layout(options)
            .inspect_err(|e| warn!("Declining overlaps hash table for {condition}: {e}"))?;
        let resolved = hints.resolve(options)?;

        let column_layout = ColumnLayout::try_new(self.accessor.as_ref(), condition.build.column)?;
        let num_rows = column_layout.num_rows();
        if num_rows == 0 {
            debug!("Build side of {condition} is empty");
            let threshold = resolved
                .bucket_threshold
                .unwrap_or(options.default_bucket_threshold);
            return Ok(Arc::new(Self::empty_table(
                layout,
                threshold,
                resolved.max_size_bytes,
                devices,
            )));
        }
        if num_rows < options.trivial_loop_join_threshold {
            warn!(
                "Declining overlaps hash table for {condition}: {num_rows} build rows are below \
                 the trivial loop join threshold"
            );
            return Err(OverlapsJoinError::NotApplicable(format!(
                "build side of {condition} has {num_rows} rows, fewer than the trivial loop join \
                 threshold of {}",
                options.trivial_loop_join_threshold
            )));
        }

        let keys = HashTableKeyBuilder::new(condition, devices);
        let cached_params = if resolved.no_cache {
            None
        } else {
            match self.lookup_cached(&keys, &resolved) {
                CacheLookup::Hit(table) => {
                    self.metrics.cache_hits.add(1);
                    info!(
                        "Reusing cached overlaps hash table for {condition} with threshold {}",
                        table.bucket_threshold()
                    );
                    return Ok(table);
                }
                CacheLookup::Miss(params) => {
                    self.metrics.cache_misses.add(1);
                    params
                }
            }
        };

        let build_timer = self.metrics.build_time.timer();
        let columns = fetch_build_columns(
            Arc::clone(&self.accessor),
            &column_layout,
            devices,
            options.concurrent_fetch,
        )
        .await?;

        // Counting and materializing are CPU bound and run on rayon
        let task = BuildTask {
            strategy: Arc::clone(&self.strategy),
            cache: Arc::clone(&self.cache),
            metrics: self.metrics.clone(),
            keys,
            columns,
            pools: devices.pools().to_vec(),
            layout,
            resolved,
            cached_params,
            options: options.clone(),
        };
        let outcome = tokio::task::spawn_blocking(move || task.run())
            .await
            .map_err(|e| {
                DataFusionError::Execution(format!("Overlaps hash table build task failed: {e}"))
            })??;
        build_timer.done();

        let tuning_params_key = keys.tuning_params_key(resolved.max_size_bytes);
        let (table, tuned_params) = match outcome {
            BuildOutcome::Cached(table, params) => {
                self.metrics.cache_hits.add(1);
                info!(
                    "Reusing cached overlaps hash table for {condition} with tuned threshold {}",
                    table.bucket_threshold()
                );
                self.cache.insert_tuned_parameters(tuning_params_key, params);
                return Ok(table);
            }
            BuildOutcome::Built(table, tuned_params) => (table, tuned_params),
        };
        self.metrics.build_mem_used.add(table.memory_size());
        info!(
            "Built overlaps hash table for {condition}: threshold {}, {} entries, {} emitted keys, \
             {} bytes on {} devices",
            table.bucket_threshold(),
            table.entry_count(),
            table.emitted_keys_count(),
            table.memory_size(),
            devices.device_count()
        );

        if resolved.no_cache {
            return Ok(table);
        }
        if let Some(params) = tuned_params {
            self.cache.insert_tuned_parameters(tuning_params_key, params);
        }
        Ok(self.cache.insert(
            keys.hash_table_key(table.bucket_threshold(), resolved.max_size_bytes),
            table,
        ))
    }

    fn lookup_cached(&self, keys: &HashTableKeyBuilder, resolved: &ResolvedHints) -> CacheLookup {
        let max_size_bytes = resolved.max_size_bytes;
        if let Some(threshold) = resolved.bucket_threshold {
            return match self.cache.lookup(&keys.hash_table_key(threshold, max_size_bytes)) {
                Some(table) => CacheLookup::Hit(table),
                None => CacheLookup::Miss(None),
            };
        }

        let Some(params) = self
            .cache
            .lookup_tuned_parameters(&keys.tuning_params_key(max_size_bytes))
        else {
            return CacheLookup::Miss(None);
        };
        match self
            .cache
            .lookup(&keys.hash_table_key(params.bucket_threshold, max_size_bytes))
        {
            Some(table) => CacheLookup::Hit(table),
            None => CacheLookup::Miss(Some(params)),
        }
    }

    fn empty_table(
        layout: HashLayout,
        bucket_threshold: f64,
        max_size_bytes: usize,
        devices: &DeviceSet,
    ) -> OverlapsHashTable {
        let device_tables = devices
            .pools()
            .iter()
            .enumerate()
            .map(|(device_id, pool)| DeviceHashTable::empty(device_id, pool))
            .collect();
        OverlapsHashTable::new(
            layout,
            BucketSize::unbounded(),
            TupleCountEstimate::default(),
            bucket_threshold,
            max_size_bytes,
            device_tables,
        )
    }
}

/// The blocking part of a build: picking the bucket size and materializing
struct BuildTask {
    strategy: Arc<dyn OverlapsBuildStrategy>,
    cache: Arc<HashTableCache>,
    metrics: OverlapsBuildMetrics,
    keys: HashTableKeyBuilder,
    columns: BuildColumns,
    pools: Vec<Arc<dyn MemoryPool>>,
    layout: HashLayout,
    resolved: ResolvedHints,
    cached_params: Option<TunedParameters>,
    options: OverlapsJoinOptions,
}

enum BuildOutcome {
    /// Tuning resolved to a threshold whose table is already cached
    Cached(Arc<OverlapsHashTable>, TunedParameters),
    /// Freshly materialized, with the parameters if they were auto tuned
    Built(Arc<OverlapsHashTable>, Option<TunedParameters>),
}

impl BuildTask {
    fn run(self) -> Result<BuildOutcome> {
        let max_size_bytes = self.resolved.max_size_bytes;
        let summary = self.columns.summary();
        let tuner = BucketSizeTuner::new(
            self.strategy.as_ref(),
            &self.columns,
            &summary,
            self.layout,
            max_size_bytes,
        )
        .with_tuning_step(self.options.tuning_step)
        .with_max_tuning_steps(self.options.max_tuning_steps);

        let mut tuned_params = None;
        let params = match (self.resolved.bucket_threshold, self.cached_params) {
            (Some(threshold), _) => {
                let tuned = tuner.evaluate_threshold(threshold)?;
                self.metrics.tuning_steps.add(tuned.steps.len());
                TunedParameters {
                    bucket_threshold: threshold,
                    bucket_size: tuned.chosen.bucket_size,
                    estimate: tuned.chosen.estimate,
                }
            }
            (None, Some(params)) => {
                debug!("Reusing tuned threshold {}", params.bucket_threshold);
                params
            }
            (None, None) => {
                let tuned = tuner.tune(self.options.default_bucket_threshold)?;
                self.metrics.tuning_steps.add(tuned.steps.len());
                let params = TunedParameters {
                    bucket_threshold: tuned.chosen.threshold,
                    bucket_size: tuned.chosen.bucket_size,
                    estimate: tuned.chosen.estimate,
                };
                if !self.resolved.no_cache {
                    // An explicit threshold build may have cached this table already
                    let key = self
                        .keys
                        .hash_table_key(params.bucket_threshold, max_size_bytes);
                    if let Some(table) = self.cache.lookup(&key) {
                        return Ok(BuildOutcome::Cached(table, params));
                    }
                }
                tuned_params = Some(params.clone());
                params
            }
        };

        let device_tables = self.strategy.materialize(&MaterializeRequest {
            columns: &self.columns,
            bucket_size: params.bucket_size,
            layout: self.layout,
            estimate: params.estimate,
            pools: &self.pools,
        })?;
        let table = Arc::new(OverlapsHashTable::new(
            self.layout,
            params.bucket_size,
            params.estimate,
            params.bucket_threshold,
            max_size_bytes,
            device_tables,
        ));
        Ok(BuildOutcome::Built(table, tuned_params))
    }
}

enum CacheLookup {
    Hit(Arc<OverlapsHashTable>),
    /// Tuned parameters may still be cached when their table is not
    Miss(Option<TunedParameters>),
}
