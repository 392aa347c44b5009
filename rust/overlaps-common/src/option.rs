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
use std::fmt::Display;

use datafusion::config::{ConfigEntry, ConfigExtension, ConfigField, ExtensionOptions, Visit};
use datafusion::prelude::SessionConfig;
use datafusion_common::config_namespace;
use datafusion_common::{DataFusionError, Result};
use regex::Regex;

/// Default bucket threshold, expressed as a fraction of the build side's extent in each
/// dimension.
pub const DEFAULT_BUCKET_THRESHOLD: f64 = 0.1;

/// Default upper bound of the memory footprint of one overlaps hash table.
pub const DEFAULT_MAX_HASH_TABLE_SIZE_BYTES: usize = 1024 * 1024 * 1024;

/// Default factor applied to the bucket threshold at each tuning step.
pub const DEFAULT_TUNING_STEP: f64 = 10.0;

/// Default number of refinement steps the bucket size tuner may take after the initial step.
pub const DEFAULT_MAX_TUNING_STEPS: usize = 8;

/// Build sides with fewer rows than this are cheaper to join with a nested loop.
pub const DEFAULT_TRIVIAL_LOOP_JOIN_THRESHOLD: usize = 1000;

/// Helper function to register the overlaps join options with a session config
pub fn add_overlaps_option_extension(config: SessionConfig) -> SessionConfig {
    config.with_option_extension(OverlapsOptions::default())
}

config_namespace! {
    /// Configuration options for the overlaps hash join.
    pub struct OverlapsOptions {
        /// Options for building overlaps hash tables
        pub join: OverlapsJoinOptions, default = OverlapsJoinOptions::default()
    }
}

config_namespace! {
    /// Configuration options for building overlaps hash tables.
    ///
    /// A value of this struct is passed into every build and acts as the
    /// execution policy of that build, so concurrent queries with different
    /// settings never observe each other's toggles.
    pub struct OverlapsJoinOptions {
        /// Build overlaps hash tables for spatial join conditions at all
        pub enable: bool, default = true

        /// Allow layouts where one build row occupies many buckets
        pub enable_many_to_many: bool, default = true

        /// Build sides with fewer rows than this are left to a loop join
        pub trivial_loop_join_threshold: usize, default = DEFAULT_TRIVIAL_LOOP_JOIN_THRESHOLD

        /// Initial bucket threshold as a fraction of the build side extent
        pub default_bucket_threshold: f64, default = DEFAULT_BUCKET_THRESHOLD

        /// Maximum memory footprint of a single hash table
        pub max_hash_table_size: HashTableSizeLimit, default = HashTableSizeLimit(DEFAULT_MAX_HASH_TABLE_SIZE_BYTES)

        /// Factor by which the bucket threshold changes at each tuning step
        pub tuning_step: f64, default = DEFAULT_TUNING_STEP

        /// Number of refinement steps the tuner may take after the initial step
        pub max_tuning_steps: usize, default = DEFAULT_MAX_TUNING_STEPS

        /// Fetch bounding extents of all devices concurrently (using spawned tasks).
        /// Set to false for contexts where spawning new tasks is not supported.
        pub concurrent_fetch: bool, default = true
    }
}

impl OverlapsJoinOptions {
    /// Extract the overlaps join options registered on a session, or the defaults if
    /// the extension was never registered.
    pub fn from_session_config(config: &SessionConfig) -> Self {
        config
            .options()
            .extensions
            .get::<OverlapsOptions>()
            .map(|options| options.join.clone())
            .unwrap_or_default()
    }

    /// The default max hash table size in bytes
    pub fn max_hash_table_size_bytes(&self) -> usize {
        self.max_hash_table_size.0
    }

    /// Check that the numeric tuning options describe a search that can terminate.
    pub fn validate(&self) -> Result<()> {
        if !self.default_bucket_threshold.is_finite() || self.default_bucket_threshold <= 0.0 {
            return Err(DataFusionError::Configuration(format!(
                "default_bucket_threshold must be a positive number, got {}",
                self.default_bucket_threshold
            )));
        }
        if !self.tuning_step.is_finite() || self.tuning_step <= 1.0 {
            return Err(DataFusionError::Configuration(format!(
                "tuning_step must be greater than 1, got {}",
                self.tuning_step
            )));
        }
        if self.max_hash_table_size.0 == 0 {
            return Err(DataFusionError::Configuration(
                "max_hash_table_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConfigExtension for OverlapsOptions {
    const PREFIX: &'static str = "overlaps";
}

impl ExtensionOptions for OverlapsOptions {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn cloned(&self) -> Box<dyn ExtensionOptions> {
        Box::new(self.clone())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        <Self as ConfigField>::set(self, key, value)
    }

    fn entries(&self) -> Vec<ConfigEntry> {
        struct Visitor(Vec<ConfigEntry>);

        impl Visit for Visitor {
            fn some<V: Display>(&mut self, key: &str, value: V, description: &'static str) {
                self.0.push(ConfigEntry {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                    description,
                })
            }

            fn none(&mut self, key: &str, description: &'static str) {
                self.0.push(ConfigEntry {
                    key: key.to_string(),
                    value: None,
                    description,
                })
            }
        }

        let mut v = Visitor(vec![]);
        self.visit(&mut v, Self::PREFIX, "");
        v.0
    }
}

/// Upper bound of the memory footprint of one overlaps hash table, in bytes.
///
/// Accepts a plain byte count or a number with a binary unit suffix, for example
/// `1048576`, `64kb`, `512M` or `1GB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashTableSizeLimit(pub usize);

impl ConfigField for HashTableSizeLimit {
    fn visit<V: Visit>(&self, v: &mut V, key: &str, description: &'static str) {
        v.some(key, self.0, description);
    }

    fn set(&mut self, _key: &str, value: &str) -> Result<()> {
        let value = value.trim().to_lowercase();
        let size_regex = Regex::new(r"^(\d+)\s*(b|k|kb|m|mb|g|gb)?$")
            .map_err(|e| DataFusionError::External(Box::new(e)))?;

        let Some(captures) = size_regex.captures(&value) else {
            return Err(DataFusionError::Configuration(format!(
                "Invalid hash table size: {value}. Expected a byte count with an optional unit (b, kb, mb, gb)"
            )));
        };

        let number = captures[1].parse::<usize>().map_err(|_| {
            DataFusionError::Configuration(format!("Invalid hash table size: {value}"))
        })?;
        let multiplier: usize = match captures.get(2).map(|m| m.as_str()) {
            None | Some("b") => 1,
            Some("k") | Some("kb") => 1024,
            Some("m") | Some("mb") => 1024 * 1024,
            _ => 1024 * 1024 * 1024,
        };
        let bytes = number.checked_mul(multiplier).ok_or_else(|| {
            DataFusionError::Configuration(format!("Hash table size overflows: {value}"))
        })?;
        if bytes == 0 {
            return Err(DataFusionError::Configuration(
                "Invalid hash table size: 0 is not allowed".to_string(),
            ));
        }

        *self = HashTableSizeLimit(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::config::ConfigField;

    #[test]
    fn test_size_limit_parsing_plain_bytes() {
        let mut limit = HashTableSizeLimit(1);

        assert!(limit.set("", "1000").is_ok());
        assert_eq!(limit, HashTableSizeLimit(1000));

        assert!(limit.set("", " 2b ").is_ok());
        assert_eq!(limit, HashTableSizeLimit(2));
    }

    #[test]
    fn test_size_limit_parsing_units() {
        let mut limit = HashTableSizeLimit(1);

        assert!(limit.set("", "64kb").is_ok());
        assert_eq!(limit, HashTableSizeLimit(64 * 1024));

        assert!(limit.set("", "512M").is_ok());
        assert_eq!(limit, HashTableSizeLimit(512 * 1024 * 1024));

        assert!(limit.set("", "1GB").is_ok());
        assert_eq!(limit, HashTableSizeLimit(DEFAULT_MAX_HASH_TABLE_SIZE_BYTES));
    }

    #[test]
    fn test_size_limit_parsing_invalid_formats() {
        let mut limit = HashTableSizeLimit(1);

        assert!(limit.set("", "").is_err());
        assert!(limit.set("", "0").is_err());
        assert!(limit.set("", "-5").is_err());
        assert!(limit.set("", "1.5gb").is_err());
        assert!(limit.set("", "12tb").is_err());
        assert!(limit.set("", "gb").is_err());
        assert!(limit.set("", "99999999999999999999999gb").is_err());
        assert_eq!(limit, HashTableSizeLimit(1));
    }

    #[test]
    fn test_default_options_are_valid() {
        let options = OverlapsJoinOptions::default();
        assert!(options.validate().is_ok());
        assert!(options.enable);
        assert_eq!(options.default_bucket_threshold, DEFAULT_BUCKET_THRESHOLD);
        assert_eq!(
            options.max_hash_table_size_bytes(),
            DEFAULT_MAX_HASH_TABLE_SIZE_BYTES
        );
    }

    #[test]
    fn test_invalid_tuning_options() {
        let options = OverlapsJoinOptions {
            tuning_step: 1.0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = OverlapsJoinOptions {
            default_bucket_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_from_session_config() {
        let config = SessionConfig::new();
        assert_eq!(
            OverlapsJoinOptions::from_session_config(&config),
            OverlapsJoinOptions::default()
        );

        let mut config = add_overlaps_option_extension(SessionConfig::new());
        config
            .options_mut()
            .set("overlaps.join.max_tuning_steps", "3")
            .unwrap();
        config
            .options_mut()
            .set("overlaps.join.max_hash_table_size", "1kb")
            .unwrap();
        let options = OverlapsJoinOptions::from_session_config(&config);
        assert_eq!(options.max_tuning_steps, 3);
        assert_eq!(options.max_hash_table_size_bytes(), 1024);
    }
}
