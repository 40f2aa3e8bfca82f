/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Configuration parsing
//!
//! The daemon is configured from a JSON document with camelCase keys.
//! Durations are ISO-8601 strings in seconds, e.g. `"PT60S"` or `"PT0.5S"`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bucketer::BucketerConfig;

/// Main daemon configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Width of each bucketing window
    #[serde(with = "duration_serde")]
    pub window_length: Duration,

    /// How often the current and previous windows are published
    #[serde(with = "duration_serde")]
    pub publish_interval: Duration,

    /// Longest the bucketer waits before re-checking the wall clock
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Capacity of the channel feeding stats to the bucketer
    pub input_channel_capacity: usize,

    /// Capacity of the channel carrying published buckets
    pub bucket_channel_capacity: usize,

    /// Publish the future window as well when shutting down
    pub flush_future_on_shutdown: bool,

    /// Periods the per-window aggregates are rolled up into
    #[serde(with = "duration_vec_serde")]
    pub rollup_periods: Vec<Duration>,

    /// Keep raw stats in the queryable repository
    pub retain_raw_stats: bool,

    /// How long raw stats are kept in the repository
    #[serde(with = "duration_serde")]
    pub repo_retention: Duration,

    /// Default tracing filter, overridden by `RUST_LOG`
    pub log_level: String,

    /// `"stdin"` or the path of a file of newline-delimited JSON stats
    pub input: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(60),
            publish_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(1),
            input_channel_capacity: 1024,
            bucket_channel_capacity: 64,
            flush_future_on_shutdown: false,
            rollup_periods: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(3600),
            ],
            retain_raw_stats: true,
            repo_retention: Duration::from_secs(3600),
            log_level: "info".to_string(),
            input: "stdin".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("windowLength", self.window_length),
            ("publishInterval", self.publish_interval),
            ("idleTimeout", self.idle_timeout),
            ("repoRetention", self.repo_retention),
        ] {
            if value.is_zero() {
                bail!("{} must be > 0", field);
            }
        }

        if self.input_channel_capacity == 0 {
            bail!("inputChannelCapacity must be > 0");
        }
        if self.bucket_channel_capacity == 0 {
            bail!("bucketChannelCapacity must be > 0");
        }

        let window = self.window_length.as_nanos();
        for period in &self.rollup_periods {
            if period.is_zero() || period.as_nanos() % window != 0 {
                bail!(
                    "rollup period {:?} is not a multiple of windowLength {:?}",
                    period,
                    self.window_length
                );
            }
        }

        if self.input.trim().is_empty() {
            bail!("input must be \"stdin\" or a file path");
        }
        Ok(())
    }

    pub fn bucketer_config(&self) -> BucketerConfig {
        BucketerConfig {
            window_length: self.window_length,
            publish_interval: self.publish_interval,
            idle_timeout: self.idle_timeout,
            flush_future_on_shutdown: self.flush_future_on_shutdown,
        }
    }
}

// Duration serialization helpers
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn to_iso(duration: &Duration) -> String {
        format!("PT{}S", duration.as_secs_f64())
    }

    pub fn from_iso(s: &str) -> Result<Duration, String> {
        let seconds = s
            .strip_prefix("PT")
            .and_then(|rest| rest.strip_suffix('S'))
            .ok_or_else(|| format!("Invalid duration format: {}", s))?;
        let seconds: f64 = seconds
            .parse()
            .map_err(|_| format!("Invalid duration format: {}", s))?;
        Duration::try_from_secs_f64(seconds).map_err(|err| format!("Invalid duration {}: {}", s, err))
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_iso(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        from_iso(&s).map_err(serde::de::Error::custom)
    }
}

mod duration_vec_serde {
    use super::duration_serde::{from_iso, to_iso};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(durations.iter().map(to_iso))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| from_iso(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
