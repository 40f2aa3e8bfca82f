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

//! Time-based stat aggregation
//!
//! Consumes the buckets published by the bucketer, summarises each one with
//! the [`aggregate`] algebra and rolls the per-window summaries up into the
//! configured periods before handing them to the sinks.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::model::StatBucket;
use crate::sinks::AggregatedData;

pub mod aggregate;
pub mod rollup;

pub use aggregate::{aggregate, aggregate_values, append, StatsAggregate};
pub use rollup::{PeriodRollup, RollupStore};

/// Aggregation engine that summarises published buckets for the sinks
pub struct AggregationEngine {
    /// Window summaries by name, merged into rollup periods on demand
    rollups: RollupStore,

    /// Newest window start seen so far, used to age out old summaries
    newest_window: Option<DateTime<Utc>>,

    /// Channel for sending aggregated data to sinks
    output_sender: mpsc::Sender<AggregatedData>,
}

impl AggregationEngine {
    /// Create a new aggregation engine
    pub fn new(
        window_length: Duration,
        periods: &[Duration],
        output_sender: mpsc::Sender<AggregatedData>,
    ) -> Result<Self> {
        Ok(Self {
            rollups: RollupStore::new(window_length, periods)?,
            newest_window: None,
            output_sender,
        })
    }

    pub fn rollups(&self) -> &RollupStore {
        &self.rollups
    }

    /// Summarise one bucket and forward the result to the sinks
    pub async fn process_bucket(&mut self, bucket: StatBucket) -> Result<()> {
        let window = self.rollups.record(&bucket);
        let rollups = self.rollups.rollups(&bucket.name, bucket.window_start);
        let window_length = self.rollups.window_length();

        debug!(
            name = %bucket.name,
            window_start = %bucket.window_start,
            count = window.count,
            "aggregated bucket"
        );

        let data = AggregatedData {
            name: bucket.name,
            start_time: bucket.window_start,
            end_time: bucket.window_start + window_length,
            period: window_length.to_std().unwrap_or_default(),
            aggregate: window,
            rollups,
        };

        self.age_out(bucket.window_start);

        self.output_sender
            .send(data)
            .await
            .context("aggregated data receiver closed")
    }

    fn age_out(&mut self, window_start: DateTime<Utc>) {
        if self.newest_window.is_some_and(|newest| newest >= window_start) {
            return;
        }
        self.newest_window = Some(window_start);

        let removed = self.rollups.prune_before(window_start - self.rollups.retention());
        if removed > 0 {
            debug!(removed, "pruned expired window summaries");
        }
    }

    /// Process buckets until the bucketer hangs up
    pub async fn run(mut self, mut buckets: mpsc::Receiver<StatBucket>) -> Result<()> {
        let mut processed = 0u64;
        while let Some(bucket) = buckets.recv().await {
            self.process_bucket(bucket).await?;
            processed += 1;
        }

        info!(
            processed,
            names = self.rollups.len(),
            "aggregation engine stopped"
        );
        Ok(())
    }
}
