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

//! Stat sinks for outputting aggregated data to various destinations
//!
//! Sinks receive the per-window summaries and rollups produced by the
//! aggregation engine and forward them to external systems.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::aggregation::{PeriodRollup, StatsAggregate};

pub mod log;
pub mod memory;

pub use log::LogSink;
pub use memory::MemorySink;

/// Trait for all stat sinks
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Send aggregated data to this sink
    async fn send(&self, data: &AggregatedData) -> Result<()>;

    /// Flush any buffered data
    async fn flush(&self) -> Result<()>;

    /// Close the sink gracefully
    async fn close(&self) -> Result<()>;

    /// Get the name of this sink
    fn name(&self) -> &str;
}

/// Aggregated stats for one name and one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedData {
    /// Name of the stat
    pub name: String,

    /// Start time of the window
    pub start_time: DateTime<Utc>,

    /// End time of the window (exclusive)
    pub end_time: DateTime<Utc>,

    /// Length of the window
    pub period: Duration,

    /// Summary of the window's stats
    pub aggregate: StatsAggregate,

    /// Summaries of the coarser periods the window belongs to
    pub rollups: Vec<PeriodRollup>,
}

/// Fan aggregated data out to every sink until the engine hangs up
///
/// A failing sink is logged and skipped; it does not stop delivery to the
/// others. Sinks are flushed and closed once the channel closes.
pub async fn run_sinks(
    sinks: Vec<Box<dyn StatsSink>>,
    mut receiver: mpsc::Receiver<AggregatedData>,
) -> u64 {
    let mut delivered = 0u64;
    while let Some(data) = receiver.recv().await {
        for sink in &sinks {
            if let Err(err) = sink.send(&data).await {
                error!(sink = sink.name(), error = %err, "sink send failed");
            }
        }
        delivered += 1;
    }

    for sink in &sinks {
        if let Err(err) = sink.flush().await {
            error!(sink = sink.name(), error = %err, "sink flush failed");
        }
        if let Err(err) = sink.close().await {
            error!(sink = sink.name(), error = %err, "sink close failed");
        }
    }

    info!(delivered, sinks = sinks.len(), "sinks closed");
    delivered
}
