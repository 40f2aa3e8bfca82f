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

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{AggregatedData, StatsSink};

/// Writes every aggregate to the tracing log
#[derive(Debug, Clone)]
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl StatsSink for LogSink {
    async fn send(&self, data: &AggregatedData) -> Result<()> {
        info!(
            sink = %self.name,
            stat = %data.name,
            start = %data.start_time,
            count = data.aggregate.count,
            average = data.aggregate.average,
            min = data.aggregate.min,
            max = data.aggregate.max,
            "window aggregate"
        );
        for rollup in &data.rollups {
            info!(
                sink = %self.name,
                stat = %data.name,
                period = ?rollup.period,
                start = %rollup.start,
                count = rollup.aggregate.count,
                average = rollup.aggregate.average,
                min = rollup.aggregate.min,
                max = rollup.aggregate.max,
                "rollup aggregate"
            );
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
