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

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{AggregatedData, StatsSink};

#[derive(Debug, Default)]
struct State {
    records: Vec<AggregatedData>,
    closed: bool,
}

/// Keeps every aggregate it receives in memory
///
/// Clones share the same buffer, so a handle kept by the caller can inspect
/// what the daemon delivered.
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Everything received so far, in arrival order
    pub async fn records(&self) -> Vec<AggregatedData> {
        self.state.lock().await.records.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl StatsSink for MemorySink {
    async fn send(&self, data: &AggregatedData) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            bail!("sink {} is closed", self.name);
        }
        state.records.push(data.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
