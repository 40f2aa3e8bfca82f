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

//! Raw stat storage
//!
//! Every accepted stat can be retained here, independently of the bucketer,
//! so recent raw values stay queryable by name and time range.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::model::SharedStat;

pub mod query;

pub use query::{LastNRawStatsRequest, QueryRequest, RawStat, RawStatsRequest};

/// Storage for raw stats, queried by name
pub trait StatRepository: Send + Sync {
    /// Store one stat
    fn insert(&self, stat: SharedStat) -> Result<()>;

    /// Stats named `name` with `start <= timestamp <= end`, oldest first
    fn raw_stats(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SharedStat>>;

    /// The newest `n` stats named `name`, oldest first
    fn last_n_raw_stats(&self, name: &str, n: usize) -> Result<Vec<SharedStat>>;
}

/// Repository held in memory, one timestamp-ordered list per name
#[derive(Debug, Default)]
pub struct InMemoryStatRepository {
    stats: DashMap<String, Vec<SharedStat>>,
}

impl InMemoryStatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every stat older than `cutoff`, returning how many went
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.stats.retain(|_, stats| {
            let split = stats.partition_point(|s| s.timestamp < cutoff);
            removed += split;
            stats.drain(..split);
            !stats.is_empty()
        });
        removed
    }

    /// Total number of stats held
    pub fn len(&self) -> usize {
        self.stats.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

impl StatRepository for InMemoryStatRepository {
    fn insert(&self, stat: SharedStat) -> Result<()> {
        let mut stats = self.stats.entry(stat.name.clone()).or_default();
        // After any equal timestamps so arrival order is kept.
        let at = stats.partition_point(|s| s.timestamp <= stat.timestamp);
        stats.insert(at, stat);
        Ok(())
    }

    fn raw_stats(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SharedStat>> {
        let Some(stats) = self.stats.get(name) else {
            return Ok(Vec::new());
        };
        let from = stats.partition_point(|s| s.timestamp < start);
        let to = stats.partition_point(|s| s.timestamp <= end);
        Ok(stats.value().get(from..to).map(<[_]>::to_vec).unwrap_or_default())
    }

    fn last_n_raw_stats(&self, name: &str, n: usize) -> Result<Vec<SharedStat>> {
        let Some(stats) = self.stats.get(name) else {
            return Ok(Vec::new());
        };
        let from = stats.len().saturating_sub(n);
        Ok(stats.value()[from..].to_vec())
    }
}

/// Store raw stats until the channel closes, pruning past `retention`
pub async fn run_repository(
    repository: Arc<InMemoryStatRepository>,
    mut stats: mpsc::Receiver<SharedStat>,
    clock: Arc<dyn Clock>,
    retention: Duration,
) -> Result<()> {
    let mut prune = time::interval(retention.max(Duration::from_secs(1)));
    let retention = chrono::TimeDelta::from_std(retention)?;
    prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stored = 0u64;
    loop {
        tokio::select! {
            received = stats.recv() => match received {
                Some(stat) => {
                    repository.insert(stat)?;
                    stored += 1;
                }
                None => break,
            },
            _ = prune.tick() => {
                let removed = repository.prune_before(clock.now() - retention);
                if removed > 0 {
                    debug!(removed, "pruned raw stats");
                }
            }
        }
    }

    info!(stored, held = repository.len(), "stat repository stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Stat;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, secs).unwrap()
    }

    fn stat(name: &str, secs: u32, value: f64) -> SharedStat {
        Stat::new(name, at(secs), value).shared()
    }

    fn values(stats: &[SharedStat]) -> Vec<f64> {
        stats.iter().map(|s| s.value).collect()
    }

    fn seeded() -> InMemoryStatRepository {
        let repo = InMemoryStatRepository::new();
        for (secs, value) in [(30, 3.0), (10, 1.0), (20, 2.0), (20, 2.5), (40, 4.0)] {
            repo.insert(stat("foo", secs, value)).unwrap();
        }
        repo.insert(stat("bar", 20, 99.0)).unwrap();
        repo
    }

    #[test]
    fn test_insert_orders_by_timestamp() {
        let repo = seeded();
        let all = repo.raw_stats("foo", at(0), at(59)).unwrap();
        assert_eq!(values(&all), vec![1.0, 2.0, 2.5, 3.0, 4.0]);
        assert_eq!(repo.len(), 6);
    }

    #[test]
    fn test_raw_stats_range_is_inclusive() {
        let repo = seeded();
        let range = repo.raw_stats("foo", at(20), at(30)).unwrap();
        assert_eq!(values(&range), vec![2.0, 2.5, 3.0]);

        assert!(repo.raw_stats("foo", at(41), at(50)).unwrap().is_empty());
        assert!(repo.raw_stats("foo", at(30), at(20)).unwrap().is_empty());
        assert!(repo.raw_stats("missing", at(0), at(59)).unwrap().is_empty());
    }

    #[test]
    fn test_last_n_raw_stats() {
        let repo = seeded();
        assert_eq!(values(&repo.last_n_raw_stats("foo", 2).unwrap()), vec![3.0, 4.0]);
        assert_eq!(repo.last_n_raw_stats("foo", 10).unwrap().len(), 5);
        assert!(repo.last_n_raw_stats("foo", 0).unwrap().is_empty());
        assert!(repo.last_n_raw_stats("missing", 3).unwrap().is_empty());
    }

    #[test]
    fn test_prune_before() {
        let repo = seeded();
        assert_eq!(repo.prune_before(at(25)), 4);
        assert_eq!(values(&repo.raw_stats("foo", at(0), at(59)).unwrap()), vec![3.0, 4.0]);
        assert!(repo.last_n_raw_stats("bar", 1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_repository_stores_until_closed() {
        let repo = Arc::new(InMemoryStatRepository::new());
        let clock = Arc::new(ManualClock::new(at(50)));
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_repository(
            Arc::clone(&repo),
            rx,
            clock,
            Duration::from_secs(3600),
        ));

        tx.send(stat("foo", 10, 1.0)).await.unwrap();
        tx.send(stat("foo", 20, 2.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(repo.len(), 2);
    }
}
