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

use ahash::{HashMap, HashMapExt};
use anyhow::{bail, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::aggregate::{aggregate, StatsAggregate};
use crate::bucketer::window::truncate;
use crate::model::StatBucket;

/// Aggregate of one name over one rollup period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodRollup {
    /// Length of the rollup period
    pub period: Duration,

    /// Inclusive start of the period
    pub start: DateTime<Utc>,

    /// Merged aggregate of every window summary inside the period
    pub aggregate: StatsAggregate,
}

/// Per-window summaries, merged on demand into coarser periods
///
/// Each window is republished with its full contents on every publish cycle,
/// so [`RollupStore::record`] replaces the summary for that window rather than
/// merging into it. Merging only happens across distinct windows.
#[derive(Debug)]
pub struct RollupStore {
    window_length: TimeDelta,
    periods: Vec<(Duration, TimeDelta)>,
    windows: HashMap<String, BTreeMap<DateTime<Utc>, StatsAggregate>>,
}

impl RollupStore {
    /// Create a store for `window_length` windows rolled up into `periods`
    ///
    /// Every period must be a non-zero multiple of the window length.
    pub fn new(window_length: Duration, periods: &[Duration]) -> Result<Self> {
        if window_length.is_zero() {
            bail!("window_length must be > 0");
        }

        let mut converted = Vec::with_capacity(periods.len());
        for period in periods {
            if period.is_zero() || period.as_nanos() % window_length.as_nanos() != 0 {
                bail!(
                    "rollup period {:?} is not a multiple of the window length {:?}",
                    period,
                    window_length
                );
            }
            converted.push((*period, TimeDelta::from_std(*period)?));
        }

        Ok(Self {
            window_length: TimeDelta::from_std(window_length)?,
            periods: converted,
            windows: HashMap::new(),
        })
    }

    pub fn window_length(&self) -> TimeDelta {
        self.window_length
    }

    /// How far behind the newest window summaries are still needed
    pub fn retention(&self) -> TimeDelta {
        let longest = self
            .periods
            .iter()
            .map(|(_, period)| *period)
            .max()
            .unwrap_or(self.window_length);
        longest + self.window_length * 2
    }

    /// Summarise a published bucket, replacing any earlier summary of the
    /// same name and window
    pub fn record(&mut self, bucket: &StatBucket) -> StatsAggregate {
        let summary = aggregate(&bucket.stats);
        self.windows
            .entry(bucket.name.clone())
            .or_default()
            .insert(bucket.window_start, summary);
        summary
    }

    /// Summary of `name` for the window starting at `start`
    pub fn window(&self, name: &str, start: DateTime<Utc>) -> Option<StatsAggregate> {
        self.windows.get(name)?.get(&start).copied()
    }

    /// Merge the window summaries of `name` inside the `period` containing `at`
    pub fn rollup(&self, name: &str, period: TimeDelta, at: DateTime<Utc>) -> StatsAggregate {
        let start = truncate(at, period);
        match self.windows.get(name) {
            Some(windows) => windows
                .range(start..start + period)
                .map(|(_, summary)| *summary)
                .sum(),
            None => StatsAggregate::ZERO,
        }
    }

    /// Rollups of `name` for every configured period containing `at`
    pub fn rollups(&self, name: &str, at: DateTime<Utc>) -> Vec<PeriodRollup> {
        self.periods
            .iter()
            .map(|(period, delta)| PeriodRollup {
                period: *period,
                start: truncate(at, *delta),
                aggregate: self.rollup(name, *delta, at),
            })
            .collect()
    }

    /// Forget window summaries that start before `cutoff`
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.windows.retain(|_, windows| {
            let kept = windows.split_off(&cutoff);
            removed += windows.len();
            *windows = kept;
            !windows.is_empty()
        });
        removed
    }

    /// Number of names with at least one window summary
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stat;
    use chrono::TimeZone;

    const MINUTE: Duration = Duration::from_secs(60);

    fn bucket(name: &str, window_start: DateTime<Utc>, values: &[f64]) -> StatBucket {
        StatBucket {
            name: name.to_string(),
            window_start,
            stats: values
                .iter()
                .map(|v| Stat::new(name, window_start, *v).shared())
                .collect(),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_periods_must_be_window_multiples() {
        assert!(RollupStore::new(MINUTE, &[Duration::from_secs(300)]).is_ok());
        assert!(RollupStore::new(MINUTE, &[Duration::from_secs(90)]).is_err());
        assert!(RollupStore::new(MINUTE, &[Duration::ZERO]).is_err());
        assert!(RollupStore::new(Duration::ZERO, &[]).is_err());
    }

    #[test]
    fn test_republished_window_replaces_summary() {
        let mut store = RollupStore::new(MINUTE, &[]).unwrap();

        store.record(&bucket("foo", at(10, 0), &[1.0, 2.0]));
        let latest = store.record(&bucket("foo", at(10, 0), &[1.0, 2.0, 6.0]));

        assert_eq!(latest.count, 3);
        assert_eq!(store.window("foo", at(10, 0)), Some(latest));
        assert_eq!(store.window("foo", at(10, 1)), None);
    }

    #[test]
    fn test_rollup_merges_windows_in_period() {
        let five_minutes = Duration::from_secs(300);
        let mut store = RollupStore::new(MINUTE, &[five_minutes]).unwrap();

        store.record(&bucket("foo", at(10, 0), &[1.0, 2.0]));
        store.record(&bucket("foo", at(10, 3), &[3.0, 4.0]));
        store.record(&bucket("foo", at(10, 4), &[5.0, 6.0]));
        // Outside the 10:00 - 10:05 period.
        store.record(&bucket("foo", at(10, 5), &[100.0]));
        store.record(&bucket("bar", at(10, 1), &[-50.0]));

        let rollups = store.rollups("foo", at(10, 4));
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].period, five_minutes);
        assert_eq!(rollups[0].start, at(10, 0));
        assert_eq!(
            rollups[0].aggregate,
            StatsAggregate {
                average: 3.5,
                min: 1.0,
                max: 6.0,
                count: 6,
            }
        );

        assert_eq!(
            store.rollup("foo", TimeDelta::minutes(5), at(10, 7)).count,
            1
        );
        assert_eq!(
            store.rollup("missing", TimeDelta::minutes(5), at(10, 0)),
            StatsAggregate::ZERO
        );
    }

    #[test]
    fn test_prune_before() {
        let mut store = RollupStore::new(MINUTE, &[Duration::from_secs(300)]).unwrap();
        store.record(&bucket("foo", at(10, 0), &[1.0]));
        store.record(&bucket("foo", at(10, 1), &[1.0]));
        store.record(&bucket("bar", at(10, 0), &[1.0]));

        assert_eq!(store.prune_before(at(10, 1)), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.window("foo", at(10, 0)), None);
        assert!(store.window("foo", at(10, 1)).is_some());

        assert_eq!(store.retention(), TimeDelta::minutes(7));
    }
}
