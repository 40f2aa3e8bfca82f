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
use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use crate::model::{SharedStat, StatBucket};

/// One fixed-length interval of the window triple
///
/// Maps stat name to the stats observed for it, in insertion order.
#[derive(Debug, Clone)]
pub struct Window {
    min_time: DateTime<Utc>,
    buckets: HashMap<String, Vec<SharedStat>>,
}

impl Window {
    /// Create an empty window starting at `min_time`
    pub fn new(min_time: DateTime<Utc>) -> Self {
        Self {
            min_time,
            buckets: HashMap::new(),
        }
    }

    /// Inclusive lower bound of the window
    pub fn min_time(&self) -> DateTime<Utc> {
        self.min_time
    }

    /// Append a stat to the end of its name's sequence
    pub fn push(&mut self, stat: SharedStat) {
        // Avoid allocating the key when the name is already present.
        match self.buckets.get_mut(stat.name.as_str()) {
            Some(stats) => stats.push(stat),
            None => {
                self.buckets.insert(stat.name.clone(), vec![stat]);
            }
        }
    }

    /// Stats recorded for `name`, if any
    pub fn get(&self, name: &str) -> Option<&[SharedStat]> {
        self.buckets.get(name).map(Vec::as_slice)
    }

    /// Number of distinct names in the window
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total stats across all names
    pub fn stat_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Clone every populated name into a publishable bucket
    pub fn snapshot(&self) -> impl Iterator<Item = StatBucket> + '_ {
        self.buckets.iter().map(|(name, stats)| StatBucket {
            name: name.clone(),
            window_start: self.min_time,
            stats: stats.clone(),
        })
    }
}

/// Round `ts` down to a multiple of `length` since the Unix epoch
pub fn truncate(ts: DateTime<Utc>, length: TimeDelta) -> DateTime<Utc> {
    ts.duration_trunc(length).unwrap_or(ts)
}
