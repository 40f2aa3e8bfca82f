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

//! Core data model for stat bucketing
//!
//! Defines the immutable [`Stat`] sample that flows through the daemon and the
//! [`StatBucket`] message that the bucketer publishes for each name and window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A single named, timestamped numeric sample
///
/// Stats are created by producers and never mutated afterwards. They travel
/// through the pipeline as [`SharedStat`] so that windows, published buckets
/// and the repository all hold the same allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    /// Identifies the statistic (e.g. `localhost-cpu-utilization`)
    pub name: String,

    /// The moment in time the statistic applies to
    pub timestamp: DateTime<Utc>,

    /// Numeric value of the statistic
    pub value: f64,
}

/// Reference-counted handle to an immutable [`Stat`]
pub type SharedStat = Arc<Stat>;

impl Stat {
    /// Create a new stat
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            value,
        }
    }

    /// Wrap this stat for sharing across the pipeline
    pub fn shared(self) -> SharedStat {
        Arc::new(self)
    }

    /// Returns the reason this stat cannot be bucketed, if any
    pub fn validate(&self) -> Option<&'static str> {
        if self.name.is_empty() {
            Some("empty stat name")
        } else if !self.value.is_finite() {
            Some("non-finite stat value")
        } else {
            None
        }
    }
}

impl AsRef<Stat> for Stat {
    fn as_ref(&self) -> &Stat {
        self
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}={}",
            self.name,
            self.timestamp.to_rfc3339(),
            self.value
        )
    }
}

/// All stats observed for one name within one window, in insertion order
///
/// This is the unit the bucketer emits on every publish. The `stats` vector is
/// a clone of the window's sequence, so consumers never observe later inserts.
#[derive(Debug, Clone, PartialEq)]
pub struct StatBucket {
    /// Name shared by every stat in the bucket
    pub name: String,

    /// Inclusive start of the window the stats were bucketed into
    pub window_start: DateTime<Utc>,

    /// Stats in insertion order
    pub stats: Vec<SharedStat>,
}

impl StatBucket {
    /// Number of stats in the bucket
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Whether the bucket holds no stats
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Iterate over the raw values in insertion order
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.stats.iter().map(|s| s.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stat_serialization() {
        let stat = Stat::new(
            "cpu",
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 15).unwrap(),
            42.5,
        );

        let json = serde_json::to_string(&stat).unwrap();
        assert!(json.contains("\"name\":\"cpu\""));
        assert!(json.contains("2024-03-01T12:30:15Z"));

        let deserialized: Stat = serde_json::from_str(&json).unwrap();
        assert_eq!(stat, deserialized);
    }

    #[test]
    fn test_stat_validation() {
        let ts = Utc::now();
        assert_eq!(Stat::new("ok", ts, 1.0).validate(), None);
        assert_eq!(Stat::new("", ts, 1.0).validate(), Some("empty stat name"));
        assert_eq!(
            Stat::new("nan", ts, f64::NAN).validate(),
            Some("non-finite stat value")
        );
        assert_eq!(
            Stat::new("inf", ts, f64::INFINITY).validate(),
            Some("non-finite stat value")
        );
    }

    #[test]
    fn test_bucket_values_keep_order() {
        let ts = Utc::now();
        let bucket = StatBucket {
            name: "foo".to_string(),
            window_start: ts,
            stats: vec![
                Stat::new("foo", ts, 2.0).shared(),
                Stat::new("foo", ts, 1.0).shared(),
            ],
        };

        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.values().collect::<Vec<_>>(), vec![2.0, 1.0]);
    }
}
