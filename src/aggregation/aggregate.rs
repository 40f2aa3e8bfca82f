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

//! Combinable summary statistics
//!
//! A [`StatsAggregate`] summarises a set of values as count, average, min and
//! max. Two aggregates over disjoint sets can be combined with [`append`]
//! without revisiting the raw values; the zero-count aggregate is the identity.

use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::Add;

use crate::model::Stat;

/// Count, average, min and max of a set of values
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsAggregate {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

impl StatsAggregate {
    /// The empty aggregate
    pub const ZERO: Self = Self {
        average: 0.0,
        min: 0.0,
        max: 0.0,
        count: 0,
    };

    /// Aggregate of a single value
    pub fn of(value: f64) -> Self {
        Self {
            average: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sum of the summarised values
    pub fn sum(&self) -> f64 {
        self.average * self.count as f64
    }

    /// Combine with another aggregate; see [`append`]
    pub fn merge(self, other: Self) -> Self {
        append(self, other)
    }
}

/// Summarise `stats` by value
///
/// Names and timestamps are ignored, so callers group by name first if they
/// want per-name results. Empty input yields [`StatsAggregate::ZERO`].
pub fn aggregate<S: AsRef<Stat>>(stats: &[S]) -> StatsAggregate {
    aggregate_values(stats.iter().map(|s| s.as_ref().value))
}

/// Summarise raw values
pub fn aggregate_values<I>(values: I) -> StatsAggregate
where
    I: IntoIterator<Item = f64>,
{
    let mut values = values.into_iter();
    let Some(first) = values.next() else {
        return StatsAggregate::ZERO;
    };

    let mut count = 1u64;
    let mut sum = first;
    let mut min = first;
    let mut max = first;
    for v in values {
        count += 1;
        sum += v;
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }

    StatsAggregate {
        average: sum / count as f64,
        min,
        max,
        count,
    }
}

/// Combine two aggregates without re-reading their values
///
/// The average is weighted by count, so the result matches aggregating the
/// union of both inputs up to floating-point rounding.
pub fn append(a: StatsAggregate, b: StatsAggregate) -> StatsAggregate {
    if a.count == 0 {
        return b;
    }
    if b.count == 0 {
        return a;
    }

    let count = a.count + b.count;
    StatsAggregate {
        average: (a.average * a.count as f64 + b.average * b.count as f64) / count as f64,
        min: a.min.min(b.min),
        max: a.max.max(b.max),
        count,
    }
}

impl Add for StatsAggregate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        append(self, rhs)
    }
}

impl Sum for StatsAggregate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, append)
    }
}

impl<'a> FromIterator<&'a Stat> for StatsAggregate {
    fn from_iter<I: IntoIterator<Item = &'a Stat>>(iter: I) -> Self {
        aggregate_values(iter.into_iter().map(|s| s.value))
    }
}
