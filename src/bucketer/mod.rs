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

//! Windowed stat bucketing
//!
//! The [`Bucketer`] tracks three contiguous windows (previous, current and
//! future) and sorts incoming stats into them by timestamp. Stats that fall
//! outside the three-window span are dropped and counted. Windows are
//! published as per-name [`StatBucket`]s and rotated forward as wall-clock
//! time crosses into the future window.
//!
//! A bucketer is owned by exactly one task (see [`Bucketer::run`]); nothing
//! else touches its windows, so no locking is involved.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;
use crate::model::{SharedStat, StatBucket};

mod driver;
pub mod window;

pub use driver::BucketerStats;
pub use window::Window;

/// Which of the three windows a stat was placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowSlot {
    Previous,
    Current,
    Future,
}

/// Reasons a stat is refused by [`Bucketer::insert`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InsertError {
    #[error("dropping malformed stat ({reason}): {stat}")]
    Malformed {
        reason: &'static str,
        stat: SharedStat,
    },

    #[error("dropping 'future' stat that is after {limit}: {stat}")]
    TooFuture {
        limit: DateTime<Utc>,
        stat: SharedStat,
    },

    #[error("dropping stat older than {min_time}: {stat}")]
    TooOld {
        min_time: DateTime<Utc>,
        stat: SharedStat,
    },
}

/// Publishing could not hand a bucket to the consumer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("bucket consumer has gone away")]
    SinkClosed,
}

/// Count of stats refused by the bucketer, by reason
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub malformed: u64,
    pub too_old: u64,
    pub too_future: u64,
}

impl DropCounters {
    pub fn total(&self) -> u64 {
        self.malformed + self.too_old + self.too_future
    }

    fn record(&mut self, err: &InsertError) {
        match err {
            InsertError::Malformed { .. } => self.malformed += 1,
            InsertError::TooOld { .. } => self.too_old += 1,
            InsertError::TooFuture { .. } => self.too_future += 1,
        }
    }
}

/// Tuning for a [`Bucketer`] and its run loop
#[derive(Debug, Clone)]
pub struct BucketerConfig {
    /// Width of each window
    pub window_length: Duration,

    /// How often current and previous windows are published
    pub publish_interval: Duration,

    /// Longest the run loop waits before re-checking the wall clock
    pub idle_timeout: Duration,

    /// Also publish the future window during the final shutdown flush
    pub flush_future_on_shutdown: bool,
}

impl Default for BucketerConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(60),
            publish_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(1),
            flush_future_on_shutdown: false,
        }
    }
}

/// Sorts stats into previous, current and future windows
pub struct Bucketer {
    config: BucketerConfig,
    window_length: TimeDelta,
    clock: Arc<dyn Clock>,

    previous: Window,
    current: Window,
    future: Window,

    drops: DropCounters,
}

impl Bucketer {
    /// Create a bucketer whose current window contains `clock.now()`
    pub fn new(config: BucketerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.window_length.is_zero() {
            bail!("window_length must be > 0");
        }
        let window_length = TimeDelta::from_std(config.window_length)?;

        let current_min = window::truncate(clock.now(), window_length);

        Ok(Self {
            previous: Window::new(current_min - window_length),
            current: Window::new(current_min),
            future: Window::new(current_min + window_length),
            config,
            window_length,
            clock,
            drops: DropCounters::default(),
        })
    }

    pub fn window_length(&self) -> TimeDelta {
        self.window_length
    }

    pub fn previous(&self) -> &Window {
        &self.previous
    }

    pub fn current(&self) -> &Window {
        &self.current
    }

    pub fn future(&self) -> &Window {
        &self.future
    }

    /// The window occupying `slot`
    pub fn window(&self, slot: WindowSlot) -> &Window {
        match slot {
            WindowSlot::Previous => &self.previous,
            WindowSlot::Current => &self.current,
            WindowSlot::Future => &self.future,
        }
    }

    pub fn drops(&self) -> DropCounters {
        self.drops
    }

    /// Latest timestamp the future window accepts
    pub fn future_limit(&self) -> DateTime<Utc> {
        self.future.min_time() + (self.window_length - TimeDelta::nanoseconds(1))
    }

    /// Place `stat` in the window its timestamp falls in
    ///
    /// Refused stats are counted and returned as an error; they are never
    /// buffered.
    pub fn insert(&mut self, stat: SharedStat) -> Result<WindowSlot, InsertError> {
        let result = self.classify(&stat);
        match &result {
            Ok(slot) => {
                let window = match slot {
                    WindowSlot::Previous => &mut self.previous,
                    WindowSlot::Current => &mut self.current,
                    WindowSlot::Future => &mut self.future,
                };
                window.push(stat);
            }
            Err(err) => self.drops.record(err),
        }
        result
    }

    fn classify(&self, stat: &SharedStat) -> Result<WindowSlot, InsertError> {
        if let Some(reason) = stat.validate() {
            return Err(InsertError::Malformed {
                reason,
                stat: Arc::clone(stat),
            });
        }

        let ts = stat.timestamp;
        let limit = self.future_limit();
        if ts > limit {
            Err(InsertError::TooFuture {
                limit,
                stat: Arc::clone(stat),
            })
        } else if ts >= self.future.min_time() {
            Ok(WindowSlot::Future)
        } else if ts >= self.current.min_time() {
            Ok(WindowSlot::Current)
        } else if ts >= self.previous.min_time() {
            Ok(WindowSlot::Previous)
        } else {
            Err(InsertError::TooOld {
                min_time: self.previous.min_time(),
                stat: Arc::clone(stat),
            })
        }
    }

    /// Rotate the windows forward by one window length
    ///
    /// Whatever the previous window held is discarded.
    pub fn advance(&mut self) {
        let next_future = Window::new(self.future.min_time() + self.window_length);
        let future = std::mem::replace(&mut self.future, next_future);
        let current = std::mem::replace(&mut self.current, future);
        let discarded = std::mem::replace(&mut self.previous, current);

        debug!(
            discarded_names = discarded.len(),
            current_min = %self.current.min_time(),
            "advanced windows"
        );
    }

    /// Advance once if `now` is past the start of the future window
    pub fn advance_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if now > self.future.min_time() {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Send a copy of every populated name in `slot` to `output`
    ///
    /// Waits for channel capacity, so a slow consumer holds up the caller.
    pub async fn publish(
        &self,
        slot: WindowSlot,
        output: &mpsc::Sender<StatBucket>,
    ) -> Result<usize, PublishError> {
        let window = self.window(slot);
        let mut published = 0;
        for bucket in window.snapshot() {
            debug!(
                name = %bucket.name,
                count = bucket.len(),
                window = ?slot,
                "publishing bucket"
            );
            output
                .send(bucket)
                .await
                .map_err(|_| PublishError::SinkClosed)?;
            published += 1;
        }
        Ok(published)
    }

    /// Publish the current window, then the previous one
    pub async fn publish_cycle(&self, output: &mpsc::Sender<StatBucket>) -> Result<usize, PublishError> {
        let current = self.publish(WindowSlot::Current, output).await?;
        let previous = self.publish(WindowSlot::Previous, output).await?;
        debug!(
            current,
            previous,
            dropped = self.drops.total(),
            "publish cycle complete"
        );
        Ok(current + previous)
    }
}
