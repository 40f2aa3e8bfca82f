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

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Bucketer, DropCounters, PublishError, WindowSlot};
use crate::model::{SharedStat, StatBucket};

/// Counters reported by [`Bucketer::run`] when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketerStats {
    /// Stats accepted into a window
    pub inserted: u64,
    /// Buckets handed to the output channel
    pub published: u64,
    /// Completed publish cycles, including the final one
    pub publish_cycles: u64,
    /// Window rotations
    pub advances: u64,
    /// Stats refused by reason
    pub drops: DropCounters,
}

impl Bucketer {
    /// Run the bucketer until shutdown
    ///
    /// Each loop iteration handles exactly one of: an inbound stat, the
    /// shutdown signal, the publish ticker or the idle timeout. After any of
    /// them the wall clock is checked and the windows advanced if real time
    /// has entered the future window.
    ///
    /// Shutdown (or the input channel closing, or the shutdown sender being
    /// dropped) triggers one final publish of the current and previous
    /// windows, and of the future window when `flush_future_on_shutdown` is
    /// set. Stats still queued in `input` at that point are not drained.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<SharedStat>,
        output: mpsc::Sender<StatBucket>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> BucketerStats {
        let publish_interval = self.config.publish_interval;
        let idle_timeout = self.config.idle_timeout;

        let mut ticker = time::interval_at(Instant::now() + publish_interval, publish_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stats = BucketerStats::default();
        let mut done = false;

        info!(
            window_length = ?self.config.window_length,
            publish_interval = ?publish_interval,
            current_min = %self.current.min_time(),
            "bucketer started"
        );

        while !done {
            tokio::select! {
                received = input.recv() => match received {
                    Some(stat) => {
                        debug!(%stat, "bucketer got stat");
                        match self.insert(stat) {
                            Ok(_) => stats.inserted += 1,
                            Err(err) => warn!(error = %err, "bucketer dropped stat"),
                        }
                    }
                    None => {
                        info!("bucketer input closed, publishing final buckets");
                        self.final_flush(&output, &mut stats).await;
                        done = true;
                    }
                },
                _ = &mut shutdown => {
                    info!("bucketer shutting down, publishing final buckets");
                    self.final_flush(&output, &mut stats).await;
                    done = true;
                }
                _ = ticker.tick() => {
                    debug!("bucketer publish interval elapsed");
                    if let Err(err) = self.flush(&output, &mut stats, false).await {
                        error!(error = %err, "bucketer publish failed, stopping");
                        done = true;
                    }
                }
                _ = time::sleep(idle_timeout) => {
                    debug!("bucketer idle timeout");
                }
            }

            if self.advance_if_due(self.clock.now()) {
                stats.advances += 1;
            }
        }

        stats.drops = self.drops;
        info!(
            inserted = stats.inserted,
            published = stats.published,
            advances = stats.advances,
            dropped_too_old = stats.drops.too_old,
            dropped_too_future = stats.drops.too_future,
            dropped_malformed = stats.drops.malformed,
            "bucketer exiting"
        );
        stats
    }

    async fn final_flush(&self, output: &mpsc::Sender<StatBucket>, stats: &mut BucketerStats) {
        let include_future = self.config.flush_future_on_shutdown;
        if let Err(err) = self.flush(output, stats, include_future).await {
            error!(error = %err, "final publish failed");
        }
    }

    async fn flush(
        &self,
        output: &mpsc::Sender<StatBucket>,
        stats: &mut BucketerStats,
        include_future: bool,
    ) -> Result<(), PublishError> {
        stats.published += self.publish_cycle(output).await? as u64;
        if include_future {
            stats.published += self.publish(WindowSlot::Future, output).await? as u64;
        }
        stats.publish_cycles += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucketer::BucketerConfig;
    use crate::clock::ManualClock;
    use crate::model::Stat;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        clock: Arc<ManualClock>,
        input: mpsc::Sender<SharedStat>,
        output: mpsc::Receiver<StatBucket>,
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<BucketerStats>,
        previous_min: DateTime<Utc>,
        current_min: DateTime<Utc>,
        future_min: DateTime<Utc>,
    }

    fn spawn(config: BucketerConfig, output_capacity: usize) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 15, 42).unwrap(),
        ));
        let bucketer = Bucketer::new(config, clock.clone()).unwrap();
        let previous_min = bucketer.previous().min_time();
        let current_min = bucketer.current().min_time();
        let future_min = bucketer.future().min_time();

        let (input, input_rx) = mpsc::channel(64);
        let (output_tx, output) = mpsc::channel(output_capacity);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(bucketer.run(input_rx, output_tx, shutdown_rx));

        Harness {
            clock,
            input,
            output,
            shutdown,
            handle,
            previous_min,
            current_min,
            future_min,
        }
    }

    fn stat(name: &str, ts: DateTime<Utc>, value: f64) -> SharedStat {
        Stat::new(name, ts, value).shared()
    }

    // With time paused, sleeping lets the bucketer task drain everything ready.
    async fn settle() {
        time::sleep(Duration::from_millis(10)).await;
    }

    async fn collect(mut output: mpsc::Receiver<StatBucket>) -> Vec<StatBucket> {
        let mut buckets = Vec::new();
        while let Some(bucket) = output.recv().await {
            buckets.push(bucket);
        }
        buckets
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_on_interval() {
        let mut h = spawn(BucketerConfig::default(), 64);
        let ts = h.current_min + TimeDelta::seconds(1);
        h.input.send(stat("foo", ts, 1.0)).await.unwrap();
        h.input.send(stat("foo", ts, 2.0)).await.unwrap();

        let bucket = h.output.recv().await.unwrap();
        assert_eq!(bucket.name, "foo");
        assert_eq!(bucket.window_start, h.current_min);
        assert_eq!(bucket.values().collect::<Vec<_>>(), vec![1.0, 2.0]);

        h.shutdown.send(()).unwrap();
        let stats = h.handle.await.unwrap();
        assert_eq!(stats.inserted, 2);
        assert!(stats.publish_cycles >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_publishes_current_and_previous_only() {
        let h = spawn(BucketerConfig::default(), 64);
        h.input.send(stat("prev", h.previous_min, 1.0)).await.unwrap();
        h.input.send(stat("cur", h.current_min, 2.0)).await.unwrap();
        h.input.send(stat("fut", h.future_min, 3.0)).await.unwrap();
        settle().await;

        h.shutdown.send(()).unwrap();
        let stats = h.handle.await.unwrap();
        let buckets = collect(h.output).await;

        let names: Vec<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["cur", "prev"]);
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_can_flush_future_window() {
        let config = BucketerConfig {
            flush_future_on_shutdown: true,
            ..BucketerConfig::default()
        };
        let h = spawn(config, 64);
        h.input.send(stat("cur", h.current_min, 2.0)).await.unwrap();
        h.input.send(stat("fut", h.future_min, 3.0)).await.unwrap();
        settle().await;

        h.shutdown.send(()).unwrap();
        h.handle.await.unwrap();
        let buckets = collect(h.output).await;

        let names: Vec<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["cur", "fut"]);
        assert_eq!(buckets[1].window_start, h.future_min);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advances_when_wall_clock_enters_future_window() {
        let h = spawn(BucketerConfig::default(), 64);
        h.input.send(stat("foo", h.current_min, 1.0)).await.unwrap();
        settle().await;

        h.clock.set(h.future_min + TimeDelta::seconds(1));
        // The idle timeout wakes the loop, which then notices the new minute.
        time::sleep(Duration::from_millis(1500)).await;

        // Stats for the old previous window are now too old.
        h.input.send(stat("late", h.previous_min, 1.0)).await.unwrap();
        settle().await;

        h.shutdown.send(()).unwrap();
        let stats = h.handle.await.unwrap();
        let buckets = collect(h.output).await;

        assert_eq!(stats.advances, 1);
        assert_eq!(stats.drops.too_old, 1);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "foo");
        assert_eq!(buckets[0].window_start, h.current_min);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_are_counted_not_fatal() {
        let h = spawn(BucketerConfig::default(), 64);
        h.input
            .send(stat("old", h.previous_min - TimeDelta::seconds(1), 1.0))
            .await
            .unwrap();
        h.input
            .send(stat("new", h.future_min + TimeDelta::minutes(1), 1.0))
            .await
            .unwrap();
        h.input.send(stat("", h.current_min, 1.0)).await.unwrap();
        h.input.send(stat("ok", h.current_min, 1.0)).await.unwrap();
        settle().await;

        h.shutdown.send(()).unwrap();
        let stats = h.handle.await.unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(
            stats.drops,
            DropCounters {
                malformed: 1,
                too_old: 1,
                too_future: 1,
            }
        );
        assert_eq!(collect(h.output).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_close_triggers_final_publish() {
        let h = spawn(BucketerConfig::default(), 64);
        h.input.send(stat("foo", h.current_min, 1.0)).await.unwrap();
        drop(h.input);

        let stats = h.handle.await.unwrap();
        let buckets = collect(h.output).await;

        assert_eq!(stats.publish_cycles, 1);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].name, "foo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_stalls_without_losing_buckets() {
        let mut h = spawn(BucketerConfig::default(), 1);
        for name in ["a", "b", "c"] {
            h.input.send(stat(name, h.current_min, 1.0)).await.unwrap();
        }
        settle().await;

        // Let the ticker fire; the bucketer blocks after filling the channel.
        time::sleep(Duration::from_secs(6)).await;

        let mut names = HashSet::new();
        for _ in 0..3 {
            let bucket = h.output.recv().await.unwrap();
            names.insert(bucket.name);
        }
        assert_eq!(
            names,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );

        h.shutdown.send(()).unwrap();
        let drain = tokio::spawn(collect(h.output));
        let stats = h.handle.await.unwrap();
        drain.await.unwrap();
        assert!(stats.published >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_output_stops_the_loop() {
        let h = spawn(BucketerConfig::default(), 4);
        drop(h.output);
        h.input.send(stat("foo", h.current_min, 1.0)).await.unwrap();

        let stats = h.handle.await.unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.publish_cycles, 0);
    }
}
