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

//! # statbucketd
//!
//! A small stats pipeline: timestamped samples are sorted into fixed-length
//! time windows, the windows are published periodically, and each published
//! bucket is reduced to a `{count, average, min, max}` summary and rolled up
//! into coarser periods before reaching the sinks. Raw samples are kept in a
//! queryable repository alongside.
//!
//! ## Example
//!
//! ```rust,no_run
//! use statbucketd::{config::DaemonConfig, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DaemonConfig::from_file("statbucketd.json")?;
//!     let mut daemon = Daemon::new(config).await?;
//!     daemon.start().await?;
//!     daemon.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod aggregation;
pub mod bucketer;
pub mod clock;
pub mod config;
pub mod model;
pub mod repo;
pub mod sinks;
pub mod sources;

use aggregation::AggregationEngine;
use bucketer::{Bucketer, BucketerStats};
use clock::{Clock, SystemClock};
use config::DaemonConfig;
use repo::InMemoryStatRepository;
use sinks::{LogSink, StatsSink};
use sources::{StatReceiver, StatSender, StatSource};

/// Counters reported once the daemon has stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    /// Stats forwarded from the source into the pipeline
    pub received: u64,

    /// What the bucketer did with them
    pub bucketer: BucketerStats,

    /// Aggregates handed to the sinks
    pub delivered: u64,
}

struct Tasks {
    source: JoinHandle<Result<()>>,
    fan_out: JoinHandle<u64>,
    bucketer: JoinHandle<BucketerStats>,
    bucketer_shutdown: oneshot::Sender<()>,
    repository: Option<JoinHandle<Result<()>>>,
    engine: JoinHandle<Result<()>>,
    sinks: JoinHandle<u64>,
}

/// Main daemon instance
pub struct Daemon {
    config: DaemonConfig,
    clock: Arc<dyn Clock>,
    repository: Arc<InMemoryStatRepository>,
    sinks: Vec<Box<dyn StatsSink>>,
    shutdown_notify: Arc<Notify>,
    tasks: Option<Tasks>,
}

impl Daemon {
    /// Create a new daemon with the given configuration
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            repository: Arc::new(InMemoryStatRepository::new()),
            sinks: Vec::new(),
            shutdown_notify: Arc::new(Notify::new()),
            tasks: None,
        })
    }

    /// Use `clock` instead of the system clock for window placement
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a sink; a [`LogSink`] is used when none are added
    pub fn add_sink(&mut self, sink: Box<dyn StatsSink>) {
        self.sinks.push(sink);
    }

    /// Raw stat repository, shared with the running pipeline
    pub fn repository(&self) -> Arc<InMemoryStatRepository> {
        Arc::clone(&self.repository)
    }

    /// Notifying this handle stops the daemon
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown_notify)
    }

    /// Open the configured input, install signal handlers and start the
    /// pipeline
    pub async fn start(&mut self) -> Result<()> {
        info!(input = %self.config.input, "Starting statbucketd services");
        let source = sources::open(&self.config.input).await?;
        self.setup_signal_handlers();
        self.start_with_source(source).await?;
        info!("All services started successfully");
        Ok(())
    }

    /// Start the pipeline reading from `source`
    pub async fn start_with_source(&mut self, mut source: Box<dyn StatSource>) -> Result<()> {
        if self.tasks.is_some() {
            return Err(anyhow!("daemon already started"));
        }

        let config = &self.config;
        let (source_tx, source_rx) = mpsc::channel(config.input_channel_capacity);
        let (input_tx, input_rx) = mpsc::channel(config.input_channel_capacity);
        let (bucket_tx, bucket_rx) = mpsc::channel(config.bucket_channel_capacity);
        let (aggregate_tx, aggregate_rx) = mpsc::channel(config.bucket_channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let bucketer = Bucketer::new(config.bucketer_config(), Arc::clone(&self.clock))
            .context("Failed to create bucketer")?;
        let engine = AggregationEngine::new(
            config.window_length,
            &config.rollup_periods,
            aggregate_tx,
        )
        .context("Failed to create aggregation engine")?;

        let repository = if config.retain_raw_stats {
            let (repo_tx, repo_rx) = mpsc::channel(config.input_channel_capacity);
            let task = tokio::spawn(repo::run_repository(
                Arc::clone(&self.repository),
                repo_rx,
                Arc::clone(&self.clock),
                config.repo_retention,
            ));
            Some((repo_tx, task))
        } else {
            None
        };
        let (repo_tx, repository) = match repository {
            Some((tx, task)) => (Some(tx), Some(task)),
            None => (None, None),
        };

        let mut sinks = std::mem::take(&mut self.sinks);
        if sinks.is_empty() {
            sinks.push(Box::new(LogSink::default()));
        }

        info!(source = source.name(), sinks = sinks.len(), "starting pipeline");
        self.tasks = Some(Tasks {
            source: tokio::spawn(async move { source.start(source_tx).await }),
            fan_out: tokio::spawn(fan_out(source_rx, input_tx, repo_tx)),
            bucketer: tokio::spawn(bucketer.run(input_rx, bucket_tx, shutdown_rx)),
            bucketer_shutdown: shutdown_tx,
            repository,
            engine: tokio::spawn(engine.run(bucket_rx)),
            sinks: tokio::spawn(sinks::run_sinks(sinks, aggregate_rx)),
        });
        Ok(())
    }

    /// Wait until shutdown is requested or the input runs dry, then stop
    /// every stage in order
    ///
    /// The bucketer publishes its final buckets before the aggregation engine
    /// and sinks are drained, so nothing it held is lost.
    pub async fn wait_for_shutdown(mut self) -> Result<DaemonStats> {
        let Some(tasks) = self.tasks.take() else {
            return Err(anyhow!("daemon not started"));
        };
        let Tasks {
            source,
            fan_out,
            mut bucketer,
            bucketer_shutdown,
            repository,
            engine,
            sinks,
        } = tasks;

        let finished = tokio::select! {
            _ = self.shutdown_notify.notified() => {
                info!("Shutdown signal received, stopping services...");
                None
            }
            result = &mut bucketer => {
                info!("Input exhausted, stopping services...");
                Some(result)
            }
        };

        source.abort();
        let bucketer_stats = match finished {
            Some(result) => result,
            None => {
                // The bucketer may already be gone if its input closed first.
                let _ = bucketer_shutdown.send(());
                bucketer.await
            }
        }
        .context("bucketer task failed")?;

        let received = fan_out.await.context("fan-out task failed")?;
        engine.await.context("aggregation task failed")??;
        let delivered = sinks.await.context("sink task failed")?;
        if let Some(repository) = repository {
            repository.await.context("repository task failed")??;
        }

        match source.await {
            Ok(Err(err)) => warn!(error = %err, "source failed"),
            Err(err) if !err.is_cancelled() => warn!(error = %err, "source task failed"),
            _ => {}
        }

        info!(received, delivered, "Shutdown complete");
        Ok(DaemonStats {
            received,
            bucketer: bucketer_stats,
            delivered,
        })
    }

    fn setup_signal_handlers(&self) {
        let shutdown_notify = Arc::clone(&self.shutdown_notify);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_notify.notify_one();
                }
                Err(err) => {
                    warn!("Failed to listen for SIGINT: {}", err);
                }
            }
        });

        #[cfg(unix)]
        {
            let shutdown_notify = Arc::clone(&self.shutdown_notify);
            tokio::spawn(async move {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        info!("Received SIGTERM, initiating shutdown");
                        shutdown_notify.notify_one();
                    }
                    Err(err) => warn!("Failed to register SIGTERM handler: {}", err),
                }
            });
        }
    }
}

/// Copy every stat from the source to the bucketer and, when retained, to
/// the repository
async fn fan_out(
    mut stats: StatReceiver,
    bucketer: StatSender,
    mut repository: Option<StatSender>,
) -> u64 {
    let mut received = 0u64;
    while let Some(stat) = stats.recv().await {
        received += 1;
        if let Some(repo) = &repository {
            if repo.send(Arc::clone(&stat)).await.is_err() {
                warn!("stat repository stopped, no longer retaining raw stats");
                repository = None;
            }
        }
        if bucketer.send(stat).await.is_err() {
            debug!("bucketer stopped, ending fan-out");
            break;
        }
    }
    received
}
