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
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use super::{parse_line, StatSender, StatSource};

/// Reads newline-delimited JSON stats
///
/// Blank lines are ignored. Lines that fail to parse are logged and counted,
/// never fatal.
pub struct JsonLinesSource<R> {
    name: String,
    reader: R,
    accepted: u64,
    rejected: u64,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Lines turned into stats and sent
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Lines skipped because they were not UTF-8 or did not parse
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[async_trait]
impl<R> StatSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn start(&mut self, sender: StatSender) -> Result<()> {
        let mut buf = Vec::new();
        let mut line_no = 0u64;

        loop {
            buf.clear();
            if self.reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            line_no += 1;

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(err) => {
                    self.rejected += 1;
                    warn!(source = %self.name, line = line_no, error = %err, "skipping line");
                    continue;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match parse_line(trimmed) {
                Ok(stat) => {
                    if sender.send(stat.shared()).await.is_err() {
                        debug!(source = %self.name, "stat receiver closed");
                        break;
                    }
                    self.accepted += 1;
                }
                Err(err) => {
                    self.rejected += 1;
                    warn!(source = %self.name, line = line_no, error = %err, "skipping line");
                }
            }
        }

        info!(
            source = %self.name,
            accepted = self.accepted,
            rejected = self.rejected,
            "source finished"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_reads_stats_and_skips_bad_lines() {
        let input = concat!(
            r#"{"name":"cpu","timestamp":"2024-06-01T10:00:00Z","value":1.0}"#,
            "\n",
            "\n",
            "garbage\n",
            r#"{"name":"mem","timestamp":"2024-06-01T10:00:01Z","value":2.5}"#,
            "\n",
        );
        let mut source = JsonLinesSource::new("test", input.as_bytes());
        let (tx, mut rx) = mpsc::channel(8);

        source.start(tx).await.unwrap();

        assert_eq!(source.accepted(), 2);
        assert_eq!(source.rejected(), 1);
        assert_eq!(rx.recv().await.unwrap().name, "cpu");
        let mem = rx.recv().await.unwrap();
        assert_eq!(mem.name, "mem");
        assert_eq!(mem.value, 2.5);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_skipped() {
        let mut input = Vec::new();
        input.extend_from_slice(
            br#"{"name":"cpu","timestamp":"2024-06-01T10:00:00Z","value":1.0}"#,
        );
        input.extend_from_slice(b"\n\xff\xfe garbage\n");
        input.extend_from_slice(
            br#"{"name":"mem","timestamp":"2024-06-01T10:00:01Z","value":2.0}"#,
        );
        input.push(b'\n');

        let mut source = JsonLinesSource::new("test", input.as_slice());
        let (tx, mut rx) = mpsc::channel(8);

        source.start(tx).await.unwrap();

        assert_eq!(source.accepted(), 2);
        assert_eq!(source.rejected(), 1);
        assert_eq!(rx.recv().await.unwrap().name, "cpu");
        assert_eq!(rx.recv().await.unwrap().name, "mem");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_when_receiver_closes() {
        let input = concat!(
            r#"{"name":"cpu","timestamp":"2024-06-01T10:00:00Z","value":1.0}"#,
            "\n",
            r#"{"name":"cpu","timestamp":"2024-06-01T10:00:01Z","value":2.0}"#,
            "\n",
        );
        let mut source = JsonLinesSource::new("test", input.as_bytes());
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        source.start(tx).await.unwrap();
        assert_eq!(source.accepted(), 0);
    }
}
