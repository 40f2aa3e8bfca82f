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

//! Stat sources for ingesting data
//!
//! Sources read stats from external systems, validate them and push them into
//! the pipeline's inbound channel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::sync::mpsc;

use crate::model::{SharedStat, Stat};

pub mod json_lines;

pub use json_lines::JsonLinesSource;

/// Trait for all stat sources
#[async_trait]
pub trait StatSource: Send {
    /// Read stats and send them until the input is exhausted or the
    /// receiving side hangs up
    async fn start(&mut self, sender: StatSender) -> Result<()>;

    /// Get the name of this source
    fn name(&self) -> &str;
}

/// Channel for sending stats from sources to the pipeline
pub type StatSender = mpsc::Sender<SharedStat>;

/// Channel for receiving stats in the pipeline
pub type StatReceiver = mpsc::Receiver<SharedStat>;

/// Reasons a line of input does not yield a stat
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid stat json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid stat: {0}")]
    Invalid(&'static str),
}

/// Parse one JSON encoded stat, rejecting ones the bucketer would refuse
pub fn parse_line(line: &str) -> Result<Stat, SourceError> {
    let stat: Stat = serde_json::from_str(line)?;
    match stat.validate() {
        Some(reason) => Err(SourceError::Invalid(reason)),
        None => Ok(stat),
    }
}

/// Open the configured input: `"stdin"` or a path to a file of JSON lines
pub async fn open(input: &str) -> Result<Box<dyn StatSource>> {
    if input == "stdin" {
        let reader = BufReader::new(tokio::io::stdin());
        return Ok(Box::new(JsonLinesSource::new("stdin", reader)));
    }

    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open input: {}", input))?;
    Ok(Box::new(JsonLinesSource::new(input, BufReader::new(file))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let stat = parse_line(r#"{"name":"cpu","timestamp":"2024-06-01T10:00:30Z","value":0.5}"#)
            .unwrap();
        assert_eq!(stat.name, "cpu");
        assert_eq!(stat.value, 0.5);
        assert_eq!(stat.timestamp.to_rfc3339(), "2024-06-01T10:00:30+00:00");
    }

    #[test]
    fn test_parse_line_rejects_bad_input() {
        assert!(matches!(parse_line("not json"), Err(SourceError::Json(_))));
        assert!(matches!(
            parse_line(r#"{"name":"cpu","value":1.0}"#),
            Err(SourceError::Json(_))
        ));
        assert!(matches!(
            parse_line(r#"{"name":"","timestamp":"2024-06-01T10:00:30Z","value":1.0}"#),
            Err(SourceError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let err = open("/definitely/not/here.jsonl").await.err().unwrap();
        assert!(err.to_string().contains("Failed to open input"));
    }
}
