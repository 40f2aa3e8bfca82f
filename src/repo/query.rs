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

//! Raw stat query requests
//!
//! Requests arrive as a request type plus a JSON message, e.g.
//! `rawStatsReq` with `{"tracker":"t","name":"cpu","startDate":0,"endDate":60}`.
//! Answers are JSON arrays of `{"ts": <unix secs>, "value": <f64>}` sent back
//! under the matching `...Res` type.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::StatRepository;
use crate::model::SharedStat;

pub const RAW_STATS_REQ: &str = "rawStatsReq";
pub const LAST_N_RAW_STATS_REQ: &str = "lastNRawStatsReq";

/// Stats of one name between two unix timestamps, both inclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStatsRequest {
    pub tracker: String,
    pub name: String,
    pub start_date: i64,
    pub end_date: i64,
}

/// The newest `last` stats of one name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastNRawStatsRequest {
    pub tracker: String,
    pub name: String,
    pub last: usize,
}

/// One stat as rendered in a query answer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawStat {
    pub ts: i64,
    pub value: f64,
}

impl From<&SharedStat> for RawStat {
    fn from(stat: &SharedStat) -> Self {
        Self {
            ts: stat.timestamp.timestamp(),
            value: stat.value,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown request type: {0}")]
    UnknownType(String),

    #[error("invalid {req_type} request: {source}")]
    Json {
        req_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unix timestamp out of range: {0}")]
    Timestamp(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRequest {
    RawStats(RawStatsRequest),
    LastNRawStats(LastNRawStatsRequest),
}

impl QueryRequest {
    /// Decode `msg` according to `req_type`
    pub fn parse(req_type: &str, msg: &str) -> Result<Self, QueryError> {
        match req_type {
            RAW_STATS_REQ => serde_json::from_str(msg)
                .map(QueryRequest::RawStats)
                .map_err(|source| QueryError::Json {
                    req_type: RAW_STATS_REQ,
                    source,
                }),
            LAST_N_RAW_STATS_REQ => serde_json::from_str(msg)
                .map(QueryRequest::LastNRawStats)
                .map_err(|source| QueryError::Json {
                    req_type: LAST_N_RAW_STATS_REQ,
                    source,
                }),
            other => Err(QueryError::UnknownType(other.to_string())),
        }
    }

    pub fn req_type(&self) -> &'static str {
        match self {
            QueryRequest::RawStats(_) => RAW_STATS_REQ,
            QueryRequest::LastNRawStats(_) => LAST_N_RAW_STATS_REQ,
        }
    }

    /// Type the answer is sent under: `rawStatsReq` becomes `rawStatsRes`
    pub fn response_type(&self) -> String {
        let req_type = self.req_type();
        format!("{}Res", req_type.strip_suffix("Req").unwrap_or(req_type))
    }

    /// Answer the request from `repository`
    pub fn run(&self, repository: &dyn StatRepository) -> Result<Vec<RawStat>> {
        debug!(request = ?self, "running raw stat query");
        let stats = match self {
            QueryRequest::RawStats(request) => repository.raw_stats(
                &request.name,
                from_unix(request.start_date)?,
                from_unix(request.end_date)?,
            )?,
            QueryRequest::LastNRawStats(request) => {
                repository.last_n_raw_stats(&request.name, request.last)?
            }
        };
        Ok(stats.iter().map(RawStat::from).collect())
    }
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>, QueryError> {
    DateTime::from_timestamp(secs, 0).ok_or(QueryError::Timestamp(secs))
}

/// Render query results as a JSON array
pub fn to_json(stats: &[RawStat]) -> Result<String> {
    Ok(serde_json::to_string(stats)?)
}
