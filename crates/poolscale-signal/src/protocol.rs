//! Wire protocol between the engine and a signal worker.
//!
//! One JSON document per line over the worker's private Unix socket:
//!
//! ```text
//! engine -> worker   {"cluster":"..","pool":"..","app":"..","parameters":{..}}
//! worker -> engine   {"ack":true}
//! engine -> worker   {"metrics":{"cpus_allocated":[[1700000000,12.0],...]}}
//! worker -> engine   {"Resources":{"cpus":40.0,"mem":null}}
//! ```
//!
//! A `Resources` value that is null, empty, or all-null means the signal
//! declined to answer this cycle.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use poolscale_core::{MetricsByName, SignalResourceRequest};

/// Environment variable carrying the socket path to the worker.
pub const SOCKET_ENV: &str = "POOLSCALE_SIGNAL_SOCKET";

/// Sent once, right after the worker connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    pub cluster: String,
    pub pool: String,
    pub app: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitAck {
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub metrics: MetricsByName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateResponse {
    // Required key: a bare `Option` would silently accept its absence.
    #[serde(rename = "Resources", deserialize_with = "Option::deserialize")]
    pub resources: Option<SignalResourceRequest>,
}

impl EvaluateResponse {
    /// The request carried by this response, `None` when the signal declined.
    pub fn into_request(self) -> Option<SignalResourceRequest> {
        self.resources.filter(|r| !r.is_empty())
    }
}

/// Serialize a message as a single newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    // serde_json never emits raw newlines in compact form.
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}
