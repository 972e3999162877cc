//! poolscale-signal: the signal evaluation engine.
//!
//! Runs versioned, application-owned scaling logic in isolated worker
//! processes and asks it, once per tick, how many resources a pool needs.
//!
//! # Architecture
//!
//! ```text
//! SignalConfig ──► ArchiveFetcher ──► {cache}/{name}-{sha256}/signal.toml
//!                                              │
//!                                              ▼ spawn (kill_on_drop)
//!   SignalSlot ──► SignalHandle ◄── unix socket in a 0700 tempdir ──► worker
//!      │  generation            init {"cluster","pool","app","parameters"}
//!      │                        ack  {"ack":true}
//!      ▼                        eval {"metrics":{..}} ─► {"Resources":{..}}
//!   Option<SignalResourceRequest>
//! ```
//!
//! Worker stdout/stderr is forwarded to tracing under the `signal` target.
//! A worker that times out, crashes, or sends garbage is killed and its
//! handle marked dead; the owning slot starts a fresh one on next use.

pub mod archive;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod slot;
pub mod worker;

pub use archive::{ArchiveFetcher, DirectoryFetcher, LocalArchiveFetcher, SignalManifest, MANIFEST_FILE};
pub use engine::{collect_metrics, SignalEngine};
pub use error::{EvaluationCause, SignalError, SignalResult};
pub use slot::SignalSlot;
pub use worker::{SignalHandle, WorkerTimeouts};
