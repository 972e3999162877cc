//! poolscale-controller: the autoscaling control loop.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────── PoolContext (one per pool) ────────────┐
//!  runner ──►│ tick lock │ settings │ app/default SignalSource │ adapter │
//!            │ group book (last applied / last known, copy-on-read)  │
//!            └─────┬──────────────────────────────────────────────┘
//!                  ▼
//!  run_once: paused? ─► read groups (retry, timeout) ─► capacity loss ─► signal (app, else default)
//!            ─► decide ─► balance ─► modify targets ─► select ─► drain / terminate
//!            ─► record fulfilled capacity history
//! ```
//!
//! Background ticks route failures through a [`Notifier`]: application
//! owners hear about their own signal, the service owner is paged for the
//! default signal and for the loop itself, throttling is silent.

pub mod context;
pub mod controller;
pub mod error;
pub mod notify;
pub mod retry;
pub mod runner;
pub mod source;

pub use context::{GroupBook, PoolContext, PoolSettings, TickState};
pub use controller::{
    Controller, ControllerBuilder, EvictionReport, PoolStatus, RunMode, SignalOrigin, TickReport,
};
pub use error::{ControllerError, ControllerResult};
pub use notify::{
    AppNotice, Notification, Notifier, RecordingNotifier, ServicePage, TracingNotifier,
};
pub use retry::RetryPolicy;
pub use runner::run;
pub use source::{SignalFactory, SignalFuture, SignalSource, SlotFactory};
