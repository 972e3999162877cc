//! Routing of failures to the people who can fix them.
//!
//! Application owners hear about their own signal. The service owner is
//! paged only for the default signal and for the control loop itself.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// What an application owner is being told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppNotice {
    /// The signal ran but produced no usable answer.
    SignalEvaluationFailed,
    /// The signal could not be fetched, started, or initialized.
    SignalConfigurationFailed,
}

impl AppNotice {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppNotice::SignalEvaluationFailed => "signal_evaluation_failed",
            AppNotice::SignalConfigurationFailed => "signal_configuration_failed",
        }
    }
}

impl fmt::Display for AppNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the service owner is being paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePage {
    /// The default signal could not be loaded or initialized.
    DefaultSignalConfigurationFailed,
    /// The default signal ran but produced no usable answer.
    DefaultSignalEvaluationFailed,
    /// Anything else that stopped a tick.
    ControlLoopFailed,
}

impl ServicePage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServicePage::DefaultSignalConfigurationFailed => "default_signal_configuration_failed",
            ServicePage::DefaultSignalEvaluationFailed => "default_signal_evaluation_failed",
            ServicePage::ControlLoopFailed => "control_loop_failed",
        }
    }
}

impl fmt::Display for ServicePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Notifier: Send + Sync {
    fn notify_app_owner(&self, pool: &str, app: &str, notice: AppNotice, message: &str);

    fn page_service_owner(&self, pool: &str, page: ServicePage, message: &str);
}

/// Emits notifications as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_app_owner(&self, pool: &str, app: &str, notice: AppNotice, message: &str) {
        warn!(target: "notify", pool, app, %notice, message, "application owner notified");
    }

    fn page_service_owner(&self, pool: &str, page: ServicePage, message: &str) {
        error!(target: "notify", pool, %page, message, "service owner paged");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    App {
        pool: String,
        app: String,
        notice: AppNotice,
        message: String,
    },
    Page {
        pool: String,
        page: ServicePage,
        message: String,
    },
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn app_notices(&self) -> Vec<(String, AppNotice)> {
        self.all()
            .into_iter()
            .filter_map(|n| match n {
                Notification::App { pool, notice, .. } => Some((pool, notice)),
                Notification::Page { .. } => None,
            })
            .collect()
    }

    pub fn pages(&self) -> Vec<(String, ServicePage)> {
        self.all()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Page { pool, page, .. } => Some((pool, page)),
                Notification::App { .. } => None,
            })
            .collect()
    }

    fn push(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify_app_owner(&self, pool: &str, app: &str, notice: AppNotice, message: &str) {
        self.push(Notification::App {
            pool: pool.to_string(),
            app: app.to_string(),
            notice,
            message: message.to_string(),
        });
    }

    fn page_service_owner(&self, pool: &str, page: ServicePage, message: &str) {
        self.push(Notification::Page {
            pool: pool.to_string(),
            page,
            message: message.to_string(),
        });
    }
}
