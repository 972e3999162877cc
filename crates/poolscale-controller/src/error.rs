//! Controller error types.

use thiserror::Error;

use poolscale_core::ConfigError;
use poolscale_pool::PoolError;
use poolscale_signal::SignalError;
use poolscale_state::StateError;

use crate::notify::ServicePage;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl ControllerError {
    /// Provider throttling. Retried on the next tick without paging anyone.
    pub fn is_throttled(&self) -> bool {
        matches!(self, ControllerError::Pool(e) if e.is_throttled())
    }

    /// Page kind for a failed background tick. Application signal failures
    /// never surface here, so a signal error comes from the default signal.
    pub fn service_page(&self) -> ServicePage {
        match self {
            ControllerError::Signal(e) if e.is_configuration_failure() => {
                ServicePage::DefaultSignalConfigurationFailed
            }
            ControllerError::Signal(_) => ServicePage::DefaultSignalEvaluationFailed,
            _ => ServicePage::ControlLoopFailed,
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
