//! Controller configuration
//!
//! All timing policy lives here so it can be tuned from the command line
//! instead of being baked into the reconcilers.

use std::time::Duration;

use crate::retry::BackoffConfig;
use crate::Error;

/// Default full resync period
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Default delay between polls of an asynchronous broker operation
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default timeout for a single broker request
pub const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Default Open Service Broker API version sent in `X-Broker-API-Version`
pub const DEFAULT_OSB_API_VERSION: &str = "2.13";

/// Limits on how long the controller keeps retrying one broker operation
/// before giving up on it
#[derive(Clone, Debug, PartialEq)]
pub struct RetryBudget {
    /// Failed attempts after which deprovision, unbind and orphan mitigation
    /// are abandoned
    pub max_attempts: u32,
    /// Wall-clock limit for a single operation, measured from
    /// `operationStartTime`
    pub max_duration: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_duration: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Configuration shared by the dispatcher and all reconcilers
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Workers per resource kind
    pub workers: usize,
    /// Interval at which every cached key is re-enqueued
    pub resync_period: Duration,
    /// Delay between polls of an async operation
    pub poll_interval: Duration,
    /// Work-queue backoff
    pub backoff: BackoffConfig,
    /// Per-operation retry budget
    pub retry_budget: RetryBudget,
    /// Timeout for one broker request
    pub broker_timeout: Duration,
    /// OSB API version header value
    pub osb_api_version: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            resync_period: DEFAULT_RESYNC_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff: BackoffConfig::default(),
            retry_budget: RetryBudget::default(),
            broker_timeout: DEFAULT_BROKER_TIMEOUT,
            osb_api_version: DEFAULT_OSB_API_VERSION.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::validation("workers must be at least 1"));
        }
        if self.resync_period.is_zero() {
            return Err(Error::validation("resync period must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::validation("poll interval must be positive"));
        }
        if self.backoff.initial_delay > self.backoff.max_delay {
            return Err(Error::validation(
                "initial backoff must not exceed the maximum backoff",
            ));
        }
        if self.backoff.backoff_multiplier < 1.0 {
            return Err(Error::validation("backoff multiplier must be at least 1.0"));
        }
        if self.retry_budget.max_attempts == 0 {
            return Err(Error::validation("retry budget must allow at least one attempt"));
        }
        if self.osb_api_version.is_empty() {
            return Err(Error::validation("OSB API version must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_budget.max_attempts, 3);
        assert_eq!(config.osb_api_version, "2.13");
    }

    #[test]
    fn rejects_zero_workers() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let mut config = ControllerConfig::default();
        config.backoff.initial_delay = Duration::from_secs(10);
        config.backoff.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_retry_budget() {
        let mut config = ControllerConfig::default();
        config.retry_budget.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
