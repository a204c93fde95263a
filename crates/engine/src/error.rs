//! Engine error types
//!
//! Per-iteration failures never show up here: they are contained by the
//! executor and recorded as failure samples. Only problems that stop a run
//! from starting (or from finishing cleanly) are errors.

use crate::threshold::ThresholdParseError;
use crate::vu::WorkloadError;

/// Configuration problems detected while a run is initializing
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Malformed ramp profile
    #[error("invalid ramp profile: {0}")]
    InvalidProfile(String),

    /// The profile asks for more virtual users than allowed
    #[error("ramp profile requires {requested} virtual users, cap is {cap}")]
    ConcurrencyCapExceeded { requested: u32, cap: u32 },

    /// A threshold expression could not be parsed
    #[error("invalid threshold '{expression}' on metric '{metric}': {source}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        #[source]
        source: ThresholdParseError,
    },

    /// A threshold references a metric nobody reports
    #[error("threshold references unknown metric '{0}'")]
    UnknownMetric(String),

    /// Invalid pacing policy
    #[error("invalid pacing policy: {0}")]
    InvalidPacing(String),

    /// Invalid aggregator settings
    #[error("invalid aggregator configuration: {0}")]
    InvalidAggregator(String),

    /// Zero or otherwise unusable interval
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}

/// Errors that end a run without a verdict
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Configuration rejected during initialization
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `Workload::setup` failed
    #[error("workload setup failed: {0}")]
    Setup(#[source] WorkloadError),

    /// A controller task ended abnormally
    #[error("controller task failed: {0}")]
    TaskFailed(String),
}

impl RunError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 104,
            Self::Setup(_) => 107,
            Self::TaskFailed(_) => 103,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config = RunError::from(ConfigError::UnknownMetric("x".into()));
        assert_eq!(config.exit_code(), 104);

        let setup = RunError::Setup(WorkloadError::new("db unreachable"));
        assert_eq!(setup.exit_code(), 107);
        assert_eq!(setup.to_string(), "workload setup failed: db unreachable");
    }

    #[test]
    fn test_cap_message() {
        let err = ConfigError::ConcurrencyCapExceeded {
            requested: 2000,
            cap: 1000,
        };
        assert_eq!(
            err.to_string(),
            "ramp profile requires 2000 virtual users, cap is 1000"
        );
    }
}
