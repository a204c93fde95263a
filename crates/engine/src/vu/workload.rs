//! Workload contract

use std::future::Future;

use async_trait::async_trait;

use super::{Reporter, VirtualUserId};
use crate::metrics::Outcome;

/// Error returned by workload code
///
/// Never fatal to the run: an iteration error becomes a failure sample, an
/// `init_vu` error retires that one virtual user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadError {
    /// Error message
    pub message: String,

    /// Error category, used as the `error` tag on failure samples
    pub kind: Option<String>,
}

impl WorkloadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    /// Set the error category
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Category, `"workload"` when none was given
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("workload")
    }
}

impl std::fmt::Display for WorkloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkloadError {}

impl From<anyhow::Error> for WorkloadError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

/// User-supplied scenario driven by the engine
///
/// One `iteration` call is one pass through the scenario (for example: log
/// in, then buy an item). Each virtual user owns its own `VuState`.
///
/// # Example
///
/// ```ignore
/// use surge_engine::prelude::*;
///
/// struct BuyItem { client: reqwest::Client }
///
/// #[async_trait]
/// impl Workload for BuyItem {
///     type VuState = String;
///
///     async fn init_vu(&self, vu: VirtualUserId) -> Result<String, WorkloadError> {
///         Ok(format!("user_{}", vu))
///     }
///
///     async fn iteration(
///         &self,
///         _vu: VirtualUserId,
///         username: &mut String,
///         reporter: &Reporter,
///     ) -> Result<Outcome, WorkloadError> {
///         let started = std::time::Instant::now();
///         let ok = buy(&self.client, username).await?;
///         reporter.report_duration("http_req_duration", started.elapsed(), Outcome::from_success(ok));
///         Ok(Outcome::from_success(reporter.check("status is 200", ok)))
///     }
/// }
/// ```
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Per-virtual-user context, created once by `init_vu`
    type VuState: Send + 'static;

    /// Custom metric names this workload reports
    ///
    /// Thresholds may only reference these and the built-in metrics.
    fn metrics(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once before any virtual user starts
    async fn setup(&self) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Build the context for one virtual user
    async fn init_vu(&self, vu: VirtualUserId) -> Result<Self::VuState, WorkloadError>;

    /// Run one iteration
    async fn iteration(
        &self,
        vu: VirtualUserId,
        state: &mut Self::VuState,
        reporter: &Reporter,
    ) -> Result<Outcome, WorkloadError>;

    /// Called once after every virtual user has stopped
    async fn teardown(&self) -> Result<(), WorkloadError> {
        Ok(())
    }
}

/// Workload built from a closure, see [`workload_fn`]
pub struct FnWorkload<F> {
    handler: F,
    metrics: Vec<String>,
}

impl<F> FnWorkload<F> {
    /// Declare the custom metrics the closure reports
    pub fn with_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }
}

/// Adapt a closure into a stateless [`Workload`]
///
/// ```
/// use surge_engine::metrics::Outcome;
/// use surge_engine::vu::workload_fn;
///
/// let workload = workload_fn(|_vu, reporter| async move {
///     reporter.report("login_duration", 12.5, Outcome::Success, Default::default());
///     Ok(Outcome::Success)
/// })
/// .with_metrics(["login_duration"]);
/// # let _ = workload;
/// ```
pub fn workload_fn<F, Fut>(handler: F) -> FnWorkload<F>
where
    F: Fn(VirtualUserId, Reporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, WorkloadError>> + Send + 'static,
{
    FnWorkload {
        handler,
        metrics: Vec::new(),
    }
}

#[async_trait]
impl<F, Fut> Workload for FnWorkload<F>
where
    F: Fn(VirtualUserId, Reporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, WorkloadError>> + Send + 'static,
{
    type VuState = ();

    fn metrics(&self) -> Vec<String> {
        self.metrics.clone()
    }

    async fn init_vu(&self, _vu: VirtualUserId) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn iteration(
        &self,
        vu: VirtualUserId,
        _state: &mut (),
        reporter: &Reporter,
    ) -> Result<Outcome, WorkloadError> {
        (self.handler)(vu, reporter.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Aggregator;
    use std::sync::Arc;

    #[test]
    fn test_error_kind_defaults_to_workload() {
        let err = WorkloadError::new("boom");
        assert_eq!(err.kind(), "workload");
        assert_eq!(err.with_kind("http").kind(), "http");
    }

    #[test]
    fn test_error_from_anyhow_keeps_context() {
        let err: WorkloadError = anyhow::anyhow!("connection refused")
            .context("login failed")
            .into();
        assert_eq!(err.to_string(), "login failed: connection refused");
    }

    #[tokio::test]
    async fn test_fn_workload_forwards_vu_and_reporter() {
        let aggregator = Arc::new(Aggregator::default());
        let workload = workload_fn(|vu, reporter| async move {
            reporter.report("seen_vu", vu as f64, Outcome::Success, Default::default());
            Ok(Outcome::Success)
        })
        .with_metrics(["seen_vu"]);

        assert_eq!(workload.metrics(), vec!["seen_vu".to_string()]);

        let reporter = Reporter::new(Arc::clone(&aggregator), 7);
        let outcome = workload.iteration(7, &mut (), &reporter).await.unwrap();
        assert_eq!(outcome, Outcome::Success);

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.get("seen_vu").unwrap().max, 7.0);
    }
}
