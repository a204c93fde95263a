//! Sample reporting handle given to workloads

use std::sync::Arc;
use std::time::Duration;

use super::VirtualUserId;
use crate::metrics::{Aggregator, Outcome, Sample, Tags, CHECKS};

/// Capability to push samples into the run's aggregator
///
/// Cheap to clone. All samples from one virtual user land on the same
/// aggregator shard. Rejected samples are counted as lost by the aggregator
/// and never surface as errors here.
#[derive(Clone)]
pub struct Reporter {
    aggregator: Arc<Aggregator>,
    vu: VirtualUserId,
}

impl Reporter {
    pub fn new(aggregator: Arc<Aggregator>, vu: VirtualUserId) -> Self {
        Self { aggregator, vu }
    }

    /// Virtual user this reporter belongs to
    pub fn vu(&self) -> VirtualUserId {
        self.vu
    }

    /// Report a raw value
    pub fn report(&self, metric: impl Into<String>, value: f64, outcome: Outcome, tags: Tags) {
        self.report_sample(Sample::new(metric, value, outcome).with_tags(tags));
    }

    /// Report a duration in milliseconds
    pub fn report_duration(&self, metric: impl Into<String>, elapsed: Duration, outcome: Outcome) {
        self.report_sample(Sample::new(metric, elapsed.as_secs_f64() * 1000.0, outcome));
    }

    /// Record a named check into the `checks` metric and return `passed`
    pub fn check(&self, name: &str, passed: bool) -> bool {
        let value = if passed { 1.0 } else { 0.0 };
        self.report_sample(
            Sample::new(CHECKS, value, Outcome::from_success(passed)).with_tag("check", name),
        );
        passed
    }

    /// Report a pre-built sample
    pub fn report_sample(&self, sample: Sample) {
        let _ = self.aggregator.ingest_on(self.shard_hint(), sample);
    }

    fn shard_hint(&self) -> usize {
        self.vu as usize
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").field("vu", &self.vu).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_records_pass_and_fail() {
        let aggregator = Arc::new(Aggregator::default());
        let reporter = Reporter::new(Arc::clone(&aggregator), 1);

        assert!(reporter.check("status is 200", true));
        assert!(!reporter.check("status is 200", false));
        assert!(reporter.check("body has token", true));

        let snapshot = aggregator.snapshot();
        let checks = snapshot.get(CHECKS).unwrap();
        assert_eq!(checks.count, 3);
        assert_eq!(checks.failure_count, 1);
    }

    #[test]
    fn test_report_duration_uses_millis() {
        let aggregator = Arc::new(Aggregator::default());
        let reporter = Reporter::new(Arc::clone(&aggregator), 3);

        reporter.report_duration("http_req_duration", Duration::from_micros(1500), Outcome::Success);

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.get("http_req_duration").unwrap().max, 1.5);
    }

    #[test]
    fn test_rejected_samples_do_not_panic() {
        let aggregator = Arc::new(Aggregator::default());
        let reporter = Reporter::new(Arc::clone(&aggregator), 2);

        reporter.report("m", f64::NAN, Outcome::Success, Tags::new());
        assert_eq!(aggregator.lost_samples(), 1);
    }
}
