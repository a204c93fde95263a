//! End-to-end run lifecycle tests
//!
//! All tests run on paused tokio time, so multi-second profiles finish
//! instantly and deterministically. Workloads always await a timer so the
//! clock can auto-advance.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use surge_engine::metrics::ITERATION_DURATION;
use surge_engine::prelude::*;
use surge_engine::threshold::ThresholdState;
use tokio_test::assert_err;

/// Scenario with per-VU state and lifecycle counters
struct LoginScenario {
    latency: Duration,
    setups: AtomicUsize,
    teardowns: Arc<AtomicUsize>,
    fail_setup: bool,
}

impl LoginScenario {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            setups: AtomicUsize::new(0),
            teardowns: Arc::new(AtomicUsize::new(0)),
            fail_setup: false,
        }
    }
}

#[async_trait]
impl Workload for LoginScenario {
    type VuState = String;

    fn metrics(&self) -> Vec<String> {
        vec!["http_req_duration".to_string()]
    }

    async fn setup(&self) -> Result<(), WorkloadError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(WorkloadError::new("database unreachable"));
        }
        Ok(())
    }

    async fn init_vu(&self, vu: VirtualUserId) -> Result<String, WorkloadError> {
        Ok(format!("user_{}", vu))
    }

    async fn iteration(
        &self,
        _vu: VirtualUserId,
        username: &mut String,
        reporter: &Reporter,
    ) -> Result<Outcome, WorkloadError> {
        assert!(username.starts_with("user_"));
        tokio::time::sleep(self.latency).await;
        reporter.report_duration("http_req_duration", self.latency, Outcome::Success);
        reporter.check("status is 200", true);
        Ok(Outcome::Success)
    }

    async fn teardown(&self) -> Result<(), WorkloadError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ramp_config() -> RunConfig {
    RunConfig::new("login")
        .with_stage(Duration::from_secs(1), 10)
        .with_stage(Duration::from_secs(2), 10)
        .with_stage(Duration::from_secs(1), 0)
        .with_pacing(PacingPolicy::fixed(Duration::from_millis(100)))
        .with_evaluation_interval(Duration::from_millis(250))
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_ramp_run_completes_with_counts() {
    let config = ramp_config()
        .with_threshold("http_req_duration", "p(95)<100")
        .with_threshold("checks", "rate<0.0001");
    let workload = LoginScenario::new(Duration::from_millis(50));
    let teardowns = Arc::clone(&workload.teardowns);

    let controller = RunController::new(config, workload);
    let mut state_rx = controller.subscribe();
    let summary = controller.run().await.unwrap();

    assert_eq!(summary.reason, CompletionReason::DurationElapsed);
    assert_eq!(summary.verdict, Verdict::Passed);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.vus_spawned, 10);
    assert_eq!(summary.peak_vus, 10);
    assert_eq!(summary.lost_workers, 0);
    assert_eq!(summary.lost_samples, 0);
    assert!(summary.elapsed >= Duration::from_secs(4));
    assert!(summary.evaluation_cycles >= 16);

    let iterations = summary.metric(ITERATION_DURATION).unwrap();
    assert_eq!(iterations.count, summary.iterations);
    assert_eq!(iterations.failure_count, 0);
    assert!(summary.iterations > 100);

    let http = summary.metric("http_req_duration").unwrap();
    assert_eq!(http.count, summary.iterations);
    assert_eq!(http.p50, 50.0);

    let checks = summary.metric("checks").unwrap();
    assert_eq!(checks.failure_rate, 0.0);

    assert!(summary
        .thresholds
        .iter()
        .all(|t| t.state == ThresholdState::Passed));
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);

    let state = state_rx.borrow_and_update();
    assert_eq!(state.phase, RunPhase::Completed);
    assert_eq!(state.verdict, Verdict::Passed);
    assert!(state.active_vus.is_empty());
    assert!(!state.aborted);
}

#[tokio::test(start_paused = true)]
async fn test_breached_threshold_fails_without_abort() {
    let counter = Arc::new(AtomicU64::new(0));
    let shared = Arc::clone(&counter);

    // 85% fast, 15% slow responses
    let workload = workload_fn(move |_vu, reporter| {
        let n = shared.fetch_add(1, Ordering::SeqCst);
        async move {
            let latency = if n % 100 < 85 { 10.0 } else { 200.0 };
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
            reporter.report("http_req_duration", latency, Outcome::Success, Tags::new());
            Ok(Outcome::Success)
        }
    })
    .with_metrics(["http_req_duration"]);

    let config = RunConfig::new("buy_item")
        .with_stage(Duration::ZERO, 1)
        .with_stage(Duration::from_secs(10), 1)
        .with_threshold("http_req_duration", "p(90) < 50")
        .with_threshold("http_req_duration", "med < 50");

    let summary = RunController::new(config, workload).run().await.unwrap();

    assert_eq!(summary.reason, CompletionReason::DurationElapsed);
    assert_eq!(summary.verdict, Verdict::Failed);
    assert_eq!(summary.exit_code(), 99);

    let p90 = summary.threshold("http_req_duration", "p(90) < 50").unwrap();
    assert_eq!(p90.state, ThresholdState::Breached);
    assert!(!p90.abort_on_breach);
    let observed = p90.observed.unwrap();
    assert!((observed - 200.0).abs() / 200.0 <= 0.001, "p90 = {}", observed);

    let median = summary.threshold("http_req_duration", "med < 50").unwrap();
    assert_eq!(median.state, ThresholdState::Passed);
}

#[tokio::test(start_paused = true)]
async fn test_identical_runs_yield_same_verdict() {
    let run = || async {
        let workload = workload_fn(|vu, reporter| async move {
            tokio::time::sleep(Duration::from_millis(20 + vu * 5)).await;
            reporter.report("latency", (20 + vu * 5) as f64, Outcome::Success, Tags::new());
            Ok(Outcome::Success)
        })
        .with_metrics(["latency"]);

        let config = RunConfig::new("deterministic")
            .with_stage(Duration::from_secs(1), 5)
            .with_stage(Duration::from_secs(1), 5)
            .with_threshold("latency", "p(99)<40")
            .with_threshold("latency", "avg<100")
            .with_seed(7)
            .with_pacing(PacingPolicy::jitter(
                Duration::from_millis(10),
                Duration::from_millis(30),
            ));

        RunController::new(config, workload).run().await.unwrap()
    };

    let first = run().await;
    let second = run().await;

    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.verdict, Verdict::Failed);
    let states = |s: &RunSummary| s.thresholds.iter().map(|t| t.state).collect::<Vec<_>>();
    assert_eq!(states(&first), states(&second));
    assert_eq!(first.exit_code(), second.exit_code());
}

#[tokio::test(start_paused = true)]
async fn test_operator_abort() {
    let workload = LoginScenario::new(Duration::from_millis(100));
    let teardowns = Arc::clone(&workload.teardowns);
    let controller = RunController::new(
        RunConfig::new("abortable").with_stage(Duration::from_secs(60), 20),
        workload,
    );
    let abort = controller.abort_handle();
    let state_rx = controller.subscribe();

    let handle = tokio::spawn(controller.run());
    tokio::time::sleep(Duration::from_secs(2)).await;
    abort.abort();
    assert!(abort.is_aborted());

    let summary = handle.await.unwrap().unwrap();

    assert_eq!(summary.reason, CompletionReason::OperatorAbort);
    assert!(summary.elapsed < Duration::from_secs(3));
    // No breached thresholds, so the verdict still passes
    assert_eq!(summary.verdict, Verdict::Passed);
    assert!(state_rx.borrow().aborted);
    assert_eq!(state_rx.borrow().phase, RunPhase::Completed);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_stage_runs_until_aborted() {
    let config = RunConfig::new("soak").with_stage(Duration::MAX, 1);
    assert!(config.validate().is_ok());

    let controller = RunController::new(config, LoginScenario::new(Duration::from_millis(10)));
    let abort = controller.abort_handle();
    let handle = tokio::spawn(controller.run());

    tokio::time::sleep(Duration::from_millis(300)).await;
    abort.abort();
    let summary = handle.await.unwrap().unwrap();

    assert_eq!(summary.reason, CompletionReason::OperatorAbort);
    assert_eq!(summary.verdict, Verdict::Passed);
    assert!(summary.elapsed < Duration::from_secs(1));
}

#[tokio::test]
async fn test_cap_exceeded_is_config_error() {
    let config = RunConfig::new("stress")
        .with_stage(Duration::from_secs(10), 2000)
        .with_max_vus(1000);
    let workload = LoginScenario::new(Duration::from_millis(1));

    let err = assert_err!(RunController::new(config, workload).run().await);

    assert!(matches!(
        err,
        RunError::Config(ConfigError::ConcurrencyCapExceeded {
            requested: 2000,
            cap: 1000
        })
    ));
    assert_eq!(err.exit_code(), 104);
}

#[tokio::test]
async fn test_bad_threshold_is_config_error() {
    let config = RunConfig::new("typo")
        .with_stage(Duration::from_secs(1), 1)
        .with_threshold("http_req_duration", "p(90) => 50");

    let err = assert_err!(
        RunController::new(config, LoginScenario::new(Duration::from_millis(1)))
            .run()
            .await
    );

    assert!(matches!(
        err,
        RunError::Config(ConfigError::InvalidThreshold { .. })
    ));
}

#[tokio::test]
async fn test_setup_failure_never_runs() {
    let mut workload = LoginScenario::new(Duration::from_millis(1));
    workload.fail_setup = true;
    let teardowns = Arc::clone(&workload.teardowns);

    let controller = RunController::new(
        RunConfig::new("no_db").with_stage(Duration::from_secs(1), 1),
        workload,
    );
    let state_rx = controller.subscribe();
    let err = assert_err!(controller.run().await);

    assert!(matches!(err, RunError::Setup(_)));
    assert_eq!(err.exit_code(), 107);
    assert_eq!(state_rx.borrow().phase, RunPhase::Initializing);
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);
}
