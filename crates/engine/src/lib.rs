//! # Surge Load Engine
//!
//! Virtual-user load generation with streaming metrics and pass/fail
//! thresholds.
//!
//! ## Features
//!
//! - **Staged ramping**: linear ramp profiles with cooperative spawn/retire of virtual users
//! - **Pacing**: none, fixed or seeded-jitter delays between iterations
//! - **Lossless aggregation**: sharded ingestion with HdrHistogram percentiles
//! - **Thresholds**: `p(90) < 50`, `rate < 0.0001` and friends, with abort-on-breach
//! - **Isolation**: workload errors, panics and timeouts become failure samples
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RunController                           │
//! │  (Initializing → Running → [Aborting] → Completed, verdict)  │
//! └─────────────────────────────────────────────────────────────┘
//!             │ StopMode                      ▲ AbortTrigger
//!             ▼                               │
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │      RampScheduler         │   │   ThresholdEvaluator       │
//! │  (tick → target → spawn)   │   │  (tick → snapshot → eval)  │
//! └───────────────────────────┘   └───────────────────────────┘
//!             │ spawn / retire                ▲ snapshot()
//!             ▼                               │
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │  VirtualUserExecutor × N   │──►│        Aggregator          │
//! │  (workload, pacing)        │   │  (shards, HdrHistogram)    │
//! └───────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use surge_engine::prelude::*;
//!
//! let workload = workload_fn(|vu, reporter| async move {
//!     let started = std::time::Instant::now();
//!     let ok = send_coins(vu).await.is_ok();
//!     reporter.report_duration("http_req_duration", started.elapsed(), Outcome::from_success(ok));
//!     reporter.check("status is 200", ok);
//!     Ok(Outcome::from_success(ok))
//! })
//! .with_metrics(["http_req_duration"]);
//!
//! let config = RunConfig::new("send_coins")
//!     .with_stage(Duration::from_secs(30), 20)
//!     .with_stage(Duration::from_secs(30), 0)
//!     .with_pacing(PacingPolicy::fixed(Duration::from_secs(1)))
//!     .with_threshold("http_req_duration", "p(90)<50")
//!     .with_abort_threshold("checks", "rate<0.0001");
//!
//! let summary = RunController::new(config, workload).run().await?;
//! println!("{}", summary);
//! ```

pub mod error;
pub mod metrics;
pub mod ramp;
pub mod run;
mod serde_helpers;
pub mod telemetry;
pub mod threshold;
pub mod vu;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{ConfigError, RunError};
    pub use crate::metrics::{Aggregator, AggregatorConfig, Outcome, Sample, Tags};
    pub use crate::ramp::{RampProfile, Stage};
    pub use crate::run::{
        AbortHandle, CompletionReason, RunConfig, RunController, RunPhase, RunState, RunSummary,
        Verdict,
    };
    pub use crate::threshold::{Threshold, ThresholdConfig, ThresholdState};
    pub use crate::vu::{
        workload_fn, PacingPolicy, Reporter, VirtualUserId, Workload, WorkloadError,
    };
    pub use async_trait::async_trait;
    pub use std::time::Duration;
}

// Re-export key types at crate root
pub use error::{ConfigError, RunError};
pub use metrics::{Aggregator, AggregatorConfig, Outcome, Sample};
pub use ramp::{RampProfile, Stage};
pub use run::{AbortHandle, RunConfig, RunController, RunState, RunSummary, Verdict};
pub use threshold::{Threshold, ThresholdConfig};
pub use vu::{workload_fn, PacingPolicy, Reporter, Workload, WorkloadError};
