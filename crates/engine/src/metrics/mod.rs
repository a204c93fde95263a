//! Metric collection for load runs
//!
//! This module provides:
//! - [`Sample`] - One immutable measurement reported by an executor or workload
//! - [`Aggregator`] - Sharded, lossless ingestion with snapshot-time merging
//! - [`AggregateSnapshot`] - Read-consistent copy of every series
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ ┌──────────┐       ┌──────────┐
//! │ Reporter │ │ Reporter │  ...  │ Reporter │   (one per VU)
//! └────┬─────┘ └────┬─────┘       └────┬─────┘
//!      │ vu % N     │                  │
//!      ▼            ▼                  ▼
//! ┌─────────────────────────────────────────────┐
//! │ Aggregator                                   │
//! │  [Shard 0] [Shard 1] ... [Shard N-1]         │
//! │  (name -> MetricSeries, HdrHistogram each)   │
//! └─────────────────────┬───────────────────────┘
//!                       │ snapshot(): lock each shard, merge
//!                       ▼
//!               AggregateSnapshot
//! ```
//!
//! # Percentile accuracy
//!
//! Percentiles come from HdrHistogram. With `significant_figures = 3` (the
//! default) any reported percentile is within 0.1% relative error of a value
//! that was actually recorded, after quantisation to `1 / value_scale`.

mod aggregator;
mod sample;
mod series;

pub use aggregator::{AggregateSnapshot, Aggregator, AggregatorConfig, IngestError};
pub use sample::{
    Outcome, Sample, Tags, CHECKS, ERROR_TAG, ITERATION_DURATION, RESERVED_METRICS,
};
pub use series::SeriesSnapshot;
