//! Gamma-Poisson arrival rate estimation.
//!
//! Each topic keeps a `Gamma(shape, rate)` posterior over the Poisson rate of
//! its message stream. Timestamps collect in an [`EventBuffer`]; once it
//! fills, the buffered inter-arrival intervals are folded into the posterior
//! in one batch and the buffer is emptied.

use log::debug;

use crate::config::EstimatorConfig;
use crate::model::{RateEstimate, RateSnapshot};
use crate::ring::{EventBuffer, EventTimestamp, OfferResult};

/// Accumulated `Gamma(shape, rate)` parameters. Only ever grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosteriorState {
    shape: f64,
    rate: f64,
}

impl PosteriorState {
    pub fn new(prior_shape: f64, prior_rate: f64) -> Self {
        debug_assert!(prior_shape >= 0.0 && prior_rate >= 0.0);
        PosteriorState {
            shape: prior_shape,
            rate: prior_rate,
        }
    }

    pub fn shape(&self) -> f64 {
        self.shape
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Treats the batch as `intervals` exponential observations whose
    /// empirical mean is `mean_interval`.
    pub fn fold(&mut self, batch: &IntervalBatch) {
        if batch.intervals == 0 {
            return;
        }
        let n = batch.intervals as f64;
        self.shape += n;
        self.rate += n * batch.mean_interval;
    }

    pub fn estimate(&self) -> RateEstimate {
        if self.rate > 0.0 {
            RateEstimate::Defined {
                mean_rate: self.shape / self.rate,
                variance: self.shape / (self.rate * self.rate),
            }
        } else {
            RateEstimate::Undefined
        }
    }
}

/// Summary of one drained buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalBatch {
    pub intervals: usize,
    /// Mean inter-arrival time in seconds.
    pub mean_interval: f64,
}

impl IntervalBatch {
    pub const EMPTY: IntervalBatch = IntervalBatch {
        intervals: 0,
        mean_interval: 0.0,
    };
}

/// Running mean of the gaps between consecutive timestamps. `n` timestamps
/// give `n - 1` intervals; fewer than two give none.
pub fn mean_interval(stamps: &[EventTimestamp]) -> IntervalBatch {
    let mut iter = stamps.iter();
    let Some(mut prev) = iter.next().copied() else {
        return IntervalBatch::EMPTY;
    };
    let mut mean = 0.0;
    let mut count = 0usize;
    for &ts in iter {
        // out-of-order stamps count as simultaneous
        let delta = ts.saturating_duration_since(prev).as_secs_f64();
        count += 1;
        mean += (delta - mean) / count as f64;
        prev = ts;
    }
    IntervalBatch {
        intervals: count,
        mean_interval: mean,
    }
}

#[derive(Debug)]
pub struct RateEstimator {
    topic: String,
    buffer: EventBuffer,
    posterior: PosteriorState,
    observed: u64,
    updates: u64,
}

impl RateEstimator {
    pub fn new(topic: impl Into<String>, config: &EstimatorConfig) -> Self {
        RateEstimator {
            topic: topic.into(),
            buffer: EventBuffer::new(config.capacity),
            posterior: PosteriorState::new(config.prior_shape, config.prior_rate),
            observed: 0,
            updates: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn posterior(&self) -> &PosteriorState {
        &self.posterior
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of times the buffer has been drained into the posterior.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Records one event. When the buffer is already full it is folded into
    /// the posterior first, and the batch that was folded is returned.
    pub fn ingest(&mut self, now: EventTimestamp) -> Option<IntervalBatch> {
        self.observed += 1;
        match self.buffer.offer(now) {
            OfferResult::Accepted => None,
            OfferResult::Full => {
                let batch = self.update();
                let retry = self.buffer.offer(now);
                debug_assert_eq!(retry, OfferResult::Accepted);
                Some(batch)
            }
        }
    }

    /// Drains the buffer and folds its intervals into the posterior.
    pub fn update(&mut self) -> IntervalBatch {
        let stamps = self.buffer.drain_all();
        let batch = mean_interval(&stamps);
        self.posterior.fold(&batch);
        self.updates += 1;

        let estimate = self.posterior.estimate();
        debug!(
            "{}  α: {}  β: {}  mean: {}  variance: {}  (folded {} intervals, mean gap {:.6}s)",
            self.topic,
            self.posterior.shape(),
            self.posterior.rate(),
            fmt_opt(estimate.mean_rate()),
            fmt_opt(estimate.variance()),
            batch.intervals,
            batch.mean_interval,
        );
        batch
    }

    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            topic: self.topic.clone(),
            shape: self.posterior.shape(),
            rate: self.posterior.rate(),
            estimate: self.posterior.estimate(),
            observed: self.observed,
            pending: self.buffer.len(),
        }
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "undefined".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    const EPS: f64 = 1e-9;

    fn stamps(base: Instant, secs: &[f64]) -> Vec<Instant> {
        secs.iter()
            .map(|&s| base + Duration::from_secs_f64(s))
            .collect()
    }

    fn config(capacity: usize) -> EstimatorConfig {
        EstimatorConfig {
            capacity,
            ..Default::default()
        }
    }

    #[test]
    fn test_mean_interval_worked_example() {
        let base = Instant::now();
        let batch = mean_interval(&stamps(base, &[0.0, 1.0, 3.0, 6.0]));
        assert_eq!(batch.intervals, 3);
        assert!((batch.mean_interval - 2.0).abs() < EPS);
    }

    #[test]
    fn test_mean_interval_degenerate() {
        let base = Instant::now();
        assert_eq!(mean_interval(&[]), IntervalBatch::EMPTY);
        assert_eq!(mean_interval(&[base]), IntervalBatch::EMPTY);
    }

    #[test]
    fn test_mean_interval_sub_second() {
        let base = Instant::now();
        let batch = mean_interval(&stamps(base, &[0.0, 0.001, 0.003]));
        assert_eq!(batch.intervals, 2);
        assert!((batch.mean_interval - 0.0015).abs() < 1e-9);
    }

    #[test]
    fn test_mean_interval_out_of_order_clamps() {
        let base = Instant::now();
        let batch = mean_interval(&stamps(base, &[2.0, 1.0, 3.0]));
        // gaps: 0 (clamped), 2
        assert_eq!(batch.intervals, 2);
        assert!((batch.mean_interval - 1.0).abs() < EPS);
    }

    #[test]
    fn test_worked_example() {
        let base = Instant::now();
        let mut est = RateEstimator::new("clicks", &config(4));
        for ts in stamps(base, &[0.0, 1.0, 3.0, 6.0]) {
            assert!(est.ingest(ts).is_none());
        }
        let batch = est.update();
        assert_eq!(batch.intervals, 3);

        let snap = est.snapshot();
        assert_eq!(snap.shape, 3.0);
        assert!((snap.rate - 6.0).abs() < EPS);
        let mean = snap.estimate.mean_rate().unwrap();
        let var = snap.estimate.variance().unwrap();
        assert!((mean - 0.5).abs() < EPS);
        assert!((var - 3.0 / 36.0).abs() < EPS);
    }

    #[test]
    fn test_full_buffer_triggers_one_update() {
        let base = Instant::now();
        let mut est = RateEstimator::new("clicks", &config(4));
        let ts = stamps(base, &[0.0, 1.0, 3.0, 6.0, 7.0]);
        for &t in &ts[..4] {
            assert!(est.ingest(t).is_none());
        }
        assert_eq!(est.updates(), 0);

        let batch = est.ingest(ts[4]).expect("full buffer should update");
        assert_eq!(batch.intervals, 3);
        assert_eq!(est.updates(), 1);
        // the triggering timestamp seeds the next batch
        assert_eq!(est.buffered(), 1);
        assert_eq!(est.snapshot().observed, 5);
        assert_eq!(est.posterior().shape(), 3.0);
    }

    #[test]
    fn test_undefined_snapshot() {
        let est = RateEstimator::new("idle", &config(10));
        let snap = est.snapshot();
        assert_eq!(snap.estimate, RateEstimate::Undefined);
        assert_eq!(snap.shape, 0.0);
        assert_eq!(snap.rate, 0.0);
    }

    #[test]
    fn test_prior_defines_estimate() {
        let cfg = EstimatorConfig {
            capacity: 10,
            prior_shape: 2.0,
            prior_rate: 4.0,
        };
        let est = RateEstimator::new("clicks", &cfg);
        let estimate = est.snapshot().estimate;
        assert_eq!(estimate.mean_rate(), Some(0.5));
        assert_eq!(estimate.variance(), Some(0.125));
    }

    #[test]
    fn test_update_on_short_buffer_is_noop() {
        let base = Instant::now();
        let mut est = RateEstimator::new("clicks", &config(4));
        est.ingest(base);
        let before = *est.posterior();
        let batch = est.update();
        assert_eq!(batch.intervals, 0);
        assert_eq!(*est.posterior(), before);
        assert_eq!(est.buffered(), 0);
    }

    #[test]
    fn test_simultaneous_events_keep_rate_undefined() {
        let base = Instant::now();
        let mut est = RateEstimator::new("burst", &config(3));
        for _ in 0..4 {
            est.ingest(base);
        }
        assert_eq!(est.posterior().shape(), 2.0);
        assert_eq!(est.posterior().rate(), 0.0);
        assert_eq!(est.snapshot().estimate, RateEstimate::Undefined);
    }

    #[test]
    fn test_capacity_one_never_folds() {
        let base = Instant::now();
        let mut est = RateEstimator::new("clicks", &config(1));
        for ts in stamps(base, &[0.0, 1.0, 2.0]) {
            est.ingest(ts);
        }
        assert_eq!(est.updates(), 2);
        assert_eq!(est.posterior().shape(), 0.0);
    }
}
