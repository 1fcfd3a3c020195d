//! Bayesian per-topic arrival rate estimation for NSQ.
//!
//! Every topic gets a [`RateEstimator`](estimator::RateEstimator) that
//! buffers message arrival times and, whenever the buffer fills, folds the
//! observed inter-arrival intervals into a Gamma posterior over the topic's
//! Poisson rate.

pub mod config;
pub mod consumer;
pub mod error;
pub mod estimator;
pub mod lookupd;
pub mod model;
pub mod protocol;
pub mod ring;
pub mod supervisor;

pub use config::{Args, Config, EstimatorConfig};
pub use error::{Error, Result};
pub use estimator::{IntervalBatch, PosteriorState, RateEstimator};
pub use model::{RateEstimate, RateSnapshot};
pub use ring::{EventBuffer, EventTimestamp, OfferResult};
pub use supervisor::{TopicHandle, TopicSupervisor};
