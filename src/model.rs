use std::fmt;

use serde::Deserialize;

/// Posterior mean and variance of the arrival rate, or `Undefined` while the
/// accumulated rate is still zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateEstimate {
    Undefined,
    Defined { mean_rate: f64, variance: f64 },
}

impl RateEstimate {
    pub fn mean_rate(&self) -> Option<f64> {
        match self {
            RateEstimate::Undefined => None,
            RateEstimate::Defined { mean_rate, .. } => Some(*mean_rate),
        }
    }

    pub fn variance(&self) -> Option<f64> {
        match self {
            RateEstimate::Undefined => None,
            RateEstimate::Defined { variance, .. } => Some(*variance),
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, RateEstimate::Defined { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    pub topic: String,
    pub shape: f64,
    pub rate: f64,
    pub estimate: RateEstimate,
    pub observed: u64, // messages ingested since startup
    pub pending: usize, // timestamps waiting in the buffer
}

impl fmt::Display for RateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.estimate {
            RateEstimate::Defined {
                mean_rate,
                variance,
            } => write!(
                f,
                "{}  mean: {:.6}/s  variance: {:.6}  shape: {}  rate: {:.6}",
                self.topic, mean_rate, variance, self.shape, self.rate
            )?,
            RateEstimate::Undefined => write!(
                f,
                "{}  mean: undefined  variance: undefined  shape: {}  rate: {:.6}",
                self.topic, self.shape, self.rate
            )?,
        }
        write!(f, "  observed: {}  pending: {}", self.observed, self.pending)
    }
}

// nsqlookupd answers either with the bare payload or, for older versions and
// clients that don't send the versioned Accept header, wrapped in an envelope.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum LookupdEnvelope<T> {
    Wrapped {
        status_code: u16,
        status_txt: String,
        data: Option<T>,
    },
    Bare(T),
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TopicsResponse {
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LookupResponse {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub producers: Vec<Producer>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Producer {
    #[serde(default)]
    pub remote_address: String,
    #[serde(default)]
    pub hostname: String,
    pub broadcast_address: String,
    pub tcp_port: u16,
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub version: String,
}

impl Producer {
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.broadcast_address, self.tcp_port)
    }
}
