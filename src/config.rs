use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

pub const DEFAULT_CHANNEL: &str = "rate_estimator#ephemeral";
const MAX_NAME_LEN: usize = 64;

#[derive(Parser, Debug, Clone)]
#[command(name = "nsq_rate_est")]
#[command(about = "Bayesian per-topic arrival rate estimates for NSQ", long_about = None)]
#[command(version)]
pub struct Args {
    /// Number of samples to collect before updating
    #[arg(short = 'n', long = "samples", default_value_t = 10)]
    pub samples: usize,

    /// Prior shape
    #[arg(long, default_value_t = 0.0)]
    pub alpha: f64,

    /// Prior rate
    #[arg(long, default_value_t = 0.0)]
    pub beta: f64,

    /// lookupd HTTP address (may be given multiple times)
    #[arg(long = "lookupd-http-address", env = "NSQ_LOOKUPD_HTTP_ADDRESS", value_delimiter = ',')]
    pub lookupd_http_addresses: Vec<String>,

    /// nsqd TCP address to connect to directly (may be given multiple times)
    #[arg(long = "nsqd-tcp-address", value_delimiter = ',')]
    pub nsqd_tcp_addresses: Vec<String>,

    /// Topic to monitor in addition to those found on lookupd
    #[arg(long = "topic")]
    pub topics: Vec<String>,

    /// Channel to subscribe with
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Max number of messages to allow in flight
    #[arg(long, default_value_t = 10)]
    pub max_in_flight: u32,

    /// Seconds between snapshot reports (0 disables)
    #[arg(long, default_value_t = 10)]
    pub report_interval: u64,

    /// Seconds between producer lookups
    #[arg(long, default_value_t = 60)]
    pub lookupd_poll_interval: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorConfig {
    pub capacity: usize,
    pub prior_shape: f64,
    pub prior_rate: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            capacity: 10,
            prior_shape: 0.0,
            prior_rate: 0.0,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity(self.capacity));
        }
        check_prior("alpha", self.prior_shape)?;
        check_prior("beta", self.prior_rate)?;
        Ok(())
    }
}

fn check_prior(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidPrior { name, value })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub estimator: EstimatorConfig,
    pub lookupd_http_addresses: Vec<String>,
    pub nsqd_tcp_addresses: Vec<String>,
    pub topics: Vec<String>,
    pub channel: String,
    pub max_in_flight: u32,
    pub report_interval: Option<Duration>,
    pub lookupd_poll_interval: Duration,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let estimator = EstimatorConfig {
            capacity: args.samples,
            prior_shape: args.alpha,
            prior_rate: args.beta,
        };
        estimator.validate()?;

        if args.max_in_flight == 0 {
            return Err(ConfigError::ZeroMaxInFlight);
        }
        if args.lookupd_http_addresses.is_empty() && args.nsqd_tcp_addresses.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if args.lookupd_http_addresses.is_empty() && args.topics.is_empty() {
            return Err(ConfigError::NoTopicsForNsqd);
        }
        if !is_valid_name(&args.channel) {
            return Err(ConfigError::InvalidChannel(args.channel.clone()));
        }
        if let Some(bad) = args.topics.iter().find(|t| !is_valid_name(t)) {
            return Err(ConfigError::InvalidTopic(bad.clone()));
        }

        Ok(Config {
            estimator,
            lookupd_http_addresses: args.lookupd_http_addresses.clone(),
            nsqd_tcp_addresses: args.nsqd_tcp_addresses.clone(),
            topics: args.topics.clone(),
            channel: args.channel.clone(),
            max_in_flight: args.max_in_flight,
            report_interval: (args.report_interval > 0)
                .then(|| Duration::from_secs(args.report_interval)),
            lookupd_poll_interval: Duration::from_secs(args.lookupd_poll_interval.max(1)),
        })
    }
}

/// Topic and channel names: 1-64 chars of `[.a-zA-Z0-9_-]`, optionally
/// suffixed with `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let stem = name.strip_suffix("#ephemeral").unwrap_or(name);
    !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
