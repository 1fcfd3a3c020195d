use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("buffer capacity must be at least 1, got {0}")]
    ZeroCapacity(usize),
    #[error("prior {name} must be a finite value >= 0, got {value}")]
    InvalidPrior { name: &'static str, value: f64 },
    #[error("max-in-flight must be at least 1")]
    ZeroMaxInFlight,
    #[error("need at least one --lookupd-http-address or --nsqd-tcp-address")]
    NoSources,
    #[error("--nsqd-tcp-address without --lookupd-http-address requires at least one --topic")]
    NoTopicsForNsqd,
    #[error("invalid channel name {0:?}")]
    InvalidChannel(String),
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes is too short")]
    ShortFrame(usize),
    #[error("frame size {0} exceeds limit")]
    OversizedFrame(usize),
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),
    #[error("message frame of {0} bytes is too short")]
    ShortMessage(usize),
    #[error("nsqd returned error: {0}")]
    Remote(String),
    #[error("unexpected response {got:?}, expected {expected:?}")]
    UnexpectedResponse { expected: &'static str, got: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("lookupd request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("lookupd {url} returned status {status}: {message}")]
    LookupdStatus {
        url: String,
        status: u16,
        message: String,
    },
    #[error("http client: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("invalid lookupd address {0:?}")]
    LookupdAddress(String),
    #[error("no topics to monitor")]
    NoTopics,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
