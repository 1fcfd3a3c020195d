//! nsqlookupd HTTP client: topic listing and producer lookup.

use std::collections::BTreeSet;
use std::time::Duration;

use log::{debug, warn};
use reqwest::{StatusCode, Url, header};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::model::{LookupResponse, LookupdEnvelope, TopicsResponse};

const ACCEPT_V1: &str = "application/vnd.nsq; version=1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LookupdClient {
    http: reqwest::Client,
    endpoints: Vec<Url>,
}

/// Accepts `host:port` as well as full URLs.
pub fn endpoint(addr: &str) -> Result<Url> {
    let addr = addr.trim();
    let with_scheme = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let url = Url::parse(&with_scheme).map_err(|_| Error::LookupdAddress(addr.to_string()))?;
    if url.host_str().is_none() {
        return Err(Error::LookupdAddress(addr.to_string()));
    }
    Ok(url)
}

impl LookupdClient {
    pub fn new(addrs: &[String]) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpClient)?;
        Self::with_client(http, addrs)
    }

    pub fn with_client(http: reqwest::Client, addrs: &[String]) -> Result<Self> {
        let endpoints = addrs
            .iter()
            .map(|a| endpoint(a))
            .collect::<Result<Vec<_>>>()?;
        Ok(LookupdClient { http, endpoints })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Union of the topics known to every lookupd. Unreachable lookupds are
    /// skipped as long as at least one answers.
    pub async fn topics(&self) -> Result<BTreeSet<String>> {
        let mut topics = BTreeSet::new();
        let mut last_err = None;
        let mut answered = false;
        for base in &self.endpoints {
            let mut url = base.clone();
            url.set_path("/topics");
            match self.get_json::<TopicsResponse>(url).await {
                Ok(Some(resp)) => {
                    answered = true;
                    topics.extend(resp.topics);
                }
                Ok(None) => answered = true,
                Err(e) => {
                    warn!("{e}");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if !answered => Err(e),
            _ => Ok(topics),
        }
    }

    /// `host:port` TCP addresses of every nsqd producing `topic`.
    pub async fn producers(&self, topic: &str) -> Result<BTreeSet<String>> {
        let mut addrs = BTreeSet::new();
        let mut last_err = None;
        let mut answered = false;
        for base in &self.endpoints {
            let mut url = base.clone();
            url.set_path("/lookup");
            url.query_pairs_mut().clear().append_pair("topic", topic);
            match self.get_json::<LookupResponse>(url).await {
                Ok(resp) => {
                    answered = true;
                    let producers = resp.unwrap_or_default().producers;
                    addrs.extend(producers.iter().map(|p| p.tcp_address()));
                }
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) if !answered => Err(e),
            _ => Ok(addrs),
        }
    }

    // Ok(None) means lookupd doesn't know the resource (404), which for a
    // topic lookup just means no producers yet.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        debug!("GET {url}");
        let resp = self
            .http
            .get(url.clone())
            .header(header::ACCEPT, ACCEPT_V1)
            .send()
            .await
            .map_err(|source| Error::Http {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = resp.bytes().await.map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })?;
        if !status.is_success() {
            return Err(Error::LookupdStatus {
                url: url.to_string(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        match serde_json::from_slice::<LookupdEnvelope<T>>(&body)? {
            LookupdEnvelope::Bare(data) => Ok(Some(data)),
            LookupdEnvelope::Wrapped {
                status_code: 200,
                data,
                ..
            } => Ok(data),
            LookupdEnvelope::Wrapped {
                status_code: 404, ..
            } => Ok(None),
            LookupdEnvelope::Wrapped {
                status_code,
                status_txt,
                ..
            } => Err(Error::LookupdStatus {
                url: url.to_string(),
                status: status_code,
                message: status_txt,
            }),
        }
    }
}
