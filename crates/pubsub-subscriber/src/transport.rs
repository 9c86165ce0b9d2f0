//! Transport capability and the default reqwest-backed implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::retry::Endpoint;

const AGENT_STRING: &str = "pubsub-subscriber-rs/0.1";

/// Transport-agnostic request descriptor. Every endpoint is a `GET` with its
/// parameters in the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Path segments, not yet percent-encoded.
    pub path: Vec<String>,
    pub query: Vec<(String, String)>,
    pub timeout: Duration,
    pub endpoint: Endpoint,
}

impl Request {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Path joined with `/`, unencoded.
    pub fn path_string(&self) -> String {
        format!("/{}", self.path.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("transport failure: {0}")]
    Other(String),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable(msg) | TransportError::Other(msg) => {
                Error::NetworkUnreachable(msg)
            }
            TransportError::Timeout => Error::Timeout,
            TransportError::Cancelled => Error::Cancelled,
        }
    }
}

/// Sends requests on behalf of the subscribe loop and heartbeat.
///
/// Non-2xx answers are returned as `Ok(Response)`; `Err` is reserved for
/// requests that produced no HTTP response at all.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;

    /// Same as [`send`](Transport::send), for requests expected to stay open
    /// up to the subscribe idle ceiling.
    async fn send_long_poll(&self, request: Request) -> Result<Response, TransportError> {
        self.send(request).await
    }

    /// Abort every in-flight request with [`TransportError::Cancelled`].
    fn cancel_all(&self) {}

    /// Reject requests until [`resume`](Transport::resume) is called.
    fn suspend(&self) {}

    fn resume(&self) {}
}

/// [`Transport`] over HTTP(S) using `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: url::Url,
    cancel: Mutex<CancellationToken>,
    suspended: AtomicBool,
}

impl HttpTransport {
    /// `base_url` is scheme and host, e.g. `https://ps.pndsn.com`.
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let base_url = url::Url::parse(base_url)
            .map_err(|e| Error::Configuration(format!("invalid origin {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Configuration(format!(
                "origin {base_url} cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .user_agent(AGENT_STRING)
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;
        tracing::debug!(base_url = %base_url, "http transport initialized");
        Ok(Self {
            client,
            base_url,
            cancel: Mutex::new(CancellationToken::new()),
            suspended: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, Error> {
        Self::new(&config.base_url())
    }

    fn url_for(&self, request: &Request) -> Result<url::Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Other("origin cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(&request.path);
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(
                request
                    .query
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            );
        }
        Ok(url)
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Unreachable(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        if self.suspended.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }
        let token = self.current_token();
        let url = self.url_for(&request)?;
        tracing::trace!(url = %url, endpoint = ?request.endpoint, "sending request");

        let builder = self.client.get(url).timeout(request.timeout);
        let exchange = async {
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>(Response {
                status,
                body: body.to_vec(),
            })
        };

        tokio::select! {
            _ = token.cancelled() => Err(TransportError::Cancelled),
            result = exchange => result.map_err(map_reqwest_error),
        }
    }

    fn cancel_all(&self) {
        let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        guard.cancel();
        *guard = CancellationToken::new();
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        self.cancel_all();
    }

    fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &[&str], query: &[(&str, &str)]) -> Request {
        Request {
            path: path.iter().map(|s| s.to_string()).collect(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timeout: Duration::from_secs(1),
            endpoint: Endpoint::Subscribe,
        }
    }

    #[test]
    fn url_encodes_segments_and_query() {
        let t = HttpTransport::new("https://ps.example.com").unwrap();
        let url = t
            .url_for(&request(
                &["v2", "subscribe", "demo", "a b,c", "0"],
                &[("tt", "0"), ("state", r#"{"a":1}"#)],
            ))
            .unwrap();
        assert!(url.as_str().starts_with("https://ps.example.com/v2/subscribe/demo/a%20b,c/0?"));
        assert!(url.as_str().contains("tt=0"));
        assert!(url.as_str().contains("state=%7B%22a%22%3A1%7D"));
    }

    #[test]
    fn invalid_origin_is_configuration_error() {
        assert!(matches!(
            HttpTransport::new("not a url"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn request_helpers() {
        let r = request(&["time", "0"], &[("uuid", "u1")]);
        assert_eq!(r.path_string(), "/time/0");
        assert_eq!(r.query_value("uuid"), Some("u1"));
        assert_eq!(r.query_value("tt"), None);
    }

    #[test]
    fn transport_errors_map_onto_taxonomy() {
        assert_eq!(Error::from(TransportError::Timeout), Error::Timeout);
        assert_eq!(Error::from(TransportError::Cancelled), Error::Cancelled);
        assert!(matches!(
            Error::from(TransportError::Unreachable("refused".into())),
            Error::NetworkUnreachable(_)
        ));
    }

    #[tokio::test]
    async fn suspended_transport_rejects_requests() {
        let t = HttpTransport::new("http://127.0.0.1:9").unwrap();
        t.suspend();
        let err = t.send(request(&["time", "0"], &[])).await.unwrap_err();
        assert_eq!(err, TransportError::Cancelled);
        t.resume();
        assert!(!t.suspended.load(Ordering::Acquire));
    }
}
