//! HTTP transport between the node and its devices
//!
//! Every device-facing call (identity probe, status GET, control POST,
//! update check) goes through [`DeviceTransport`]. The production
//! implementation is [`HttpTransport`] (reqwest); tests plug in an
//! instrumented mock instead.
//!
//! Non-2xx answers are NOT errors at this level: they come back as a
//! [`DeviceResponse`] and each caller decides what the status means.

use serde_json::Value;
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Failure to obtain any HTTP response from a device
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Refused, reset or unroutable: nobody is answering at that address
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    /// The peer answered with something that is not HTTP, or hung up
    /// before a complete response. Devices do this while rebooting after
    /// an update.
    #[error("malformed response from peer: {0}")]
    MalformedResponse(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Connection failures and timeouts mean "no device here"
    pub fn is_absence(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl DeviceRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            body,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl DeviceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True when the body carries nothing but whitespace
    pub fn is_blank(&self) -> bool {
        self.body.iter().all(u8::is_ascii_whitespace)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request to one device
pub trait DeviceTransport: Send + Sync + 'static {
    fn send(
        &self,
        request: DeviceRequest,
    ) -> impl Future<Output = Result<DeviceResponse, TransportError>> + Send;
}

/// Ceiling on TCP connection setup, below any per-request timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// reqwest-backed transport used in production
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        // Devices live on the LAN: never route them through an env proxy.
        // Idle sockets are capped so a wide scan does not pile them up.
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(Duration::from_secs(30))
            .user_agent(concat!("fleetwatch-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl DeviceTransport for HttpTransport {
    async fn send(&self, request: DeviceRequest) -> Result<DeviceResponse, TransportError> {
        trace!(url = %request.url, method = ?request.method, "sending device request");

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match &request.body {
            Some(body) => builder.json(body),
            None => builder.header(reqwest::header::CONTENT_TYPE, "application/json"),
        };

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;

        Ok(DeviceResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Maps a reqwest failure onto the transport taxonomy.
///
/// Timeouts first, then protocol breakage reported by hyper, then plain
/// connection trouble found anywhere in the source chain.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_parse() || hyper_err.is_incomplete_message() {
                return TransportError::MalformedResponse(hyper_err.to_string());
            }
            if hyper_err.is_timeout() {
                return TransportError::Timeout;
            }
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::TimedOut => return TransportError::Timeout,
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::AddrNotAvailable => {
                    return TransportError::Connect(io_err.to_string())
                }
                _ => {}
            }
        }
        source = cause.source();
    }

    if err.is_connect() {
        return TransportError::Connect(err.to_string());
    }
    TransportError::Other(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_fits_probe_budget() {
        assert!(CONNECT_TIMEOUT <= crate::probe::ProbeOptions::default().timeout);
        assert!(HttpTransport::new().is_ok());
    }

    #[test]
    fn test_absence_classes() {
        assert!(TransportError::Connect("refused".into()).is_absence());
        assert!(TransportError::Timeout.is_absence());
        assert!(!TransportError::MalformedResponse("bad status line".into()).is_absence());
        assert!(!TransportError::Other("boom".into()).is_absence());
    }

    #[test]
    fn test_response_helpers() {
        let ok = DeviceResponse { status: 204, body: b" \n".to_vec() };
        assert!(ok.is_success());
        assert!(ok.is_blank());

        let missing = DeviceResponse { status: 404, body: b"{}".to_vec() };
        assert!(!missing.is_success());
        assert!(!missing.is_blank());
    }

    #[test]
    fn test_request_builders() {
        let req = DeviceRequest::post("http://10.0.0.3:9000/controls/A/start", None)
            .with_timeout(Duration::from_secs(1));
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.timeout, Some(Duration::from_secs(1)));
        assert!(req.body.is_none());
    }
}
