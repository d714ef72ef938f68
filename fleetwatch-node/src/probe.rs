//! Identity probe against one candidate address

use crate::transport::{DeviceRequest, DeviceTransport, TransportError};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// What a probe learned about one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found { id: String, address: Ipv4Addr },
    /// Nothing usable answers there. Expected for most of a subnet.
    Absent { address: Ipv4Addr },
}

impl ProbeOutcome {
    pub fn address(&self) -> Ipv4Addr {
        match self {
            ProbeOutcome::Found { address, .. } | ProbeOutcome::Absent { address } => *address,
        }
    }
}

/// Unexpected client or protocol fault while probing
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("unexpected error whilst probing {address}: {source}")]
    Transport {
        address: Ipv4Addr,
        source: TransportError,
    },
    #[error("device at {address} answered without a usable id")]
    MissingId { address: Ipv4Addr },
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub port: u16,
    pub path: String,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            port: 8888,
            path: "id".to_string(),
        }
    }
}

pub fn identity_url(address: Ipv4Addr, port: u16, path: &str) -> String {
    format!("http://{}:{}/{}", address, port, path.trim_start_matches('/'))
}

/// Asks `address` for its identity.
///
/// Refused connections, timeouts, non-2xx answers, empty bodies and
/// unparsable bodies all mean [`ProbeOutcome::Absent`]. Any other
/// transport failure, or JSON without an `id`, is returned as an error so
/// the caller can tell "no device here" from "something is wrong".
pub async fn probe<T: DeviceTransport>(
    transport: &T,
    address: Ipv4Addr,
    options: &ProbeOptions,
) -> Result<ProbeOutcome, ProbeError> {
    let url = identity_url(address, options.port, &options.path);
    let request = DeviceRequest::get(&url).with_timeout(options.timeout);

    let response = match transport.send(request).await {
        Ok(response) => response,
        Err(e) if e.is_absence() => {
            trace!(%url, error = %e, "no device");
            return Ok(ProbeOutcome::Absent { address });
        }
        Err(e) => {
            error!(%url, error = %e, "Unexpected error whilst scanning url");
            return Err(ProbeError::Transport { address, source: e });
        }
    };

    if !response.is_success() {
        debug!(%url, status = response.status, "identity endpoint refused the request");
        return Ok(ProbeOutcome::Absent { address });
    }

    if response.is_blank() {
        warn!(%url, "No message back whilst scanning url");
        return Ok(ProbeOutcome::Absent { address });
    }

    let body: Value = match serde_json::from_slice(&response.body) {
        Ok(body) => body,
        Err(e) => {
            error!(%url, error = %e, "Could not parse response as JSON object");
            return Ok(ProbeOutcome::Absent { address });
        }
    };

    match body.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => {
            debug!(%url, device_id = id, "device answered");
            Ok(ProbeOutcome::Found {
                id: id.to_string(),
                address,
            })
        }
        _ => {
            error!(%url, body = %body, "identity payload has no id");
            Err(ProbeError::MissingId { address })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_url() {
        let ip = Ipv4Addr::new(192, 168, 123, 12);
        assert_eq!(identity_url(ip, 8888, "id"), "http://192.168.123.12:8888/id");
        assert_eq!(identity_url(ip, 8888, "/id"), "http://192.168.123.12:8888/id");
    }

    #[test]
    fn test_default_options() {
        let options = ProbeOptions::default();
        assert_eq!(options.port, 8888);
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(options.path, "id");
    }

    #[test]
    fn test_outcome_address() {
        let ip = Ipv4Addr::new(10, 0, 0, 3);
        assert_eq!(ProbeOutcome::Absent { address: ip }.address(), ip);
        assert_eq!(
            ProbeOutcome::Found { id: "A".into(), address: ip }.address(),
            ip
        );
    }
}
