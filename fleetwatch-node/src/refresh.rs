//! Status refresh of already discovered devices
//!
//! Each device's status endpoint is fetched and merged into its record.
//! Unlike the scan, a failure here evicts the device: it was seen, it no
//! longer answers properly, so it is no longer trusted.

use crate::fanout;
use crate::registry::{Registry, StatusFields};
use crate::transport::{DeviceRequest, DeviceTransport, TransportError};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("status endpoint replied with HTTP {0}")]
    Status(u16),
    #[error("malformed status payload: {0}")]
    Malformed(String),
    #[error("device reported an error: {0}")]
    DeviceReported(String),
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub port: u16,
    /// First path segment of the status endpoint
    pub what: String,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            port: 9000,
            what: "data".to_string(),
            concurrency: 5,
            timeout: Duration::from_secs(5),
        }
    }
}

pub fn status_url(ip: Ipv4Addr, port: u16, what: &str, id: &str) -> String {
    format!("http://{}:{}/{}/{}", ip, port, what, id)
}

/// Fetches one device's status object
pub async fn fetch_status<T: DeviceTransport>(
    transport: &T,
    id: &str,
    ip: Ipv4Addr,
    options: &RefreshOptions,
) -> Result<StatusFields, RefreshError> {
    let url = status_url(ip, options.port, &options.what, id);
    debug!(device_id = id, %url, "requesting status");

    let response = transport
        .send(DeviceRequest::get(url).with_timeout(options.timeout))
        .await?;
    if !response.is_success() {
        return Err(RefreshError::Status(response.status));
    }
    if response.is_blank() {
        return Err(RefreshError::Malformed("empty body".to_string()));
    }

    match serde_json::from_slice::<Value>(&response.body) {
        Ok(Value::Object(fields)) => match fields.get("error") {
            Some(reported) => Err(RefreshError::DeviceReported(error_text(reported))),
            None => Ok(fields),
        },
        Ok(other) => Err(RefreshError::Malformed(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(RefreshError::Malformed(e.to_string())),
    }
}

pub(crate) fn error_text(reported: &Value) -> String {
    match reported {
        Value::String(message) => message.clone(),
        other => other.to_string(),
    }
}

async fn refresh_one<T: DeviceTransport>(
    transport: &T,
    id: String,
    ip: Ipv4Addr,
    options: &RefreshOptions,
) -> (String, Ipv4Addr, Result<StatusFields, RefreshError>) {
    let result = fetch_status(transport, &id, ip, options).await;
    (id, ip, result)
}

/// Refreshes every record of `registry`, evicting the ones that fail
pub async fn refresh<T: DeviceTransport>(
    transport: &T,
    mut registry: Registry,
    options: &RefreshOptions,
) -> Registry {
    let started = Instant::now();
    let targets: Vec<(String, Ipv4Addr)> = registry
        .records()
        .map(|record| (record.id.clone(), record.ip))
        .collect();

    let results = fanout::bounded(targets, options.concurrency, |(id, ip)| {
        refresh_one(transport, id, ip, options)
    })
    .await;

    for (id, ip, result) in results {
        match result {
            Ok(fields) => {
                if let Some(record) = registry.get_mut(&id) {
                    record.merge(fields);
                }
            }
            Err(e) => {
                error!(device_id = %id, ip = %ip, phase = "refresh", error = %e, "Could not get data from device, evicting");
                registry.remove(&id);
            }
        }
    }

    info!(
        count = registry.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        devices = ?registry.sorted_ids(),
        "DEVICE INFO -> refreshed devices"
    );
    registry
}
