//! Command dispatch to one device
//!
//! The target must be in the published registry; dispatch never triggers
//! a scan on its own. Nothing here retries: a device rebooting after
//! `update` shows up as [`DispatchError::MalformedResponse`] and the caller
//! decides whether to back off and reconnect.

use crate::refresh::error_text;
use crate::registry::RegistryHandle;
use crate::transport::{DeviceRequest, DeviceResponse, DeviceTransport, TransportError};
use serde_json::Value;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Start,
    Stop,
    Poweroff,
    Update,
    /// Any other control understood by the device (`start_record`, ...)
    Control(String),
    /// Raw endpoint: `/{what}/{id}[/{kind}]`
    Custom { what: String, kind: Option<String> },
}

impl DeviceAction {
    pub fn parse(name: &str) -> Self {
        match name {
            "start" => DeviceAction::Start,
            "stop" => DeviceAction::Stop,
            "poweroff" => DeviceAction::Poweroff,
            "update" => DeviceAction::Update,
            other => DeviceAction::Control(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DeviceAction::Start => "start",
            DeviceAction::Stop => "stop",
            DeviceAction::Poweroff => "poweroff",
            DeviceAction::Update => "update",
            DeviceAction::Control(name) => name,
            DeviceAction::Custom { what, .. } => what,
        }
    }

    /// `(what, type)` path segments around the device id
    fn route(&self) -> (&str, Option<&str>) {
        match self {
            DeviceAction::Update => ("update", None),
            DeviceAction::Custom { what, kind } => (what.as_str(), kind.as_deref()),
            other => ("controls", Some(other.name())),
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.route() {
            (what, Some(kind)) => write!(f, "{what}/{kind}"),
            (what, None) => f.write_str(what),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no such device: {0}")]
    NoSuchDevice(String),
    /// Usually the device restarting after an update
    #[error("bad status line from device {id}, most probably due to an update and auto-reset: {detail}")]
    MalformedResponse { id: String, detail: String },
    #[error("failed to reach device {id}: {source}")]
    Unreachable { id: String, source: TransportError },
    #[error("device {id} couldn't fulfill the request, error code {status}")]
    Remote { id: String, status: u16, body: String },
    #[error("device {id} reported an error: {message}")]
    DeviceReported { id: String, message: String },
    #[error("device {id} answered with a body that is not JSON: {detail}")]
    InvalidBody { id: String, detail: String },
    #[error("unexpected transport error with device {id}: {source}")]
    Transport { id: String, source: TransportError },
}

impl DispatchError {
    /// Short failure-class name for error envelopes and logs
    pub fn class(&self) -> &'static str {
        match self {
            DispatchError::NoSuchDevice(_) => "no_such_device",
            DispatchError::MalformedResponse { .. } => "malformed_response",
            DispatchError::Unreachable { .. } => "unreachable",
            DispatchError::Remote { .. } => "remote_error",
            DispatchError::DeviceReported { .. } => "device_error",
            DispatchError::InvalidBody { .. } => "invalid_body",
            DispatchError::Transport { .. } => "transport",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            port: 9000,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateCheckOptions {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for UpdateCheckOptions {
    fn default() -> Self {
        Self {
            port: 8888,
            timeout: Duration::from_secs(10),
        }
    }
}

pub fn control_url(ip: Ipv4Addr, port: u16, id: &str, action: &DeviceAction) -> String {
    match action.route() {
        (what, Some(kind)) => format!("http://{ip}:{port}/{what}/{id}/{kind}"),
        (what, None) => format!("http://{ip}:{port}/{what}/{id}"),
    }
}

pub fn update_check_url(ip: Ipv4Addr, port: u16, id: &str) -> String {
    format!("http://{ip}:{port}/check_update/{id}")
}

fn lookup(registry: &RegistryHandle, id: &str) -> Result<Ipv4Addr, DispatchError> {
    let snapshot = registry.snapshot();
    match snapshot.registry.get(id) {
        Some(record) => Ok(record.ip),
        None => {
            warn!(device_id = id, "device is not in the registry, a new sweep is needed");
            Err(DispatchError::NoSuchDevice(id.to_string()))
        }
    }
}

/// Sends `action` to device `id` and returns its JSON answer.
///
/// A JSON object answer is merged into the published record. An empty
/// answer is returned as `Value::Null`.
pub async fn dispatch<T: DeviceTransport>(
    transport: &T,
    registry: &RegistryHandle,
    id: &str,
    action: &DeviceAction,
    payload: Option<Value>,
    options: &DispatchOptions,
) -> Result<Value, DispatchError> {
    let ip = lookup(registry, id)?;
    let url = control_url(ip, options.port, id, action);
    info!(device_id = id, action = %action, %url, "requesting");

    let request = DeviceRequest::post(url, payload).with_timeout(options.timeout);
    let answer = exchange(transport, id, request).await?;

    if let Value::Object(fields) = &answer {
        if !registry.merge_fields(id, fields.clone()) {
            warn!(device_id = id, "device left the registry while the command was in flight");
        }
    }
    Ok(answer)
}

/// Asks the update service of device `id` whether updates are pending.
///
/// GET without payload, POST with one. The answer is returned as is and
/// never merged into the record.
pub async fn check_update<T: DeviceTransport>(
    transport: &T,
    registry: &RegistryHandle,
    id: &str,
    payload: Option<Value>,
    options: &UpdateCheckOptions,
) -> Result<Value, DispatchError> {
    let ip = lookup(registry, id)?;
    let url = update_check_url(ip, options.port, id);
    info!(device_id = id, %url, "requesting");

    let request = match payload {
        Some(body) => DeviceRequest::post(url, Some(body)),
        None => DeviceRequest::get(url),
    };
    exchange(transport, id, request.with_timeout(options.timeout)).await
}

async fn exchange<T: DeviceTransport>(
    transport: &T,
    id: &str,
    request: DeviceRequest,
) -> Result<Value, DispatchError> {
    let response = transport
        .send(request)
        .await
        .map_err(|e| transport_failure(id, e))?;
    interpret(id, response)
}

fn transport_failure(id: &str, e: TransportError) -> DispatchError {
    match e {
        TransportError::MalformedResponse(detail) => {
            error!(device_id = id, %detail, "BadStatusLine, most probably due to device update and auto-reset");
            DispatchError::MalformedResponse { id: id.to_string(), detail }
        }
        e if e.is_absence() => {
            error!(device_id = id, error = %e, "We failed to reach a server");
            DispatchError::Unreachable { id: id.to_string(), source: e }
        }
        e => {
            error!(device_id = id, error = %e, "Unexpected transport error");
            DispatchError::Transport { id: id.to_string(), source: e }
        }
    }
}

fn interpret(id: &str, response: DeviceResponse) -> Result<Value, DispatchError> {
    if !response.is_success() {
        error!(device_id = id, status = response.status, "The server couldn't fulfill the request");
        return Err(DispatchError::Remote {
            id: id.to_string(),
            status: response.status,
            body: response.body_text(),
        });
    }
    if response.is_blank() {
        return Ok(Value::Null);
    }

    let answer: Value = serde_json::from_slice(&response.body).map_err(|e| DispatchError::InvalidBody {
        id: id.to_string(),
        detail: e.to_string(),
    })?;
    if let Some(reported) = answer.as_object().and_then(|fields| fields.get("error")) {
        return Err(DispatchError::DeviceReported {
            id: id.to_string(),
            message: error_text(reported),
        });
    }
    Ok(answer)
}
