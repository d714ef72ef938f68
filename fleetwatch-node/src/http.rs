//! HTTP control surface
//!
//! Read access to the published registry, on-demand sweeps, command relay
//! to devices and the node's own update. Every error body is
//! `{"error": "<message>"}`.
//!
//! When an API key is configured, every route except `/health` requires a
//! matching `x-api-key` header.

use crate::dispatch::{DeviceAction, DispatchError};
use crate::orchestrator::{Orchestrator, SweepError, SweepSummary};
use crate::registry::{DeviceRecord, Snapshot, StatusFields};
use crate::self_update::{RestartRequested, SelfUpdater};
use crate::transport::DeviceTransport;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const API_KEY_ENV: &str = "FLEETWATCH_API_KEY";
pub const API_KEY_HEADER: &str = "x-api-key";

pub struct AppState<T> {
    pub orchestrator: Arc<Orchestrator<T>>,
    pub updater: SelfUpdater,
    /// Main task ends the process once it receives a request here
    pub restart_tx: mpsc::Sender<RestartRequested>,
    pub api_key: Option<Arc<str>>,
}

// derive(Clone) would require T: Clone
impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            updater: self.updater.clone(),
            restart_tx: self.restart_tx.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

/// Reads the API key from the environment; empty means no key
pub fn api_key_from_env() -> Option<Arc<str>> {
    std::env::var(API_KEY_ENV)
        .ok()
        .filter(|key| !key.is_empty())
        .map(Arc::from)
}

#[derive(Debug, Serialize)]
struct DeviceView {
    id: String,
    ip: String,
    status: Option<String>,
    name: Option<String>,
    backup_path: Option<String>,
    time_since_backup_secs: Option<u64>,
    fields: StatusFields,
}

fn to_view(record: &DeviceRecord) -> DeviceView {
    DeviceView {
        id: record.id.clone(),
        ip: record.ip.to_string(),
        status: record.run_status().map(str::to_string),
        name: record.machine_name().map(str::to_string),
        backup_path: record.backup_path.as_ref().map(|p| p.display().to_string()),
        time_since_backup_secs: record.time_since_backup.map(|d| d.as_secs()),
        fields: record.fields.clone(),
    }
}

#[derive(Debug, Serialize)]
struct RegistryView {
    generation: u64,
    swept_at: Option<String>, // RFC3339
    devices: BTreeMap<String, DeviceView>,
}

fn registry_view(snapshot: &Snapshot) -> RegistryView {
    RegistryView {
        generation: snapshot.generation,
        swept_at: snapshot.swept_at.and_then(|at| at.format(&Rfc3339).ok()),
        devices: snapshot
            .registry
            .records()
            .map(|record| (record.id.clone(), to_view(record)))
            .collect(),
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::NoSuchDevice(_) => StatusCode::NOT_FOUND,
            DispatchError::MalformedResponse { .. }
            | DispatchError::Unreachable { .. }
            | DispatchError::Remote { .. }
            | DispatchError::DeviceReported { .. }
            | DispatchError::InvalidBody { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Transport { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<SweepError> for ApiError {
    fn from(err: SweepError) -> Self {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

async fn require_api_key<T: DeviceTransport>(
    State(app): State<AppState<T>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request without a valid api key");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid api key"));
    }
    Ok(next.run(req).await)
}

pub fn build_router<T: DeviceTransport>(app_state: AppState<T>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/devices", get(get_devices::<T>))
        .route("/devices/{id}", get(get_device::<T>))
        .route("/devices/{id}/check_update", get(check_update::<T>).post(check_update::<T>))
        .route("/devices/{id}/{action}", post(post_action::<T>))
        .route("/sweep", post(post_sweep::<T>))
        .route("/node/update", post(update_node::<T>))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key::<T>))
        .with_state(app_state)
}

/// Empty body means "no payload"
fn optional_json(body: &Bytes) -> Result<Option<Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("request body is not JSON: {e}")))
}

// GET /devices
async fn get_devices<T: DeviceTransport>(State(app): State<AppState<T>>) -> Json<RegistryView> {
    Json(registry_view(&app.orchestrator.snapshot()))
}

// GET /devices/{id}
async fn get_device<T: DeviceTransport>(
    State(app): State<AppState<T>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, ApiError> {
    let snapshot = app.orchestrator.snapshot();
    let Some(record) = snapshot.registry.get(&id) else {
        return Err(DispatchError::NoSuchDevice(id).into());
    };
    Ok(Json(to_view(record)))
}

// POST /sweep
async fn post_sweep<T: DeviceTransport>(State(app): State<AppState<T>>) -> Result<Json<SweepSummary>, ApiError> {
    let summary = app.orchestrator.sweep().await?;
    Ok(Json(summary))
}

// POST /devices/{id}/{action}
async fn post_action<T: DeviceTransport>(
    State(app): State<AppState<T>>,
    Path((id, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload = optional_json(&body)?;
    let action = DeviceAction::parse(&action);
    let answer = app.orchestrator.dispatch(&id, &action, payload).await?;
    Ok(Json(answer))
}

// GET|POST /devices/{id}/check_update
async fn check_update<T: DeviceTransport>(
    State(app): State<AppState<T>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload = optional_json(&body)?;
    let answer = app.orchestrator.check_update(&id, payload).await?;
    Ok(Json(answer))
}

// POST /node/update
async fn update_node<T: DeviceTransport>(State(app): State<AppState<T>>) -> Result<Json<Value>, ApiError> {
    let request = app
        .updater
        .pull()
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let body = json!({ "updated": true, "restarting": true, "summary": request.summary });
    if app.restart_tx.try_send(request).is_err() {
        warn!("restart already pending");
    } else {
        info!("restart scheduled after this response");
    }
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, RegistryHandle};
    use crate::transport::TransportError;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sample_record() -> DeviceRecord {
        let mut record = DeviceRecord::new("A", Ipv4Addr::new(10, 0, 0, 3));
        if let Value::Object(fields) = json!({"status": "running", "name": "ETHOSCOPE_001"}) {
            record.merge(fields);
        }
        record.backup_path = Some(PathBuf::from("/ethoscope_results/A/ETHOSCOPE_001"));
        record.time_since_backup = Some(Duration::from_secs(7200));
        record
    }

    #[test]
    fn test_device_view() {
        let view = to_view(&sample_record());
        assert_eq!(view.ip, "10.0.0.3");
        assert_eq!(view.status.as_deref(), Some("running"));
        assert_eq!(view.name.as_deref(), Some("ETHOSCOPE_001"));
        assert_eq!(view.time_since_backup_secs, Some(7200));
    }

    #[test]
    fn test_registry_view_before_and_after_publish() {
        let handle = RegistryHandle::new();
        let empty = registry_view(&handle.snapshot());
        assert_eq!(empty.generation, 0);
        assert!(empty.swept_at.is_none());

        let published = handle.publish(Registry::from_iter([sample_record()]));
        let view = registry_view(&published);
        assert_eq!(view.generation, 1);
        assert!(view.swept_at.is_some());
        assert!(view.devices.contains_key("A"));
    }

    #[test]
    fn test_dispatch_error_status_mapping() {
        let cases = [
            (DispatchError::NoSuchDevice("X".into()), StatusCode::NOT_FOUND),
            (
                DispatchError::Unreachable { id: "A".into(), source: TransportError::Timeout },
                StatusCode::BAD_GATEWAY,
            ),
            (
                DispatchError::MalformedResponse { id: "A".into(), detail: "bad status line".into() },
                StatusCode::BAD_GATEWAY,
            ),
            (
                DispatchError::Remote { id: "A".into(), status: 500, body: String::new() },
                StatusCode::BAD_GATEWAY,
            ),
            (
                DispatchError::Transport { id: "A".into(), source: TransportError::Other("tls".into()) },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_optional_json() {
        assert_eq!(optional_json(&Bytes::new()).unwrap(), None);
        assert_eq!(optional_json(&Bytes::from_static(b" \n")).unwrap(), None);
        assert_eq!(
            optional_json(&Bytes::from_static(br#"{"a":1}"#)).unwrap(),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            optional_json(&Bytes::from_static(b"nope")).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
    }
}
