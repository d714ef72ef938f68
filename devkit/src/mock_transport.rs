/*!
In-memory device transport

Replies are registered per URL. Unknown URLs fail like a refused
connection, which is what an empty slot of the subnet does. Every request
is recorded, and the number of requests in flight at once is tracked so
tests can assert concurrency ceilings.
*/

use fleetwatch_node::transport::{DeviceRequest, DeviceResponse, DeviceTransport, TransportError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum MockReply {
    /// 200 with a JSON body
    Json(Value),
    /// Any status with a text body
    Status(u16, String),
    /// Any status with raw bytes (empty bodies, broken JSON...)
    Raw(u16, Vec<u8>),
    Fail(TransportError),
}

impl MockReply {
    fn into_result(self) -> Result<DeviceResponse, TransportError> {
        match self {
            MockReply::Json(value) => Ok(DeviceResponse {
                status: 200,
                body: value.to_string().into_bytes(),
            }),
            MockReply::Status(status, text) => Ok(DeviceResponse {
                status,
                body: text.into_bytes(),
            }),
            MockReply::Raw(status, body) => Ok(DeviceResponse { status, body }),
            MockReply::Fail(err) => Err(err),
        }
    }
}

#[derive(Default)]
struct Inner {
    replies: Mutex<HashMap<String, MockReply>>,
    delays: Mutex<HashMap<String, Duration>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<DeviceRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Cheap to clone; clones share replies and recordings
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency applied to every request without a specific delay
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = latency;
        self
    }

    pub fn reply(&self, url: impl Into<String>, reply: MockReply) -> &Self {
        self.inner.replies.lock().insert(url.into(), reply);
        self
    }

    pub fn reply_json(&self, url: impl Into<String>, body: Value) -> &Self {
        self.reply(url, MockReply::Json(body))
    }

    /// Holds requests to `url` for `delay` before replying
    pub fn delay(&self, url: impl Into<String>, delay: Duration) -> &Self {
        self.inner.delays.lock().insert(url.into(), delay);
        self
    }

    pub fn calls(&self) -> Vec<DeviceRequest> {
        self.inner.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.lock().len()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.inner.calls.lock().iter().filter(|c| c.url == url).count()
    }

    /// Highest number of requests that were in flight at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Forgets recorded calls and the peak, keeps the replies
    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
        self.inner.peak.store(0, Ordering::SeqCst);
    }
}

impl DeviceTransport for MockTransport {
    async fn send(&self, request: DeviceRequest) -> Result<DeviceResponse, TransportError> {
        let inner = &self.inner;
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&inner.in_flight);

        let url = request.url.clone();
        let wait = inner
            .delays
            .lock()
            .get(&url)
            .copied()
            .unwrap_or_else(|| *inner.latency.lock());
        let reply = inner.replies.lock().get(&url).cloned();
        let timeout = request.timeout;
        inner.calls.lock().push(request);

        match timeout {
            Some(limit) if wait > limit => {
                tokio::time::sleep(limit).await;
                return Err(TransportError::Timeout);
            }
            _ if !wait.is_zero() => tokio::time::sleep(wait).await,
            _ => {}
        }

        reply
            .unwrap_or_else(|| MockReply::Fail(TransportError::Connect("connection refused".into())))
            .into_result()
    }
}
