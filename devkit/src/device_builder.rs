/*!
Simulated device

Builds the identity and status replies one device serves on the default
ports and installs them in a [`MockTransport`].
*/

use crate::mock_transport::{MockReply, MockTransport};
use fleetwatch_node::probe::identity_url;
use fleetwatch_node::refresh::status_url;
use fleetwatch_node::transport::TransportError;
use serde_json::{json, Map, Value};
use std::net::Ipv4Addr;

pub const IDENTITY_PORT: u16 = 8888;
pub const CONTROL_PORT: u16 = 9000;

#[derive(Debug, Clone)]
pub struct MockDevice {
    pub id: String,
    pub ip: Ipv4Addr,
    fields: Map<String, Value>,
    status_reply: Option<MockReply>,
}

impl MockDevice {
    pub fn new(id: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            id: id.into(),
            ip,
            fields: Map::new(),
            status_reply: None,
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Machine name, used for the backup directory
    pub fn with_name(self, name: &str) -> Self {
        self.with_field("name", json!(name))
    }

    pub fn with_status(self, status: &str) -> Self {
        self.with_field("status", json!(status))
    }

    /// Status endpoint answers with `reply` instead of the device payload
    pub fn with_status_reply(mut self, reply: MockReply) -> Self {
        self.status_reply = Some(reply);
        self
    }

    /// Status endpoint answers 500
    pub fn failing_refresh(mut self) -> Self {
        self.status_reply = Some(MockReply::Status(500, "internal error".into()));
        self
    }

    /// Status endpoint answers with an `error` key
    pub fn reporting_error(mut self, message: &str) -> Self {
        self.status_reply = Some(MockReply::Json(json!({ "error": message })));
        self
    }

    /// Status endpoint stops answering
    pub fn unreachable_status(mut self) -> Self {
        self.status_reply = Some(MockReply::Fail(TransportError::Timeout));
        self
    }

    pub fn identity_url(&self) -> String {
        identity_url(self.ip, IDENTITY_PORT, "id")
    }

    pub fn status_url(&self) -> String {
        status_url(self.ip, CONTROL_PORT, "data", &self.id)
    }

    pub fn control_url(&self, action: &str) -> String {
        format!("http://{}:{}/controls/{}/{}", self.ip, CONTROL_PORT, self.id, action)
    }

    /// Status payload the device reports, `id` included
    pub fn status_payload(&self) -> Value {
        let mut payload = self.fields.clone();
        payload.insert("id".into(), json!(self.id));
        Value::Object(payload)
    }

    pub fn install(&self, transport: &MockTransport) {
        transport.reply_json(self.identity_url(), json!({ "id": self.id }));
        let status = self
            .status_reply
            .clone()
            .unwrap_or_else(|| MockReply::Json(self.status_payload()));
        transport.reply(self.status_url(), status);
    }
}
