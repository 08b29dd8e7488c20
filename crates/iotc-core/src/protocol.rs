// ── Property / command protocol engine ──
//
// Routes inbound hub frames by topic prefix:
//
//   $iothub/twin/res/                     twin snapshot (200) or reported ack (204)
//   $iothub/twin/PATCH/properties/desired desired-property patch
//   $iothub/methods/POST/                 command invocation
//   devices/<id>/messages/devicebound/    cloud-to-device message (dropped)
//
// Property and command events carry a `SessionHandle` so the application
// can acknowledge or reply from inside its callback.

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value, json};
use tracing::{debug, trace, warn};

use iotc_api::InboundMessage;
use iotc_api::topics;

use crate::error::CoreError;
use crate::events::{DeviceEvent, EventCategory, EventRegistry};
use crate::session::SessionHandle;

const VERSION_KEY: &str = "$version";
const DEFAULT_ACK_DESCRIPTION: &str = "Property applied";

// ── Twin ─────────────────────────────────────────────────────────────

/// Last known device twin, replaced wholesale on every twin response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinSnapshot {
    pub desired: Map<String, Value>,
    pub reported: Map<String, Value>,
}

impl TwinSnapshot {
    /// Parse a twin document. Anything that is not a JSON object is an error.
    pub fn parse(body: &[u8]) -> Result<Self, CoreError> {
        let value: Value = serde_json::from_slice(body).map_err(|e| CoreError::MalformedTwin {
            message: e.to_string(),
        })?;
        let Value::Object(mut doc) = value else {
            return Err(CoreError::MalformedTwin {
                message: "twin document is not an object".into(),
            });
        };
        let section = |value: Option<Value>| match value {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Ok(Self {
            desired: section(doc.remove("desired")),
            reported: section(doc.remove("reported")),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty() && self.reported.is_empty()
    }

    /// `$version` of the desired section.
    pub fn desired_version(&self) -> Option<i64> {
        self.desired.get(VERSION_KEY).and_then(Value::as_i64)
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// One desired-property change.
#[derive(Debug, Clone)]
pub struct PropertyEvent {
    pub name: String,
    /// The property value, unwrapped from `{"value": ...}` when `wrapped`.
    pub value: Value,
    /// `$version` of the patch that carried this property.
    pub version: Option<i64>,
    pub wrapped: bool,
    handle: SessionHandle,
}

impl PropertyEvent {
    fn new(name: &str, raw: &Value, version: Option<i64>, handle: SessionHandle) -> Self {
        let (value, wrapped) = match raw {
            Value::Object(fields) if fields.contains_key("value") => {
                (fields.get("value").cloned().unwrap_or(Value::Null), true)
            }
            other => (other.clone(), false),
        };
        Self {
            name: name.to_owned(),
            value,
            version,
            wrapped,
            handle,
        }
    }

    /// Reported-property document acknowledging this change.
    pub fn ack_payload(&self, message: Option<&str>) -> Value {
        let body = if self.wrapped {
            json!({
                "ac": 200,
                "ad": message.unwrap_or(DEFAULT_ACK_DESCRIPTION),
                "av": self.version,
                "value": self.value,
            })
        } else {
            self.value.clone()
        };
        let mut patch = Map::new();
        patch.insert(self.name.clone(), body);
        Value::Object(patch)
    }

    /// Publish the acknowledgment as a reported-property patch.
    pub async fn ack(&self, message: Option<&str>) -> Result<(), CoreError> {
        self.handle
            .send_reported(&self.ack_payload(message))
            .await
    }
}

/// Outcome reported back for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Error,
}

impl CommandStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::Error => 500,
        }
    }
}

/// One inbound command invocation.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub name: String,
    pub request_id: String,
    /// JSON request body; non-JSON bodies are kept as a string.
    pub payload: Option<Value>,
    handle: SessionHandle,
}

impl CommandEvent {
    /// An event whose replies have nowhere to go.
    #[cfg(test)]
    pub(crate) fn detached(name: &str, request_id: &str, payload: Option<Value>) -> Self {
        Self {
            name: name.to_owned(),
            request_id: request_id.to_owned(),
            payload,
            handle: SessionHandle::detached(),
        }
    }

    /// Acknowledge the invocation, then publish `message` as the command's
    /// reported value.
    pub async fn reply(&self, status: CommandStatus, message: &str) -> Result<(), CoreError> {
        self.handle
            .publish(
                &topics::command_response(status.code(), &self.request_id),
                Vec::new(),
            )
            .await?;

        let mut patch = Map::new();
        patch.insert(self.name.clone(), json!({ "value": message }));
        self.handle.send_reported(&Value::Object(patch)).await
    }
}

fn command_payload(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(body)
        .ok()
        .or_else(|| Some(Value::String(String::from_utf8_lossy(body).into_owned())))
}

// ── Engine ───────────────────────────────────────────────────────────

/// Inbound frame router shared by a session's dispatcher.
pub struct ProtocolEngine {
    registry: Arc<EventRegistry>,
    handle: SessionHandle,
    twin: RwLock<TwinSnapshot>,
    device_bound_prefix: String,
}

impl ProtocolEngine {
    pub fn new(registry: Arc<EventRegistry>, handle: SessionHandle) -> Self {
        let device_bound_prefix = topics::device_bound_prefix(handle.device_id());
        Self {
            registry,
            handle,
            twin: RwLock::new(TwinSnapshot::default()),
            device_bound_prefix,
        }
    }

    pub fn twin(&self) -> TwinSnapshot {
        self.twin
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process one inbound frame, including any callback it triggers.
    pub async fn handle(&self, message: InboundMessage) {
        let topic = message.topic.as_str();
        if topic.starts_with(topics::TWIN_RESPONSE_PREFIX) {
            self.on_twin_response(topic, &message.payload).await;
        } else if topic.starts_with(topics::DESIRED_PATCH_PREFIX) {
            self.on_desired_patch(&message.payload).await;
        } else if topic.starts_with(topics::COMMAND_PREFIX) {
            self.on_command(topic, &message.payload).await;
        } else if topic.starts_with(&self.device_bound_prefix) {
            debug!(topic, size = message.payload.len(), "device-bound message dropped");
        } else {
            trace!(topic, "unrouted frame");
        }
    }

    async fn on_twin_response(&self, topic: &str, body: &[u8]) {
        match topics::parse_twin_status(topic) {
            Some(200) => {}
            Some(204) => {
                debug!(topic, "reported properties accepted");
                return;
            }
            status => {
                warn!(topic, ?status, "twin request failed");
                return;
            }
        }

        let twin = TwinSnapshot::parse(body).unwrap_or_else(|e| {
            warn!(error = %e, "replacing twin with empty document");
            TwinSnapshot::default()
        });
        let desired = twin.desired.clone();
        *self.twin.write().unwrap_or_else(PoisonError::into_inner) = twin;
        debug!(version = ?desired.get(VERSION_KEY), "twin updated");

        if !desired.is_empty() {
            self.dispatch_properties(&desired).await;
        }
    }

    async fn on_desired_patch(&self, body: &[u8]) {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(patch)) => self.dispatch_properties(&patch).await,
            Ok(_) => warn!("desired patch is not an object, dropped"),
            Err(e) => warn!(error = %e, "malformed desired patch dropped"),
        }
    }

    async fn dispatch_properties(&self, patch: &Map<String, Value>) {
        if !self.registry.has_listener(EventCategory::Properties) {
            return;
        }
        let version = patch.get(VERSION_KEY).and_then(Value::as_i64);
        for (name, raw) in patch {
            if name == VERSION_KEY {
                continue;
            }
            let Some(callback) = self.registry.listener(EventCategory::Properties, name) else {
                continue;
            };
            let event = PropertyEvent::new(name, raw, version, self.handle.clone());
            callback(DeviceEvent::Property(event)).await;
        }
    }

    async fn on_command(&self, topic: &str, body: &[u8]) {
        let Some(command) = topics::parse_command(topic) else {
            warn!(topic, "malformed command topic dropped");
            return;
        };
        let Some(callback) = self.registry.listener(EventCategory::Commands, &command.name) else {
            debug!(command = %command.name, "no listener for command");
            return;
        };
        let event = CommandEvent {
            name: command.name,
            request_id: command.request_id,
            payload: command_payload(body),
            handle: self.handle.clone(),
        };
        callback(DeviceEvent::Command(event)).await;
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("registry", &self.registry)
            .field("device_bound_prefix", &self.device_bound_prefix)
            .finish_non_exhaustive()
    }
}
