//! The host event envelope.
//!
//! Every WebSocket lifecycle event arrives as one independent invocation
//! carrying this envelope; the adapter returns a plain HTTP-shaped response.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of WebSocket lifecycle event being delivered.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// The client opened a socket; subprotocol negotiation happens here.
    Connect,
    /// The client's socket is gone.
    Disconnect,
    /// One WebSocket frame.
    Message,
}

/// One inbound WebSocket lifecycle event.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    /// What kind of event this is.
    pub event_type: EventType,

    /// The route the gateway matched for a MESSAGE event.
    #[serde(default)]
    pub route_key: Option<String>,

    /// The opaque id of the client socket at the gateway.
    pub connection_id: String,

    /// Request headers; only meaningful on CONNECT.
    #[serde(default)]
    pub multi_value_headers: HashMap<String, Vec<String>>,

    /// The frame body of a MESSAGE event.
    #[serde(default)]
    pub body: Option<String>,

    /// The peer-reported close code of a DISCONNECT event.
    #[serde(default)]
    pub disconnect_status_code: Option<u16>,

    /// The peer-reported close reason of a DISCONNECT event.
    #[serde(default)]
    pub disconnect_reason: Option<String>,

    /// The gateway runtime's per-connection request metadata, snapshotted
    /// into the connection context on CONNECT.
    #[serde(default)]
    pub request_context: Option<Value>,
}

impl GatewayEvent {
    /// Looks up a header's values, ignoring name case.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.multi_value_headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, vs)| vs.iter().map(String::as_str))
    }

    /// Returns the client's subprotocol offerings in offer order, splitting
    /// comma-separated header values.
    pub fn subprotocol_offers(&self) -> Vec<&str> {
        self.header_values("Sec-WebSocket-Protocol")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }
}

/// The outbound response of one invocation. Non-200 is used only for
/// subprotocol rejection at CONNECT.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    /// The HTTP status code.
    pub status_code: u16,

    /// Response headers, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Response body, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl GatewayResponse {
    /// A bare success response.
    pub fn ok() -> Self {
        Self {
            status_code: 200,
            headers: None,
            body: None,
        }
    }
}
