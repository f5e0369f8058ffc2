use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The payload for a client's Subscribe message. This triggers execution of a
/// query, mutation, or subscription.
///
/// The payload round-trips through serialization unchanged, since it is
/// persisted verbatim for the lifetime of the subscription and handed back to
/// completion hooks.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// The document body.
    pub query: String,

    /// The optional variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    /// The optional operation name (required if the document contains multiple
    /// operations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// The optional extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// ClientMessage defines the message types that clients can send.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// ConnectionInit is sent by the client upon connecting.
    ConnectionInit {
        /// Optional parameters of any type sent from the client. These are
        /// often used for authentication.
        #[serde(default)]
        payload: Option<Value>,
    },
    /// Ping is used for detecting failed connections, displaying latency
    /// metrics or other types of network probing.
    Ping {
        /// Optional parameters of any type used to transfer additional details
        /// about the ping.
        #[serde(default)]
        payload: Option<Value>,
    },
    /// The response to a server `Ping`.
    Pong {
        /// Optional parameters of any type used to transfer additional details
        /// about the pong.
        #[serde(default)]
        payload: Option<Value>,
    },
    /// Requests an operation specified in the message payload.
    Subscribe {
        /// The id of the operation. This can be anything, but must be unique
        /// per connection. If there are other in-flight operations with the
        /// same id, the message will cause an error.
        id: String,

        /// The query, variables, and operation name.
        payload: SubscribePayload,
    },
    /// Indicates that the client has stopped listening and wants to complete
    /// the subscription.
    Complete {
        /// The id of the operation to stop.
        id: String,
    },
}
