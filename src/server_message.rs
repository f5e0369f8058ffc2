use serde::Serialize;
use serde_json::Value;

/// ServerMessage defines the message types that the adapter sends to clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// ConnectionAck is sent in response to a client's ConnectionInit message
    /// if the connection was accepted.
    ConnectionAck {
        /// Optional payload, as returned by the connect hook.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Ping probes the client; applications can send it through the socket.
    Ping {
        /// Optional details about the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// The response to a client `Ping`.
    Pong {
        /// Optional details echoed back from the ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Next contains the result of an operation: once for queries and
    /// mutations, once per published event for subscriptions.
    Next {
        /// The id of the operation that the data is for.
        id: String,

        /// The execution result, shaped as `{data, errors?}` unless a hook
        /// substituted it.
        payload: Value,
    },
    /// Error contains errors that occur before execution, such as validation
    /// errors.
    Error {
        /// The id of the operation that triggered the error(s).
        id: String,

        /// The error(s), as an array of GraphQL error objects.
        payload: Value,
    },
    /// Complete indicates that no more data will be sent for the given
    /// operation.
    Complete {
        /// The id of the operation that has completed.
        id: String,
    },
    /// Close mimics a WebSocket close for runtimes whose gateway cannot attach
    /// a code and reason: the frame is posted to the client right before the
    /// gateway is asked to drop the connection.
    Close {
        /// The close code.
        code: u16,

        /// A message describing the reason for the connection closing.
        reason: String,
    },
}
