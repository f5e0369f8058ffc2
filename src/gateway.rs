use async_trait::async_trait;
use thiserror::Error;

/// An error reported by the gateway client.
///
/// The transport exposes an HTTP status where one is known; 410 means the
/// connection is permanently gone.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("gateway error: {message}")]
pub struct GatewayError {
    /// The underlying HTTP status, if the transport exposed one.
    pub status: Option<u16>,

    /// A human-readable description.
    pub message: String,
}

impl GatewayError {
    /// Creates an error with the given status and message.
    pub fn new(status: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }

    /// The error a gateway reports for a permanently closed connection.
    pub fn gone() -> Self {
        Self::new(410, "connection gone")
    }

    /// Whether the connection this error was observed on is permanently
    /// closed.
    pub fn is_gone(&self) -> bool {
        self.status == Some(410)
    }
}

/// The outbound WebSocket gateway: the management surface through which a
/// request/response runtime pushes frames to, and drops, client sockets.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Delivers `data` to the client behind `connection_id`.
    async fn post_to_connection(&self, connection_id: &str, data: &[u8])
        -> Result<(), GatewayError>;

    /// Asks the gateway to close the underlying socket.
    async fn delete_connection(&self, connection_id: &str) -> Result<(), GatewayError>;
}
