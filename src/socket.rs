//! The per-invocation view over one connection.
//!
//! A socket is re-created for every invocation and holds no cross-invocation
//! state: the context is loaded lazily from the store and memoized, writes to
//! it queue up in the tracked wrapper, and `flush` pushes them out before the
//! invocation acknowledges.

use std::sync::Arc;

use crate::{
    context::{ConnectionContext, ContextStore, TrackedContext},
    error::Error,
    gateway::Gateway,
    server_message::ServerMessage,
    JsonTransform,
};

/// A per-invocation view over one connection.
///
/// Obtained from [`Server::socket`](crate::Server::socket) (the protocol
/// machine builds its own); useful to applications that want to push frames
/// such as a [`ServerMessage::Ping`] to a connection they know about.
pub struct Socket {
    connection_id: String,
    gateway: Arc<dyn Gateway>,
    context_store: ContextStore,
    replacer: Option<JsonTransform>,
    tracked: Option<TrackedContext>,
}

/// Encodes an outbound message, passing it through the configured replacer.
pub(crate) fn encode_message(
    replacer: Option<&JsonTransform>,
    message: &ServerMessage,
) -> Result<String, serde_json::Error> {
    let Some(replace) = replacer else {
        return serde_json::to_string(message);
    };
    let value = replace(serde_json::to_value(message)?);
    serde_json::to_string(&value)
}

impl Socket {
    pub(crate) fn new(
        connection_id: impl Into<String>,
        gateway: Arc<dyn Gateway>,
        context_store: ContextStore,
        replacer: Option<JsonTransform>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            gateway,
            context_store,
            replacer,
            tracked: None,
        }
    }

    /// The id of the connection this socket writes to.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The connection's context, loaded on first use and memoized for the
    /// rest of the invocation.
    pub async fn context(&mut self) -> Result<&mut TrackedContext, Error> {
        let tracked = match self.tracked.take() {
            Some(tracked) => tracked,
            None => TrackedContext::new(self.context_store.load(&self.connection_id).await?),
        };
        Ok(self.tracked.insert(tracked))
    }

    /// Replaces the stored context wholesale, bypassing change tracking.
    pub(crate) async fn create_context(&mut self, ctx: ConnectionContext) -> Result<(), Error> {
        self.context_store.create(&self.connection_id, &ctx).await?;
        self.tracked = Some(TrackedContext::new(ctx));
        Ok(())
    }

    /// Frames a message as JSON and posts it to the connection.
    pub async fn send(&self, message: &ServerMessage) -> Result<(), Error> {
        let encoded = encode_message(self.replacer.as_ref(), message)?;
        self.gateway
            .post_to_connection(&self.connection_id, encoded.as_bytes())
            .await?;
        Ok(())
    }

    /// Posts already-framed text to the connection unchanged.
    pub async fn send_text(&self, text: &str) -> Result<(), Error> {
        self.gateway
            .post_to_connection(&self.connection_id, text.as_bytes())
            .await?;
        Ok(())
    }

    /// Posts a synthetic close frame to the client, then asks the gateway to
    /// drop the connection. A connection that is already gone is not an
    /// error.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        let frame = ServerMessage::Close {
            code,
            reason: reason.into(),
        };
        if let Err(err) = self.send(&frame).await {
            match err {
                Error::Gateway(ref gateway_err) if gateway_err.is_gone() => {}
                other => return Err(other),
            }
        }
        match self.gateway.delete_connection(&self.connection_id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_gone() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persists all pending context changes.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if let Some(tracked) = &mut self.tracked {
            self.context_store.flush(&self.connection_id, tracked).await?;
        }
        Ok(())
    }
}
