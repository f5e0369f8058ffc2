//! The fan-out publisher.
//!
//! `publish(topic, payload)` resolves the topic's subscribers and pushes one
//! framed `next` message to each underlying connection. Delivery failures
//! never fail the publish: a gateway that reports the connection gone (HTTP
//! 410) triggers a registry disconnect for it, anything else is logged and
//! the remaining channels still get their message.

use std::sync::Arc;

use futures::future;
use serde_json::{json, Value};

use crate::{
    client_message::SubscribePayload,
    error::Error,
    executor::SchemaExecutor,
    gateway::{Gateway, GatewayError},
    registry::Registry,
    server_message::ServerMessage,
    socket::encode_message,
    store::Store,
    JsonTransform,
};

/// Publishes payloads to every subscriber of a topic.
///
/// Built once, next to the [`Registry`] it resolves subscribers from. Two
/// framing modes exist, selected at construction: raw forwarding wraps the
/// published payload as `{data: payload}` verbatim; with an executor
/// attached, each delivery re-executes the stored subscribe operation with
/// the payload as root value, letting resolvers shape per-subscription data.
#[derive(Clone)]
pub struct Publisher {
    registry: Registry,
    store: Arc<dyn Store>,
    gateway: Arc<dyn Gateway>,
    executor: Option<Arc<dyn SchemaExecutor>>,
    replacer: Option<JsonTransform>,
}

impl Publisher {
    /// Creates a raw-forwarding publisher.
    pub fn new(registry: Registry, store: Arc<dyn Store>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            registry,
            store,
            gateway,
            executor: None,
            replacer: None,
        }
    }

    /// Switches the publisher to schema-aware framing.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn SchemaExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Passes every outbound frame through `replacer` before encoding.
    #[must_use]
    pub fn with_replacer(mut self, replacer: JsonTransform) -> Self {
        self.replacer = Some(replacer);
        self
    }

    /// Delivers `payload` to every subscriber of `topic`.
    ///
    /// Fails only on caller errors (an empty topic) or on failure to read the
    /// subscriber set; per-delivery failures are recovered from as described
    /// on the type.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<(), Error> {
        if topic.is_empty() {
            return Err(Error::InvalidTopic);
        }
        let channels = self.registry.get_channels(topic).await?;
        if channels.is_empty() {
            return Ok(());
        }

        let sends = channels.iter().map(|(connection_id, subscription_id)| {
            let payload = payload.clone();
            async move {
                let Some(frame) = self.frame(subscription_id, payload).await else {
                    return Ok(());
                };
                self.gateway
                    .post_to_connection(connection_id, frame.as_bytes())
                    .await
                    .map_err(|err| (connection_id.as_str(), err))
            }
        });

        for (connection_id, err) in future::join_all(sends)
            .await
            .into_iter()
            .filter_map(Result::err)
        {
            self.recover(connection_id, err).await;
        }
        Ok(())
    }

    /// Frames one delivery. Returns [`None`] when the frame cannot be
    /// produced; the failure is logged and the delivery skipped.
    async fn frame(&self, subscription_id: &str, payload: Value) -> Option<String> {
        let next_payload = match self.shape(subscription_id, payload).await {
            Ok(shaped) => shaped,
            Err(err) => {
                tracing::warn!(
                    subscription_id,
                    error = %err,
                    "failed to shape event for subscription; skipping delivery",
                );
                return None;
            }
        };
        let message = ServerMessage::Next {
            id: subscription_id.into(),
            payload: next_payload,
        };
        match encode_message(self.replacer.as_ref(), &message) {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                tracing::warn!(subscription_id, error = %err, "failed to encode event frame");
                None
            }
        }
    }

    async fn shape(&self, subscription_id: &str, payload: Value) -> Result<Value, Error> {
        if let Some(executor) = &self.executor {
            let record_key = self.registry.keys().subscription_record(subscription_id);
            if let Some(raw) = self.store.read_value(&record_key).await? {
                let record: SubscribePayload = serde_json::from_str(&raw)?;
                let result = executor
                    .execute_with_root(&record, payload)
                    .await
                    .map_err(Error::Execution)?;
                return Ok(result.into_payload());
            }
        }
        Ok(json!({ "data": payload }))
    }

    async fn recover(&self, connection_id: &str, err: GatewayError) {
        if err.is_gone() {
            tracing::debug!(connection_id, "connection gone; removing its registrations");
            if let Err(cleanup_err) = self.registry.disconnect(connection_id).await {
                tracing::warn!(
                    connection_id,
                    error = %cleanup_err,
                    "failed to clean up gone connection",
                );
            }
        } else {
            tracing::warn!(connection_id, error = %err, "failed to deliver event");
        }
    }
}
