//! Implementation of the [`graphql-transport-ws` GraphQL over WebSocket
//! Protocol][proto] for stateless request/response gateway runtimes.
//!
//! A traditional GraphQL WebSocket server holds the socket and its
//! per-connection state in memory. Behind a request/response gateway there is
//! nothing to hold: every frame arrives as an independent invocation, possibly
//! concurrently with others for the same connection. This crate externalizes
//! all of that state into a shared key-value store (the protocol context as
//! a flattened hash, the topic/subscription/connection routing index as sets)
//! and reconciles it atomically, so any fleet member can handle any frame.
//!
//! The pieces:
//!
//! - [`Server`] dispatches one gateway event per invocation and drives the
//!   protocol state machine.
//! - [`Publisher`] fans a published payload out to every subscriber of a
//!   topic, recovering from connections that are already gone.
//! - [`Store`], [`Gateway`], and [`SchemaExecutor`] are the seams to the
//!   key-value store, the outbound WebSocket gateway, and GraphQL execution.
//! - [`Hooks`] lets the application observe and steer the protocol:
//!   authentication on connect, argument substitution on subscribe, payload
//!   substitution per frame, completion and close notifications.
//!
//! Subscription resolvers in this model do not return event streams. They
//! return a [`SubscriptionChannel`] naming the topics to register the
//! subscription under, and later publishes to those topics are delivered as
//! `next` frames without re-entering the resolver (unless schema-aware
//! framing is enabled on the publisher).
//!
//! [proto]: https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod client_message;
mod codec;
mod context;
mod emitter;
mod error;
mod event;
mod executor;
mod gateway;
mod keys;
mod protocol;
mod pubsub;
mod registry;
mod server_message;
mod socket;
mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use self::{
    client_message::{ClientMessage, SubscribePayload},
    context::{ConnectionContext, TrackedContext},
    error::Error,
    event::{EventType, GatewayEvent, GatewayResponse},
    executor::{
        BoxError, ExecutionArgs, ExecutionResult, OperationKind, PrepareFailure, ResolvedField,
        SchemaExecutor, SubscriptionChannel,
    },
    gateway::{Gateway, GatewayError},
    keys::KeySpace,
    protocol::{Server, ServerOptions},
    pubsub::Publisher,
    registry::Registry,
    server_message::ServerMessage,
    socket::Socket,
    store::{MemoryStore, Store, StoreError},
};
#[cfg(feature = "redis-store")]
pub use self::store::RedisStore;

/// The subprotocol this crate implements.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// The legacy subprotocol, accepted at negotiation; message semantics always
/// follow [`GRAPHQL_TRANSPORT_WS_PROTOCOL`].
pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// A transformation applied to outbound frames before encoding (a replacer)
/// or to inbound frames after parsing (a reviver).
pub type JsonTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// What the connect hook decided about a ConnectionInit message.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectDecision {
    /// Accept the connection; the payload, if any, rides on the ConnectionAck
    /// frame.
    Accept(Option<Value>),
    /// Reject the connection; the socket is closed with 4403 Forbidden.
    Reject,
}

/// What the subscribe hook decided about a Subscribe message.
#[derive(Clone, Debug)]
pub enum SubscribeOutcome {
    /// Prepare and execute the client's payload normally.
    Continue,
    /// Emit these GraphQL errors and stop.
    Errors(Vec<Value>),
    /// Skip preparation and execute with these arguments.
    Args(ExecutionArgs),
}

/// Default root values injected into execution arguments that do not carry
/// their own.
#[derive(Clone, Debug, Default)]
pub struct Roots {
    /// The root value for queries.
    pub query: Option<Value>,
    /// The root value for mutations.
    pub mutation: Option<Value>,
    /// The root value for subscriptions.
    pub subscription: Option<Value>,
}

impl Roots {
    /// The configured root value for the given operation kind.
    pub fn for_operation(&self, kind: OperationKind) -> Option<&Value> {
        match kind {
            OperationKind::Query => self.query.as_ref(),
            OperationKind::Mutation => self.mutation.as_ref(),
            OperationKind::Subscription => self.subscription.as_ref(),
        }
    }
}

/// The application hooks the protocol machine calls as it reacts to events.
///
/// Every method has a no-op default, so implementations override only what
/// they care about. Hook failures fail the invocation, except where a method
/// documents otherwise.
#[allow(unused_variables)]
#[async_trait]
pub trait Hooks: Send + Sync + 'static {
    /// Called when a ConnectionInit message is received, before the
    /// connection is acknowledged. The context is mutable so the hook can
    /// stash application data in `extra`.
    async fn on_connect(&self, ctx: &mut TrackedContext) -> Result<ConnectDecision, BoxError> {
        Ok(ConnectDecision::Accept(None))
    }

    /// Called when a Subscribe message passes the protocol checks, before the
    /// operation is prepared.
    async fn on_subscribe(
        &self,
        ctx: &mut TrackedContext,
        id: &str,
        payload: &SubscribePayload,
    ) -> Result<SubscribeOutcome, BoxError> {
        Ok(SubscribeOutcome::Continue)
    }

    /// Called before each `next` frame; a returned value replaces the frame's
    /// payload.
    async fn on_next(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        result: &ExecutionResult,
    ) -> Result<Option<Value>, BoxError> {
        Ok(None)
    }

    /// Called before each `error` frame; a returned value replaces the
    /// frame's payload.
    async fn on_error(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        errors: &[Value],
    ) -> Result<Option<Value>, BoxError> {
        Ok(None)
    }

    /// Called when an operation completes: the client sent Complete, the
    /// owning connection disconnected, or an immediate result finished the
    /// operation. `payload` is the stored subscribe payload, when one exists.
    async fn on_complete(
        &self,
        ctx: &ConnectionContext,
        id: &str,
        payload: Option<&SubscribePayload>,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called on DISCONNECT for connections that had been acknowledged.
    async fn on_disconnect(
        &self,
        ctx: &ConnectionContext,
        code: u16,
        reason: &str,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called on every DISCONNECT, acknowledged or not, after all other
    /// cleanup hooks.
    async fn on_close(
        &self,
        ctx: &ConnectionContext,
        code: u16,
        reason: &str,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The do-nothing [`Hooks`] implementation, used when none is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {}

/// Handles MESSAGE events whose route is not `$default`.
#[async_trait]
pub trait RouteHandler: Send + Sync + 'static {
    /// Produces the invocation's response for the routed event.
    async fn handle(&self, event: &GatewayEvent) -> Result<GatewayResponse, BoxError>;
}
