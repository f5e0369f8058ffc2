//! The GraphQL execution seam.
//!
//! Document parsing, validation, and execution are collaborators of the
//! adapter, not part of it. [`SchemaExecutor`] defines exactly what the
//! protocol machine consumes: classify an operation, execute a query or
//! mutation, or resolve the root field of a subscription. It never drives
//! the standard subscribe-iterator path, since no invocation outlives a
//! frame.
//!
//! A subscription resolver returns [`ResolvedField`]: either a
//! [`SubscriptionChannel`] naming the topics to register the subscription
//! under (the machine performs the registration), or one immediate result.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::client_message::SubscribePayload;

/// A boxed error from an executor or hook.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The kind of operation a subscribe payload names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    /// A query, executed once.
    Query,
    /// A mutation, executed once.
    Mutation,
    /// A subscription, resolved to a channel or an immediate result.
    Subscription,
}

/// Why an operation could not be prepared.
#[derive(Debug)]
pub enum PrepareFailure {
    /// Parse or validation errors, emitted to the client as an `error`
    /// message.
    Errors(Vec<Value>),
    /// The document does not identify an operation to run.
    NoOperation,
}

/// The arguments of one execution, assembled by the machine or returned
/// directly by the subscribe hook.
#[derive(Clone, Debug)]
pub struct ExecutionArgs {
    /// The classified operation kind.
    pub operation: OperationKind,

    /// The client's verbatim subscribe payload.
    pub payload: SubscribePayload,

    /// The root value, defaulted from the configured per-operation roots when
    /// the hook did not supply one.
    pub root_value: Option<Value>,

    /// The context value, defaulted from the configured context when the hook
    /// did not supply one.
    pub context_value: Option<Value>,
}

/// The outcome of executing an operation: data plus any field errors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionResult {
    /// The result data.
    pub data: Value,

    /// Errors that occurred during execution. Parse and validation errors are
    /// not carried here; they are sent via `error` messages.
    pub errors: Vec<Value>,
}

impl ExecutionResult {
    /// Shapes the result as a `next` payload: `{data, errors?}`.
    pub fn into_payload(self) -> Value {
        let mut payload = Map::new();
        payload.insert("data".into(), self.data);
        if !self.errors.is_empty() {
            payload.insert("errors".into(), Value::Array(self.errors));
        }
        Value::Object(payload)
    }
}

/// The fan-out address a subscription resolver returns instead of an event
/// stream: published payloads on any of the listed topics are delivered to
/// the subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionChannel {
    /// The topics to register the subscription under.
    pub topics: Vec<String>,
}

/// What the root subscription field resolved to.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedField {
    /// A channel to register; deliveries arrive via later publishes.
    Channel(SubscriptionChannel),
    /// A single immediate result; the operation finishes right away.
    Value(ExecutionResult),
}

/// The GraphQL collaborator the protocol machine and the schema-aware
/// publisher drive.
#[async_trait]
pub trait SchemaExecutor: Send + Sync + 'static {
    /// Parses and validates the payload's document and classifies the
    /// operation it names.
    async fn prepare(&self, payload: &SubscribePayload) -> Result<OperationKind, PrepareFailure>;

    /// Executes a query or mutation to completion. Field errors belong in the
    /// returned result, not in an `Err`.
    async fn execute(&self, args: &ExecutionArgs) -> Result<ExecutionResult, BoxError>;

    /// Resolves only the root subscription field with the prepared arguments.
    async fn resolve_subscription(&self, args: &ExecutionArgs) -> Result<ResolvedField, BoxError>;

    /// Re-executes a stored operation against a published event payload as
    /// the root value, letting resolvers shape per-subscription data. Runs
    /// with an empty context.
    async fn execute_with_root(
        &self,
        payload: &SubscribePayload,
        root: Value,
    ) -> Result<ExecutionResult, BoxError>;
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_next_payload_shape() {
        let bare = ExecutionResult {
            data: json!({"messaged": "hi"}),
            errors: vec![],
        };
        assert_eq!(bare.into_payload(), json!({"data": {"messaged": "hi"}}));

        let with_errors = ExecutionResult {
            data: Value::Null,
            errors: vec![json!({"message": "boom"})],
        };
        assert_eq!(
            with_errors.into_payload(),
            json!({"data": null, "errors": [{"message": "boom"}]}),
        );
    }
}
