//! The protocol state machine.
//!
//! One [`Server`] is built at cold start and reused across invocations; each
//! call to [`Server::handle_event`] handles exactly one gateway event. The
//! connection's protocol state (`NEW → INIT_RECEIVED → ACKNOWLEDGED`) lives
//! in its stored context, so every branch re-reads the flags instead of
//! trusting anything in memory, and every registry mutation is atomic;
//! concurrent invocations for the same connection interleave safely.

use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Value};

use crate::{
    client_message::{ClientMessage, SubscribePayload},
    context::{ConnectionContext, ContextStore},
    emitter::Emitter,
    error::Error,
    event::{EventType, GatewayEvent, GatewayResponse},
    executor::{ExecutionArgs, OperationKind, PrepareFailure, ResolvedField, SchemaExecutor},
    gateway::Gateway,
    keys::KeySpace,
    pubsub::Publisher,
    registry::Registry,
    server_message::ServerMessage,
    socket::Socket,
    store::Store,
    ConnectDecision, Hooks, JsonTransform, NoopHooks, RouteHandler, Roots, SubscribeOutcome,
    GRAPHQL_TRANSPORT_WS_PROTOCOL, GRAPHQL_WS_PROTOCOL,
};

const DEFAULT_ROUTE: &str = "$default";
const SUPPORTED_SUBPROTOCOLS: [&str; 2] = [GRAPHQL_TRANSPORT_WS_PROTOCOL, GRAPHQL_WS_PROTOCOL];

/// Configuration for a [`Server`].
pub struct ServerOptions {
    /// The shared key-value store carrying all connection state.
    pub store: Arc<dyn Store>,

    /// The outbound WebSocket gateway client.
    pub gateway: Arc<dyn Gateway>,

    /// The GraphQL executor.
    pub executor: Arc<dyn SchemaExecutor>,

    /// The application hooks.
    pub hooks: Arc<dyn Hooks>,

    /// Handler for MESSAGE events on routes other than `$default`. Without
    /// one, such events take the default protocol path.
    pub route_handler: Option<Arc<dyn RouteHandler>>,

    /// The prefix of the fan-out index keys.
    pub key_prefix: String,

    /// Whether the publisher re-executes stored operations per event instead
    /// of forwarding payloads raw.
    pub schema_aware_publish: bool,

    /// Applied to every outbound frame before encoding.
    pub json_message_replacer: Option<JsonTransform>,

    /// Applied to every inbound frame after parsing.
    pub json_message_reviver: Option<JsonTransform>,

    /// Default root values for operations that do not carry their own.
    pub roots: Roots,

    /// Default context value for operations that do not carry their own.
    pub context_value: Option<Value>,
}

impl ServerOptions {
    /// Constructs options with the required collaborators and defaults for
    /// everything else.
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn Gateway>,
        executor: Arc<dyn SchemaExecutor>,
    ) -> Self {
        Self {
            store,
            gateway,
            executor,
            hooks: Arc::new(NoopHooks),
            route_handler: None,
            key_prefix: "pubsub".into(),
            schema_aware_publish: false,
            json_message_replacer: None,
            json_message_reviver: None,
            roots: Roots::default(),
            context_value: None,
        }
    }

    /// Specifies the application hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Specifies the handler for non-default MESSAGE routes.
    #[must_use]
    pub fn with_route_handler(mut self, handler: Arc<dyn RouteHandler>) -> Self {
        self.route_handler = Some(handler);
        self
    }

    /// Specifies the fan-out index key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Makes the publisher re-execute stored operations per published event.
    #[must_use]
    pub fn with_schema_aware_publish(mut self) -> Self {
        self.schema_aware_publish = true;
        self
    }

    /// Specifies the outbound frame replacer.
    #[must_use]
    pub fn with_json_message_replacer(mut self, replacer: JsonTransform) -> Self {
        self.json_message_replacer = Some(replacer);
        self
    }

    /// Specifies the inbound frame reviver.
    #[must_use]
    pub fn with_json_message_reviver(mut self, reviver: JsonTransform) -> Self {
        self.json_message_reviver = Some(reviver);
        self
    }

    /// Specifies default root values per operation kind.
    #[must_use]
    pub fn with_roots(mut self, roots: Roots) -> Self {
        self.roots = roots;
        self
    }

    /// Specifies the default context value.
    #[must_use]
    pub fn with_context_value(mut self, context_value: Value) -> Self {
        self.context_value = Some(context_value);
        self
    }
}

/// The event-driven protocol adapter.
pub struct Server {
    options: ServerOptions,
    registry: Registry,
    context_store: ContextStore,
    publisher: Arc<Publisher>,
}

impl Server {
    /// Builds the adapter and its publisher. Intended to run once at cold
    /// start; the value is reused across invocations.
    pub fn new(options: ServerOptions) -> Self {
        let keys = KeySpace::new(options.key_prefix.clone());
        let registry = Registry::new(options.store.clone(), keys.clone());
        let context_store = ContextStore::new(options.store.clone(), keys);

        let mut publisher = Publisher::new(
            registry.clone(),
            options.store.clone(),
            options.gateway.clone(),
        );
        if options.schema_aware_publish {
            publisher = publisher.with_executor(options.executor.clone());
        }
        if let Some(replacer) = options.json_message_replacer.clone() {
            publisher = publisher.with_replacer(replacer);
        }

        Self {
            options,
            registry,
            context_store,
            publisher: Arc::new(publisher),
        }
    }

    /// The publisher delivering to this adapter's subscribers.
    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    /// The registry this adapter routes through.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A fresh socket over the given connection, for pushing frames outside
    /// the protocol flow.
    pub fn socket(&self, connection_id: &str) -> Socket {
        Socket::new(
            connection_id,
            self.options.gateway.clone(),
            self.context_store.clone(),
            self.options.json_message_replacer.clone(),
        )
    }

    /// Handles one gateway event and produces the invocation's response.
    ///
    /// All context changes are flushed before a 200 is returned; an `Err`
    /// means the invocation must be failed so the host can retry it.
    pub async fn handle_event(&self, event: GatewayEvent) -> Result<GatewayResponse, Error> {
        match event.event_type {
            EventType::Connect => self.handle_connect(&event).await,
            EventType::Disconnect => self.handle_disconnect(&event).await,
            EventType::Message => self.handle_message(&event).await,
        }
    }

    async fn handle_connect(&self, event: &GatewayEvent) -> Result<GatewayResponse, Error> {
        let offers = event.subprotocol_offers();
        let Some(protocol) = offers
            .iter()
            .copied()
            .find(|offer| SUPPORTED_SUBPROTOCOLS.contains(offer))
        else {
            tracing::debug!(?offers, "rejecting connection with no acceptable subprotocol");
            let body = json!({
                "error": "unsupported subprotocol",
                "message": "Subprotocol not acceptable",
                "supportedProtocol": null,
            });
            return Ok(GatewayResponse {
                status_code: 400,
                headers: Some(HashMap::from([(
                    "Content-Type".into(),
                    "application/json".into(),
                )])),
                body: Some(body.to_string()),
            });
        };

        let extra = event
            .request_context
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut socket = self.socket(&event.connection_id);
        socket.create_context(ConnectionContext::with_extra(extra)).await?;
        socket.flush().await?;

        Ok(GatewayResponse {
            status_code: 200,
            headers: Some(HashMap::from([(
                "Sec-WebSocket-Protocol".into(),
                protocol.into(),
            )])),
            body: None,
        })
    }

    async fn handle_message(&self, event: &GatewayEvent) -> Result<GatewayResponse, Error> {
        if let (Some(route), Some(handler)) =
            (event.route_key.as_deref(), self.options.route_handler.as_ref())
        {
            if route != DEFAULT_ROUTE {
                return handler.handle(event).await.map_err(Error::Hook);
            }
        }

        let mut socket = self.socket(&event.connection_id);
        let message = match event.body.as_deref().map(|body| self.parse_frame(body)) {
            Some(Ok(message)) => message,
            _ => {
                socket.close(4400, "Invalid message received").await?;
                socket.flush().await?;
                return Ok(GatewayResponse::ok());
            }
        };

        match message {
            ClientMessage::ConnectionInit { payload } => {
                self.handle_connection_init(&mut socket, payload).await?
            }
            ClientMessage::Ping { payload } => {
                socket.send(&ServerMessage::Pong { payload }).await?
            }
            ClientMessage::Pong { .. } => {}
            ClientMessage::Subscribe { id, payload } => {
                self.handle_subscribe(&mut socket, &id, payload).await?
            }
            ClientMessage::Complete { id } => self.handle_complete(&mut socket, &id).await?,
        }

        socket.flush().await?;
        Ok(GatewayResponse::ok())
    }

    fn parse_frame(&self, body: &str) -> Result<ClientMessage, serde_json::Error> {
        let mut value: Value = serde_json::from_str(body)?;
        if let Some(revive) = &self.options.json_message_reviver {
            value = revive(value);
        }
        serde_json::from_value(value)
    }

    async fn handle_connection_init(
        &self,
        socket: &mut Socket,
        params: Option<Value>,
    ) -> Result<(), Error> {
        if socket.context().await?.connection_init_received {
            socket.close(4429, "Too many initialisation requests").await?;
            return Ok(());
        }

        let decision = self
            .options
            .hooks
            .on_connect(socket.context().await?)
            .await
            .map_err(Error::Hook)?;

        match decision {
            ConnectDecision::Reject => socket.close(4403, "Forbidden").await?,
            ConnectDecision::Accept(ack_payload) => {
                let ctx = socket.context().await?;
                ctx.set_connection_init_received(true);
                ctx.set_acknowledged(true);
                ctx.set_connection_params(params);
                socket
                    .send(&ServerMessage::ConnectionAck {
                        payload: ack_payload,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_subscribe(
        &self,
        socket: &mut Socket,
        id: &str,
        payload: SubscribePayload,
    ) -> Result<(), Error> {
        if !socket.context().await?.acknowledged {
            socket.close(4401, "Unauthorized").await?;
            return Ok(());
        }
        if self.registry.is_registered(id).await? {
            socket
                .close(4409, &format!("Subscriber for {id} already exists"))
                .await?;
            return Ok(());
        }

        // The payload record outlives this invocation: completion hooks and
        // schema-aware publishes read it back.
        let record_key = self.registry.keys().subscription_record(id);
        self.options
            .store
            .write_value(&record_key, &serde_json::to_string(&payload)?)
            .await?;

        let outcome = self
            .options
            .hooks
            .on_subscribe(socket.context().await?, id, &payload)
            .await
            .map_err(Error::Hook)?;
        let ctx = ConnectionContext::clone(socket.context().await?);

        let emitter = Emitter::new(socket, self.options.hooks.as_ref(), &ctx);
        let Some(mut args) = self.build_args(&emitter, id, &payload, outcome).await? else {
            self.options.store.delete(&[record_key]).await?;
            return Ok(());
        };
        if args.root_value.is_none() {
            args.root_value = self.options.roots.for_operation(args.operation).cloned();
        }
        if args.context_value.is_none() {
            args.context_value = self.options.context_value.clone();
        }

        match args.operation {
            OperationKind::Subscription => {
                match self.options.executor.resolve_subscription(&args).await {
                    Ok(ResolvedField::Channel(channel)) => {
                        self.registry
                            .register(socket.connection_id(), id, &channel.topics)
                            .await?;
                    }
                    Ok(ResolvedField::Value(result)) => {
                        emitter.next(id, result).await?;
                        emitter
                            .complete(ctx.subscriptions.contains_key(id), id, Some(&payload))
                            .await?;
                        self.options.store.delete(&[record_key]).await?;
                    }
                    Err(err) => {
                        if let Err(cleanup_err) =
                            self.options.store.delete(&[record_key]).await
                        {
                            tracing::warn!(
                                subscription_id = id,
                                error = %cleanup_err,
                                "failed to remove payload record of failed subscribe",
                            );
                        }
                        socket.close(4400, &err.to_string()).await?;
                        return Err(Error::Resolver(err));
                    }
                }
            }
            OperationKind::Query | OperationKind::Mutation => {
                let result = match self.options.executor.execute(&args).await {
                    Ok(result) => result,
                    Err(err) => {
                        if let Err(cleanup_err) =
                            self.options.store.delete(&[record_key]).await
                        {
                            tracing::warn!(
                                subscription_id = id,
                                error = %cleanup_err,
                                "failed to remove payload record of failed subscribe",
                            );
                        }
                        return Err(Error::Execution(err));
                    }
                };
                emitter.next(id, result).await?;
                emitter
                    .complete(ctx.subscriptions.contains_key(id), id, Some(&payload))
                    .await?;
                self.options.store.delete(&[record_key]).await?;
            }
        }
        Ok(())
    }

    /// Turns the subscribe hook's outcome into execution arguments, emitting
    /// errors and returning [`None`] when the operation should not run.
    async fn build_args(
        &self,
        emitter: &Emitter<'_>,
        id: &str,
        payload: &SubscribePayload,
        outcome: SubscribeOutcome,
    ) -> Result<Option<ExecutionArgs>, Error> {
        match outcome {
            SubscribeOutcome::Errors(errors) => {
                emitter.error(id, errors).await?;
                Ok(None)
            }
            SubscribeOutcome::Args(args) => Ok(Some(args)),
            SubscribeOutcome::Continue => match self.options.executor.prepare(payload).await {
                Ok(operation) => Ok(Some(ExecutionArgs {
                    operation,
                    payload: payload.clone(),
                    root_value: None,
                    context_value: None,
                })),
                Err(PrepareFailure::Errors(errors)) => {
                    emitter.error(id, errors).await?;
                    Ok(None)
                }
                Err(PrepareFailure::NoOperation) => {
                    emitter
                        .error(id, vec![json!({"message": "Unable to identify operation"})])
                        .await?;
                    Ok(None)
                }
            },
        }
    }

    async fn handle_complete(&self, socket: &mut Socket, id: &str) -> Result<(), Error> {
        self.registry.unregister(socket.connection_id(), id).await?;

        let record_key = self.registry.keys().subscription_record(id);
        let raw = self
            .options
            .store
            .read_value(&record_key)
            .await?
            .ok_or_else(|| Error::MissingSubscriptionRecord(id.to_string()))?;
        let payload: SubscribePayload = serde_json::from_str(&raw)?;

        let ctx = ConnectionContext::clone(socket.context().await?);
        self.options
            .hooks
            .on_complete(&ctx, id, Some(&payload))
            .await
            .map_err(Error::Hook)?;
        self.options.store.delete(&[record_key]).await?;
        Ok(())
    }

    async fn handle_disconnect(&self, event: &GatewayEvent) -> Result<GatewayResponse, Error> {
        let connection_id = event.connection_id.as_str();
        let code = event.disconnect_status_code.unwrap_or(1001);
        let reason = event.disconnect_reason.as_deref().unwrap_or("Going away");

        let mut socket = self.socket(connection_id);
        let ctx = ConnectionContext::clone(socket.context().await?);

        let subscriptions = self
            .registry
            .get_connection_subscriptions(connection_id)
            .await?;
        self.registry.disconnect(connection_id).await?;

        for id in &subscriptions {
            let record_key = self.registry.keys().subscription_record(id);
            match self.options.store.read_value(&record_key).await? {
                Some(raw) => {
                    match serde_json::from_str::<SubscribePayload>(&raw) {
                        Ok(payload) => self
                            .options
                            .hooks
                            .on_complete(&ctx, id, Some(&payload))
                            .await
                            .map_err(Error::Hook)?,
                        Err(err) => {
                            tracing::warn!(
                                subscription_id = %id,
                                error = %err,
                                "unreadable subscribe payload record; completing without it",
                            );
                            self.options
                                .hooks
                                .on_complete(&ctx, id, None)
                                .await
                                .map_err(Error::Hook)?;
                        }
                    }
                    self.options.store.delete(&[record_key]).await?;
                }
                None => {
                    self.options
                        .hooks
                        .on_complete(&ctx, id, None)
                        .await
                        .map_err(Error::Hook)?;
                }
            }
        }

        if ctx.acknowledged {
            self.options
                .hooks
                .on_disconnect(&ctx, code, reason)
                .await
                .map_err(Error::Hook)?;
        }
        self.options
            .hooks
            .on_close(&ctx, code, reason)
            .await
            .map_err(Error::Hook)?;

        socket.flush().await?;
        self.options
            .store
            .delete(&[self.registry.keys().context(connection_id)])
            .await?;
        Ok(GatewayResponse::ok())
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        executor::{BoxError, ExecutionResult, SubscriptionChannel},
        gateway::GatewayError,
        store::MemoryStore,
    };

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<(String, String)>>,
        deleted: Mutex<Vec<String>>,
        gone: Mutex<HashSet<String>>,
    }

    impl RecordingGateway {
        fn mark_gone(&self, connection_id: &str) {
            self.gone.lock().unwrap().insert(connection_id.into());
        }

        fn frames(&self, connection_id: &str) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(cid, _)| cid == connection_id)
                .filter_map(|(_, frame)| serde_json::from_str(frame).ok())
                .collect()
        }

        fn last_frame(&self, connection_id: &str) -> Value {
            self.frames(connection_id).pop().unwrap()
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Gateway for RecordingGateway {
        async fn post_to_connection(
            &self,
            connection_id: &str,
            data: &[u8],
        ) -> Result<(), GatewayError> {
            if self.gone.lock().unwrap().contains(connection_id) {
                return Err(GatewayError::gone());
            }
            self.sent.lock().unwrap().push((
                connection_id.into(),
                String::from_utf8(data.to_vec()).unwrap(),
            ));
            Ok(())
        }

        async fn delete_connection(&self, connection_id: &str) -> Result<(), GatewayError> {
            self.deleted.lock().unwrap().push(connection_id.into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubExecutor {
        resolved: HashMap<String, ResolvedField>,
        failures: HashSet<String>,
    }

    impl StubExecutor {
        fn channel(mut self, query: &str, topics: &[&str]) -> Self {
            self.resolved.insert(
                query.into(),
                ResolvedField::Channel(SubscriptionChannel {
                    topics: topics.iter().map(|t| t.to_string()).collect(),
                }),
            );
            self
        }

        fn immediate(mut self, query: &str, result: ExecutionResult) -> Self {
            self.resolved
                .insert(query.into(), ResolvedField::Value(result));
            self
        }

        fn failing(mut self, query: &str) -> Self {
            self.failures.insert(query.into());
            self
        }
    }

    #[async_trait]
    impl SchemaExecutor for StubExecutor {
        async fn prepare(
            &self,
            payload: &SubscribePayload,
        ) -> Result<OperationKind, PrepareFailure> {
            let query = payload.query.trim();
            if query == "invalid" {
                return Err(PrepareFailure::Errors(vec![json!({
                    "message": "Syntax Error",
                })]));
            }
            if query.is_empty() {
                return Err(PrepareFailure::NoOperation);
            }
            if query.starts_with("subscription") {
                Ok(OperationKind::Subscription)
            } else if query.starts_with("mutation") {
                Ok(OperationKind::Mutation)
            } else {
                Ok(OperationKind::Query)
            }
        }

        async fn execute(&self, args: &ExecutionArgs) -> Result<ExecutionResult, BoxError> {
            if self.failures.contains(args.payload.query.as_str()) {
                return Err("execution exploded".to_string().into());
            }
            Ok(ExecutionResult {
                data: json!({"context": 1}),
                errors: vec![],
            })
        }

        async fn resolve_subscription(
            &self,
            args: &ExecutionArgs,
        ) -> Result<ResolvedField, BoxError> {
            let query = args.payload.query.as_str();
            if self.failures.contains(query) {
                return Err("resolver exploded".to_string().into());
            }
            Ok(self.resolved.get(query).cloned().unwrap_or_else(|| {
                ResolvedField::Channel(SubscriptionChannel {
                    topics: vec!["broadcast".into()],
                })
            }))
        }

        async fn execute_with_root(
            &self,
            _payload: &SubscribePayload,
            root: Value,
        ) -> Result<ExecutionResult, BoxError> {
            Ok(ExecutionResult {
                data: root,
                errors: vec![],
            })
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl Hooks for RecordingHooks {
        async fn on_subscribe(
            &self,
            _ctx: &mut crate::TrackedContext,
            id: &str,
            _payload: &SubscribePayload,
        ) -> Result<SubscribeOutcome, BoxError> {
            self.record(format!("subscribe:{id}"));
            Ok(SubscribeOutcome::Continue)
        }

        async fn on_complete(
            &self,
            _ctx: &ConnectionContext,
            id: &str,
            payload: Option<&SubscribePayload>,
        ) -> Result<(), BoxError> {
            let query = payload.map(|p| p.query.as_str()).unwrap_or("-");
            self.record(format!("complete:{id}:{query}"));
            Ok(())
        }

        async fn on_disconnect(
            &self,
            _ctx: &ConnectionContext,
            code: u16,
            reason: &str,
        ) -> Result<(), BoxError> {
            self.record(format!("disconnect:{code}:{reason}"));
            Ok(())
        }

        async fn on_close(
            &self,
            _ctx: &ConnectionContext,
            code: u16,
            reason: &str,
        ) -> Result<(), BoxError> {
            self.record(format!("close:{code}:{reason}"));
            Ok(())
        }
    }

    struct Harness {
        server: Server,
        store: Arc<MemoryStore>,
        gateway: Arc<RecordingGateway>,
        hooks: Arc<RecordingHooks>,
    }

    fn harness(executor: StubExecutor) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let hooks = Arc::new(RecordingHooks::default());
        let server = Server::new(
            ServerOptions::new(store.clone(), gateway.clone(), Arc::new(executor))
                .with_hooks(hooks.clone()),
        );
        Harness {
            server,
            store,
            gateway,
            hooks,
        }
    }

    fn connect_event(connection_id: &str) -> GatewayEvent {
        GatewayEvent {
            event_type: EventType::Connect,
            route_key: Some("$connect".into()),
            connection_id: connection_id.into(),
            multi_value_headers: HashMap::from([(
                "Sec-WebSocket-Protocol".to_string(),
                vec!["graphql-transport-ws".to_string()],
            )]),
            body: None,
            disconnect_status_code: None,
            disconnect_reason: None,
            request_context: Some(json!({"connectedAt": 1})),
        }
    }

    fn message_event(connection_id: &str, frame: Value) -> GatewayEvent {
        raw_message_event(connection_id, &frame.to_string())
    }

    fn raw_message_event(connection_id: &str, body: &str) -> GatewayEvent {
        GatewayEvent {
            event_type: EventType::Message,
            route_key: Some(DEFAULT_ROUTE.into()),
            connection_id: connection_id.into(),
            multi_value_headers: HashMap::new(),
            body: Some(body.into()),
            disconnect_status_code: None,
            disconnect_reason: None,
            request_context: None,
        }
    }

    fn disconnect_event(connection_id: &str) -> GatewayEvent {
        GatewayEvent {
            event_type: EventType::Disconnect,
            route_key: Some("$disconnect".into()),
            connection_id: connection_id.into(),
            multi_value_headers: HashMap::new(),
            body: None,
            disconnect_status_code: None,
            disconnect_reason: None,
            request_context: None,
        }
    }

    async fn init(harness: &Harness, connection_id: &str) {
        let response = harness
            .server
            .handle_event(connect_event(connection_id))
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);

        let response = harness
            .server
            .handle_event(message_event(
                connection_id,
                json!({"type": "connection_init"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
    }

    async fn subscribe(harness: &Harness, connection_id: &str, id: &str, query: &str) {
        harness
            .server
            .handle_event(message_event(
                connection_id,
                json!({"type": "subscribe", "id": id, "payload": {"query": query}}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_negotiates_subprotocol() {
        let h = harness(StubExecutor::default());

        let response = h.server.handle_event(connect_event("A")).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.headers.unwrap().get("Sec-WebSocket-Protocol"),
            Some(&"graphql-transport-ws".to_string()),
        );

        // The fresh context snapshots the request metadata into `extra`.
        let fields = h.store.read_fields("graphql:connection:A").await.unwrap();
        assert_eq!(fields.get("connectionInitReceived").unwrap(), "__boolean__false");
        assert_eq!(fields.get("acknowledged").unwrap(), "__boolean__false");
        assert_eq!(fields.get("extra.connectedAt").unwrap(), "__number__1");
    }

    #[tokio::test]
    async fn test_connect_accepts_the_legacy_subprotocol() {
        let h = harness(StubExecutor::default());
        let mut event = connect_event("A");
        event.multi_value_headers = HashMap::from([(
            "sec-websocket-protocol".to_string(),
            vec!["graphql-ws".to_string()],
        )]);

        let response = h.server.handle_event(event).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.headers.unwrap().get("Sec-WebSocket-Protocol"),
            Some(&"graphql-ws".to_string()),
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_subprotocols() {
        let h = harness(StubExecutor::default());
        let mut event = connect_event("A");
        event.multi_value_headers = HashMap::from([(
            "Sec-WebSocket-Protocol".to_string(),
            vec!["soap".to_string()],
        )]);

        let response = h.server.handle_event(event).await.unwrap();

        assert_eq!(response.status_code, 400);
        let body: Value = serde_json::from_str(&response.body.unwrap()).unwrap();
        assert_eq!(body["supportedProtocol"], Value::Null);
        assert!(!h.store.key_exists("graphql:connection:A").await.unwrap());
    }

    #[tokio::test]
    async fn test_single_subscription_round_trip() {
        let h = harness(
            StubExecutor::default().channel("subscription{messaged}", &["messaged_broadcast"]),
        );

        h.server.handle_event(connect_event("A")).await.unwrap();
        h.server
            .handle_event(message_event(
                "A",
                json!({"type": "connection_init", "payload": {"token": "t"}}),
            ))
            .await
            .unwrap();

        assert_eq!(h.gateway.last_frame("A"), json!({"type": "connection_ack"}));
        let fields = h.store.read_fields("graphql:connection:A").await.unwrap();
        assert_eq!(fields.get("acknowledged").unwrap(), "__boolean__true");
        assert_eq!(fields.get("connectionParams.token").unwrap(), "t");

        subscribe(&h, "A", "s1", "subscription{messaged}").await;

        assert_eq!(
            h.store
                .set_members("pubsub:topic:messaged_broadcast")
                .await
                .unwrap(),
            vec!["pubsub:conn:A#pubsub:sub:s1"],
        );

        h.server
            .publisher()
            .publish("messaged_broadcast", json!("hi"))
            .await
            .unwrap();

        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "next", "id": "s1", "payload": {"data": "hi"}}),
        );
    }

    #[tokio::test]
    async fn test_subscribe_before_ack_is_unauthorized() {
        let h = harness(StubExecutor::default());

        h.server.handle_event(connect_event("B")).await.unwrap();
        subscribe(&h, "B", "s1", "subscription{messaged}").await;

        assert_eq!(
            h.gateway.last_frame("B"),
            json!({"type": "close", "code": 4401, "reason": "Unauthorized"}),
        );
        assert_eq!(h.gateway.deleted(), vec!["B"]);
        assert!(!h.store.key_exists("pubsub:sub:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_init_closes_4429() {
        let h = harness(StubExecutor::default());

        init(&h, "C").await;
        h.server
            .handle_event(message_event("C", json!({"type": "connection_init"})))
            .await
            .unwrap();

        assert_eq!(
            h.gateway.last_frame("C"),
            json!({"type": "close", "code": 4429, "reason": "Too many initialisation requests"}),
        );
        assert_eq!(h.gateway.deleted(), vec!["C"]);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_id_closes_4409() {
        let h = harness(StubExecutor::default().channel("subscription{messaged}", &["t"]));

        init(&h, "A").await;
        subscribe(&h, "A", "s1", "subscription{messaged}").await;
        subscribe(&h, "A", "s1", "subscription{messaged}").await;

        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "close", "code": 4409, "reason": "Subscriber for s1 already exists"}),
        );
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_everything() {
        let h = harness(
            StubExecutor::default()
                .channel("subscription{a}", &["t1", "t2"])
                .channel("subscription{b}", &["t2"]),
        );

        init(&h, "D").await;
        subscribe(&h, "D", "s1", "subscription{a}").await;
        subscribe(&h, "D", "s2", "subscription{b}").await;

        h.server.handle_event(disconnect_event("D")).await.unwrap();

        for key in [
            "pubsub:conn:D",
            "pubsub:sub:s1",
            "pubsub:sub:s2",
            "pubsub:topic:t1",
            "pubsub:topic:t2",
            "graphql:connection:D",
            "graphql:subscription:s1",
            "graphql:subscription:s2",
        ] {
            assert!(!h.store.key_exists(key).await.unwrap(), "{key} survived");
        }

        let events = h.hooks.events();
        assert_eq!(
            events,
            vec![
                "subscribe:s1",
                "subscribe:s2",
                "complete:s1:subscription{a}",
                "complete:s2:subscription{b}",
                "disconnect:1001:Going away",
                "close:1001:Going away",
            ],
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_ack_skips_the_disconnect_hook() {
        let h = harness(StubExecutor::default());

        h.server.handle_event(connect_event("A")).await.unwrap();
        let mut event = disconnect_event("A");
        event.disconnect_status_code = Some(1006);
        event.disconnect_reason = Some("Connection dropped".into());
        h.server.handle_event(event).await.unwrap();

        assert_eq!(h.hooks.events(), vec!["close:1006:Connection dropped"]);
    }

    #[tokio::test]
    async fn test_gone_connection_is_cleaned_up_by_publish() {
        let h = harness(StubExecutor::default().channel("subscription{messaged}", &["t"]));

        init(&h, "E").await;
        subscribe(&h, "E", "s1", "subscription{messaged}").await;
        h.gateway.mark_gone("E");

        h.server.publisher().publish("t", json!("x")).await.unwrap();

        assert!(h.server.registry().get_channels("t").await.unwrap().is_empty());
        assert!(!h.store.key_exists("pubsub:conn:E").await.unwrap());
        assert!(!h.store.key_exists("pubsub:sub:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_frames_close_4400() {
        let h = harness(StubExecutor::default());

        init(&h, "A").await;
        h.server
            .handle_event(raw_message_event("A", "not even json"))
            .await
            .unwrap();

        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "close", "code": 4400, "reason": "Invalid message received"}),
        );

        h.server
            .handle_event(message_event("A", json!({"type": "start", "id": "x"})))
            .await
            .unwrap();
        assert_eq!(h.gateway.last_frame("A")["code"], json!(4400));
    }

    #[tokio::test]
    async fn test_ping_echoes_payload() {
        let h = harness(StubExecutor::default());

        h.server.handle_event(connect_event("A")).await.unwrap();
        h.server
            .handle_event(message_event(
                "A",
                json!({"type": "ping", "payload": {"a": 1}}),
            ))
            .await
            .unwrap();

        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "pong", "payload": {"a": 1}}),
        );
    }

    #[tokio::test]
    async fn test_immediate_result_subscription_finishes_quietly() {
        let h = harness(StubExecutor::default().immediate(
            "subscription{once}",
            ExecutionResult {
                data: json!({"once": true}),
                errors: vec![],
            },
        ));

        init(&h, "A").await;
        subscribe(&h, "A", "s1", "subscription{once}").await;

        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "next", "id": "s1", "payload": {"data": {"once": true}}}),
        );
        // The completion hook fires, but no client frame follows and nothing
        // stays registered or recorded.
        assert!(h
            .hooks
            .events()
            .contains(&"complete:s1:subscription{once}".to_string()));
        assert!(!h.store.key_exists("graphql:subscription:s1").await.unwrap());
        assert!(!h.server.registry().is_registered("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_queries_execute_once() {
        let h = harness(StubExecutor::default());

        init(&h, "A").await;
        subscribe(&h, "A", "q1", "{context}").await;

        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "next", "id": "q1", "payload": {"data": {"context": 1}}}),
        );
        assert!(!h.store.key_exists("graphql:subscription:q1").await.unwrap());
    }

    #[tokio::test]
    async fn test_validation_errors_are_emitted() {
        let h = harness(StubExecutor::default());

        init(&h, "A").await;
        subscribe(&h, "A", "s1", "invalid").await;

        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "error", "id": "s1", "payload": [{"message": "Syntax Error"}]}),
        );
        assert!(!h.store.key_exists("graphql:subscription:s1").await.unwrap());
        assert!(!h.server.registry().is_registered("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_resolver_failure_closes_and_fails_the_invocation() {
        let h = harness(StubExecutor::default().failing("subscription{boom}"));

        init(&h, "A").await;
        let result = h
            .server
            .handle_event(message_event(
                "A",
                json!({"type": "subscribe", "id": "s1", "payload": {"query": "subscription{boom}"}}),
            ))
            .await;

        assert!(matches!(result, Err(Error::Resolver(_))));
        assert_eq!(
            h.gateway.last_frame("A"),
            json!({"type": "close", "code": 4400, "reason": "resolver exploded"}),
        );
        assert!(!h.store.key_exists("graphql:subscription:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_execution_failure_cleans_up_its_record() {
        let h = harness(StubExecutor::default().failing("{boom}"));

        init(&h, "A").await;
        let result = h
            .server
            .handle_event(message_event(
                "A",
                json!({"type": "subscribe", "id": "q1", "payload": {"query": "{boom}"}}),
            ))
            .await;

        assert!(matches!(result, Err(Error::Execution(_))));
        assert!(!h.store.key_exists("graphql:subscription:q1").await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_completes_subscriptions_with_corrupt_records() {
        let h = harness(StubExecutor::default().channel("subscription{messaged}", &["t"]));

        init(&h, "D").await;
        subscribe(&h, "D", "s1", "subscription{messaged}").await;
        h.store
            .write_value("graphql:subscription:s1", "not json")
            .await
            .unwrap();

        h.server.handle_event(disconnect_event("D")).await.unwrap();

        // The completion hook still fires, just without the lost payload.
        assert!(h.hooks.events().contains(&"complete:s1:-".to_string()));
        assert!(!h.store.key_exists("graphql:subscription:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_unregisters_and_notifies_the_hook() {
        let h = harness(StubExecutor::default().channel("subscription{messaged}", &["t"]));

        init(&h, "A").await;
        subscribe(&h, "A", "s1", "subscription{messaged}").await;
        h.server
            .handle_event(message_event("A", json!({"type": "complete", "id": "s1"})))
            .await
            .unwrap();

        assert!(h.server.registry().get_channels("t").await.unwrap().is_empty());
        assert!(!h.server.registry().is_registered("s1").await.unwrap());
        assert!(!h.store.key_exists("graphql:subscription:s1").await.unwrap());
        assert!(h
            .hooks
            .events()
            .contains(&"complete:s1:subscription{messaged}".to_string()));
    }

    #[tokio::test]
    async fn test_complete_without_a_record_is_fatal() {
        let h = harness(StubExecutor::default());

        init(&h, "A").await;
        let result = h
            .server
            .handle_event(message_event("A", json!({"type": "complete", "id": "ghost"})))
            .await;

        assert!(matches!(result, Err(Error::MissingSubscriptionRecord(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_connect_hook_can_reject() {
        struct RejectingHooks;

        #[async_trait]
        impl Hooks for RejectingHooks {
            async fn on_connect(
                &self,
                _ctx: &mut crate::TrackedContext,
            ) -> Result<ConnectDecision, BoxError> {
                Ok(ConnectDecision::Reject)
            }
        }

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let server = Server::new(
            ServerOptions::new(store, gateway.clone(), Arc::new(StubExecutor::default()))
                .with_hooks(Arc::new(RejectingHooks)),
        );

        server.handle_event(connect_event("A")).await.unwrap();
        server
            .handle_event(message_event("A", json!({"type": "connection_init"})))
            .await
            .unwrap();

        assert_eq!(
            gateway.last_frame("A"),
            json!({"type": "close", "code": 4403, "reason": "Forbidden"}),
        );
    }

    #[tokio::test]
    async fn test_connect_hook_payload_rides_on_the_ack() {
        struct GreetingHooks;

        #[async_trait]
        impl Hooks for GreetingHooks {
            async fn on_connect(
                &self,
                _ctx: &mut crate::TrackedContext,
            ) -> Result<ConnectDecision, BoxError> {
                Ok(ConnectDecision::Accept(Some(json!({"user": "alice"}))))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let server = Server::new(
            ServerOptions::new(store, gateway.clone(), Arc::new(StubExecutor::default()))
                .with_hooks(Arc::new(GreetingHooks)),
        );

        server.handle_event(connect_event("A")).await.unwrap();
        server
            .handle_event(message_event("A", json!({"type": "connection_init"})))
            .await
            .unwrap();

        assert_eq!(
            gateway.last_frame("A"),
            json!({"type": "connection_ack", "payload": {"user": "alice"}}),
        );
    }

    #[tokio::test]
    async fn test_reviver_and_replacer_are_applied() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let server = Server::new(
            ServerOptions::new(store, gateway.clone(), Arc::new(StubExecutor::default()))
                .with_json_message_reviver(Arc::new(|mut frame: Value| {
                    if frame["type"] == json!("gql_ping") {
                        frame["type"] = json!("ping");
                    }
                    frame
                }))
                .with_json_message_replacer(Arc::new(|mut frame: Value| {
                    frame["traced"] = json!(true);
                    frame
                })),
        );

        server.handle_event(connect_event("A")).await.unwrap();
        server
            .handle_event(message_event("A", json!({"type": "gql_ping"})))
            .await
            .unwrap();

        assert_eq!(
            gateway.last_frame("A"),
            json!({"type": "pong", "traced": true}),
        );
    }

    #[tokio::test]
    async fn test_configured_roots_reach_the_executor() {
        #[derive(Default)]
        struct CapturingExecutor {
            seen: Mutex<Option<(Option<Value>, Option<Value>)>>,
        }

        #[async_trait]
        impl SchemaExecutor for CapturingExecutor {
            async fn prepare(
                &self,
                _payload: &SubscribePayload,
            ) -> Result<OperationKind, PrepareFailure> {
                Ok(OperationKind::Subscription)
            }

            async fn execute(&self, _args: &ExecutionArgs) -> Result<ExecutionResult, BoxError> {
                unreachable!("subscription only")
            }

            async fn resolve_subscription(
                &self,
                args: &ExecutionArgs,
            ) -> Result<ResolvedField, BoxError> {
                *self.seen.lock().unwrap() =
                    Some((args.root_value.clone(), args.context_value.clone()));
                Ok(ResolvedField::Channel(SubscriptionChannel {
                    topics: vec!["t".into()],
                }))
            }

            async fn execute_with_root(
                &self,
                _payload: &SubscribePayload,
                _root: Value,
            ) -> Result<ExecutionResult, BoxError> {
                unreachable!("raw forwarding")
            }
        }

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let executor = Arc::new(CapturingExecutor::default());
        let server = Server::new(
            ServerOptions::new(store, gateway, executor.clone())
                .with_roots(Roots {
                    subscription: Some(json!({"seed": true})),
                    ..Roots::default()
                })
                .with_context_value(json!({"env": "test"})),
        );

        server.handle_event(connect_event("A")).await.unwrap();
        server
            .handle_event(message_event("A", json!({"type": "connection_init"})))
            .await
            .unwrap();
        server
            .handle_event(message_event(
                "A",
                json!({"type": "subscribe", "id": "s1", "payload": {"query": "subscription{x}"}}),
            ))
            .await
            .unwrap();

        assert_eq!(
            executor.seen.lock().unwrap().clone(),
            Some((Some(json!({"seed": true})), Some(json!({"env": "test"})))),
        );
    }

    #[tokio::test]
    async fn test_subscribe_hook_errors_short_circuit() {
        struct VetoHooks;

        #[async_trait]
        impl Hooks for VetoHooks {
            async fn on_subscribe(
                &self,
                _ctx: &mut crate::TrackedContext,
                _id: &str,
                _payload: &SubscribePayload,
            ) -> Result<SubscribeOutcome, BoxError> {
                Ok(SubscribeOutcome::Errors(vec![json!({"message": "denied"})]))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let server = Server::new(
            ServerOptions::new(
                store.clone(),
                gateway.clone(),
                Arc::new(StubExecutor::default()),
            )
            .with_hooks(Arc::new(VetoHooks)),
        );

        server.handle_event(connect_event("A")).await.unwrap();
        server
            .handle_event(message_event("A", json!({"type": "connection_init"})))
            .await
            .unwrap();
        server
            .handle_event(message_event(
                "A",
                json!({"type": "subscribe", "id": "s1", "payload": {"query": "subscription{x}"}}),
            ))
            .await
            .unwrap();

        assert_eq!(
            gateway.last_frame("A"),
            json!({"type": "error", "id": "s1", "payload": [{"message": "denied"}]}),
        );
        assert!(!server.registry().is_registered("s1").await.unwrap());
        assert!(!store.key_exists("graphql:subscription:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_hook_can_substitute_args() {
        struct RewritingHooks;

        #[async_trait]
        impl Hooks for RewritingHooks {
            async fn on_subscribe(
                &self,
                _ctx: &mut crate::TrackedContext,
                _id: &str,
                _payload: &SubscribePayload,
            ) -> Result<SubscribeOutcome, BoxError> {
                Ok(SubscribeOutcome::Args(ExecutionArgs {
                    operation: OperationKind::Query,
                    payload: SubscribePayload {
                        query: "{context}".into(),
                        variables: None,
                        operation_name: None,
                        extensions: None,
                    },
                    root_value: None,
                    context_value: None,
                }))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let server = Server::new(
            ServerOptions::new(store, gateway.clone(), Arc::new(StubExecutor::default()))
                .with_hooks(Arc::new(RewritingHooks)),
        );

        server.handle_event(connect_event("A")).await.unwrap();
        server
            .handle_event(message_event("A", json!({"type": "connection_init"})))
            .await
            .unwrap();
        // The client asked for a subscription; the hook rewrote it into a
        // one-off query.
        server
            .handle_event(message_event(
                "A",
                json!({"type": "subscribe", "id": "s1", "payload": {"query": "subscription{x}"}}),
            ))
            .await
            .unwrap();

        assert_eq!(
            gateway.last_frame("A"),
            json!({"type": "next", "id": "s1", "payload": {"data": {"context": 1}}}),
        );
        assert!(!gateway.frames("A").is_empty());
    }

    #[tokio::test]
    async fn test_application_sockets_can_push_frames() {
        let h = harness(StubExecutor::default());

        h.server.handle_event(connect_event("A")).await.unwrap();

        let socket = h.server.socket("A");
        socket
            .send(&ServerMessage::Ping { payload: None })
            .await
            .unwrap();
        socket.send_text("already framed").await.unwrap();

        assert_eq!(h.gateway.last_frame("A"), json!({"type": "ping"}));
        let sent = h.gateway.sent.lock().unwrap().clone();
        assert_eq!(sent.last().unwrap().1, "already framed");
    }

    #[tokio::test]
    async fn test_custom_routes_are_delegated() {
        struct EchoRoute;

        #[async_trait]
        impl RouteHandler for EchoRoute {
            async fn handle(&self, event: &GatewayEvent) -> Result<GatewayResponse, BoxError> {
                Ok(GatewayResponse {
                    status_code: 200,
                    headers: None,
                    body: event.body.clone(),
                })
            }
        }

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let server = Server::new(
            ServerOptions::new(store, gateway, Arc::new(StubExecutor::default()))
                .with_route_handler(Arc::new(EchoRoute)),
        );

        let mut event = raw_message_event("A", "anything");
        event.route_key = Some("echo".into());
        let response = server.handle_event(event).await.unwrap();

        assert_eq!(response.body.as_deref(), Some("anything"));
    }
}
