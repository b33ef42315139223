//! # Agent Bridge
//!
//! Explicitly owned bridge instance that ties the pieces together:
//!
//! ```text
//! transport -> ConnectionManager -> dispatch loop -> InvocationPipeline -> registry / adapter
//!                     ^                   |
//!                     +---- responses ----+
//! ```
//!
//! Lifecycle is `build -> start -> shutdown`. A bridge plays both roles at
//! once: it answers requests for its own capabilities and can call the
//! capabilities advertised by the peer on the other side of the transport.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::Stream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    adapter::{FrameworkAdapter, RegistryAdapter},
    config::BridgeConfig,
    connection::{ConnectionManager, ConnectionState},
    context::{AgentInfo, ApplicationInfo, ContextBuilder, RawContext},
    error::{BridgeError, BridgeResult},
    event_bus::{BridgeEvent, EventBus, EventReceiver},
    pipeline::{
        result::{CallError, CallMeta, CallResult, ErrorCode},
        InvocationPipeline, Target,
    },
    protocol::{
        catalog::{CapabilityCatalog, CapabilitySet},
        correlation::CorrelationTable,
        message::{CapabilitiesBroadcast, CapabilitiesRequest, CapabilitiesResponse, Envelope, ResultMessage},
    },
    registry::{
        ActionHandlers, CapabilityFilter, CapabilityKind, CapabilityRegistry, ComponentDefinition,
        FunctionDefinition, FunctionHandler, RegisterOptions, RegistryError, StateSource,
    },
    timestamp::Timestamp,
    transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BridgeStatus {
    Created,
    Running,
    Disposed,
}

pub struct AgentBridgeBuilder {
    config: BridgeConfig,
    transport: Option<Arc<dyn Transport>>,
    adapter: Option<Arc<dyn FrameworkAdapter>>,
    agent: Option<AgentInfo>,
}

impl AgentBridgeBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Custom toolkit binding. Defaults to [`RegistryAdapter`].
    pub fn adapter(mut self, adapter: Arc<dyn FrameworkAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Identity sent with outbound calls and the session announcement.
    pub fn agent(mut self, id: &str, name: &str) -> Self {
        self.agent = Some(AgentInfo {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn build(self) -> BridgeResult<Arc<AgentBridge>> {
        let transport = self
            .transport
            .ok_or_else(|| BridgeError::Config("a transport is required".to_string()))?;

        let event_bus = Arc::new(EventBus::new(self.config.event_buffer_size));
        let registry = Arc::new(CapabilityRegistry::new(event_bus.clone()));
        let adapter = self
            .adapter
            .unwrap_or_else(|| Arc::new(RegistryAdapter::new(registry.clone())));
        let pipeline = Arc::new(InvocationPipeline::new(
            registry.clone(),
            adapter,
            ContextBuilder::new(&self.config.application),
        ));
        let connection =
            ConnectionManager::new(transport, self.config.connection.clone(), event_bus.clone());

        Ok(Arc::new(AgentBridge {
            session_id: Uuid::new_v4().to_string(),
            agent: self.agent,
            config: self.config,
            event_bus,
            registry,
            pipeline,
            connection,
            correlation: CorrelationTable::new(),
            catalog: CapabilityCatalog::new(),
            status: watch::channel(BridgeStatus::Created).0,
            tasks: StdMutex::new(Vec::new()),
        }))
    }
}

pub struct AgentBridge {
    config: BridgeConfig,
    session_id: String,
    agent: Option<AgentInfo>,
    event_bus: Arc<EventBus>,
    registry: Arc<CapabilityRegistry>,
    pipeline: Arc<InvocationPipeline>,
    connection: Arc<ConnectionManager>,
    correlation: CorrelationTable,
    catalog: CapabilityCatalog,
    status: watch::Sender<BridgeStatus>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl AgentBridge {
    pub fn builder(config: BridgeConfig) -> AgentBridgeBuilder {
        AgentBridgeBuilder {
            config,
            transport: None,
            adapter: None,
            agent: None,
        }
    }

    /// Starts dispatching inbound frames and connects the transport.
    #[instrument(level = "debug", skip(self), fields(session = %self.session_id))]
    pub fn start(self: &Arc<Self>) -> BridgeResult<()> {
        let mut started = false;
        self.status.send_if_modified(|status| {
            if *status == BridgeStatus::Created {
                *status = BridgeStatus::Running;
                started = true;
            }
            started
        });
        if !started {
            return Err(BridgeError::NotInitialized(format!(
                "bridge cannot start from state {}",
                self.status()
            )));
        }

        let inbound = self
            .connection
            .take_inbound()
            .ok_or_else(|| BridgeError::internal("inbound channel already taken"))?;
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::dispatch(Arc::downgrade(self), inbound)));
        if self.config.announce_on_connect {
            tasks.push(tokio::spawn(Self::announce_on_connect(
                Arc::downgrade(self),
                self.connection.subscribe_state(),
            )));
        }
        lock(&self.tasks).extend(tasks);

        self.connection.start();
        info!("bridge started");
        Ok(())
    }

    /// Disposes the bridge. Pending remote calls complete with
    /// `NOT_INITIALIZED`; the connection is closed for good.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let previous = self.status.send_replace(BridgeStatus::Disposed);
        if previous == BridgeStatus::Disposed {
            return Ok(());
        }
        let cancelled = self.correlation.cancel_all("bridge shut down");
        self.connection.close().await;
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        info!("bridge shut down ({} pending calls cancelled)", cancelled);
        Ok(())
    }

    pub fn status(&self) -> BridgeStatus {
        *self.status.borrow()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<InvocationPipeline> {
        &self.pipeline
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    pub fn events(&self) -> impl Stream<Item = BridgeEvent> {
        self.event_bus.stream()
    }

    // ---- local capabilities ----

    pub async fn register_function(
        &self,
        definition: FunctionDefinition,
        handler: Arc<dyn FunctionHandler>,
    ) -> BridgeResult<()> {
        self.register_function_with(definition, handler, RegisterOptions::default())
            .await
    }

    pub async fn register_function_with(
        &self,
        definition: FunctionDefinition,
        handler: Arc<dyn FunctionHandler>,
        options: RegisterOptions,
    ) -> BridgeResult<()> {
        self.registry
            .register_function(definition.clone(), handler, options)?;
        self.announce_update(CapabilitySet::new(vec![definition], vec![]))
            .await;
        Ok(())
    }

    pub async fn unregister_function(&self, name: &str) -> BridgeResult<FunctionDefinition> {
        let definition = self.registry.unregister_function(name)?;
        self.announce_full().await;
        Ok(definition)
    }

    pub async fn register_component(
        &self,
        definition: ComponentDefinition,
        handlers: ActionHandlers,
    ) -> BridgeResult<()> {
        self.register_component_with(definition, handlers, RegisterOptions::default())
            .await
    }

    pub async fn register_component_with(
        &self,
        definition: ComponentDefinition,
        handlers: ActionHandlers,
        options: RegisterOptions,
    ) -> BridgeResult<()> {
        let id = definition.id.clone();
        let previous = self.registry.get_component(&id).map(|entry| {
            let state = self.registry.state().get(&id).unwrap_or_default();
            (entry, state)
        });
        self.registry
            .register_component(definition.clone(), handlers.clone(), options)?;
        if let Err(e) = self
            .pipeline
            .adapter()
            .register_component(definition.clone(), handlers)
            .await
        {
            warn!("adapter refused component {}, rolling back: {}", id, e);
            match previous {
                Some((entry, state)) => self.registry.restore_component(entry, state),
                None => {
                    if let Err(rollback) = self.registry.unregister_component(&id) {
                        warn!("rollback of component {} failed: {}", id, rollback);
                    }
                }
            }
            return Err(e);
        }
        self.announce_update(CapabilitySet::new(vec![], vec![definition]))
            .await;
        Ok(())
    }

    pub async fn unregister_component(&self, id: &str) -> BridgeResult<ComponentDefinition> {
        let definition = self.registry.unregister_component(id)?;
        if let Err(e) = self.pipeline.adapter().unregister_component(id).await {
            warn!("adapter failed to unregister component {}: {}", id, e);
        }
        self.announce_full().await;
        Ok(definition)
    }

    /// Local state change made by the application.
    pub async fn update_component_state(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> BridgeResult<Map<String, Value>> {
        self.pipeline
            .apply_patch(id, patch, StateSource::Application)
            .await
            .ok_or_else(|| {
                RegistryError::NotFound {
                    kind: CapabilityKind::Component,
                    key: id.to_string(),
                }
                .into()
            })
    }

    pub fn component_state(&self, id: &str) -> Option<Map<String, Value>> {
        self.registry.state().get(id)
    }

    /// Registers components the adapter knows about but the registry does
    /// not. Their actions run through the adapter. Returns how many were added.
    pub async fn sync_adapter_components(&self) -> BridgeResult<usize> {
        let mut added = Vec::new();
        for definition in self.pipeline.adapter().get_component_definitions().await {
            if self.registry.contains_component(&definition.id) {
                continue;
            }
            self.registry.register_component(
                definition.clone(),
                ActionHandlers::new(),
                RegisterOptions::default(),
            )?;
            added.push(definition);
        }
        let count = added.len();
        if count > 0 {
            debug!("synced {} components from adapter", count);
            self.announce_update(CapabilitySet::new(vec![], added)).await;
        }
        Ok(count)
    }

    /// Runs a local invocation through the pipeline.
    pub async fn invoke(&self, target: &Target, params: Value, raw: RawContext) -> CallResult {
        if self.status() == BridgeStatus::Disposed {
            return CallResult::rejected(ErrorCode::NotInitialized, "bridge is shut down");
        }
        self.pipeline.invoke(target, params, raw).await
    }

    // ---- remote capabilities ----

    pub async fn call_remote_function(&self, name: &str, parameters: Value) -> CallResult {
        let envelope = Envelope::call_function(name, parameters, self.outbound_context());
        self.remote_call(envelope).await
    }

    pub async fn call_remote_component_action(
        &self,
        component_id: &str,
        action: &str,
        parameters: Value,
    ) -> CallResult {
        let envelope = Envelope::call_component_action(
            component_id,
            action,
            parameters,
            self.outbound_context(),
        );
        self.remote_call(envelope).await
    }

    pub async fn update_remote_component(&self, component_id: &str, properties: Value) -> CallResult {
        let envelope =
            Envelope::update_component(component_id, properties, self.outbound_context());
        self.remote_call(envelope).await
    }

    /// Asks the peer for its full capability set. On success the local view of
    /// the peer's catalog is replaced and `data` holds the set.
    pub async fn query_remote_capabilities(&self) -> CallResult {
        let started_at = Timestamp::now();
        match self.round_trip(Envelope::query_capabilities()).await {
            Ok(Envelope::CapabilitiesResult(response)) => {
                let set = self.catalog.replace(CapabilitySet::new(
                    response.functions,
                    response.components,
                ));
                self.publish(BridgeEvent::CapabilitiesUpdated(set.clone()));
                match serde_json::to_value(&set) {
                    Ok(data) => CallResult::ok(data, CallMeta::since(started_at)),
                    Err(e) => CallResult::failure(
                        CallError::new(ErrorCode::ExecutionError, e.to_string()),
                        CallMeta::since(started_at),
                    ),
                }
            }
            Ok(other) => unexpected_response(other, started_at),
            Err(result) => result,
        }
    }

    /// The peer's capabilities as last announced or queried.
    pub fn remote_capabilities(&self) -> CapabilitySet {
        self.catalog.snapshot()
    }

    /// Sends a `session` envelope followed by the full local capability set.
    pub async fn announce(&self) -> BridgeResult<()> {
        let session = Envelope::session(
            &self.session_id,
            Some(ApplicationInfo::from(&self.config.application)),
            self.agent.clone(),
        );
        self.connection.send_envelope(&session).await?;
        let register =
            Envelope::RegisterCapabilities(CapabilitiesRequest::new(self.local_capabilities()));
        self.connection.send_envelope(&register).await
    }

    pub fn local_capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(
            self.registry.list_functions(&CapabilityFilter::default()),
            self.registry.list_components(&CapabilityFilter::default()),
        )
    }

    async fn remote_call(&self, envelope: Envelope) -> CallResult {
        let started_at = Timestamp::now();
        match self.round_trip(envelope).await {
            Ok(response) => match response.into_call_result() {
                Some(result) => result,
                None => CallResult::failure(
                    CallError::new(ErrorCode::ExecutionError, "unexpected response type"),
                    CallMeta::since(started_at),
                ),
            },
            Err(result) => result,
        }
    }

    /// Sends a request and waits for its correlated response. Every failure
    /// comes back as a ready-made `CallResult`.
    #[instrument(level = "debug", skip(self, envelope), fields(kind = envelope.kind()))]
    async fn round_trip(&self, envelope: Envelope) -> Result<Envelope, CallResult> {
        let started_at = Timestamp::now();
        let fail = |code: ErrorCode, message: String| {
            CallResult::failure(CallError::new(code, message), CallMeta::since(started_at))
        };

        if self.status() != BridgeStatus::Running {
            return Err(fail(
                ErrorCode::NotInitialized,
                format!("bridge is {}", self.status()),
            ));
        }
        let Some(id) = envelope.request_id().map(str::to_string) else {
            return Err(fail(
                ErrorCode::InvalidParameters,
                format!("{} is not a request", envelope.kind()),
            ));
        };

        let pending = self
            .correlation
            .register(&id)
            .map_err(|e| fail(e.code(), e.to_string()))?;
        if let Err(e) = self.connection.send_envelope(&envelope).await {
            return Err(fail(e.code(), e.to_string()));
        }
        pending
            .wait(self.config.request_timeout)
            .await
            .map_err(|e| fail(e.code(), e.to_string()))
    }

    fn outbound_context(&self) -> Option<Value> {
        let mut context = Map::new();
        if let Some(agent) = &self.agent {
            context.insert("agent".to_string(), serde_json::to_value(agent).ok()?);
        }
        context.insert(
            "application".to_string(),
            serde_json::to_value(ApplicationInfo::from(&self.config.application)).ok()?,
        );
        Some(Value::Object(context))
    }

    // ---- announcements ----

    async fn announce_update(&self, set: CapabilitySet) {
        if !self.should_announce() {
            return;
        }
        let envelope = Envelope::UpdateCapabilities(CapabilitiesRequest::new(set));
        if let Err(e) = self.connection.send_envelope(&envelope).await {
            warn!("capability update not sent: {}", e);
        }
    }

    async fn announce_full(&self) {
        if !self.should_announce() {
            return;
        }
        let envelope =
            Envelope::RegisterCapabilities(CapabilitiesRequest::new(self.local_capabilities()));
        if let Err(e) = self.connection.send_envelope(&envelope).await {
            warn!("capability announcement not sent: {}", e);
        }
    }

    // Disconnected periods are covered by the announcement on connect.
    fn should_announce(&self) -> bool {
        self.status() == BridgeStatus::Running
            && self.connection.state() == ConnectionState::Connected
    }

    async fn announce_on_connect(this: Weak<Self>, mut state: watch::Receiver<ConnectionState>) {
        loop {
            if state
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .is_err()
            {
                return;
            }
            let Some(bridge) = this.upgrade() else {
                return;
            };
            if let Err(e) = bridge.announce().await {
                warn!("announcement failed: {}", e);
            }
            drop(bridge);
            if state
                .wait_for(|s| *s != ConnectionState::Connected)
                .await
                .is_err()
            {
                return;
            }
        }
    }

    // ---- inbound ----

    async fn dispatch(this: Weak<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(frame) = inbound.recv().await {
            let Some(bridge) = this.upgrade() else {
                break;
            };
            bridge.handle_frame(&frame).await;
        }
        debug!("dispatch loop stopped");
    }

    async fn handle_frame(self: &Arc<Self>, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed envelope: {}", e);
                if let Some(id) = e.request_id() {
                    let reply = Envelope::error(
                        Some(id.to_string()),
                        CallError::new(ErrorCode::InvalidParameters, e.to_string()),
                    );
                    self.reply(reply).await;
                }
                return;
            }
        };

        match envelope {
            Envelope::CallFunction(_)
            | Envelope::CallComponentAction(_)
            | Envelope::UpdateComponent(_) => {
                // Own task per call so a slow handler does not hold up pongs
                // and responses.
                let bridge = self.clone();
                tokio::spawn(async move {
                    if let Some(reply) = bridge.handle_call(envelope).await {
                        bridge.reply(reply).await;
                    }
                });
            }
            Envelope::QueryCapabilities(request) => {
                let set = self.local_capabilities();
                let reply = Envelope::CapabilitiesResult(CapabilitiesResponse {
                    correlation_id: request.id,
                    timestamp: Timestamp::now(),
                    functions: set.functions,
                    components: set.components,
                });
                self.reply(reply).await;
            }
            Envelope::RegisterCapabilities(request) => {
                let set = self.catalog.replace(request.capabilities());
                self.capabilities_changed(request.id, set).await;
            }
            Envelope::UpdateCapabilities(request) => {
                let set = self.catalog.merge(request.capabilities());
                self.capabilities_changed(request.id, set).await;
            }
            Envelope::Session(session) => {
                info!("peer session {} started", session.session_id);
                self.publish(BridgeEvent::SessionStarted {
                    session_id: session.session_id,
                    agent: session.agent,
                });
            }
            Envelope::Ping(ping) => self.reply(Envelope::pong(&ping.id)).await,
            Envelope::Pong(_) => self.connection.record_pong(),
            Envelope::Error(ref error) if error.correlation_id.is_none() => {
                warn!("peer reported error: {}", error.error);
            }
            response => {
                let kind = response.kind();
                if !self.correlation.resolve(response) {
                    debug!("unmatched {} ignored", kind);
                }
            }
        }
    }

    async fn handle_call(&self, envelope: Envelope) -> Option<Envelope> {
        let raw = |id: &str, context: Option<&Value>| {
            let mut raw = context.map(RawContext::from_value).unwrap_or_default();
            raw.request_id.get_or_insert_with(|| id.to_string());
            raw
        };
        match envelope {
            Envelope::CallFunction(call) => {
                let result = self
                    .pipeline
                    .invoke(
                        &Target::Function(call.name),
                        call.parameters,
                        raw(&call.id, call.context.as_ref()),
                    )
                    .await;
                Some(Envelope::FunctionResult(ResultMessage::new(&call.id, result)))
            }
            Envelope::CallComponentAction(call) => {
                let result = self
                    .pipeline
                    .invoke(
                        &Target::ComponentAction {
                            component_id: call.component_id,
                            action: call.action,
                        },
                        call.parameters,
                        raw(&call.id, call.context.as_ref()),
                    )
                    .await;
                Some(Envelope::ComponentActionResult(ResultMessage::new(
                    &call.id, result,
                )))
            }
            Envelope::UpdateComponent(update) => {
                let result = self
                    .pipeline
                    .update_component(
                        &update.component_id,
                        update.properties,
                        raw(&update.id, update.context.as_ref()),
                    )
                    .await;
                Some(Envelope::ComponentUpdateResult(ResultMessage::new(
                    &update.id, result,
                )))
            }
            _ => None,
        }
    }

    async fn capabilities_changed(&self, request_id: String, set: CapabilitySet) {
        self.publish(BridgeEvent::CapabilitiesUpdated(set.clone()));
        let broadcast = Envelope::CapabilitiesUpdated(CapabilitiesBroadcast {
            correlation_id: Some(request_id),
            timestamp: Timestamp::now(),
            functions: set.functions,
            components: set.components,
        });
        self.reply(broadcast).await;
    }

    async fn reply(&self, envelope: Envelope) {
        if let Err(e) = self.connection.send_envelope(&envelope).await {
            warn!("{} not sent: {}", envelope.kind(), e);
        }
    }

    fn publish(&self, event: BridgeEvent) {
        if let Err(e) = self.event_bus.publish(event) {
            debug!("event not published: {}", e);
        }
    }
}

impl Drop for AgentBridge {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

fn unexpected_response(envelope: Envelope, started_at: Timestamp) -> CallResult {
    match envelope.into_call_result() {
        // An `error` envelope answering the query.
        Some(result) if !result.success => result,
        _ => CallResult::failure(
            CallError::new(ErrorCode::ExecutionError, "unexpected response type"),
            CallMeta::since(started_at),
        ),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::MockFrameworkAdapter,
        registry::{fn_handler, HandlerError},
        transport::{MemoryPeer, MemoryTransport},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn running_bridge(config: BridgeConfig) -> (Arc<AgentBridge>, MemoryPeer) {
        let (transport, peer) = MemoryTransport::new();
        let bridge = AgentBridge::builder(config)
            .transport(Arc::new(transport))
            .agent("app-agent", "App")
            .build()
            .unwrap();
        bridge.start().unwrap();
        bridge
            .subscribe_connection_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        (bridge, peer)
    }

    async fn next_envelope(peer: &MemoryPeer) -> Envelope {
        Envelope::decode(&peer.next_frame().await.unwrap()).unwrap()
    }

    async fn next_of_kind(peer: &MemoryPeer, kind: &str) -> Envelope {
        loop {
            let envelope = next_envelope(peer).await;
            if envelope.kind() == kind {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_build_requires_transport() {
        assert!(matches!(
            AgentBridge::builder(BridgeConfig::default()).build(),
            Err(BridgeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_announces_on_connect() {
        let (bridge, peer) = running_bridge(BridgeConfig::default()).await;
        let session = next_envelope(&peer).await;
        match session {
            Envelope::Session(s) => assert_eq!(s.session_id, bridge.session_id()),
            other => panic!("expected session, got {:?}", other),
        }
        assert_eq!(next_envelope(&peer).await.kind(), "register_capabilities");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (bridge, _peer) = running_bridge(BridgeConfig::default()).await;
        assert!(bridge.start().is_err());
    }

    #[tokio::test]
    async fn test_answers_call_function() {
        let (bridge, peer) = running_bridge(BridgeConfig::default()).await;
        bridge
            .register_function(
                FunctionDefinition::new("echo", ""),
                fn_handler(|params, _| async move { Ok(params) }),
            )
            .await
            .unwrap();

        peer.deliver(r#"{"type":"call_function","id":"req-1","name":"echo","parameters":{"x":1}}"#);
        match next_of_kind(&peer, "function_result").await {
            Envelope::FunctionResult(result) => {
                assert_eq!(result.correlation_id, "req-1");
                assert!(result.success);
                assert_eq!(result.data, Some(json!({"x": 1})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let (_bridge, peer) = running_bridge(BridgeConfig::default()).await;
        peer.deliver(r#"{"type":"call_function","id":"bad-1"}"#);
        match next_of_kind(&peer, "error").await {
            Envelope::Error(error) => {
                assert_eq!(error.correlation_id.as_deref(), Some("bad-1"));
                assert_eq!(error.error.code, ErrorCode::InvalidParameters);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (_bridge, peer) = running_bridge(BridgeConfig::default()).await;
        peer.deliver(r#"{"type":"ping","id":"p-1"}"#);
        assert_eq!(next_of_kind(&peer, "pong").await.correlation_id(), Some("p-1"));
    }

    #[tokio::test]
    async fn test_register_capabilities_replaces_catalog() {
        let (bridge, peer) = running_bridge(BridgeConfig::default()).await;
        let mut events = bridge.subscribe();
        peer.deliver(
            r#"{"type":"register_capabilities","id":"c-1","functions":[{"name":"search"}],"components":[]}"#,
        );
        let updated = next_of_kind(&peer, "capabilities_updated").await;
        assert_eq!(updated.correlation_id(), Some("c-1"));

        let set = events
            .recv_matching(|event| match event {
                BridgeEvent::CapabilitiesUpdated(set) => Some(set),
                _ => None,
            })
            .await
            .unwrap();
        assert_eq!(set.functions[0].name, "search");
        assert_eq!(bridge.remote_capabilities(), set);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_call_times_out() {
        let config = BridgeConfig {
            request_timeout: std::time::Duration::from_secs(5),
            ..BridgeConfig::default()
        };
        let (bridge, _peer) = running_bridge(config).await;
        let result = bridge.call_remote_function("slow", json!({})).await;
        assert_eq!(result.error_code(), Some(ErrorCode::ResponseTimeout));
    }

    #[tokio::test]
    async fn test_remote_call_resolved_by_peer() {
        let (bridge, peer) = running_bridge(BridgeConfig::default()).await;
        let caller = bridge.clone();
        let call = tokio::spawn(async move { caller.call_remote_function("add", json!({"a": 1})).await });

        let request = next_of_kind(&peer, "call_function").await;
        let id = request.request_id().unwrap().to_string();
        let response = format!(
            r#"{{"type":"function_result","correlationId":"{}","success":true,"data":42}}"#,
            id
        );
        assert!(peer.deliver(&response));
        let result = call.await.unwrap();
        assert_eq!(result.data, Some(json!(42)));
        assert_eq!(bridge.correlation.pending_count(), 0);

        // A duplicate finds nothing pending and gets no reply.
        assert!(peer.deliver(&response));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bridge.correlation.pending_count(), 0);
        assert!(peer.try_next_frame().await.is_none());
        assert_eq!(result.data, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_refused_overwrite_keeps_previous_component() {
        let (transport, _peer) = MemoryTransport::new();
        let mut adapter = MockFrameworkAdapter::new();
        let mut calls = 0;
        adapter.expect_register_component().returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(BridgeError::internal("toolkit refused"))
            }
        });
        let bridge = AgentBridge::builder(BridgeConfig::default())
            .transport(Arc::new(transport))
            .adapter(Arc::new(adapter))
            .build()
            .unwrap();

        bridge
            .register_component(
                ComponentDefinition::new("panel", "panel").with_tag("v1"),
                ActionHandlers::new(),
            )
            .await
            .unwrap();
        let mut state = Map::new();
        state.insert("open".to_string(), json!(true));
        bridge.registry.state().merge("panel", state, StateSource::Application);

        let err = bridge
            .register_component_with(
                ComponentDefinition::new("panel", "panel").with_tag("v2"),
                ActionHandlers::new(),
                RegisterOptions::force(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Internal(_)));

        let kept = bridge.registry.get_component("panel").unwrap();
        assert!(kept.definition.tags.contains("v1"));
        assert_eq!(
            bridge.component_state("panel").map(Value::Object),
            Some(json!({"open": true}))
        );

        let err = bridge
            .register_component(ComponentDefinition::new("fresh", "panel"), ActionHandlers::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Internal(_)));
        assert!(!bridge.registry.contains_component("fresh"));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_later_calls() {
        let (bridge, peer) = running_bridge(BridgeConfig::default()).await;
        let caller = bridge.clone();
        let call = tokio::spawn(async move { caller.call_remote_function("never", json!({})).await });
        next_of_kind(&peer, "call_function").await;

        bridge.shutdown().await.unwrap();
        assert_eq!(call.await.unwrap().error_code(), Some(ErrorCode::NotInitialized));
        assert_eq!(
            bridge.call_remote_function("x", json!({})).await.error_code(),
            Some(ErrorCode::NotInitialized)
        );
        assert_eq!(
            bridge
                .invoke(&Target::function("x"), json!({}), RawContext::default())
                .await
                .error_code(),
            Some(ErrorCode::NotInitialized)
        );
        assert_eq!(bridge.status(), BridgeStatus::Disposed);
    }

    #[tokio::test]
    async fn test_calls_before_start_not_initialized() {
        let (transport, _peer) = MemoryTransport::new();
        let bridge = AgentBridge::builder(BridgeConfig::default())
            .transport(Arc::new(transport))
            .build()
            .unwrap();
        let result = bridge.query_remote_capabilities().await;
        assert_eq!(result.error_code(), Some(ErrorCode::NotInitialized));
    }

    #[tokio::test]
    async fn test_update_component_state_unknown() {
        let (bridge, _peer) = running_bridge(BridgeConfig::default()).await;
        let err = bridge
            .update_component_state("ghost", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ComponentNotFound);
    }

    #[tokio::test]
    async fn test_register_sends_update() {
        let (bridge, peer) = running_bridge(BridgeConfig::default()).await;
        next_of_kind(&peer, "register_capabilities").await;
        bridge
            .register_function(
                FunctionDefinition::new("late", ""),
                fn_handler(|_, _| async { Err(HandlerError::failed("unused")) }),
            )
            .await
            .unwrap();
        match next_of_kind(&peer, "update_capabilities").await {
            Envelope::UpdateCapabilities(update) => {
                assert_eq!(update.functions.len(), 1);
                assert_eq!(update.functions[0].name, "late");
            }
            other => panic!("unexpected {:?}", other),
        }

        bridge.unregister_function("late").await.unwrap();
        match next_of_kind(&peer, "register_capabilities").await {
            Envelope::RegisterCapabilities(full) => assert!(full.functions.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
