use std::{sync::Arc, time::Duration};

use agentbridge::{
    connection::ConnectionState,
    event_bus::BridgeEvent,
    protocol::Envelope,
    registry::{
        fn_action, fn_handler, ActionHandlers, ActionOutput, AuthLevel, ComponentDefinition,
        FunctionDefinition, StateSource,
    },
    schema::Schema,
    transport::MemoryTransport,
    AgentBridge, BridgeConfig, ErrorCode,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn config(id: &str) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.application.id = id.to_string();
    config.request_timeout = Duration::from_millis(500);
    config
}

async fn wait_connected(bridge: &AgentBridge) {
    let mut state = bridge.subscribe_connection_state();
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
}

async fn register_app_capabilities(app: &AgentBridge) {
    app.register_function(
        FunctionDefinition::new("add", "Adds two numbers").with_schema(
            Schema::object()
                .property("a", Schema::number(), true)
                .property("b", Schema::number(), true),
        ),
        fn_handler(|params: Value, _| async move {
            let a = params["a"].as_i64().unwrap_or_default();
            let b = params["b"].as_i64().unwrap_or_default();
            Ok(json!(a + b))
        }),
    )
    .await
    .unwrap();

    app.register_function(
        FunctionDefinition::new("stall", "Never answers in time"),
        fn_handler(|_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }),
    )
    .await
    .unwrap();

    app.register_function(
        FunctionDefinition::new("profile", "Needs a signed-in user")
            .with_auth_level(AuthLevel::User),
        fn_handler(|_, context| async move { Ok(json!(context.user.map(|u| u.id))) }),
    )
    .await
    .unwrap();

    let mut handlers = ActionHandlers::new();
    handlers.insert(
        "increment".to_string(),
        fn_action(|_, state: Map<String, Value>, _| async move {
            let count = state.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
            tokio::task::yield_now().await;
            let mut patch = Map::new();
            patch.insert("count".to_string(), json!(count));
            Ok(ActionOutput::data(json!(count)).with_state(patch))
        }),
    );
    app.register_component(
        ComponentDefinition::new("counter", "counter")
            .with_properties(Schema::object().property("count", Schema::integer(), false))
            .with_action("increment", "Adds one", Schema::Any),
        handlers,
    )
    .await
    .unwrap();
}

/// An application bridge and an agent bridge talking over a memory pair.
async fn connected_pair() -> (Arc<AgentBridge>, Arc<AgentBridge>) {
    let (app_side, agent_side) = MemoryTransport::pair();
    let app = AgentBridge::builder(config("app"))
        .transport(Arc::new(app_side))
        .build()
        .unwrap();
    let agent = AgentBridge::builder(config("agent"))
        .transport(Arc::new(agent_side))
        .agent("agent-1", "Helper")
        .build()
        .unwrap();
    register_app_capabilities(&app).await;

    app.start().unwrap();
    agent.start().unwrap();
    wait_connected(&app).await;
    wait_connected(&agent).await;
    (app, agent)
}

#[tokio::test]
async fn test_remote_function_call() {
    let (app, agent) = connected_pair().await;

    let result = agent
        .call_remote_function("add", json!({"a": 2, "b": 3}))
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data, Some(json!(5)));

    let missing = agent.call_remote_function("subtract", json!({})).await;
    assert_eq!(missing.error_code(), Some(ErrorCode::FunctionNotFound));

    let invalid = agent.call_remote_function("add", json!({"a": "x"})).await;
    assert_eq!(invalid.error_code(), Some(ErrorCode::InvalidParameters));

    app.shutdown().await.unwrap();
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_call_is_authorized_on_the_answering_side() {
    let (_app, agent) = connected_pair().await;
    let result = agent.call_remote_function("profile", json!({})).await;
    assert_eq!(result.error_code(), Some(ErrorCode::Unauthorized));
}

#[tokio::test]
async fn test_remote_component_action_updates_app_state() {
    let (app, agent) = connected_pair().await;
    let mut events = app.subscribe();

    let result = agent
        .call_remote_component_action("counter", "increment", Value::Null)
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data, Some(json!(1)));
    assert_eq!(
        app.component_state("counter").map(Value::Object),
        Some(json!({"count": 1}))
    );

    let change = events
        .recv_matching(|event| match event {
            BridgeEvent::ComponentStateChanged(change) => Some(change),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(change.component_id, "counter");
    assert_eq!(change.source, StateSource::Action);

    let unknown_action = agent
        .call_remote_component_action("counter", "reset", Value::Null)
        .await;
    assert_eq!(unknown_action.error_code(), Some(ErrorCode::ActionNotFound));
}

#[tokio::test]
async fn test_concurrent_remote_actions_compose() {
    let (app, agent) = connected_pair().await;

    let results = futures::future::join_all(
        (0..50).map(|_| agent.call_remote_component_action("counter", "increment", Value::Null)),
    )
    .await;

    assert!(results.iter().all(|r| r.success), "{:?}", results);
    assert_eq!(
        app.component_state("counter").map(Value::Object),
        Some(json!({"count": 50}))
    );
}

#[tokio::test]
async fn test_remote_component_update() {
    let (app, agent) = connected_pair().await;

    let result = agent
        .update_remote_component("counter", json!({"count": 10}))
        .await;
    assert_eq!(result.data, Some(json!({"count": 10})));
    assert_eq!(
        app.component_state("counter").map(Value::Object),
        Some(json!({"count": 10}))
    );

    let rejected = agent
        .update_remote_component("counter", json!({"count": "ten"}))
        .await;
    assert_eq!(rejected.error_code(), Some(ErrorCode::InvalidParameters));
}

#[tokio::test]
async fn test_query_remote_capabilities() {
    let (_app, agent) = connected_pair().await;

    let result = agent.query_remote_capabilities().await;
    assert!(result.success);
    let names: Vec<String> = agent
        .remote_capabilities()
        .functions
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["add", "profile", "stall"]);
    assert!(agent.remote_capabilities().components[0].action("increment").is_some());
}

#[tokio::test]
async fn test_session_announcement_reaches_app() {
    let (app, agent) = connected_pair().await;
    let mut events = app.subscribe();

    agent.announce().await.unwrap();
    let (session_id, agent_info) = events
        .recv_matching(|event| match event {
            BridgeEvent::SessionStarted { session_id, agent } => Some((session_id, agent)),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(session_id, agent.session_id());
    assert_eq!(agent_info.map(|a| a.id), Some("agent-1".to_string()));
}

#[tokio::test]
async fn test_remote_call_times_out() {
    let (_app, agent) = connected_pair().await;
    let result = agent.call_remote_function("stall", json!({})).await;
    assert_eq!(result.error_code(), Some(ErrorCode::ResponseTimeout));
}

#[tokio::test]
async fn test_shutdown_rejects_remote_calls() {
    let (_app, agent) = connected_pair().await;
    agent.shutdown().await.unwrap();
    let result = agent.call_remote_function("add", json!({"a": 1, "b": 1})).await;
    assert_eq!(result.error_code(), Some(ErrorCode::NotInitialized));
    // Idempotent.
    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frames() {
    let (transport, peer) = MemoryTransport::new();
    let bridge = AgentBridge::builder(config("app"))
        .transport(Arc::new(transport))
        .build()
        .unwrap();
    bridge.start().unwrap();
    wait_connected(&bridge).await;

    // No id to answer to: dropped.
    assert!(peer.deliver("not json"));
    assert!(peer.deliver(r#"{"type":"no_such_type","id":"m-1"}"#));

    loop {
        let frame = peer.next_frame().await.unwrap();
        if let Envelope::Error(error) = Envelope::decode(&frame).unwrap() {
            assert_eq!(error.correlation_id.as_deref(), Some("m-1"));
            assert_eq!(error.error.code, ErrorCode::InvalidParameters);
            break;
        }
    }
}
