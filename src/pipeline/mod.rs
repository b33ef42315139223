//! # Invocation Pipeline
//!
//! Runs one call against a registered target and packages the outcome as a
//! [`CallResult`]. The steps, in order:
//!
//! 1. look the target up (miss: `*_NOT_FOUND`, zero duration)
//! 2. build the [`ExecutionContext`]
//! 3. authorize against the target's [`AuthLevel`]
//! 4. validate parameters against the target's schema
//! 5. check the target's sliding-window rate limit for this caller
//! 6. run the handler, timed; errors and panics become `EXECUTION_ERROR`
//!
//! Nothing here returns `Err` or lets a handler panic escape: every path ends
//! in a `CallResult`.

pub mod rate_limit;
pub mod result;

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, error, instrument, warn};

use crate::{
    adapter::FrameworkAdapter,
    context::{ContextBuilder, ExecutionContext, RawContext},
    registry::{AuthLevel, CapabilityRegistry, HandlerError, StateSource},
    schema::SchemaViolation,
    timestamp::Timestamp,
};

pub use rate_limit::{RateLimit, SlidingWindow};
pub use result::{CallError, CallMeta, CallResult, ErrorCode};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Function(String),
    ComponentAction { component_id: String, action: String },
}

impl Target {
    pub fn function(name: &str) -> Self {
        Target::Function(name.to_string())
    }

    pub fn action(component_id: &str, action: &str) -> Self {
        Target::ComponentAction {
            component_id: component_id.to_string(),
            action: action.to_string(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Function(name) => write!(f, "function:{}", name),
            Target::ComponentAction {
                component_id,
                action,
            } => write!(f, "component:{}.{}", component_id, action),
        }
    }
}

pub struct InvocationPipeline {
    registry: Arc<CapabilityRegistry>,
    adapter: Arc<dyn FrameworkAdapter>,
    contexts: ContextBuilder,
}

impl InvocationPipeline {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        adapter: Arc<dyn FrameworkAdapter>,
        contexts: ContextBuilder,
    ) -> Self {
        Self {
            registry,
            adapter,
            contexts,
        }
    }

    #[instrument(level = "debug", skip(self, params, raw), fields(target = %target))]
    pub async fn invoke(&self, target: &Target, params: Value, raw: RawContext) -> CallResult {
        let params = normalize_params(params);
        match target {
            Target::Function(name) => self.invoke_function(name, params, raw).await,
            Target::ComponentAction {
                component_id,
                action,
            } => self.invoke_action(component_id, action, params, raw).await,
        }
    }

    async fn invoke_function(&self, name: &str, params: Value, raw: RawContext) -> CallResult {
        let Some(entry) = self.registry.get_function(name) else {
            return CallResult::rejected(
                ErrorCode::FunctionNotFound,
                format!("Function not found: {}", name),
            );
        };

        let context = self.contexts.build(raw);
        if let Err(e) = authorize(entry.definition.auth_level, &context) {
            return CallResult::failure(e, CallMeta::instant());
        }
        if let Err(violations) = entry.definition.parameter_schema.validate(&params) {
            return invalid_parameters(violations);
        }
        if let Some(limiter) = entry.limiter() {
            if let Err(retry_after) = limiter.try_acquire(&context.caller_key()) {
                let limit = limiter.limit();
                debug!("rate limit hit for {} by {}", name, context.caller_key());
                return CallResult::failure(
                    CallError::new(
                        ErrorCode::RateLimitExceeded,
                        format!(
                            "Rate limit exceeded: {} requests per {}s",
                            limit.max_requests, limit.window_seconds
                        ),
                    )
                    .with_details(json!({
                        "retryAfterMs": retry_after.as_millis() as u64,
                        "maxRequests": limit.max_requests,
                        "windowSeconds": limit.window_seconds,
                    })),
                    CallMeta::instant(),
                );
            }
        }

        let started_at = Timestamp::now();
        let outcome = AssertUnwindSafe(entry.handler.call(params, &context))
            .catch_unwind()
            .await;
        let meta = CallMeta::since(started_at);

        match flatten_outcome(outcome) {
            Ok(data) => CallResult::ok(data, meta),
            Err(cause) => {
                error!("function {} failed: {}", name, cause);
                CallResult::failure(CallError::new(ErrorCode::ExecutionError, cause), meta)
            }
        }
    }

    async fn invoke_action(
        &self,
        component_id: &str,
        action: &str,
        params: Value,
        raw: RawContext,
    ) -> CallResult {
        let Some(entry) = self.registry.get_component(component_id) else {
            return CallResult::rejected(
                ErrorCode::ComponentNotFound,
                format!("Component not found: {}", component_id),
            );
        };
        let Some(action_def) = entry.definition.action(action) else {
            return CallResult::rejected(
                ErrorCode::ActionNotFound,
                format!("Action {} not found on component {}", action, component_id),
            );
        };

        let context = self.contexts.build(raw);
        if let Err(e) = authorize(entry.definition.auth_level, &context) {
            return CallResult::failure(e, CallMeta::instant());
        }
        if let Err(violations) = action_def.parameter_schema.validate(&params) {
            return invalid_parameters(violations);
        }

        let started_at = Timestamp::now();
        let _serialized = entry.lock_actions().await;
        let outcome = AssertUnwindSafe(
            self.adapter
                .execute_component_action(component_id, action, params, &context),
        )
        .catch_unwind()
        .await;

        let output = match flatten_outcome(outcome) {
            Ok(output) => output,
            Err(cause) => {
                error!("action {}.{} failed: {}", component_id, action, cause);
                return CallResult::failure(
                    CallError::new(ErrorCode::ExecutionError, cause),
                    CallMeta::since(started_at),
                );
            }
        };

        if let Some(patch) = output.state {
            self.apply_patch(component_id, patch, StateSource::Action).await;
        }
        CallResult::ok(output.data, CallMeta::since(started_at))
    }

    /// Remote partial update of a component's properties. Only the provided
    /// keys are validated; on success `data` is the merged state.
    #[instrument(level = "debug", skip(self, properties, raw))]
    pub async fn update_component(
        &self,
        component_id: &str,
        properties: Value,
        raw: RawContext,
    ) -> CallResult {
        let Some(entry) = self.registry.get_component(component_id) else {
            return CallResult::rejected(
                ErrorCode::ComponentNotFound,
                format!("Component not found: {}", component_id),
            );
        };

        let context = self.contexts.build(raw);
        if let Err(e) = authorize(entry.definition.auth_level, &context) {
            return CallResult::failure(e, CallMeta::instant());
        }
        let patch = match normalize_params(properties) {
            Value::Object(patch) => patch,
            other => {
                return CallResult::rejected(
                    ErrorCode::InvalidParameters,
                    format!("properties must be an object, got {}", json_type(&other)),
                )
            }
        };
        if let Err(violations) = entry.definition.properties_schema.validate_partial(&patch) {
            return invalid_parameters(violations);
        }

        let started_at = Timestamp::now();
        match self.apply_patch(component_id, patch, StateSource::Agent).await {
            Some(state) => CallResult::ok(Value::Object(state), CallMeta::since(started_at)),
            // Unregistered between lookup and merge.
            None => CallResult::rejected(
                ErrorCode::ComponentNotFound,
                format!("Component not found: {}", component_id),
            ),
        }
    }

    /// Merges into the state store, then tells the adapter. Adapter failures
    /// are logged; the merged state stands.
    pub(crate) async fn apply_patch(
        &self,
        component_id: &str,
        patch: Map<String, Value>,
        source: StateSource,
    ) -> Option<Map<String, Value>> {
        let merged = self
            .registry
            .state()
            .merge(component_id, patch.clone(), source)?;
        if let Err(e) = self
            .adapter
            .update_component_state(component_id, patch)
            .await
        {
            warn!("adapter rejected state update for {}: {}", component_id, e);
        }
        Some(merged)
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn adapter(&self) -> &Arc<dyn FrameworkAdapter> {
        &self.adapter
    }

    pub fn contexts(&self) -> &ContextBuilder {
        &self.contexts
    }
}

fn authorize(level: AuthLevel, context: &ExecutionContext) -> Result<(), CallError> {
    if level == AuthLevel::Public {
        return Ok(());
    }
    let Some(user) = &context.user else {
        return Err(CallError::new(ErrorCode::Unauthorized, "Authentication required"));
    };
    if level == AuthLevel::Admin && !user.is_admin() {
        return Err(CallError::new(ErrorCode::Forbidden, "Admin role required"));
    }
    Ok(())
}

// A missing payload means "no parameters".
fn normalize_params(params: Value) -> Value {
    match params {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

fn invalid_parameters(violations: Vec<SchemaViolation>) -> CallResult {
    let summary = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    CallResult::failure(
        CallError::new(ErrorCode::InvalidParameters, format!("Invalid parameters: {}", summary))
            .with_details(json!({ "violations": violations })),
        CallMeta::instant(),
    )
}

fn flatten_outcome<T>(
    outcome: Result<Result<T, HandlerError>, Box<dyn Any + Send>>,
) -> Result<T, String> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
