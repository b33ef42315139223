//! Wire envelopes.
//!
//! Every frame is a JSON object discriminated by `type`. Requests carry an
//! `id`, responses a `correlationId` equal to the request's `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    context::{AgentInfo, ApplicationInfo},
    pipeline::result::{CallError, CallMeta, CallResult, ErrorCode},
    registry::{ComponentDefinition, FunctionDefinition},
    timestamp::Timestamp,
};

use super::catalog::CapabilitySet;

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesRequest {
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub components: Vec<ComponentDefinition>,
}

impl CapabilitiesRequest {
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self {
            id: new_message_id(),
            timestamp: Timestamp::now(),
            functions: capabilities.functions,
            components: capabilities.components,
        }
    }

    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(self.functions.clone(), self.components.clone())
    }
}

/// Request with no payload beyond its id (`query_capabilities`, `ping`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BareRequest {
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl BareRequest {
    pub fn new() -> Self {
        Self {
            id: new_message_id(),
            timestamp: Timestamp::now(),
        }
    }
}

impl Default for BareRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesResponse {
    pub correlation_id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub components: Vec<ComponentDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesBroadcast {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub components: Vec<ComponentDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFunctionMessage {
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallComponentActionMessage {
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    pub component_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateComponentMessage {
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    pub component_id: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Body of `function_result`, `component_action_result` and
/// `component_update_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub correlation_id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<CallMeta>,
}

impl ResultMessage {
    pub fn new(correlation_id: &str, result: CallResult) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            timestamp: Timestamp::now(),
            success: result.success,
            data: result.data,
            error: result.error,
            meta: Some(result.meta),
        }
    }

    pub fn into_call_result(self) -> CallResult {
        CallResult {
            success: self.success,
            data: if self.success {
                Some(self.data.unwrap_or(Value::Null))
            } else {
                None
            },
            error: if self.success {
                None
            } else {
                Some(self.error.unwrap_or_else(|| {
                    CallError::new(ErrorCode::ExecutionError, "remote call failed")
                }))
            },
            meta: self.meta.unwrap_or_else(CallMeta::instant),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub success: bool,
    pub error: CallError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub correlation_id: String,
    #[serde(default)]
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Envelope {
    RegisterCapabilities(CapabilitiesRequest),
    UpdateCapabilities(CapabilitiesRequest),
    QueryCapabilities(BareRequest),
    CapabilitiesResult(CapabilitiesResponse),
    CapabilitiesUpdated(CapabilitiesBroadcast),
    CallFunction(CallFunctionMessage),
    CallComponentAction(CallComponentActionMessage),
    UpdateComponent(UpdateComponentMessage),
    FunctionResult(ResultMessage),
    ComponentActionResult(ResultMessage),
    ComponentUpdateResult(ResultMessage),
    Error(ErrorMessage),
    Session(SessionMessage),
    Ping(BareRequest),
    Pong(PongMessage),
}

impl Envelope {
    pub fn call_function(name: &str, parameters: Value, context: Option<Value>) -> Self {
        Envelope::CallFunction(CallFunctionMessage {
            id: new_message_id(),
            timestamp: Timestamp::now(),
            name: name.to_string(),
            parameters,
            context,
        })
    }

    pub fn call_component_action(
        component_id: &str,
        action: &str,
        parameters: Value,
        context: Option<Value>,
    ) -> Self {
        Envelope::CallComponentAction(CallComponentActionMessage {
            id: new_message_id(),
            timestamp: Timestamp::now(),
            component_id: component_id.to_string(),
            action: action.to_string(),
            parameters,
            context,
        })
    }

    pub fn update_component(component_id: &str, properties: Value, context: Option<Value>) -> Self {
        Envelope::UpdateComponent(UpdateComponentMessage {
            id: new_message_id(),
            timestamp: Timestamp::now(),
            component_id: component_id.to_string(),
            properties,
            context,
        })
    }

    pub fn query_capabilities() -> Self {
        Envelope::QueryCapabilities(BareRequest::new())
    }

    pub fn ping() -> Self {
        Envelope::Ping(BareRequest::new())
    }

    pub fn pong(correlation_id: &str) -> Self {
        Envelope::Pong(PongMessage {
            correlation_id: correlation_id.to_string(),
            timestamp: Timestamp::now(),
        })
    }

    pub fn error(correlation_id: Option<String>, error: CallError) -> Self {
        Envelope::Error(ErrorMessage {
            correlation_id,
            timestamp: Timestamp::now(),
            success: false,
            error,
        })
    }

    pub fn session(
        session_id: &str,
        application: Option<ApplicationInfo>,
        agent: Option<AgentInfo>,
    ) -> Self {
        Envelope::Session(SessionMessage {
            id: new_message_id(),
            timestamp: Timestamp::now(),
            session_id: session_id.to_string(),
            application,
            agent,
        })
    }

    /// The wire `type` of this envelope.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// `id` of a request-shaped envelope.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Envelope::RegisterCapabilities(m) | Envelope::UpdateCapabilities(m) => Some(&m.id),
            Envelope::QueryCapabilities(m) | Envelope::Ping(m) => Some(&m.id),
            Envelope::CallFunction(m) => Some(&m.id),
            Envelope::CallComponentAction(m) => Some(&m.id),
            Envelope::UpdateComponent(m) => Some(&m.id),
            Envelope::Session(m) => Some(&m.id),
            _ => None,
        }
    }

    /// `correlationId` of a response-shaped envelope.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Envelope::CapabilitiesResult(m) => Some(&m.correlation_id),
            Envelope::CapabilitiesUpdated(m) => m.correlation_id.as_deref(),
            Envelope::FunctionResult(m)
            | Envelope::ComponentActionResult(m)
            | Envelope::ComponentUpdateResult(m) => Some(&m.correlation_id),
            Envelope::Error(m) => m.correlation_id.as_deref(),
            Envelope::Pong(m) => Some(&m.correlation_id),
            _ => None,
        }
    }

    /// Converts a result-shaped response into the `CallResult` it carries.
    /// `capabilities_result` becomes a success whose data is the capability set.
    pub fn into_call_result(self) -> Option<CallResult> {
        match self {
            Envelope::FunctionResult(m)
            | Envelope::ComponentActionResult(m)
            | Envelope::ComponentUpdateResult(m) => Some(m.into_call_result()),
            Envelope::Error(m) => Some(CallResult::failure(m.error, CallMeta::instant())),
            Envelope::CapabilitiesResult(m) => {
                let set = CapabilitySet::new(m.functions, m.components);
                let data = serde_json::to_value(&set).unwrap_or(Value::Null);
                Some(CallResult::ok(data, CallMeta::instant()))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Encode {
            message: e.to_string(),
        })
    }

    pub fn decode(frame: &str) -> Result<Self, MessageError> {
        serde_json::from_str(frame).map_err(|e| MessageError::Malformed {
            message: e.to_string(),
            request_id: recover_request_id(frame),
        })
    }
}

// Best effort: the frame may be valid JSON with a bad shape.
fn recover_request_id(frame: &str) -> Option<String> {
    let value: Value = serde_json::from_str(frame).ok()?;
    match value.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("malformed envelope: {message}")]
    Malformed {
        message: String,
        request_id: Option<String>,
    },
    #[error("failed to encode envelope: {message}")]
    Encode { message: String },
}

impl MessageError {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            MessageError::Malformed { request_id, .. } => request_id.as_deref(),
            MessageError::Encode { .. } => None,
        }
    }
}
