//! Per-call execution context.
//!
//! [`ContextBuilder::build`] turns whatever the caller supplied into a fully
//! populated [`ExecutionContext`]. It never fails: absent or malformed optional
//! fields fall back to defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{config::ApplicationConfig, timestamp::Timestamp};

pub const UNKNOWN_AGENT: &str = "unknown";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            id: UNKNOWN_AGENT.to_string(),
            name: UNKNOWN_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub id: String,
    pub name: String,
    pub environment: String,
}

impl From<&ApplicationConfig> for ApplicationInfo {
    fn from(config: &ApplicationConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            environment: config.environment.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserInfo {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub request_id: String,
    pub timestamp: Timestamp,
    pub agent: AgentInfo,
    pub application: ApplicationInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl ExecutionContext {
    /// Identity used to key per-caller state such as rate-limit windows.
    pub fn caller_key(&self) -> String {
        match &self.user {
            Some(user) => format!("user:{}", user.id),
            None => format!("agent:{}", self.agent.id),
        }
    }
}

/// Caller-supplied context, every field optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawContext {
    pub request_id: Option<String>,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub application_id: Option<String>,
    pub application_name: Option<String>,
    pub environment: Option<String>,
    pub user: Option<UserInfo>,
    pub ip: Option<String>,
}

impl RawContext {
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_agent(mut self, id: &str, name: &str) -> Self {
        self.agent_id = Some(id.to_string());
        self.agent_name = Some(name.to_string());
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    /// Reads a context object off the wire. Fields of the wrong shape are
    /// ignored rather than rejected.
    pub fn from_value(value: &Value) -> Self {
        let str_field = |v: Option<&Value>| v.and_then(Value::as_str).map(str::to_string);

        let agent = value.get("agent");
        let application = value.get("application");

        Self {
            request_id: str_field(value.get("requestId")),
            agent_id: agent.and_then(|a| id_like(a.get("id"))),
            agent_name: str_field(agent.and_then(|a| a.get("name"))),
            application_id: application.and_then(|a| id_like(a.get("id"))),
            application_name: str_field(application.and_then(|a| a.get("name"))),
            environment: str_field(application.and_then(|a| a.get("environment"))),
            user: value.get("user").and_then(user_from_value),
            ip: str_field(value.get("ip")),
        }
    }
}

// Ids may arrive as strings or numbers.
fn id_like(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn user_from_value(value: &Value) -> Option<UserInfo> {
    let id = id_like(value.get("id"))?;
    let roles = value
        .get("roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(UserInfo {
        id,
        name: value.get("name").and_then(Value::as_str).map(str::to_string),
        roles,
    })
}

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    application: ApplicationInfo,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(&ApplicationConfig::default())
    }
}

impl ContextBuilder {
    pub fn new(application: &ApplicationConfig) -> Self {
        Self {
            application: application.into(),
        }
    }

    pub fn build(&self, raw: RawContext) -> ExecutionContext {
        let environment = raw
            .environment
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| {
                if self.application.environment.is_empty() {
                    DEFAULT_ENVIRONMENT.to_string()
                } else {
                    self.application.environment.clone()
                }
            });

        ExecutionContext {
            request_id: raw
                .request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: Timestamp::now(),
            agent: AgentInfo {
                id: raw.agent_id.unwrap_or_else(|| UNKNOWN_AGENT.to_string()),
                name: raw.agent_name.unwrap_or_else(|| UNKNOWN_AGENT.to_string()),
            },
            application: ApplicationInfo {
                id: raw
                    .application_id
                    .unwrap_or_else(|| self.application.id.clone()),
                name: raw
                    .application_name
                    .unwrap_or_else(|| self.application.name.clone()),
                environment,
            },
            user: raw.user,
            ip: raw.ip,
        }
    }
}
