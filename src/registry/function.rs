use std::{collections::BTreeSet, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    context::ExecutionContext,
    pipeline::rate_limit::{RateLimit, SlidingWindow},
    schema::Schema,
};

use super::{AuthLevel, HandlerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameter_schema: Schema,
    #[serde(default)]
    pub auth_level: AuthLevel,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl FunctionDefinition {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameter_schema: Schema::Any,
            auth_level: AuthLevel::Public,
            tags: BTreeSet::new(),
            rate_limit: None,
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.parameter_schema = schema;
        self
    }

    pub fn with_auth_level(mut self, auth_level: AuthLevel) -> Self {
        self.auth_level = auth_level;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn with_rate_limit(mut self, max_requests: u32, window_seconds: u64) -> Self {
        self.rate_limit = Some(RateLimit::new(max_requests, window_seconds));
        self
    }
}

#[mockall::automock]
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, params: Value, context: &ExecutionContext) -> Result<Value, HandlerError>;
}

type BoxedCall =
    Box<dyn Fn(Value, ExecutionContext) -> Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>> + Send + Sync>;

/// Adapts an async closure into a [`FunctionHandler`].
pub struct FnHandler {
    call: BoxedCall,
}

#[async_trait]
impl FunctionHandler for FnHandler {
    async fn call(&self, params: Value, context: &ExecutionContext) -> Result<Value, HandlerError> {
        (self.call)(params, context.clone()).await
    }
}

pub fn fn_handler<F, Fut>(f: F) -> Arc<dyn FunctionHandler>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        call: Box::new(move |params, context| Box::pin(f(params, context))),
    })
}

#[derive(Clone)]
pub struct FunctionEntry {
    pub definition: FunctionDefinition,
    pub handler: Arc<dyn FunctionHandler>,
    pub(crate) limiter: Option<Arc<SlidingWindow>>,
}

impl FunctionEntry {
    pub(crate) fn new(definition: FunctionDefinition, handler: Arc<dyn FunctionHandler>) -> Self {
        let limiter = definition
            .rate_limit
            .map(|limit| Arc::new(SlidingWindow::new(limit)));
        Self {
            definition,
            handler,
            limiter,
        }
    }

    pub fn limiter(&self) -> Option<&SlidingWindow> {
        self.limiter.as_deref()
    }
}

impl std::fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}
