//! HTTP-mounted named-method dispatch tables.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Wire format of one endpoint call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Wire format of one endpoint reply: exactly one of `result`/`error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn result(value: Value) -> Self {
        Self {
            result: Some(value),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Mutable state shared by every method of an endpoint.
#[derive(Debug, Default)]
pub struct EndpointContext {
    state: Mutex<Value>,
}

impl EndpointContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, value: Value) {
        if let Ok(mut state) = self.state.lock() {
            *state = value;
        }
    }

    pub fn state(&self) -> Value {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or(Value::Null)
    }
}

pub type MethodFn =
    Arc<dyn Fn(Arc<EndpointContext>, Vec<Value>) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Initialized,
    Started,
    Destroyed,
}

/// A named-method RPC surface. Methods receive the shared context and
/// the call arguments with `static_params` prepended.
pub struct Endpoint {
    methods: HashMap<String, MethodFn>,
    static_params: Vec<Value>,
    context: Arc<EndpointContext>,
    state: Mutex<EndpointState>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            static_params: Vec::new(),
            context: Arc::new(EndpointContext::new()),
            state: Mutex::new(EndpointState::Initialized),
        }
    }

    pub fn context(&self) -> Arc<EndpointContext> {
        self.context.clone()
    }

    pub fn set_static_params(&mut self, params: Vec<Value>) {
        self.static_params = params;
    }

    pub fn define_method<F, Fut>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(Arc<EndpointContext>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.define_method_raw(name, Arc::new(move |ctx, args| Box::pin(method(ctx, args))));
    }

    pub fn define_method_raw(&mut self, name: impl Into<String>, method: MethodFn) {
        self.methods.insert(name.into(), method);
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn state(&self) -> EndpointState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(EndpointState::Destroyed)
    }

    pub fn start(&self) {
        if let Ok(mut state) = self.state.lock() {
            if *state == EndpointState::Initialized {
                *state = EndpointState::Started;
            }
        }
    }

    pub fn destroy(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = EndpointState::Destroyed;
        }
    }

    /// Resolve one call. Unknown methods and method failures come back
    /// as `{error}` replies, never transport errors.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        if self.state() != EndpointState::Started {
            return RpcResponse::error("endpoint not started");
        }
        let Some(method) = self.methods.get(&request.method) else {
            return RpcResponse::error("unknown method");
        };
        let mut args = self.static_params.clone();
        args.extend(request.args);
        match method(self.context.clone(), args).await {
            Ok(value) => RpcResponse::result(value),
            Err(err) => RpcResponse::error(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(method: &str, args: Vec<Value>) -> RpcRequest {
        RpcRequest {
            method: method.to_string(),
            args,
        }
    }

    #[tokio::test]
    async fn dispatches_with_static_params_prepended() {
        let mut endpoint = Endpoint::new();
        endpoint.set_static_params(vec![json!(3)]);
        endpoint.define_method("echo_all", |_ctx, args| async move { Ok(json!(args)) });
        endpoint.start();
        let reply = endpoint.dispatch(call("echo_all", vec![json!("hi")])).await;
        assert_eq!(reply.result, Some(json!([3, "hi"])));
        assert_eq!(reply.error, None);
    }

    #[tokio::test]
    async fn unknown_method_is_an_error_reply() {
        let mut endpoint = Endpoint::new();
        endpoint.define_method("known", |_ctx, _args| async move { Ok(Value::Null) });
        endpoint.start();
        let reply = endpoint.dispatch(call("missing", vec![])).await;
        assert_eq!(reply.error.as_deref(), Some("unknown method"));
    }

    #[tokio::test]
    async fn lifecycle_gates_dispatch() {
        let mut endpoint = Endpoint::new();
        endpoint.define_method("noop", |_ctx, _args| async move { Ok(Value::Null) });
        assert_eq!(endpoint.state(), EndpointState::Initialized);
        let reply = endpoint.dispatch(call("noop", vec![])).await;
        assert!(reply.error.is_some());
        endpoint.start();
        assert_eq!(endpoint.state(), EndpointState::Started);
        assert!(endpoint.dispatch(call("noop", vec![])).await.error.is_none());
        endpoint.destroy();
        assert_eq!(endpoint.state(), EndpointState::Destroyed);
        assert!(endpoint.dispatch(call("noop", vec![])).await.error.is_some());
    }

    #[tokio::test]
    async fn methods_share_the_context_state() {
        let mut endpoint = Endpoint::new();
        endpoint.define_method("mark", |ctx, args| async move {
            ctx.set_state(args.into_iter().next().unwrap_or(Value::Null));
            Ok(Value::Null)
        });
        endpoint.start();
        endpoint.dispatch(call("mark", vec![json!("ready")])).await;
        assert_eq!(endpoint.context().state(), json!("ready"));
    }
}
