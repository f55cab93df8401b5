//! Slave side of the remote control plane: a node installed by a master
//! through `POST /remote`, holding a local RPC endpoint and a reporting
//! link back to the master.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{event, Level};
use url::Url;

use crate::error::Error;
use crate::remote::client::{ClientState, EndpointClient};
use crate::remote::endpoint::{Endpoint, EndpointState, MethodFn};
use crate::server::ServerState;
use crate::CRATE_NAME;

fn default_update_interval() -> u64 {
    2000
}

/// One method exposed on the slave: `name` is the method name on the
/// endpoint, `fun` is a key into the slave's [`MethodRegistry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveMethod {
    pub name: String,
    pub fun: String,
}

/// Wire form of a slave installation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveSpec {
    pub id: u64,
    #[serde(default)]
    pub master: Option<String>,
    #[serde(default)]
    pub master_methods: Vec<String>,
    #[serde(default)]
    pub slave_methods: Vec<SlaveMethod>,
    /// Milliseconds between state reports to the master.
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
}

impl SlaveSpec {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            master: None,
            master_methods: Vec::new(),
            slave_methods: Vec::new(),
            update_interval: default_update_interval(),
        }
    }

    pub fn with_master(mut self, master: impl Into<String>) -> Self {
        self.master = Some(master.into());
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, fun: impl Into<String>) -> Self {
        self.slave_methods.push(SlaveMethod {
            name: name.into(),
            fun: fun.into(),
        });
        self
    }

    pub fn with_update_interval(mut self, millis: u64) -> Self {
        self.update_interval = millis;
        self
    }
}

/// The closed set of callables a slave is willing to expose. Masters
/// select from it by key; transmitted code is rejected by construction.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    entries: HashMap<String, MethodFn>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock methods every slave understands.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Echoes the last caller-supplied argument (static params come
        // first in the argument list).
        registry.define("echo", |_ctx, args| async move {
            Ok(args.into_iter().last().unwrap_or(Value::Null))
        });
        registry
    }

    pub fn define<F, Fut>(&mut self, key: impl Into<String>, method: F)
    where
        F: Fn(Arc<crate::remote::endpoint::EndpointContext>, Vec<Value>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = Result<Value, Error>> + Send + 'static,
    {
        self.entries.insert(
            key.into(),
            Arc::new(move |ctx, args| Box::pin(method(ctx, args))),
        );
    }

    pub fn materialize(&self, key: &str) -> Result<MethodFn, Error> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown slave method: {key}")))
    }
}

/// A live slave installation. Owns the endpoint route and the optional
/// master reporting link; destroying either side tears down the other.
pub struct SlaveNode {
    id: u64,
    url: String,
    endpoint: Arc<Endpoint>,
    master: Option<Arc<EndpointClient>>,
    server: Weak<ServerState>,
    updater: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl SlaveNode {
    /// Build a node from a spec: materialize every slave method from the
    /// registry, install the endpoint, wire the master client, start the
    /// state updater. Any failure leaves the server untouched.
    pub async fn create(server: Arc<ServerState>, spec: SlaveSpec) -> Result<Arc<Self>, Error> {
        let mut endpoint = Endpoint::new();
        for method in &spec.slave_methods {
            let callable = server.registry().materialize(&method.fun)?;
            endpoint.define_method_raw(method.name.clone(), callable);
        }

        let master = match &spec.master {
            Some(base) => {
                let url = Url::parse(base)
                    .map_err(|err| Error::config(format!("invalid master url {base}: {err}")))?;
                Some(Arc::new(
                    EndpointClient::new(url).with_static_params(vec![json!(spec.id)]),
                ))
            }
            None => None,
        };

        let endpoint = Arc::new(endpoint);
        endpoint.start();
        endpoint.context().set_state(json!("initialized"));
        server.install_endpoint(spec.id, endpoint.clone())?;

        let node = Arc::new(Self {
            id: spec.id,
            url: format!("/remote/{}", spec.id),
            endpoint,
            master: master.clone(),
            server: Arc::downgrade(&server),
            updater: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        server.register_slave(node.clone());

        if let Some(client) = master {
            let interval = Duration::from_millis(spec.update_interval.max(1));
            let weak = Arc::downgrade(&node);
            let handle = tokio::spawn(async move {
                let _ = client.connect().await;
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(node) = weak.upgrade() else { break };
                    if node.destroyed.load(Ordering::Acquire) {
                        break;
                    }
                    if node.endpoint.state() == EndpointState::Destroyed
                        || client.state() == ClientState::Destroyed
                    {
                        node.destroy();
                        break;
                    }
                    if client.state() == ClientState::Connected {
                        let state = node.endpoint.context().state();
                        if let Err(err) = client.call("updateSlaveState_", vec![state]).await {
                            event!(
                                target: CRATE_NAME,
                                Level::DEBUG,
                                slave = node.id,
                                err = %err,
                                "state report failed"
                            );
                        }
                    }
                }
            });
            if let Ok(mut updater) = node.updater.lock() {
                *updater = Some(handle);
            }
        }

        event!(target: CRATE_NAME, Level::INFO, slave = spec.id, "slave node started");
        Ok(node)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path of the node's endpoint on the host server.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Tear the node down: endpoint unregistered, master link closed,
    /// updater stopped, node removed from the active list. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.endpoint.destroy();
        if let Some(master) = &self.master {
            master.destroy();
        }
        if let Ok(mut updater) = self.updater.lock() {
            if let Some(handle) = updater.take() {
                handle.abort();
            }
        }
        if let Some(server) = self.server.upgrade() {
            server.remove_endpoint(self.id);
            server.remove_slave(self.id);
        }
        event!(target: CRATE_NAME, Level::INFO, slave = self.id, "slave node ended");
    }
}

impl Drop for SlaveNode {
    fn drop(&mut self) {
        self.destroy();
    }
}
