//! The embedded HTTP server the control plane mounts onto.
//!
//! Exposes the `/remote` surface: listing and installing slave nodes,
//! and dispatching RPC calls to installed endpoints. Load tests can own
//! a handle to shut the server down when they finish.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::error::Error;
use crate::remote::endpoint::{Endpoint, RpcRequest};
use crate::remote::slave::{MethodRegistry, SlaveNode, SlaveSpec};
use crate::CRATE_NAME;

/// Shared routing state: installed endpoints, active slave nodes, and
/// the method registry slaves materialize from.
pub struct ServerState {
    endpoints: RwLock<HashMap<u64, Arc<Endpoint>>>,
    slaves: RwLock<BTreeMap<u64, Arc<SlaveNode>>>,
    next_id: AtomicU64,
    registry: MethodRegistry,
}

impl ServerState {
    pub fn new(registry: MethodRegistry) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            slaves: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            registry,
        }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Reserve an endpoint id no installation is using.
    pub fn allocate_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let taken = self
                .endpoints
                .read()
                .map(|endpoints| endpoints.contains_key(&id))
                .unwrap_or(true);
            if !taken {
                return id;
            }
        }
    }

    pub fn install_endpoint(&self, id: u64, endpoint: Arc<Endpoint>) -> Result<(), Error> {
        let Ok(mut endpoints) = self.endpoints.write() else {
            return Err(Error::transport("endpoint table poisoned"));
        };
        if endpoints.contains_key(&id) {
            return Err(Error::config(format!("endpoint id {id} already in use")));
        }
        endpoints.insert(id, endpoint);
        Ok(())
    }

    pub fn remove_endpoint(&self, id: u64) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints.remove(&id);
        }
    }

    pub fn endpoint(&self, id: u64) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .ok()
            .and_then(|endpoints| endpoints.get(&id).cloned())
    }

    pub(crate) fn register_slave(&self, node: Arc<SlaveNode>) {
        if let Ok(mut slaves) = self.slaves.write() {
            slaves.insert(node.id(), node);
        }
    }

    pub(crate) fn remove_slave(&self, id: u64) {
        if let Ok(mut slaves) = self.slaves.write() {
            slaves.remove(&id);
        }
    }

    pub fn slave(&self, id: u64) -> Option<Arc<SlaveNode>> {
        self.slaves
            .read()
            .ok()
            .and_then(|slaves| slaves.get(&id).cloned())
    }

    pub fn slave_urls(&self) -> Vec<String> {
        self.slaves
            .read()
            .map(|slaves| slaves.values().map(|node| node.url().to_string()).collect())
            .unwrap_or_default()
    }
}

/// A bound, serving server. Dropping the handle does not stop the
/// server; call [`shutdown`](Self::shutdown).
pub struct ServerHandle {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bind and start serving. `addr` may carry port 0 for an ephemeral
    /// port.
    pub async fn bind(addr: SocketAddr, registry: MethodRegistry) -> Result<Self, Error> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| Error::transport(format!("cannot bind {addr}: {err}")))?;
        let addr = listener
            .local_addr()
            .map_err(|err| Error::transport(err.to_string()))?;
        let state = Arc::new(ServerState::new(registry));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = router(state.clone());
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                event!(target: CRATE_NAME, Level::ERROR, err = %err, "server failed");
            }
        });
        event!(target: CRATE_NAME, Level::INFO, %addr, "server listening");
        Ok(Self {
            addr,
            state,
            shutdown: shutdown_tx,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL of the server, e.g. `http://127.0.0.1:8000`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Begin a graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the server task to finish.
    pub async fn join(self) -> Result<(), Error> {
        self.task
            .await
            .map_err(|err| Error::Generic(anyhow::anyhow!("server task failed: {err}")))
    }
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/remote", get(list_slaves).post(create_slave))
        .route("/remote/:id", axum::routing::post(dispatch_rpc))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::very_permissive())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "Service is healthy")
}

async fn list_slaves(State(state): State<Arc<ServerState>>) -> Json<Vec<String>> {
    Json(state.slave_urls())
}

async fn create_slave(State(state): State<Arc<ServerState>>, body: String) -> Response {
    let spec: SlaveSpec = match serde_json::from_str(&body) {
        Ok(spec) => spec,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid slave spec: {err}")).into_response()
        }
    };
    match SlaveNode::create(state, spec).await {
        Ok(node) => (
            StatusCode::CREATED,
            [(header::LOCATION, node.url().to_string())],
        )
            .into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

async fn dispatch_rpc(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<u64>,
    body: String,
) -> Response {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid call: {err}")).into_response()
        }
    };
    match state.endpoint(id) {
        Some(endpoint) => Json(endpoint.dispatch(request).await).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
