//! Master side of the remote control plane: deploys slave specs to
//! worker hosts and keeps one invocation stub per slave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde_json::Value;
use tracing::{event, Level};
use url::Url;

use crate::error::Error;
use crate::remote::client::EndpointClient;
use crate::remote::endpoint::Endpoint;
use crate::remote::slave::SlaveSpec;
use crate::server::{ServerHandle, ServerState};
use crate::CRATE_NAME;

/// Stub for invoking methods on one deployed slave.
pub struct SlaveHandle {
    pub id: u64,
    pub url: Url,
    client: EndpointClient,
}

impl SlaveHandle {
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        self.client.call(method, args).await
    }

    pub fn destroy(&self) {
        self.client.destroy();
    }
}

/// Controller for a set of worker nodes. Installs a local endpoint that
/// receives `updateSlaveState_` reports and deploys slave specs to
/// worker hosts over `POST /remote`.
pub struct Master {
    endpoint_id: u64,
    endpoint_url: String,
    server: Arc<ServerState>,
    states: Arc<Mutex<HashMap<u64, Value>>>,
    http: reqwest::Client,
    slaves: Vec<SlaveHandle>,
}

impl Master {
    /// Install the master endpoint on the local server.
    pub fn new(server: &ServerHandle) -> Result<Self, Error> {
        let states: Arc<Mutex<HashMap<u64, Value>>> = Arc::default();
        let mut endpoint = Endpoint::new();
        let sink = states.clone();
        endpoint.define_method("updateSlaveState_", move |_ctx, args| {
            let sink = sink.clone();
            async move {
                let id = args
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::protocol("missing slave id"))?;
                let state = args.into_iter().nth(1).unwrap_or(Value::Null);
                if let Ok(mut states) = sink.lock() {
                    states.insert(id, state);
                }
                Ok(Value::Null)
            }
        });
        let endpoint = Arc::new(endpoint);
        endpoint.start();
        let state = server.state().clone();
        let endpoint_id = state.allocate_id();
        state.install_endpoint(endpoint_id, endpoint)?;
        Ok(Self {
            endpoint_id,
            endpoint_url: format!("{}/remote/{}", server.url(), endpoint_id),
            server: state,
            states,
            http: reqwest::Client::new(),
            slaves: Vec::new(),
        })
    }

    /// Absolute URL slaves report their state to.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Install `spec` on the worker at `host` (e.g. `http://10.0.0.2:8000`)
    /// and keep a stub for it, returning the slave's absolute URL. The
    /// spec's master URL is pointed at this master's endpoint.
    pub async fn deploy(&mut self, host: &str, spec: SlaveSpec) -> Result<Url, Error> {
        let spec = SlaveSpec {
            master: Some(self.endpoint_url.clone()),
            ..spec
        };
        let response = self
            .http
            .post(format!("{host}/remote"))
            .json(&spec)
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::protocol(format!(
                "slave install rejected with {status}: {body}"
            )));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::protocol("slave install reply carried no location"))?;
        let base = Url::parse(host)
            .map_err(|err| Error::config(format!("invalid worker host {host}: {err}")))?;
        let url = base
            .join(location)
            .map_err(|err| Error::protocol(format!("invalid slave location {location}: {err}")))?;
        event!(target: CRATE_NAME, Level::INFO, slave = spec.id, url = %url, "slave deployed");
        self.slaves.push(SlaveHandle {
            id: spec.id,
            url: url.clone(),
            client: EndpointClient::new(url.clone()),
        });
        Ok(url)
    }

    pub fn slaves(&self) -> &[SlaveHandle] {
        &self.slaves
    }

    /// Invoke the same method on every slave, collecting per-slave
    /// results in deployment order.
    pub async fn invoke_all(&self, method: &str, args: Vec<Value>) -> Vec<Result<Value, Error>> {
        join_all(
            self.slaves
                .iter()
                .map(|slave| slave.invoke(method, args.clone())),
        )
        .await
    }

    /// Last state reported by each slave.
    pub fn slave_states(&self) -> HashMap<u64, Value> {
        self.states
            .lock()
            .map(|states| states.clone())
            .unwrap_or_default()
    }

    /// Tear down every stub and the local endpoint.
    pub fn destroy(&self) {
        for slave in &self.slaves {
            slave.destroy();
        }
        self.server.remove_endpoint(self.endpoint_id);
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.destroy();
    }
}
