//! Client side of the RPC-over-HTTP link, with reconnection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{event, Level};
use url::Url;

use crate::error::Error;
use crate::remote::endpoint::{RpcRequest, RpcResponse};
use crate::CRATE_NAME;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Doubling delay schedule with a cap.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, cap: Duration) -> Self {
        Self { next: initial, cap }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(self.cap);
        delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnect,
    Destroyed,
}

struct Inner {
    url: Url,
    http: reqwest::Client,
    state: Mutex<ClientState>,
}

impl Inner {
    fn state(&self) -> ClientState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ClientState::Destroyed)
    }

    /// Returns false when the transition is not allowed from the current
    /// state (`Destroyed` is terminal, `Reconnect` is only entered once).
    fn transition(&self, to: ClientState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match (*state, to) {
            (ClientState::Destroyed, _) => false,
            (ClientState::Reconnect, ClientState::Reconnect) => false,
            _ => {
                *state = to;
                true
            }
        }
    }
}

/// Connects to a remote [`Endpoint`](crate::remote::endpoint::Endpoint).
/// Transport failures trigger a probing reconnect loop; calls made while
/// reconnecting are rejected rather than buffered.
pub struct EndpointClient {
    inner: Arc<Inner>,
    static_params: Vec<Value>,
}

impl EndpointClient {
    pub fn new(url: Url) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                http: reqwest::Client::new(),
                state: Mutex::new(ClientState::Disconnected),
            }),
            static_params: Vec::new(),
        }
    }

    /// Values prepended to the argument list of every call.
    pub fn with_static_params(mut self, params: Vec<Value>) -> Self {
        self.static_params = params;
        self
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Probe the remote once. On failure the client enters the
    /// reconnect loop and the error is returned.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.inner.state() == ClientState::Destroyed {
            return Err(Error::transport("endpoint client destroyed"));
        }
        self.inner.transition(ClientState::Connecting);
        match self.inner.http.get(self.inner.url.clone()).send().await {
            Ok(_) => {
                self.inner.transition(ClientState::Connected);
                Ok(())
            }
            Err(err) => {
                self.begin_reconnect();
                Err(err.into())
            }
        }
    }

    /// Invoke a named method on the remote endpoint.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        match self.inner.state() {
            ClientState::Destroyed => return Err(Error::transport("endpoint client destroyed")),
            ClientState::Reconnect => {
                return Err(Error::transport("endpoint client is reconnecting"))
            }
            _ => {}
        }
        let request = RpcRequest {
            method: method.to_string(),
            args: self
                .static_params
                .iter()
                .cloned()
                .chain(args)
                .collect(),
        };
        let response = self
            .inner
            .http
            .post(self.inner.url.clone())
            .json(&request)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.begin_reconnect();
                return Err(err.into());
            }
        };
        // A destroy that raced the request wins: the reply is dropped.
        if !self.inner.transition(ClientState::Connected) {
            return Err(Error::transport("endpoint client destroyed"));
        }
        let reply: RpcResponse = response.json().await?;
        if let Some(error) = reply.error {
            return Err(Error::protocol(error));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    /// Terminal: cancels reconnection and rejects every further call.
    pub fn destroy(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            *state = ClientState::Destroyed;
        }
    }

    fn begin_reconnect(&self) {
        if !self.inner.transition(ClientState::Reconnect) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_CAP);
            loop {
                let delay = backoff.next();
                event!(
                    target: CRATE_NAME,
                    Level::DEBUG,
                    url = %inner.url,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                tokio::time::sleep(delay).await;
                if inner.state() != ClientState::Reconnect {
                    break;
                }
                // Any HTTP reply at all means the transport is back.
                if inner.http.get(inner.url.clone()).send().await.is_ok() {
                    if inner.transition(ClientState::Connected) {
                        event!(target: CRATE_NAME, Level::INFO, url = %inner.url, "reconnected");
                    }
                    break;
                }
            }
        });
    }
}

impl Drop for EndpointClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_CAP);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn destroyed_client_rejects_calls() {
        let client = EndpointClient::new(Url::parse("http://127.0.0.1:9/remote/0").unwrap());
        client.destroy();
        assert_eq!(client.state(), ClientState::Destroyed);
        let err = client.call("echo", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
