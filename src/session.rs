//! The unit of work a virtual user repeats, and the adapter that turns
//! an HTTP request source into one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{event, Level};

use crate::client::{Client, RequestTemplate};
use crate::error::Error;
use crate::{CRATE_NAME, USER_TASK};

/// How an iteration resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultTag {
    Response,
    Timeout,
    ConnectError,
}

/// One completed iteration, as fed to the monitor. `status` is `0` for
/// timeouts and connect errors.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub tag: ResultTag,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub fingerprint: u64,
}

/// A virtual user's work function. One `call` is one iteration;
/// `Ok(None)` means the session had nothing to do this turn.
#[async_trait]
pub trait Session: Send {
    async fn call(&mut self) -> Result<Option<Sample>, Error>;
}

/// Builds one session per virtual user, typically wrapping a fresh HTTP
/// client. Failures are retried by the scheduler with backoff.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn build(&self) -> Result<Box<dyn Session>, Error>;
}

/// Produces the next request for a user, or `None` when the user should
/// stay idle for this iteration.
pub type RequestGenerator = Arc<dyn Fn(&Client) -> Option<RequestTemplate> + Send + Sync>;

/// Produces the per-user HTTP client.
pub type ConnectionGenerator = Arc<dyn Fn() -> Client + Send + Sync>;

/// Session adapter over a request source: submits one request per
/// iteration and maps the outcome (response, timeout, connect error)
/// to a [`Sample`].
pub struct RequestLoop {
    client: Client,
    generator: RequestGenerator,
}

impl RequestLoop {
    pub fn new(client: Client, generator: RequestGenerator) -> Self {
        Self { client, generator }
    }
}

#[async_trait]
impl Session for RequestLoop {
    async fn call(&mut self) -> Result<Option<Sample>, Error> {
        let Some(template) = (self.generator)(&self.client) else {
            return Ok(None);
        };
        let mut sample = Sample {
            method: template.method.to_string(),
            path: template.path.clone(),
            status: 0,
            tag: ResultTag::Response,
            request_bytes: template.body_len(),
            response_bytes: 0,
            fingerprint: template.fingerprint(),
        };
        match self.client.send(&template).await {
            Ok(response) => {
                sample.status = response.status().as_u16();
                event!(
                    name: "response.status",
                    target: USER_TASK,
                    Level::DEBUG,
                    status = sample.status
                );
                // Drain the body so the iteration covers the full
                // exchange; a deadline or reset mid-body still counts
                // against the request.
                match response.bytes().await {
                    Ok(bytes) => sample.response_bytes = bytes.len() as u64,
                    Err(err) if err.is_timeout() => {
                        sample.status = 0;
                        sample.tag = ResultTag::Timeout;
                    }
                    Err(err) => {
                        event!(target: CRATE_NAME, Level::DEBUG, err = %err, "body read failed");
                        sample.status = 0;
                        sample.tag = ResultTag::ConnectError;
                    }
                }
            }
            Err(err) if err.is_timeout() => sample.tag = ResultTag::Timeout,
            Err(err) => {
                event!(target: CRATE_NAME, Level::DEBUG, err = %err, "request failed");
                sample.tag = ResultTag::ConnectError;
            }
        }
        Ok(Some(sample))
    }
}

/// Factory wiring a request source to per-user clients.
pub(crate) struct RequestLoopFactory {
    pub base: String,
    pub connection: Option<ConnectionGenerator>,
    pub generator: RequestGenerator,
}

#[async_trait]
impl SessionFactory for RequestLoopFactory {
    async fn build(&self) -> Result<Box<dyn Session>, Error> {
        let client = match &self.connection {
            Some(generate) => generate(),
            None => Client::new(self.base.clone()),
        };
        Ok(Box::new(RequestLoop::new(client, self.generator.clone())))
    }
}

/// Adapter for plain async closures acting as a [`SessionFactory`].
pub struct FnSessionFactory<F>(pub F);

#[async_trait]
impl<F, Fut> SessionFactory for FnSessionFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Box<dyn Session>, Error>> + Send,
{
    async fn build(&self) -> Result<Box<dyn Session>, Error> {
        (self.0)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn target_server() -> SocketAddr {
        let app = axum::Router::new()
            .route("/", axum::routing::get(|| async { "ok" }))
            .route(
                "/slow",
                axum::routing::get(|| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    "late"
                }),
            )
            .route(
                "/missing",
                axum::routing::get(|| async { axum::http::StatusCode::NOT_FOUND }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn loop_for(addr: SocketAddr, template: RequestTemplate) -> RequestLoop {
        let client = Client::new(format!("http://{addr}"));
        RequestLoop::new(client, Arc::new(move |_| Some(template.clone())))
    }

    #[tokio::test]
    async fn response_maps_status_and_bytes() {
        let addr = target_server().await;
        let mut session = loop_for(addr, RequestTemplate::get("/"));
        let sample = session.call().await.unwrap().unwrap();
        assert_eq!(sample.status, 200);
        assert_eq!(sample.tag, ResultTag::Response);
        assert_eq!(sample.response_bytes, 2);
        let mut session = loop_for(addr, RequestTemplate::get("/missing"));
        let sample = session.call().await.unwrap().unwrap();
        assert_eq!(sample.status, 404);
        assert_eq!(sample.tag, ResultTag::Response);
    }

    #[tokio::test]
    async fn timeout_wins_over_a_slow_response() {
        let addr = target_server().await;
        let template = RequestTemplate::get("/slow").with_timeout(Duration::from_millis(100));
        let mut session = loop_for(addr, template);
        let begun = std::time::Instant::now();
        let sample = session.call().await.unwrap().unwrap();
        assert_eq!(sample.status, 0);
        assert_eq!(sample.tag, ResultTag::Timeout);
        assert!(begun.elapsed() < Duration::from_millis(450));
    }

    #[tokio::test]
    async fn connect_errors_are_tagged() {
        let client = Client::new("http://127.0.0.1:1");
        let mut session = RequestLoop::new(
            client,
            Arc::new(|_| Some(RequestTemplate::get("/"))),
        );
        let sample = session.call().await.unwrap().unwrap();
        assert_eq!(sample.status, 0);
        assert_eq!(sample.tag, ResultTag::ConnectError);
    }

    #[tokio::test]
    async fn an_empty_generator_idles() {
        let client = Client::new("http://127.0.0.1:1");
        let mut session = RequestLoop::new(client, Arc::new(|_| None));
        assert!(session.call().await.unwrap().is_none());
    }
}
