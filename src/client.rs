//! Wrapper types over the reqwest crate.
//!
//! The wrapper client pins every request to a test target base URL and
//! stamps the metadata (method, path, body size, fingerprint) that the
//! statistics layer consumes, emitting a trace event per request body
//! written.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use http::Method;
use tracing::{event, Level};

use crate::USER_TASK;

/// One concrete HTTP request a virtual user is about to issue.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Per-request deadline; `None` waits for the transport.
    pub timeout: Option<Duration>,
}

impl RequestTemplate {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }

    /// Stable identity of `(method, path, body)`, used by the uniques
    /// statistic to count distinct requests.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.method.as_str().hash(&mut hasher);
        self.path.hash(&mut hasher);
        self.body.hash(&mut hasher);
        hasher.finish()
    }
}

/// HTTP client owned by a single virtual user.
#[derive(Clone)]
pub struct Client {
    inner: reqwest::Client,
    base: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Client").field("base", &self.base).finish()
    }
}

impl Client {
    /// New client against `base` (e.g. `http://localhost:8080`).
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base: base.into(),
        }
    }

    pub fn with_inner(inner: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            inner,
            base: base.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Issue `template` against the base URL.
    pub async fn send(&self, template: &RequestTemplate) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}{}", self.base, template.path);
        let mut builder = self.inner.request(template.method.clone(), &url);
        for (name, value) in &template.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &template.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = template.timeout {
            builder = builder.timeout(timeout);
        }
        event!(
            name: "request.write",
            target: USER_TASK,
            Level::DEBUG,
            method = %template.method,
            path = %template.path,
            bytes = template.body_len()
        );
        builder.send().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_distinguishes_method_path_and_body() {
        let a = RequestTemplate::get("/");
        let b = RequestTemplate::new(Method::POST, "/");
        let c = RequestTemplate::get("/other");
        let d = RequestTemplate::get("/").with_body("payload");
        let prints = [a.fingerprint(), b.fingerprint(), c.fingerprint(), d.fingerprint()];
        for (i, x) in prints.iter().enumerate() {
            for (j, y) in prints.iter().enumerate() {
                if i != j {
                    assert_ne!(x, y);
                }
            }
        }
        assert_eq!(a.fingerprint(), RequestTemplate::get("/").fingerprint());
    }

    #[test]
    fn body_len_counts_bytes() {
        assert_eq!(RequestTemplate::get("/").body_len(), 0);
        assert_eq!(RequestTemplate::get("/").with_body("abcd").body_len(), 4);
    }
}
