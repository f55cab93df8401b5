//! Test specifications: what to hit, how many users, at what rate, for
//! how long, and which statistics to collect.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::Method;

use crate::client::RequestTemplate;
use crate::error::Error;
use crate::profile::{Pacer, Profile};
use crate::session::{
    ConnectionGenerator, RequestGenerator, RequestLoopFactory, SessionFactory,
};

/// A named statistic enabled on a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Latency,
    ResultCodes,
    Uniques,
    Concurrency,
    HttpErrors,
    RequestBytes,
    ResponseBytes,
}

impl StatKind {
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name {
            "latency" => Ok(Self::Latency),
            "result-codes" => Ok(Self::ResultCodes),
            "uniques" => Ok(Self::Uniques),
            "concurrency" => Ok(Self::Concurrency),
            "http-errors" => Ok(Self::HttpErrors),
            "request-bytes" => Ok(Self::RequestBytes),
            "response-bytes" => Ok(Self::ResponseBytes),
            other => Err(Error::config(format!("unknown statistic: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::ResultCodes => "result-codes",
            Self::Uniques => "uniques",
            Self::Concurrency => "concurrency",
            Self::HttpErrors => "http-errors",
            Self::RequestBytes => "request-bytes",
            Self::ResponseBytes => "response-bytes",
        }
    }
}

/// A statistic plus its options.
#[derive(Debug, Clone)]
pub struct StatSpec {
    pub kind: StatKind,
    /// Quantiles reported by the latency histogram.
    pub percentiles: Vec<f64>,
    /// Status codes the http-errors log treats as success.
    pub success_codes: Vec<u16>,
    /// Target file for the http-errors log.
    pub log: Option<PathBuf>,
}

impl StatSpec {
    pub fn new(kind: StatKind) -> Self {
        Self {
            kind,
            percentiles: vec![0.5, 0.95, 0.99],
            success_codes: (200..400).collect(),
            log: None,
        }
    }

    pub fn named(name: &str) -> Result<Self, Error> {
        Ok(Self::new(StatKind::parse(name)?))
    }

    pub fn with_percentiles(mut self, percentiles: Vec<f64>) -> Self {
        self.percentiles = percentiles;
        self
    }

    pub fn with_success_codes(mut self, codes: Vec<u16>) -> Self {
        self.success_codes = codes;
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = Some(path.into());
        self
    }
}

/// Everything needed to drive load against one target.
///
/// Built with chained `with_*` calls; unset fields fall back to the
/// defaults (GET `http://localhost:8080/`, 10 users, 120 seconds,
/// latency and result-code statistics).
#[derive(Clone)]
pub struct TestSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub method: Method,
    pub path: String,
    pub request_data: Option<Vec<u8>>,
    pub request_generator: Option<RequestGenerator>,
    pub session: Option<Arc<dyn SessionFactory>>,
    pub connection_generator: Option<ConnectionGenerator>,
    pub num_users: usize,
    pub user_profile: Option<Profile>,
    /// Constant requests per second; `f64::INFINITY` disables pacing.
    pub target_rps: Option<f64>,
    pub load_profile: Option<Profile>,
    pub num_requests: Option<u64>,
    pub time_limit: Duration,
    pub delay: Duration,
    pub stats: Vec<StatSpec>,
}

impl TestSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: "localhost".to_string(),
            port: 8080,
            method: Method::GET,
            path: "/".to_string(),
            request_data: None,
            request_generator: None,
            session: None,
            connection_generator: None,
            num_users: 10,
            user_profile: None,
            target_rps: None,
            load_profile: None,
            num_requests: None,
            time_limit: Duration::from_secs(120),
            delay: Duration::ZERO,
            stats: vec![
                StatSpec::new(StatKind::Latency),
                StatSpec::new(StatKind::ResultCodes),
            ],
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_request_data(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.request_data = Some(body.into());
        self
    }

    pub fn with_request_generator(mut self, generator: RequestGenerator) -> Self {
        self.request_generator = Some(generator);
        self
    }

    /// Supply the full iteration function, bypassing the request loop.
    pub fn with_session(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session = Some(factory);
        self
    }

    pub fn with_connection_generator(mut self, generator: ConnectionGenerator) -> Self {
        self.connection_generator = Some(generator);
        self
    }

    pub fn with_num_users(mut self, users: usize) -> Self {
        self.num_users = users;
        self
    }

    /// `(t_seconds, user_count)` schedule. Takes precedence over
    /// [`num_users`](Self::with_num_users).
    pub fn with_user_profile(mut self, profile: Profile) -> Self {
        self.user_profile = Some(profile);
        self
    }

    pub fn with_target_rps(mut self, rps: f64) -> Self {
        self.target_rps = Some(rps);
        self
    }

    /// `(t_seconds, rps)` schedule. Takes precedence over
    /// [`target_rps`](Self::with_target_rps).
    pub fn with_load_profile(mut self, profile: Profile) -> Self {
        self.load_profile = Some(profile);
        self
    }

    pub fn with_num_requests(mut self, cap: u64) -> Self {
        self.num_requests = Some(cap);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_stats(mut self, stats: Vec<StatSpec>) -> Self {
        self.stats = stats;
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub(crate) fn concurrency_profile(&self) -> Profile {
        match &self.user_profile {
            Some(profile) => profile.clone(),
            None => Profile::constant(self.num_users as f64),
        }
    }

    pub(crate) fn pacer(&self) -> Pacer {
        if let Some(profile) = &self.load_profile {
            return Pacer::new(profile.clone());
        }
        match self.target_rps {
            Some(rps) if rps.is_finite() => Pacer::new(Profile::constant(rps)),
            _ => Pacer::unpaced(),
        }
    }

    pub(crate) fn build_factory(&self) -> Arc<dyn SessionFactory> {
        if let Some(factory) = &self.session {
            return factory.clone();
        }
        let generator: RequestGenerator = match &self.request_generator {
            Some(generator) => generator.clone(),
            None => {
                let mut template = RequestTemplate::new(self.method.clone(), self.path.clone());
                if let Some(body) = &self.request_data {
                    template = template.with_body(body.clone());
                }
                Arc::new(move |_| Some(template.clone()))
            }
        };
        Arc::new(RequestLoopFactory {
            base: self.base_url(),
            connection: self.connection_generator.clone(),
            generator,
        })
    }
}

impl Default for TestSpec {
    fn default() -> Self {
        Self::new("loadtest")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::NextStart;

    #[test]
    fn defaults_match_the_documented_surface() {
        let spec = TestSpec::default();
        assert_eq!(spec.base_url(), "http://localhost:8080");
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.path, "/");
        assert_eq!(spec.num_users, 10);
        assert_eq!(spec.time_limit, Duration::from_secs(120));
        let names: Vec<_> = spec.stats.iter().map(|s| s.kind.name()).collect();
        assert_eq!(names, ["latency", "result-codes"]);
    }

    #[test]
    fn unknown_statistic_is_a_config_error() {
        assert!(matches!(StatSpec::named("p99s"), Err(Error::Config(_))));
        assert!(StatSpec::named("http-errors").is_ok());
    }

    #[test]
    fn profiles_win_over_scalars() {
        let spec = TestSpec::new("t")
            .with_num_users(3)
            .with_user_profile(Profile::constant(7.0))
            .with_target_rps(10.0)
            .with_load_profile(Profile::constant(1.0));
        assert_eq!(spec.concurrency_profile().value(0.0), 7.0);
        match spec.pacer().next_start(0) {
            NextStart::At(d) => assert!((d.as_secs_f64() - 1.0).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn infinite_rps_means_unpaced() {
        let spec = TestSpec::new("t").with_target_rps(f64::INFINITY);
        assert!(spec.pacer().is_unpaced());
        let spec = TestSpec::new("t");
        assert!(spec.pacer().is_unpaced());
    }
}
