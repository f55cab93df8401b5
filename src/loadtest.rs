//! Composes loops and monitors into one running invocation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{event, Level};

use crate::config::TestSpec;
use crate::error::Error;
use crate::monitor::{Monitor, StatSnapshot};
use crate::multiloop::{LoopConfig, LoopEvent, LoopHandle, MultiLoop};
use crate::server::ServerHandle;
use crate::CRATE_NAME;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(2);

/// Statistics for one test at one update tick.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub name: String,
    pub stats: BTreeMap<String, StatSnapshot>,
}

#[derive(Debug)]
pub enum TestEvent {
    Start,
    Update { reports: Vec<TestReport> },
    End,
}

enum Command {
    Stop,
    SetUpdateInterval(Duration),
}

/// A running invocation: one loop and monitor per spec, a periodic
/// updater, and global end detection.
pub struct LoadTest {
    events: mpsc::UnboundedReceiver<TestEvent>,
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

impl LoadTest {
    /// Coordinator event stream: `Start`, periodic `Update`s, one `End`.
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TestEvent> {
        &mut self.events
    }

    /// Wind every loop down. Idempotent; in-flight iterations complete.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn set_update_interval(&self, interval: Duration) {
        let _ = self.commands.send(Command::SetUpdateInterval(interval));
    }

    /// Wait for the invocation to finish.
    pub async fn join(self) -> Result<(), Error> {
        self.driver
            .await
            .map_err(|err| Error::Generic(anyhow::anyhow!("coordinator task failed: {err}")))
    }
}

/// Start driving load for every spec. Must be called on a tokio runtime.
pub fn run(specs: Vec<TestSpec>) -> Result<LoadTest, Error> {
    run_with_server(specs, None)
}

/// Like [`run`], additionally owning `server`: it is shut down when the
/// test ends.
pub fn run_with_server(
    specs: Vec<TestSpec>,
    server: Option<ServerHandle>,
) -> Result<LoadTest, Error> {
    if specs.is_empty() {
        return Err(Error::config("at least one test spec is required"));
    }

    let mut names = Vec::new();
    let mut monitors = Vec::new();
    let mut handles: Vec<LoopHandle> = Vec::new();
    let mut streams: StreamMap<usize, UnboundedReceiverStream<LoopEvent>> = StreamMap::new();

    for (index, spec) in specs.iter().enumerate() {
        let monitor = Monitor::new(&spec.stats)?;
        let config = LoopConfig {
            concurrency: spec.concurrency_profile(),
            pacer: spec.pacer(),
            duration: spec.time_limit,
            iterations: spec.num_requests,
            delay: spec.delay,
        };
        let (multiloop, handle, loop_events) = MultiLoop::new(config, spec.build_factory());
        tokio::spawn(multiloop.run());
        names.push(spec.name.clone());
        monitors.push(Arc::new(Mutex::new(monitor)));
        handles.push(handle);
        streams.insert(index, UnboundedReceiverStream::new(loop_events));
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();

    let driver = tokio::spawn(async move {
        let _ = events_tx.send(TestEvent::Start);
        event!(target: CRATE_NAME, Level::INFO, tests = names.len(), "test started");

        let mut interval = DEFAULT_UPDATE_INTERVAL;
        let mut ticker = update_ticker(interval);
        let mut commands_open = true;
        let total = monitors.len();
        let mut ended = 0usize;

        while ended < total {
            tokio::select! {
                next = streams.next() => {
                    match next {
                        Some((index, event)) => {
                            if matches!(event, LoopEvent::Ended) {
                                ended += 1;
                            }
                            if let Ok(mut monitor) = monitors[index].lock() {
                                monitor.record(&event);
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    let _ = events_tx.send(TestEvent::Update {
                        reports: collect_reports(&names, &monitors),
                    });
                }
                command = commands_rx.recv(), if commands_open => {
                    match command {
                        Some(Command::Stop) => {
                            for handle in &handles {
                                handle.stop();
                            }
                        }
                        Some(Command::SetUpdateInterval(new_interval)) => {
                            interval = new_interval;
                            ticker = update_ticker(interval);
                        }
                        None => commands_open = false,
                    }
                }
            }
        }

        let _ = events_tx.send(TestEvent::Update {
            reports: collect_reports(&names, &monitors),
        });
        let _ = events_tx.send(TestEvent::End);
        event!(target: CRATE_NAME, Level::INFO, "test ended");
        if let Some(server) = server {
            server.shutdown();
        }
    });

    Ok(LoadTest {
        events: events_rx,
        commands: commands_tx,
        driver,
    })
}

fn update_ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

fn collect_reports(names: &[String], monitors: &[Arc<Mutex<Monitor>>]) -> Vec<TestReport> {
    names
        .iter()
        .zip(monitors)
        .map(|(name, monitor)| TestReport {
            name: name.clone(),
            stats: match monitor.lock() {
                Ok(mut monitor) => monitor.update(),
                Err(_) => BTreeMap::new(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatSpec;
    use crate::error::Error;
    use crate::session::{FnSessionFactory, ResultTag, Sample, Session};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSession(Arc<AtomicU64>);

    #[async_trait]
    impl Session for CountingSession {
        async fn call(&mut self) -> Result<Option<Sample>, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Some(Sample {
                method: "GET".to_string(),
                path: "/".to_string(),
                status: 200,
                tag: ResultTag::Response,
                request_bytes: 0,
                response_bytes: 0,
                fingerprint: 7,
            }))
        }
    }

    fn counting_spec(name: &str, calls: Arc<AtomicU64>, cap: u64) -> TestSpec {
        TestSpec::new(name)
            .with_session(Arc::new(FnSessionFactory(move || {
                let calls = calls.clone();
                async move { Ok(Box::new(CountingSession(calls)) as Box<dyn Session>) }
            })))
            .with_num_users(2)
            .with_num_requests(cap)
            .with_time_limit(Duration::from_secs(30))
            .with_stats(vec![
                StatSpec::named("latency").unwrap(),
                StatSpec::named("result-codes").unwrap(),
            ])
    }

    #[tokio::test(start_paused = true)]
    async fn runs_to_completion_and_reports() {
        let calls_a = Arc::new(AtomicU64::new(0));
        let calls_b = Arc::new(AtomicU64::new(0));
        let mut test = run(vec![
            counting_spec("a", calls_a.clone(), 10),
            counting_spec("b", calls_b.clone(), 6),
        ])
        .unwrap();

        let mut saw_start = false;
        let mut saw_end = false;
        let mut last_reports = Vec::new();
        while let Some(event) = test.events().recv().await {
            match event {
                TestEvent::Start => saw_start = true,
                TestEvent::Update { reports } => last_reports = reports,
                TestEvent::End => {
                    saw_end = true;
                    break;
                }
            }
        }
        assert!(saw_start && saw_end);
        assert_eq!(calls_a.load(Ordering::SeqCst), 10);
        assert_eq!(calls_b.load(Ordering::SeqCst), 6);
        assert_eq!(last_reports.len(), 2);
        assert_eq!(last_reports[0].name, "a");
        assert_eq!(last_reports[0].stats["result-codes"].cumulative["200"], 10);
        assert_eq!(last_reports[1].stats["result-codes"].cumulative["200"], 6);
        test.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cascades_to_every_loop() {
        let calls = Arc::new(AtomicU64::new(0));
        let spec = counting_spec("long", calls.clone(), u64::MAX)
            .with_time_limit(Duration::from_secs(3600));
        let mut test = run(vec![spec]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        test.stop();
        test.stop();
        let mut saw_end = false;
        while let Some(event) = test.events().recv().await {
            if matches!(event, TestEvent::End) {
                saw_end = true;
                break;
            }
        }
        assert!(saw_end);
        test.join().await.unwrap();
    }

    #[tokio::test]
    async fn drives_real_http_until_the_request_cap() {
        let app = axum::Router::new().route("/", axum::routing::get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let spec = TestSpec::new("cap")
            .with_host(addr.ip().to_string())
            .with_port(addr.port())
            .with_num_users(4)
            .with_num_requests(20)
            .with_time_limit(Duration::from_secs(60))
            .with_stats(vec![
                StatSpec::named("result-codes").unwrap(),
                StatSpec::named("concurrency").unwrap(),
            ]);
        let mut test = run(vec![spec]).unwrap();
        let mut last_reports = Vec::new();
        while let Some(event) = test.events().recv().await {
            match event {
                TestEvent::Update { reports } => last_reports = reports,
                TestEvent::End => break,
                TestEvent::Start => {}
            }
        }
        let codes = &last_reports[0].stats["result-codes"].cumulative;
        assert_eq!(codes["200"], 20);
        let peak = last_reports[0].stats["concurrency"]
            .cumulative
            .as_u64()
            .unwrap();
        assert!(peak >= 1 && peak <= 4, "peak concurrency was {peak}");
        test.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn update_interval_is_adjustable() {
        let calls = Arc::new(AtomicU64::new(0));
        let spec = counting_spec("ticks", calls, u64::MAX)
            .with_time_limit(Duration::from_secs(3600));
        let mut test = run(vec![spec]).unwrap();
        test.set_update_interval(Duration::from_millis(100));
        let mut updates = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while updates < 3 {
            tokio::select! {
                event = test.events().recv() => {
                    if matches!(event, Some(TestEvent::Update { .. })) {
                        updates += 1;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        assert!(updates >= 3, "saw only {updates} updates in a second");
        test.stop();
        while let Some(event) = test.events().recv().await {
            if matches!(event, TestEvent::End) {
                break;
            }
        }
        test.join().await.unwrap();
    }
}
