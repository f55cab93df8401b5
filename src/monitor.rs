//! Turns loop events into named statistics.
//!
//! A monitor is attached to one loop's event stream. It stamps iteration
//! starts, computes latency when the matching end arrives, and feeds
//! every enabled statistic. `update()` swaps the windowed aggregators
//! out for an interval snapshot; cumulative aggregators only ever grow.

mod stats;

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{event, Level};

use crate::config::{StatKind, StatSpec};
use crate::error::Error;
use crate::multiloop::LoopEvent;
use crate::session::Sample;
use crate::CRATE_NAME;
use stats::{Agg, LatencyDigest, Uniques};

/// Interval and since-start views of one statistic.
#[derive(Debug, Clone, Serialize)]
pub struct StatSnapshot {
    pub interval: Value,
    pub cumulative: Value,
}

struct Stat {
    spec: StatSpec,
    window: Agg,
    total: Agg,
    log: Option<File>,
}

impl Stat {
    fn new(spec: StatSpec) -> Result<Self, Error> {
        let log = match (&spec.kind, &spec.log) {
            (StatKind::HttpErrors, Some(path)) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| {
                        Error::config(format!("cannot open error log {}: {err}", path.display()))
                    })?,
            ),
            _ => None,
        };
        let shape = match spec.kind {
            StatKind::Latency => Agg::Latency(LatencyDigest::default()),
            StatKind::ResultCodes => Agg::Codes(BTreeMap::new()),
            StatKind::Uniques => Agg::Uniques(Uniques::default()),
            StatKind::Concurrency => Agg::Peak(0),
            StatKind::HttpErrors => Agg::Count(0),
            StatKind::RequestBytes | StatKind::ResponseBytes => Agg::Bytes(0),
        };
        Ok(Self {
            window: shape.fresh(),
            total: shape,
            spec,
            log,
        })
    }

    fn feed(&mut self, sample: &Sample, latency_ms: f64) {
        match (&mut self.window, &mut self.total) {
            (Agg::Latency(window), Agg::Latency(total)) => {
                window.observe(latency_ms);
                total.observe(latency_ms);
            }
            (Agg::Codes(window), Agg::Codes(total)) => {
                *window.entry(sample.status).or_default() += 1;
                *total.entry(sample.status).or_default() += 1;
            }
            (Agg::Uniques(window), Agg::Uniques(total)) => {
                window.insert(sample.fingerprint);
                total.insert(sample.fingerprint);
            }
            (Agg::Count(window), Agg::Count(total)) => {
                if self.spec.success_codes.contains(&sample.status) {
                    return;
                }
                *window += 1;
                *total += 1;
                if let Some(log) = &mut self.log {
                    let line = json!({
                        "time": chrono::Utc::now().to_rfc3339(),
                        "method": sample.method,
                        "path": sample.path,
                        "status": sample.status,
                        "tag": sample.tag,
                        "latencyMs": latency_ms,
                    });
                    if let Err(err) = writeln!(log, "{line}") {
                        event!(target: CRATE_NAME, Level::WARN, err = %err, "error log write failed");
                    }
                }
            }
            (Agg::Bytes(window), Agg::Bytes(total)) => {
                let bytes = match self.spec.kind {
                    StatKind::RequestBytes => sample.request_bytes,
                    _ => sample.response_bytes,
                };
                *window += bytes;
                *total += bytes;
            }
            (Agg::Peak(_), Agg::Peak(_)) => {}
            _ => unreachable!("window and total always share a shape"),
        }
    }

    fn observe_in_flight(&mut self, in_flight: usize) {
        if let (Agg::Peak(window), Agg::Peak(total)) = (&mut self.window, &mut self.total) {
            *window = (*window).max(in_flight);
            *total = (*total).max(in_flight);
        }
    }

    fn snapshot_and_reset(&mut self) -> (String, StatSnapshot) {
        let interval = self.window.snapshot(&self.spec.percentiles);
        self.window = self.window.fresh();
        let cumulative = self.total.snapshot(&self.spec.percentiles);
        (
            self.spec.kind.name().to_string(),
            StatSnapshot {
                interval,
                cumulative,
            },
        )
    }
}

pub struct Monitor {
    stats: Vec<Stat>,
    pending: HashMap<u64, Instant>,
    in_flight: usize,
}

impl Monitor {
    pub fn new(specs: &[StatSpec]) -> Result<Self, Error> {
        let stats = specs
            .iter()
            .cloned()
            .map(Stat::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            stats,
            pending: HashMap::new(),
            in_flight: 0,
        })
    }

    /// Feed one loop event. Start events stamp the iteration; end events
    /// resolve the stamp into a latency and update every statistic.
    pub fn record(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::IterationStart { user } => {
                self.pending.insert(*user, Instant::now());
                self.in_flight += 1;
                for stat in &mut self.stats {
                    stat.observe_in_flight(self.in_flight);
                }
            }
            LoopEvent::IterationEnd { user, sample } => {
                let started = self.pending.remove(user);
                self.in_flight = self.in_flight.saturating_sub(1);
                if let Some(sample) = sample {
                    let latency_ms = started
                        .map(|s| s.elapsed().as_secs_f64() * 1_000.0)
                        .unwrap_or(0.0);
                    for stat in &mut self.stats {
                        stat.feed(sample, latency_ms);
                    }
                }
            }
            LoopEvent::Started | LoopEvent::UsersChanged { .. } | LoopEvent::Ended => {}
        }
    }

    /// Swap windowed aggregators out and report every statistic.
    /// Calling twice with no samples in between leaves the cumulative
    /// side untouched.
    pub fn update(&mut self) -> BTreeMap<String, StatSnapshot> {
        self.stats
            .iter_mut()
            .map(Stat::snapshot_and_reset)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ResultTag;

    fn sample(status: u16, fingerprint: u64) -> Sample {
        Sample {
            method: "GET".to_string(),
            path: "/".to_string(),
            status,
            tag: if status == 0 {
                ResultTag::Timeout
            } else {
                ResultTag::Response
            },
            request_bytes: 10,
            response_bytes: 20,
            fingerprint,
        }
    }

    fn all_stats() -> Vec<StatSpec> {
        ["latency", "result-codes", "uniques", "concurrency", "request-bytes", "response-bytes"]
            .iter()
            .map(|name| StatSpec::named(name).unwrap())
            .collect()
    }

    fn iteration(monitor: &mut Monitor, user: u64, sample: Sample) {
        monitor.record(&LoopEvent::IterationStart { user });
        monitor.record(&LoopEvent::IterationEnd {
            user,
            sample: Some(sample),
        });
    }

    #[test]
    fn counts_codes_bytes_and_uniques() {
        let mut monitor = Monitor::new(&all_stats()).unwrap();
        iteration(&mut monitor, 0, sample(200, 1));
        iteration(&mut monitor, 1, sample(200, 1));
        iteration(&mut monitor, 0, sample(500, 2));
        let report = monitor.update();
        assert_eq!(report["result-codes"].interval["200"], 2);
        assert_eq!(report["result-codes"].interval["500"], 1);
        assert_eq!(report["uniques"].interval["count"], 2);
        assert_eq!(report["request-bytes"].interval, 30);
        assert_eq!(report["response-bytes"].cumulative, 60);
        assert_eq!(report["latency"].interval["count"], 3);
    }

    #[test]
    fn update_resets_the_window_but_not_the_total() {
        let mut monitor = Monitor::new(&all_stats()).unwrap();
        iteration(&mut monitor, 0, sample(200, 1));
        let first = monitor.update();
        assert_eq!(first["result-codes"].cumulative["200"], 1);
        let second = monitor.update();
        assert!(second["result-codes"].interval.as_object().unwrap().is_empty());
        assert_eq!(second["result-codes"].cumulative["200"], 1);
        assert_eq!(second["latency"].interval, serde_json::json!({ "count": 0 }));
        assert_eq!(second["latency"].cumulative["count"], 1);
    }

    #[test]
    fn peak_concurrency_tracks_overlapping_iterations() {
        let mut monitor = Monitor::new(&all_stats()).unwrap();
        monitor.record(&LoopEvent::IterationStart { user: 0 });
        monitor.record(&LoopEvent::IterationStart { user: 1 });
        monitor.record(&LoopEvent::IterationStart { user: 2 });
        monitor.record(&LoopEvent::IterationEnd {
            user: 2,
            sample: Some(sample(200, 1)),
        });
        monitor.record(&LoopEvent::IterationEnd {
            user: 1,
            sample: Some(sample(200, 1)),
        });
        let report = monitor.update();
        assert_eq!(report["concurrency"].interval, 3);
        let report = monitor.update();
        assert_eq!(report["concurrency"].interval, 0);
        assert_eq!(report["concurrency"].cumulative, 3);
    }

    #[test]
    fn idle_iterations_touch_no_statistic() {
        let mut monitor = Monitor::new(&all_stats()).unwrap();
        monitor.record(&LoopEvent::IterationStart { user: 0 });
        monitor.record(&LoopEvent::IterationEnd {
            user: 0,
            sample: None,
        });
        let report = monitor.update();
        assert_eq!(report["latency"].interval, serde_json::json!({ "count": 0 }));
        assert!(report["result-codes"].interval.as_object().unwrap().is_empty());
    }

    #[test]
    fn http_errors_count_non_success_codes() {
        let dir = std::env::temp_dir().join("stampede-test-errors.log");
        let _ = std::fs::remove_file(&dir);
        let spec = StatSpec::named("http-errors").unwrap().with_log(&dir);
        let mut monitor = Monitor::new(&[spec]).unwrap();
        iteration(&mut monitor, 0, sample(200, 1));
        iteration(&mut monitor, 0, sample(503, 1));
        iteration(&mut monitor, 0, sample(0, 1));
        let report = monitor.update();
        assert_eq!(report["http-errors"].interval, 2);
        let written = std::fs::read_to_string(&dir).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.contains("503"));
        let _ = std::fs::remove_file(&dir);
    }
}
