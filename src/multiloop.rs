//! The virtual-user scheduler: shapes user count and start rate over a
//! bounded run.
//!
//! A `MultiLoop` owns a pool of virtual users. Each user is a spawned
//! task driving its [`Session`] sequentially; the controller re-sizes
//! the pool every scheduling tick to track the concurrency profile, and
//! every start is numbered through the pacer so the observed rate tracks
//! the rate profile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{event, Level};

use crate::profile::{NextStart, Pacer, Profile};
use crate::session::{Sample, Session, SessionFactory};
use crate::CRATE_NAME;

/// Minimum interval between pool re-sizes.
const TICK: Duration = Duration::from_millis(50);
/// Longest wait between session-factory retries.
const BUILD_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Shape of one loop's run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Target user count over elapsed time.
    pub concurrency: Profile,
    /// Start pacing over elapsed time.
    pub pacer: Pacer,
    /// Hard wall-clock bound.
    pub duration: Duration,
    /// Total iteration cap across all users.
    pub iterations: Option<u64>,
    /// Wait before admitting the first iteration.
    pub delay: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            concurrency: Profile::constant(1.0),
            pacer: Pacer::unpaced(),
            duration: Duration::from_secs(120),
            iterations: None,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Delayed,
    Running,
    Stopping,
    Ended,
}

/// Emitted over the loop's event channel, in order per user.
#[derive(Debug)]
pub enum LoopEvent {
    Started,
    UsersChanged { active: usize },
    IterationStart { user: u64 },
    IterationEnd { user: u64, sample: Option<Sample> },
    Ended,
}

struct Shared {
    started: AtomicU64,
    pacer: Pacer,
    duration: Duration,
    iterations: Option<u64>,
}

struct UserSlot {
    id: u64,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    stopping: bool,
}

/// External control over a running loop.
#[derive(Debug)]
pub struct LoopHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<LoopState>,
}

impl LoopHandle {
    /// Request the loop to wind down. Idempotent; in-flight iterations
    /// finish before the loop ends.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Wait until the loop has fully ended.
    pub async fn ended(&mut self) {
        loop {
            if *self.state.borrow_and_update() == LoopState::Ended {
                return;
            }
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct MultiLoop {
    config: LoopConfig,
    factory: Arc<dyn SessionFactory>,
    events: mpsc::UnboundedSender<LoopEvent>,
    state: watch::Sender<LoopState>,
    stop: watch::Receiver<bool>,
}

impl MultiLoop {
    pub fn new(
        config: LoopConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> (Self, LoopHandle, mpsc::UnboundedReceiver<LoopEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);
        let (stop_tx, stop_rx) = watch::channel(false);
        let multiloop = Self {
            config,
            factory,
            events: events_tx,
            state: state_tx,
            stop: stop_rx,
        };
        let handle = LoopHandle {
            stop: stop_tx,
            state: state_rx,
        };
        (multiloop, handle, events_rx)
    }

    /// Drive the loop to completion. Resources (user tasks, timers) are
    /// released on every exit path.
    pub async fn run(self) {
        let MultiLoop {
            config,
            factory,
            events,
            state,
            mut stop,
        } = self;

        let _ = state.send(LoopState::Delayed);
        let _ = events.send(LoopEvent::Started);
        if !config.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(config.delay) => {}
                _ = stopped(&mut stop) => {}
            }
        }

        let origin = Instant::now();
        let shared = Arc::new(Shared {
            started: AtomicU64::new(0),
            pacer: config.pacer.clone(),
            duration: config.duration,
            iterations: config.iterations,
        });
        let mut users: Vec<UserSlot> = Vec::new();
        let mut next_user_id: u64 = 0;
        let mut build_failures: u32 = 0;
        let mut next_build_attempt = origin;

        if !*stop.borrow() {
            let _ = state.send(LoopState::Running);
            let mut tick = tokio::time::interval(TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = stopped(&mut stop) => break,
                }
                let elapsed = origin.elapsed();
                if elapsed >= config.duration {
                    break;
                }

                let before = users.len();
                users.retain(|slot| !slot.handle.is_finished());
                let mut changed = users.len() != before;

                if let Some(cap) = config.iterations {
                    if shared.started.load(Ordering::Acquire) >= cap && users.is_empty() {
                        break;
                    }
                }

                let target = target_users(&config.concurrency, elapsed);
                let active = users.iter().filter(|slot| !slot.stopping).count();
                if target > active && Instant::now() >= next_build_attempt {
                    for _ in active..target {
                        match factory.build().await {
                            Ok(session) => {
                                build_failures = 0;
                                let id = next_user_id;
                                next_user_id += 1;
                                users.push(spawn_user(
                                    id,
                                    session,
                                    origin,
                                    shared.clone(),
                                    events.clone(),
                                ));
                                changed = true;
                            }
                            Err(err) => {
                                build_failures += 1;
                                let backoff = TICK
                                    .saturating_mul(1 << build_failures.min(5))
                                    .min(BUILD_BACKOFF_CAP);
                                next_build_attempt = Instant::now() + backoff;
                                event!(
                                    target: CRATE_NAME,
                                    Level::WARN,
                                    err = %err,
                                    retry_in_ms = backoff.as_millis() as u64,
                                    "session factory failed"
                                );
                                break;
                            }
                        }
                    }
                } else if target < active {
                    // Oldest first: slots are kept in creation order.
                    let mut excess = active - target;
                    for slot in users.iter_mut() {
                        if excess == 0 {
                            break;
                        }
                        if !slot.stopping {
                            slot.stopping = true;
                            let _ = slot.stop.send(true);
                            excess -= 1;
                            changed = true;
                            event!(target: CRATE_NAME, Level::DEBUG, user = slot.id, "stopping user");
                        }
                    }
                }

                if changed {
                    let active = users.iter().filter(|slot| !slot.stopping).count();
                    event!(target: CRATE_NAME, Level::INFO, users = active as u64);
                    let _ = events.send(LoopEvent::UsersChanged { active });
                }
            }
        }

        let _ = state.send(LoopState::Stopping);
        for slot in &users {
            let _ = slot.stop.send(true);
        }
        for slot in users.drain(..) {
            let _ = slot.handle.await;
        }
        let _ = events.send(LoopEvent::Ended);
        let _ = state.send(LoopState::Ended);
        event!(target: CRATE_NAME, Level::INFO, "loop ended");
    }
}

fn target_users(concurrency: &Profile, elapsed: Duration) -> usize {
    concurrency.value(elapsed.as_secs_f64()).round().max(0.0) as usize
}

/// Resolves once the stop flag is raised. A dropped controller means no
/// stop will ever arrive, so the future stays pending.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_user(
    id: u64,
    mut session: Box<dyn Session>,
    origin: Instant,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<LoopEvent>,
) -> UserSlot {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }
            // Reserve the next start number. The compare-exchange below
            // is the only admission into an iteration, so numbering is
            // dense and ordered even across users racing for the same
            // slot.
            let n = shared.started.load(Ordering::Acquire);
            if let Some(cap) = shared.iterations {
                if n >= cap {
                    break;
                }
            }
            let deadline = match shared.pacer.next_start(n) {
                NextStart::Immediate => origin,
                NextStart::At(offset) => {
                    if offset >= shared.duration {
                        break;
                    }
                    origin + offset
                }
                NextStart::Never => break,
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            if shared
                .started
                .compare_exchange(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another user claimed start `n`; re-evaluate.
                continue;
            }
            let _ = events.send(LoopEvent::IterationStart { user: id });
            let sample = match session.call().await {
                Ok(sample) => sample,
                Err(err) => {
                    event!(target: CRATE_NAME, Level::INFO, user = id, err = %err, "iteration failed");
                    None
                }
            };
            let _ = events.send(LoopEvent::IterationEnd { user: id, sample });
        }
    });
    UserSlot {
        id,
        stop: stop_tx,
        handle,
        stopping: false,
    }
}
