/*! Stampede is a distributed HTTP load generator.

An operator submits one or more [test specifications](config::TestSpec);
stampede drives concurrent HTTP traffic against the target, shaping both
the virtual-user count and the request rate over time, aggregates
response statistics in real time, and can spread the load across worker
nodes controlled from a single master.

# Concepts

* *Virtual user* — an autonomous task running its [`Session`](session::Session)
  sequentially; the unit of concurrency. Users are created and torn down
  at runtime to track the concurrency profile.
* *Iteration* — one `call` of a session, from admission by the pacer to
  its [`Sample`](session::Sample).
* *Profile* — a piecewise-linear schedule of user count or request rate
  over elapsed time ([`profile::Profile`]).
* *Monitor* — turns iteration events into named statistics with interval
  and cumulative views ([`monitor::Monitor`]).
* *Master / slave* — controller and worker roles of the remote control
  plane ([`remote`]).

# Example

```no_run
use std::time::Duration;
use stampede::prelude::*;

#[tokio::main]
async fn main() -> Result<(), stampede::error::Error> {
    let spec = TestSpec::new("front page")
        .with_host("127.0.0.1")
        .with_port(8080)
        .with_num_users(5)
        .with_target_rps(50.0)
        .with_time_limit(Duration::from_secs(30));

    let mut test = stampede::run(vec![spec])?;
    while let Some(event) = test.events().recv().await {
        match event {
            TestEvent::Update { reports } => println!("{:?}", reports),
            TestEvent::End => break,
            _ => {}
        }
    }
    Ok(())
}
```

# Remote control

A worker runs the embedded [server](server::ServerHandle); a controller
installs [slave specs](remote::SlaveSpec) on it over `POST /remote` and
invokes slave methods by name. Methods come from a closed
[registry](remote::MethodRegistry) declared on the worker — the control
plane never executes transmitted code.
*/

pub mod client;
pub mod config;
pub mod error;
pub mod loadtest;
pub mod monitor;
pub mod multiloop;
pub mod profile;
pub mod remote;
pub mod server;
pub mod session;

pub use loadtest::{run, run_with_server, LoadTest, TestEvent, TestReport};

pub mod prelude {
    pub use crate::config::{StatSpec, TestSpec};
    pub use crate::loadtest::{run, run_with_server, LoadTest, TestEvent};
    pub use crate::profile::Profile;
    pub use crate::session::{Session, SessionFactory};
}

/// Tracing target for scheduler and control-plane events.
pub(crate) const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
/// Tracing target for per-request events emitted inside a user task.
pub const USER_TASK: &str = "user_task";
