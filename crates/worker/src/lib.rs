//! Chrome-backed worker host for the tab-relay agent.
//!
//! One browser process; every worker is a tab. The agent drives it through
//! [`ChromeWorkerHost`], which implements `WorkerHost` from tab-relay-common.

pub mod executor;
mod host;
pub mod sensor;
mod tab_pool;

pub use executor::{JobRunner, JobTiming};
pub use host::ChromeWorkerHost;
pub use sensor::{ProbeReading, PROBE_SCRIPT};
pub use tab_pool::{chrome_args, TabPool};
