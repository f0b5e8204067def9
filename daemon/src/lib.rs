// daemon/src/lib.rs
//! Recognition daemon: a JSON-lines TCP server in front of a single task
//! worker and a lazily loaded model.
pub mod config;
pub mod daemon;
pub mod model;

pub use daemon::state::{DaemonState, Services};
pub use daemon::DaemonServer;
