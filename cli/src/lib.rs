// cli/src/lib.rs
pub mod cli;
pub mod client;

pub use client::{ClientError, ClientResult, DaemonClient, WaitOptions};
