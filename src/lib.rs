// src/lib.rs
//! LaTeXSnipper's local runtime: the recognition daemon, its client and the
//! dependency-layer installer, re-exported from the workspace crates.
pub use snipper_cli;
pub use snipper_core;
pub use snipper_daemon;
