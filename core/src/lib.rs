// core/src/lib.rs
pub mod deps;
pub mod error;
pub mod gpu;
pub mod rpc;
pub mod utils;
