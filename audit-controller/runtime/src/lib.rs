#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
pub mod alert;
mod args;
pub mod audit;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod server;
pub mod store;

pub use self::args::Args;
pub use kubetrail_controller_core as core;
