pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod clients;
pub mod config;
pub mod foreman;
pub mod gpu;
pub mod messages;
pub mod metrics;
pub mod monitor;
pub mod postprocessor;
pub mod remote;
pub mod scratch;
pub mod task;
pub mod worker;
pub mod worker_group;

#[cfg(test)]
test_r::enable!();

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
