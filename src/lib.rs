// src/lib.rs
pub mod config;
pub mod executor;
pub mod metrics;
pub mod monitor;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use monitor::{stop, DrainReport, Monitor, MonitorError, MonitorHandle};
