// src/state/mod.rs
mod store;
mod target_state;
mod window;

pub use store::{Applied, StateStore};
pub use target_state::{AggregationPolicy, Status, TargetState};
pub use window::LatencyWindow;
