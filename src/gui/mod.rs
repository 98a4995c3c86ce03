mod error;
mod particle_monitor;

pub use error::MonitorError;
pub use particle_monitor::{engage_monitor, MonitorApp};
