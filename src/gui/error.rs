use crate::tracker::TrackerError;
use std::{error::Error, fmt::Display};

#[derive(Debug)]
pub enum MonitorError {
    IOError(std::io::Error),
    TrackerError(TrackerError),
}

impl Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::IOError(e) => write!(f, "terminal error: {}", e),
            MonitorError::TrackerError(e) => write!(f, "tracking failed: {}", e),
        }
    }
}

impl Error for MonitorError {}

impl From<std::io::Error> for MonitorError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<TrackerError> for MonitorError {
    fn from(value: TrackerError) -> Self {
        Self::TrackerError(value)
    }
}
