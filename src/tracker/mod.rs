pub mod line;

pub use line::{LineTracker, TrackStatus, TrackUpdate};
