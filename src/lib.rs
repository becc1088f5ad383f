pub mod annotate;
pub mod camera;
pub mod config;
pub mod detect;
pub mod media;
pub mod pipeline;
pub mod telemetry;
pub mod tracker;
