pub mod control;
pub mod dispatcher;

pub use control::{format_target, ControlLink, HALT_SENTINEL};
pub use dispatcher::TelemetryDispatcher;
