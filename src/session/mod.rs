//! Session registry and per-stream session state.

pub mod registry;
pub mod state;

pub use registry::SessionRegistry;
pub use state::{ErrorHistory, PumpStop, Session, SessionSnapshot, SessionStatus, StopToken};
