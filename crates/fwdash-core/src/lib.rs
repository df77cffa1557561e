//! Orchestration core of the firmware console: bounded backend calls,
//! serial sessions, build jobs, notifications and per-app configuration.

pub mod backend;
pub mod build;
pub mod console;
pub mod error;
pub mod events;
pub mod gateway;
pub mod notify;
pub mod pins;
pub mod platform;
pub mod prefs;
pub mod profile;
pub mod selection;
pub mod serial;
pub mod types;

#[cfg(test)]
mod testing;

pub use backend::{Backend, GrpcBackend};
pub use build::{BuildOrchestrator, BuildPhase, BuildState};
pub use console::Console;
pub use error::{CoreError, CoreResult};
pub use events::{pump_events, BuildEvent, EventRouter, SerialEvent};
pub use gateway::CommandGateway;
pub use notify::{Notification, Notifier, Severity};
pub use pins::{PinPurpose, PinValidation, PinValidator};
pub use prefs::{JsonPreferences, MemoryPreferences, PreferenceStore};
pub use profile::{ConfigState, ProfileState};
pub use selection::AppSelection;
pub use serial::{SerialBuffer, SerialSessions, SerialState, UploadLock};
