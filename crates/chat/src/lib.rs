#![deny(unsafe_code)]

//! Streaming chat session controller for hosted chatbots.
//!
//! The controller owns one conversation at a time: it loads the session's widget
//! configuration, sends user messages, consumes the provider's run events into a
//! transcript, and reports failures as transient notifications.

pub mod app_state;
/// Widget configuration for a loaded session.
pub mod config;
pub mod controller;
pub mod error;
pub mod notification;
/// Layered console settings (defaults, JSON file, environment).
pub mod settings;
/// Run lifecycle state machine.
pub mod state;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use app_state::ConsoleState;
pub use config::SessionConfig;
pub use controller::{ChatSessionController, EventOutcome};
pub use error::{SessionError, SessionResult};
pub use notification::{Notification, NotificationLevel};
pub use settings::{ConsoleSettings, SettingsError, SettingsStore};
pub use state::{SessionState, SessionTransition, TransitionRejection};
pub use transcript::{Speaker, Transcript, Turn};

pub use botsmith_client::{RunEvent, RunEventMapped, RunTarget, create_backend, create_provider};
