use botsmith_client::{BackendError, ProviderError};
use snafu::Snafu;

use crate::state::SessionState;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("{source}"))]
    ConfigFetch {
        stage: &'static str,
        session_id: String,
        source: BackendError,
    },
    #[snafu(display("{source}"))]
    RunCreation {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("{source}"))]
    OpenStream {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("{source}"))]
    ConsoleRequest {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("{message}"))]
    Stream {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("cannot send an empty message"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("a response is still in progress ({state:?})"))]
    Busy {
        stage: &'static str,
        state: SessionState,
    },
    #[snafu(display("no chat session is loaded"))]
    NoActiveSession { stage: &'static str },
}

impl SessionError {
    /// Human-readable text suitable for a transient notification.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Whether the failure put the controller into the `Error` state.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            Self::ConfigFetch { .. }
                | Self::RunCreation { .. }
                | Self::OpenStream { .. }
                | Self::Stream { .. }
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
