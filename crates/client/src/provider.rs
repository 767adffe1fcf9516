use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::RunCredentials;
use crate::events::{RunEventMapped, RunTarget};

pub const DEFAULT_PROVIDER_ENDPOINT: &str = "https://api.openai.com/v1";

pub type RunWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the run API; point it at a backend proxy to keep keys off clients.
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim().trim_end_matches('/').to_string();
        Self {
            endpoint: if endpoint.is_empty() {
                DEFAULT_PROVIDER_ENDPOINT.to_string()
            } else {
                endpoint
            },
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PROVIDER_ENDPOINT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub target: RunTarget,
    pub session_id: String,
    pub credentials: RunCredentials,
}

impl RunRequest {
    pub fn new(target: RunTarget, session_id: impl Into<String>, credentials: RunCredentials) -> Self {
        Self {
            target,
            session_id: session_id.into(),
            credentials,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing provider key for session '{session_id}'"))]
    MissingProviderKey {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("missing assistant id for session '{session_id}'"))]
    MissingAssistantId {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("failed to build provider http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("provider request failed on `{stage}`: {source}"))]
    SendRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("provider returned status {status}: {message}"))]
    RunStatus {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("failed to read provider stream on `{stage}`: {source}"))]
    ReadStream {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to decode provider event '{event}': {source}"))]
    DecodeEvent {
        stage: &'static str,
        event: String,
        source: serde_json::Error,
    },
}

/// Receiving side of one run subscription.
///
/// Dropping the stream cancels the worker so provider IO stops promptly.
pub struct RunEventStream {
    target: RunTarget,
    events: mpsc::UnboundedReceiver<RunEventMapped>,
    cancel: CancellationToken,
}

pub struct RunStreamHandle {
    pub stream: RunEventStream,
    pub worker: RunWorker,
}

impl RunEventStream {
    pub(crate) fn new(
        target: RunTarget,
        events: mpsc::UnboundedReceiver<RunEventMapped>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            events,
            cancel,
        }
    }

    pub fn target(&self) -> RunTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<RunEventMapped> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RunEventMapped> {
        self.events.try_recv().ok()
    }

    /// Returns false when the subscription was already cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        self.events.close();
        true
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for RunEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Streamed-run interface of the conversational-AI provider.
pub trait RunProvider: Send + Sync {
    fn name(&self) -> &str;
    fn open_run_stream(&self, request: RunRequest) -> ProviderResult<RunStreamHandle>;
}

/// Creates the channel pair shared by a run worker and its [`RunEventStream`].
pub fn make_event_stream(
    target: RunTarget,
) -> (
    mpsc::UnboundedSender<RunEventMapped>,
    RunEventStream,
    CancellationToken,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    (
        event_tx,
        RunEventStream::new(target, event_rx, cancel.clone()),
        cancel,
    )
}
