use std::sync::Arc;
use std::time::Duration;

use botsmith_client::{
    ChatBackend, RunEvent, RunEventMapped, RunEventStream, RunProvider, RunRequest, RunSeq,
    RunTarget, SessionEpoch,
};
use snafu::{IntoError, OptionExt, ensure};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{
    BusySnafu, ConfigFetchSnafu, EmptyMessageSnafu, NoActiveSessionSnafu, OpenStreamSnafu,
    RunCreationSnafu, SessionError, SessionResult, StreamSnafu,
};
use crate::notification::{Notification, NotificationQueue};
use crate::settings::{ConsoleSettings, DEFAULT_STREAM_IDLE_TIMEOUT_SECS};
use crate::state::{SessionState, SessionTransition};
use crate::transcript::{Transcript, Turn};

/// What happened to one incoming run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Event belonged to a run that is no longer active and was dropped.
    Ignored,
    Completed,
}

/// Controller-side bookkeeping for the in-flight run.
struct ActiveRun {
    target: RunTarget,
    stream: Option<RunEventStream>,
    worker: Option<JoinHandle<()>>,
}

impl ActiveRun {
    fn detach(mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.cancel();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Owns one live conversation: configuration, transcript and the single active run.
///
/// Every mutation goes through `&mut self`, so submissions are serialized by
/// construction; the explicit state guard additionally rejects a submit while a run
/// is awaiting credentials or streaming.
pub struct ChatSessionController {
    backend: Arc<dyn ChatBackend>,
    provider: Arc<dyn RunProvider>,
    stream_idle_timeout: Duration,
    epoch: SessionEpoch,
    next_run_seq: u64,
    session_id: Option<String>,
    config: Option<SessionConfig>,
    transcript: Transcript,
    pending_input: String,
    state: SessionState,
    active_run: Option<ActiveRun>,
    notifications: NotificationQueue,
}

impl ChatSessionController {
    /// Creates a controller with no session loaded and the default idle timeout.
    pub fn new(backend: Arc<dyn ChatBackend>, provider: Arc<dyn RunProvider>) -> Self {
        Self {
            backend,
            provider,
            stream_idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
            epoch: SessionEpoch::new(0),
            next_run_seq: 1,
            session_id: None,
            config: None,
            transcript: Transcript::new(),
            pending_input: String::new(),
            state: SessionState::Idle,
            active_run: None,
            notifications: NotificationQueue::default(),
        }
    }

    /// Creates a controller using the stream timeout from console settings.
    pub fn with_settings(
        backend: Arc<dyn ChatBackend>,
        provider: Arc<dyn RunProvider>,
        settings: &ConsoleSettings,
    ) -> Self {
        Self::new(backend, provider).with_stream_idle_timeout(settings.stream_idle_timeout())
    }

    /// Overrides how long a streaming run may stay silent before it fails.
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Identifier of the loaded session, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Widget configuration of the loaded session, once fetched.
    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// Greeting shown above the transcript; it is not part of the transcript itself.
    pub fn greeting(&self) -> Option<&str> {
        self.config
            .as_ref()
            .map(|config| config.greeting.as_str())
            .filter(|greeting| !greeting.is_empty())
    }

    /// Suggested prompts for the loaded session.
    pub fn suggestions(&self) -> &[String] {
        self.config
            .as_ref()
            .map(|config| config.suggestions.as_slice())
            .unwrap_or_default()
    }

    /// Current run lifecycle state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Conversation so far, oldest turn first.
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Shorthand for `transcript().turns()`.
    pub fn turns(&self) -> &[Turn] {
        self.transcript.turns()
    }

    /// Text typed but not yet submitted.
    pub fn pending_input(&self) -> &str {
        &self.pending_input
    }

    /// Replaces the pending input.
    pub fn set_input(&mut self, text: impl Into<String>) {
        self.pending_input = text.into();
    }

    /// Drains notifications queued since the last call.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain()
    }

    /// Switches to another session, dropping everything tied to the previous one.
    ///
    /// Valid from any state. The new epoch makes every event from older runs stale,
    /// even if one is still buffered somewhere.
    pub async fn reset(&mut self, session_id: impl Into<String>) -> SessionResult<()> {
        let session_id = session_id.into();
        self.detach_active_run();
        self.epoch = self.epoch.next();
        self.session_id = Some(session_id.clone());
        self.config = None;
        self.transcript.clear();
        self.pending_input.clear();
        self.transition(SessionTransition::Reset);

        tracing::info!(
            session_id = %session_id,
            epoch = self.epoch.0,
            "switched chat session"
        );

        match self.backend.fetch_session_config(&session_id).await {
            Ok(payload) => {
                let backend = self.backend.clone();
                self.config = Some(SessionConfig::from_payload(payload, |img_id| {
                    backend.avatar_url(img_id)
                }));
                Ok(())
            }
            Err(source) => {
                let error = ConfigFetchSnafu {
                    stage: "reset-fetch-config",
                    session_id,
                }
                .into_error(source);
                Err(self.surface(None, error))
            }
        }
    }

    /// Submits the current pending input, as an Enter key press would.
    pub async fn submit_pending(&mut self) -> SessionResult<RunTarget> {
        let text = self.pending_input.clone();
        self.submit(text).await
    }

    /// Sends one user message and opens the run stream for the reply.
    ///
    /// On success the controller is `Streaming`; feed it with [`Self::drive`] or
    /// [`Self::next_event`]. Credential or stream-open failures keep the user turn
    /// and leave the controller in `Error`.
    pub async fn submit(&mut self, text: impl Into<String>) -> SessionResult<RunTarget> {
        let text = text.into();
        ensure!(
            !text.trim().is_empty(),
            EmptyMessageSnafu { stage: "submit" }
        );
        let session_id = self
            .session_id
            .clone()
            .context(NoActiveSessionSnafu { stage: "submit" })?;

        let target = RunTarget::new(self.epoch, RunSeq::new(self.next_run_seq));
        match self.state.apply(SessionTransition::Submit(target)) {
            Ok(next) => self.state = next,
            Err(rejection) => {
                tracing::debug!(
                    target = ?target,
                    rejection = ?rejection,
                    "rejected submit while a run is in flight"
                );
                return BusySnafu {
                    stage: "submit",
                    state: self.state.clone(),
                }
                .fail();
            }
        }
        // Reserve the sequence immediately so a later submit never reuses a target.
        self.next_run_seq = self.next_run_seq.saturating_add(1);

        self.transcript.push_user(text.as_str());
        self.pending_input.clear();
        self.active_run = Some(ActiveRun {
            target,
            stream: None,
            worker: None,
        });

        let credentials = match self.backend.create_run(&session_id, &text).await {
            Ok(credentials) => credentials,
            Err(source) => {
                let error = RunCreationSnafu {
                    stage: "submit-create-run",
                }
                .into_error(source);
                return Err(self.surface(Some(target), error));
            }
        };

        let request = RunRequest::new(target, session_id, credentials);
        let handle = match self.provider.open_run_stream(request) {
            Ok(handle) => handle,
            Err(source) => {
                let error = OpenStreamSnafu {
                    stage: "submit-open-stream",
                }
                .into_error(source);
                return Err(self.surface(Some(target), error));
            }
        };

        self.transcript.push_assistant();
        self.transition(SessionTransition::RunOpened(target));
        let worker = tokio::spawn(handle.worker);
        if let Some(active_run) = self.active_run.as_mut() {
            active_run.stream = Some(handle.stream);
            active_run.worker = Some(worker);
        }

        tracing::debug!(
            target = ?target,
            provider = self.provider.name(),
            "run stream opened"
        );
        Ok(target)
    }

    /// Consumes events until the active run finishes.
    ///
    /// Returns the resulting state; stream failures and idle timeouts are returned
    /// as [`SessionError::Stream`] after being surfaced.
    pub async fn drive(&mut self) -> SessionResult<SessionState> {
        loop {
            match self.next_event().await? {
                None | Some(EventOutcome::Completed) => return Ok(self.state.clone()),
                Some(EventOutcome::Applied | EventOutcome::Ignored) => {}
            }
        }
    }

    /// Waits for and applies at most one event of the active run.
    ///
    /// Returns `Ok(None)` when nothing is streaming.
    pub async fn next_event(&mut self) -> SessionResult<Option<EventOutcome>> {
        let idle_timeout = self.stream_idle_timeout;
        let Some(active_run) = self.active_run.as_mut() else {
            return Ok(None);
        };
        let target = active_run.target;
        let Some(stream) = active_run.stream.as_mut() else {
            return Ok(None);
        };

        let received = tokio::time::timeout(idle_timeout, stream.recv()).await;
        match received {
            Ok(Some(event)) => self.apply_event(event).map(Some),
            Ok(None) => {
                let error = StreamSnafu {
                    stage: "next-event-closed",
                    message: "run stream ended before a terminal event",
                }
                .build();
                Err(self.surface(Some(target), error))
            }
            Err(_) => {
                tracing::warn!(
                    target = ?target,
                    timeout_secs = idle_timeout.as_secs_f64(),
                    "run stream stalled"
                );
                let error = StreamSnafu {
                    stage: "next-event-timeout",
                    message: format!(
                        "no response from the assistant for {} seconds",
                        idle_timeout.as_secs()
                    ),
                }
                .build();
                Err(self.surface(Some(target), error))
            }
        }
    }

    /// Applies one tagged run event to the transcript.
    ///
    /// Events whose target is not the streaming run are ignored without touching
    /// any state.
    pub fn apply_event(&mut self, event: RunEventMapped) -> SessionResult<EventOutcome> {
        let RunEventMapped { target, payload } = event;
        if !self.state.accepts_event(target) {
            tracing::debug!(
                target = ?target,
                state = ?self.state,
                "dropping event from inactive run"
            );
            return Ok(EventOutcome::Ignored);
        }

        match payload {
            RunEvent::RunStarted => {
                let pending = self
                    .transcript
                    .last()
                    .is_some_and(Turn::is_pending_assistant);
                if !pending {
                    self.transcript.push_assistant();
                }
                Ok(EventOutcome::Applied)
            }
            RunEvent::TextDelta(fragment) => {
                if !self.transcript.append_to_assistant(&fragment) {
                    tracing::warn!(target = ?target, "text delta without an assistant turn");
                }
                Ok(EventOutcome::Applied)
            }
            RunEvent::CodeInterpreter(delta) => {
                if !self.transcript.append_code_interpreter(&delta) {
                    tracing::warn!(target = ?target, "tool call delta without an assistant turn");
                }
                Ok(EventOutcome::Applied)
            }
            RunEvent::End => {
                self.transition(SessionTransition::Complete(target));
                self.detach_active_run();
                tracing::debug!(target = ?target, "run completed");
                Ok(EventOutcome::Completed)
            }
            RunEvent::Error(message) => {
                let error = StreamSnafu {
                    stage: "apply-event-error",
                    message,
                }
                .build();
                Err(self.surface(Some(target), error))
            }
        }
    }

    /// Stops the in-flight run, keeping whatever text already arrived.
    pub fn cancel(&mut self) -> bool {
        let Some(target) = self.state.active_target() else {
            return false;
        };
        self.transition(SessionTransition::Cancel(target));
        self.detach_active_run();
        self.notifications.push(Notification::info("Response stopped"));
        tracing::debug!(target = ?target, "run cancelled by user");
        true
    }

    fn transition(&mut self, transition: SessionTransition) -> bool {
        match self.state.apply(transition.clone()) {
            Ok(next) => {
                self.state = next;
                true
            }
            Err(rejection) => {
                tracing::warn!(
                    transition = ?transition,
                    rejection = ?rejection,
                    "ignored illegal session transition"
                );
                false
            }
        }
    }

    /// Moves to `Error`, queues the notification and tears down the run.
    fn surface(&mut self, target: Option<RunTarget>, error: SessionError) -> SessionError {
        let message = error.user_message();
        tracing::error!(
            target = ?target,
            session_id = ?self.session_id,
            error = %error,
            "chat session operation failed"
        );
        self.transition(SessionTransition::Fail {
            target,
            message: message.clone(),
        });
        self.notifications.push(Notification::error(message));
        self.detach_active_run();
        error
    }

    fn detach_active_run(&mut self) {
        if let Some(active_run) = self.active_run.take() {
            active_run.detach();
        }
    }
}

impl Drop for ChatSessionController {
    fn drop(&mut self) {
        self.detach_active_run();
    }
}
