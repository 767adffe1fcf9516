//! In-memory backend and provider doubles for controller tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

use botsmith_client::{
    BackendError, BackendResult, BoxFuture, ChatBackend, ChatbotSummary, ModelInfo, NewChatbot,
    ProviderKey, ProviderResult, RunCredentials, RunEvent, RunEventMapped, RunProvider,
    RunRequest, RunStreamHandle, RunWorker, SessionConfigPayload, UploadFile, UploadedFiles,
    UserInfo, WidgetSettingsUpdate, make_event_stream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

fn rejected(stage: &'static str, message: &str) -> BackendError {
    BackendError::Rejected {
        stage,
        status: 400,
        message: message.to_string(),
    }
}

pub(crate) struct FakeBackend {
    config_error: Option<String>,
    run_error: Option<String>,
    pub(crate) create_run_calls: AtomicUsize,
    fetched_sessions: Mutex<Vec<String>>,
    created_sessions: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            config_error: None,
            run_error: None,
            create_run_calls: AtomicUsize::new(0),
            fetched_sessions: Mutex::new(Vec::new()),
            created_sessions: AtomicUsize::new(0),
        }
    }
}

impl FakeBackend {
    pub(crate) fn failing_runs(message: &str) -> Self {
        Self {
            run_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn failing_config(message: &str) -> Self {
        Self {
            config_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn fetched_sessions(&self) -> Vec<String> {
        self.fetched_sessions
            .lock()
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }
}

impl ChatBackend for FakeBackend {
    fn fetch_session_config<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionConfigPayload>> {
        Box::pin(async move {
            if let Ok(mut sessions) = self.fetched_sessions.lock() {
                sessions.push(session_id.to_string());
            }
            if let Some(message) = &self.config_error {
                return Err(rejected("fake-fetch-session-config", message));
            }
            Ok(SessionConfigPayload {
                initial: Some("Hi! How can I help you today?".to_string()),
                placeholder: Some("Write your sentences here".to_string()),
                suggested: Some("Hello!\nWhat is chatbot?".to_string()),
                use_custom: Some(false),
                bot_msg_bg_color: Some("#000000".to_string()),
                img_id: Some("img_1".to_string()),
            })
        })
    }

    fn create_run<'a>(
        &'a self,
        _session_id: &'a str,
        _message: &'a str,
    ) -> BoxFuture<'a, BackendResult<RunCredentials>> {
        Box::pin(async move {
            self.create_run_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.run_error {
                return Err(rejected("fake-create-run", message));
            }
            Ok(RunCredentials {
                provider_key: ProviderKey::new("sk-test"),
                assistant_id: "asst_test".to_string(),
            })
        })
    }

    fn create_session<'a>(&'a self, chatbot_id: &'a str) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move {
            let count = self.created_sessions.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("thread_{chatbot_id}_{count}"))
        })
    }

    fn list_chatbots<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<ChatbotSummary>>> {
        Box::pin(async move {
            Ok(vec![
                ChatbotSummary {
                    id: "bot_a".to_string(),
                    name: "Support".to_string(),
                },
                ChatbotSummary {
                    id: "bot_b".to_string(),
                    name: "Sales".to_string(),
                },
            ])
        })
    }

    fn user_info<'a>(&'a self) -> BoxFuture<'a, BackendResult<UserInfo>> {
        Box::pin(async move {
            Ok(UserInfo {
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                email: "ada@example.com".to_string(),
            })
        })
    }

    fn add_bot<'a>(&'a self, bot: NewChatbot) -> BoxFuture<'a, BackendResult<ChatbotSummary>> {
        Box::pin(async move {
            Ok(ChatbotSummary {
                id: format!("bot_{}", bot.name.to_lowercase()),
                name: bot.name,
            })
        })
    }

    fn model_info<'a>(&'a self, chatbot_id: &'a str) -> BoxFuture<'a, BackendResult<ModelInfo>> {
        Box::pin(async move {
            Ok(ModelInfo {
                id: chatbot_id.to_string(),
                name: "Support".to_string(),
                prompt: "Answer politely.".to_string(),
                file_names: Vec::new(),
                file_ids: Vec::new(),
            })
        })
    }

    fn update_model_info<'a>(
        &'a self,
        chatbot_id: &'a str,
        _name: &'a str,
        _prompt: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            if chatbot_id.starts_with("bot_") {
                Ok(())
            } else {
                Err(rejected(
                    "fake-update-model-info",
                    "You are not allowed to see others setting",
                ))
            }
        })
    }

    fn upload_knowledge_files<'a>(
        &'a self,
        _chatbot_id: &'a str,
        files: Vec<UploadFile>,
    ) -> BoxFuture<'a, BackendResult<UploadedFiles>> {
        Box::pin(async move {
            Ok(UploadedFiles {
                file_ids: (1..=files.len()).map(|n| format!("file_{n}")).collect(),
                file_names: files.into_iter().map(|file| file.file_name).collect(),
            })
        })
    }

    fn delete_knowledge_file<'a>(
        &'a self,
        _chatbot_id: &'a str,
        _file_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn chatbot_settings<'a>(
        &'a self,
        _chatbot_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionConfigPayload>> {
        Box::pin(async move { Ok(SessionConfigPayload::default()) })
    }

    fn update_chatbot_settings<'a>(
        &'a self,
        _update: WidgetSettingsUpdate,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move { Ok(()) })
    }

    fn avatar_url(&self, img_id: &str) -> String {
        format!("http://backend.test/avatar/{img_id}")
    }
}

/// Replays one scripted event list per opened run.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<RunEvent>>>,
    hold_open: bool,
    pub(crate) opened: AtomicUsize,
    last_sender: Mutex<Option<mpsc::UnboundedSender<RunEventMapped>>>,
    last_cancel: Mutex<Option<CancellationToken>>,
}

impl ScriptedProvider {
    pub(crate) fn with_script(events: Vec<RunEvent>) -> Self {
        Self::with_scripts(vec![events])
    }

    pub(crate) fn with_scripts(scripts: Vec<Vec<RunEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// Keeps the stream open after the script until the run is cancelled.
    pub(crate) fn holding_open(events: Vec<RunEvent>) -> Self {
        Self {
            hold_open: true,
            ..Self::with_script(events)
        }
    }

    pub(crate) fn last_sender(&self) -> Option<mpsc::UnboundedSender<RunEventMapped>> {
        self.last_sender.lock().ok().and_then(|sender| sender.clone())
    }

    pub(crate) fn last_cancel_token(&self) -> Option<CancellationToken> {
        self.last_cancel.lock().ok().and_then(|token| token.clone())
    }
}

impl RunProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open_run_stream(&self, request: RunRequest) -> ProviderResult<RunStreamHandle> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let events = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .unwrap_or_default();

        let target = request.target;
        let (event_tx, stream, cancel) = make_event_stream(target);
        // A retained sender would keep finished scripts from closing the channel.
        if self.hold_open
            && let Ok(mut last_sender) = self.last_sender.lock()
        {
            *last_sender = Some(event_tx.clone());
        }
        if let Ok(mut last_cancel) = self.last_cancel.lock() {
            *last_cancel = Some(cancel.clone());
        }

        let hold_open = self.hold_open;
        let worker: RunWorker = Box::pin(async move {
            for payload in events {
                if event_tx.send(RunEventMapped::new(target, payload)).is_err() {
                    return;
                }
            }
            if hold_open {
                cancel.cancelled().await;
            }
        });

        Ok(RunStreamHandle { stream, worker })
    }
}
