use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BackendResult<T> = Result<T, BackendError>;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Form field the backend reads uploaded files from.
const UPLOAD_FIELD: &str = "files";
const ACKNOWLEDGEMENT: &str = "success";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("failed to build backend http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend request to {url} failed on `{stage}`: {source}"))]
    SendRequest {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    // The backend's own message is already written for end users, so it is shown verbatim.
    #[snafu(display("{message}"))]
    Rejected {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("failed to decode backend response on `{stage}`: {source}"))]
    DecodeBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned an empty reply on `{stage}`"))]
    EmptyReply { stage: &'static str },
}

impl BackendError {
    /// Label of the call that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::BuildHttpClient { stage, .. }
            | Self::SendRequest { stage, .. }
            | Self::Rejected { stage, .. }
            | Self::DecodeBody { stage, .. }
            | Self::EmptyReply { stage } => stage,
        }
    }
}

/// Provider secret handed out by the backend for one run.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(String);

impl ProviderKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ProviderKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("ProviderKey(<redacted>)")
    }
}

/// Widget settings as the backend serves them, per session or per chatbot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct SessionConfigPayload {
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub suggested: Option<String>,
    #[serde(default)]
    pub use_custom: Option<bool>,
    #[serde(default)]
    pub bot_msg_bg_color: Option<String>,
    #[serde(default)]
    pub img_id: Option<String>,
}

/// Credentials required to open one provider run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunCredentials {
    #[serde(rename = "key")]
    pub provider_key: ProviderKey,
    pub assistant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatbotSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserInfo {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl UserInfo {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }
}

/// Persona and knowledge files of one chatbot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub file_names: Vec<String>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

impl ModelInfo {
    /// Pairs of `(file_id, file_name)` in upload order.
    pub fn knowledge_files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.file_ids
            .iter()
            .map(String::as_str)
            .zip(self.file_names.iter().map(String::as_str))
    }
}

/// Files the backend accepted in one knowledge upload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct UploadedFiles {
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub file_names: Vec<String>,
}

/// In-memory file sent as a multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    fn into_part(self) -> Part {
        Part::bytes(self.bytes).file_name(self.file_name)
    }
}

/// A chatbot to create from a persona and optional knowledge files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatbot {
    pub name: String,
    pub prompt: String,
    pub knowledge_files: Vec<UploadFile>,
}

/// Widget appearance written back for one chatbot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetSettingsUpdate {
    pub chatbot_id: String,
    pub initial: String,
    pub placeholder: String,
    pub suggested: String,
    pub use_custom: bool,
    pub bot_msg_bg_color: String,
    /// Replaces the avatar when present; the current one is kept otherwise.
    pub avatar: Option<UploadFile>,
}

impl WidgetSettingsUpdate {
    fn into_form(self) -> Form {
        let form = Form::new()
            .text("id", self.chatbot_id)
            .text("initial", self.initial)
            .text("placeholder", self.placeholder)
            .text("suggested", self.suggested)
            .text("use_custom", if self.use_custom { "true" } else { "false" })
            .text("bot_msg_bg_color", self.bot_msg_bg_color);
        match self.avatar {
            Some(avatar) => form.part(UPLOAD_FIELD, avatar.into_part()),
            None => form,
        }
    }
}

fn with_uploads(form: Form, files: Vec<UploadFile>) -> Form {
    files
        .into_iter()
        .fold(form, |form, file| form.part(UPLOAD_FIELD, file.into_part()))
}

/// Unwraps a plain-text reply, which some routes send bare and some as a JSON string.
fn plain_text_reply(body: &str) -> String {
    let body = body.trim();
    serde_json::from_str::<String>(body)
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| body.to_string())
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Serialize)]
struct IdRequest<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    message: &'a str,
    session_id: &'a str,
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    chatbot_id: &'a str,
}

#[derive(Serialize)]
struct ModelInfoUpdate<'a> {
    id: &'a str,
    name: &'a str,
    prompt: &'a str,
}

#[derive(Serialize)]
struct DeleteFileRequest<'a> {
    id: &'a str,
    file_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            auth_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        self.auth_token = if token.is_empty() { None } else { Some(token) };
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Request/response contract of the bot backend consumed by the console.
pub trait ChatBackend: Send + Sync {
    fn fetch_session_config<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionConfigPayload>>;

    fn create_run<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, BackendResult<RunCredentials>>;

    /// Opens a new conversation thread and returns its session id.
    fn create_session<'a>(&'a self, chatbot_id: &'a str) -> BoxFuture<'a, BackendResult<String>>;

    fn list_chatbots<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<ChatbotSummary>>>;

    fn user_info<'a>(&'a self) -> BoxFuture<'a, BackendResult<UserInfo>>;

    fn add_bot<'a>(&'a self, bot: NewChatbot) -> BoxFuture<'a, BackendResult<ChatbotSummary>>;

    fn model_info<'a>(&'a self, chatbot_id: &'a str) -> BoxFuture<'a, BackendResult<ModelInfo>>;

    fn update_model_info<'a>(
        &'a self,
        chatbot_id: &'a str,
        name: &'a str,
        prompt: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>>;

    fn upload_knowledge_files<'a>(
        &'a self,
        chatbot_id: &'a str,
        files: Vec<UploadFile>,
    ) -> BoxFuture<'a, BackendResult<UploadedFiles>>;

    fn delete_knowledge_file<'a>(
        &'a self,
        chatbot_id: &'a str,
        file_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>>;

    /// Widget settings of a chatbot, as edited in the console.
    fn chatbot_settings<'a>(
        &'a self,
        chatbot_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionConfigPayload>>;

    fn update_chatbot_settings<'a>(
        &'a self,
        update: WidgetSettingsUpdate,
    ) -> BoxFuture<'a, BackendResult<()>>;

    /// Absolute URL of an uploaded avatar image.
    fn avatar_url(&self, img_id: &str) -> String;
}

pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "http-backend-new",
            })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Sends one authenticated POST and turns non-2xx replies into `Rejected`.
    async fn send(
        &self,
        stage: &'static str,
        path: &str,
        with_body: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> BackendResult<Response> {
        let url = self.config.endpoint(path);
        let mut request = self.client.post(&url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = with_body(request).send().await.context(SendRequestSnafu {
            stage,
            url: url.clone(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::rejection_message(status, response).await;
            tracing::warn!(
                stage,
                url = %url,
                status = status.as_u16(),
                message = %message,
                "backend rejected request"
            );
            return RejectedSnafu {
                stage,
                status: status.as_u16(),
                message,
            }
            .fail();
        }
        Ok(response)
    }

    async fn post<B, T>(&self, stage: &'static str, path: &str, body: Option<&B>) -> BackendResult<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(stage, path, |request| match body {
                Some(body) => request.json(body),
                None => request,
            })
            .await?;
        response.json::<T>().await.context(DecodeBodySnafu { stage })
    }

    async fn post_form<T>(&self, stage: &'static str, path: &str, form: Form) -> BackendResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self
            .send(stage, path, |request| request.multipart(form))
            .await?;
        response.json::<T>().await.context(DecodeBodySnafu { stage })
    }

    async fn read_text(stage: &'static str, response: Response) -> BackendResult<String> {
        let body = response.text().await.context(DecodeBodySnafu { stage })?;
        Ok(plain_text_reply(&body))
    }

    /// Update routes answer with a bare acknowledgement instead of JSON.
    fn check_acknowledged(stage: &'static str, reply: &str) {
        if reply != ACKNOWLEDGEMENT {
            tracing::debug!(stage, reply, "unexpected acknowledgement from backend");
        }
    }

    async fn rejection_message(status: StatusCode, response: Response) -> String {
        let fallback = format!("backend returned status {}", status.as_u16());
        match response.json::<ErrorBody>().await {
            Ok(ErrorBody {
                message: Some(message),
            }) if !message.trim().is_empty() => message,
            _ => fallback,
        }
    }
}

impl ChatBackend for HttpBackend {
    fn fetch_session_config<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionConfigPayload>> {
        Box::pin(async move {
            self.post(
                "fetch-session-config",
                "chatbot_setting_session",
                Some(&IdRequest { id: session_id }),
            )
            .await
        })
    }

    fn create_run<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, BackendResult<RunCredentials>> {
        Box::pin(async move {
            self.post(
                "create-run",
                "get_ai_response",
                Some(&CreateRunRequest {
                    message,
                    session_id,
                }),
            )
            .await
        })
    }

    fn create_session<'a>(&'a self, chatbot_id: &'a str) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move {
            let stage = "create-session";
            let body = CreateSessionRequest { chatbot_id };
            let response = self
                .send(stage, "create_session", |request| request.json(&body))
                .await?;
            let session_id = Self::read_text(stage, response).await?;
            ensure!(!session_id.is_empty(), EmptyReplySnafu { stage });
            Ok(session_id)
        })
    }

    fn list_chatbots<'a>(&'a self) -> BoxFuture<'a, BackendResult<Vec<ChatbotSummary>>> {
        Box::pin(async move { self.post::<(), _>("list-chatbots", "chatbot_list", None).await })
    }

    fn user_info<'a>(&'a self) -> BoxFuture<'a, BackendResult<UserInfo>> {
        Box::pin(async move { self.post::<(), _>("user-info", "user_info", None).await })
    }

    fn add_bot<'a>(&'a self, bot: NewChatbot) -> BoxFuture<'a, BackendResult<ChatbotSummary>> {
        Box::pin(async move {
            let form = Form::new().text("name", bot.name).text("prompt", bot.prompt);
            let form = with_uploads(form, bot.knowledge_files);
            self.post_form("add-bot", "add_bot", form).await
        })
    }

    fn model_info<'a>(&'a self, chatbot_id: &'a str) -> BoxFuture<'a, BackendResult<ModelInfo>> {
        Box::pin(async move {
            self.post(
                "model-info",
                "get_model_info",
                Some(&IdRequest { id: chatbot_id }),
            )
            .await
        })
    }

    fn update_model_info<'a>(
        &'a self,
        chatbot_id: &'a str,
        name: &'a str,
        prompt: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let stage = "update-model-info";
            let body = ModelInfoUpdate {
                id: chatbot_id,
                name,
                prompt,
            };
            let response = self
                .send(stage, "update_model_info", |request| request.json(&body))
                .await?;
            Self::check_acknowledged(stage, &Self::read_text(stage, response).await?);
            Ok(())
        })
    }

    fn upload_knowledge_files<'a>(
        &'a self,
        chatbot_id: &'a str,
        files: Vec<UploadFile>,
    ) -> BoxFuture<'a, BackendResult<UploadedFiles>> {
        Box::pin(async move {
            let form = with_uploads(Form::new().text("id", chatbot_id.to_string()), files);
            self.post_form("upload-knowledge-files", "update_files", form)
                .await
        })
    }

    fn delete_knowledge_file<'a>(
        &'a self,
        chatbot_id: &'a str,
        file_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let stage = "delete-knowledge-file";
            let body = DeleteFileRequest {
                id: chatbot_id,
                file_id,
            };
            let response = self
                .send(stage, "delete_file", |request| request.json(&body))
                .await?;
            Self::check_acknowledged(stage, &Self::read_text(stage, response).await?);
            Ok(())
        })
    }

    fn chatbot_settings<'a>(
        &'a self,
        chatbot_id: &'a str,
    ) -> BoxFuture<'a, BackendResult<SessionConfigPayload>> {
        Box::pin(async move {
            self.post(
                "chatbot-settings",
                "get_chatbot_setting",
                Some(&IdRequest { id: chatbot_id }),
            )
            .await
        })
    }

    fn update_chatbot_settings<'a>(
        &'a self,
        update: WidgetSettingsUpdate,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let stage = "update-chatbot-settings";
            let form = update.into_form();
            let response = self
                .send(stage, "update_chatbot_setting", |request| {
                    request.multipart(form)
                })
                .await?;
            Self::check_acknowledged(stage, &Self::read_text(stage, response).await?);
            Ok(())
        })
    }

    fn avatar_url(&self, img_id: &str) -> String {
        self.config.endpoint(&format!("avatar/{}", img_id.trim()))
    }
}
