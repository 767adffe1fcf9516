#![deny(unsafe_code)]

//! Wire-level collaborators of the chat console: the bot backend's REST API and the
//! provider's streamed-run interface.

mod assistants;
pub mod backend;
pub mod events;
pub mod provider;
pub mod sse;

#[cfg(test)]
mod test_server;

use std::sync::Arc;

pub use assistants::{ASSISTANTS_BETA_HEADER, AssistantsRunProvider};
pub use backend::{
    BackendConfig, BackendError, BackendResult, BoxFuture, ChatBackend, ChatbotSummary,
    HttpBackend, ModelInfo, NewChatbot, ProviderKey, RunCredentials, SessionConfigPayload,
    UploadFile, UploadedFiles, UserInfo, WidgetSettingsUpdate,
};
pub use events::{
    CodeInterpreterDelta, CodeOutput, RunEvent, RunEventMapped, RunSeq, RunTarget, SessionEpoch,
};
pub use provider::{
    DEFAULT_PROVIDER_ENDPOINT, ProviderConfig, ProviderError, ProviderResult, RunEventStream,
    RunProvider, RunRequest, RunStreamHandle, RunWorker, make_event_stream,
};

pub fn create_backend(config: BackendConfig) -> BackendResult<Arc<dyn ChatBackend>> {
    Ok(Arc::new(HttpBackend::new(config)?))
}

pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn RunProvider>> {
    Ok(Arc::new(AssistantsRunProvider::new(config)?))
}
