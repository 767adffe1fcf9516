use botsmith_client::{ChatBackend, ChatbotSummary, NewChatbot, UserInfo};
use snafu::ResultExt;

use crate::controller::ChatSessionController;
use crate::error::{ConsoleRequestSnafu, SessionResult};

/// Console-wide state that sits above a single chat session.
///
/// Callers own this value and pass it explicitly; nothing here is global.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleState {
    pub user: Option<UserInfo>,
    pub chatbots: Vec<ChatbotSummary>,
    pub active_chatbot_id: Option<String>,
}

impl ConsoleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reloads the signed-in user and their chatbots.
    pub async fn refresh(&mut self, backend: &dyn ChatBackend) -> SessionResult<()> {
        let user = backend.user_info().await.context(ConsoleRequestSnafu {
            stage: "refresh-user-info",
        })?;
        let chatbots = backend.list_chatbots().await.context(ConsoleRequestSnafu {
            stage: "refresh-chatbot-list",
        })?;

        tracing::debug!(chatbot_count = chatbots.len(), "refreshed console state");
        self.user = Some(user);
        if let Some(active) = &self.active_chatbot_id
            && !chatbots.iter().any(|chatbot| &chatbot.id == active)
        {
            self.active_chatbot_id = None;
        }
        self.chatbots = chatbots;
        Ok(())
    }

    /// Creates a chatbot and adds it to the sidebar list.
    pub async fn add_chatbot(
        &mut self,
        backend: &dyn ChatBackend,
        bot: NewChatbot,
    ) -> SessionResult<ChatbotSummary> {
        let created = backend.add_bot(bot).await.context(ConsoleRequestSnafu {
            stage: "add-chatbot",
        })?;
        tracing::info!(chatbot_id = %created.id, "created chatbot");
        self.chatbots.push(created.clone());
        Ok(created)
    }

    /// Saves a chatbot's persona and renames it in the sidebar list.
    pub async fn update_persona(
        &mut self,
        backend: &dyn ChatBackend,
        chatbot_id: &str,
        name: &str,
        prompt: &str,
    ) -> SessionResult<()> {
        backend
            .update_model_info(chatbot_id, name, prompt)
            .await
            .context(ConsoleRequestSnafu {
                stage: "update-persona",
            })?;
        if let Some(chatbot) = self.chatbots.iter_mut().find(|bot| bot.id == chatbot_id) {
            chatbot.name = name.to_string();
        }
        Ok(())
    }

    /// Looks up a chatbot in the sidebar list.
    pub fn chatbot(&self, chatbot_id: &str) -> Option<&ChatbotSummary> {
        self.chatbots.iter().find(|chatbot| chatbot.id == chatbot_id)
    }

    /// Starts a fresh conversation with a chatbot and points the controller at it.
    pub async fn open_chat(
        &mut self,
        backend: &dyn ChatBackend,
        controller: &mut ChatSessionController,
        chatbot_id: &str,
    ) -> SessionResult<String> {
        let session_id = backend
            .create_session(chatbot_id)
            .await
            .context(ConsoleRequestSnafu {
                stage: "open-chat-create-session",
            })?;

        self.active_chatbot_id = Some(chatbot_id.to_string());
        controller.reset(session_id.clone()).await?;
        Ok(session_id)
    }

    /// Forgets everything tied to the signed-in user.
    pub fn sign_out(&mut self) {
        *self = Self::default();
    }
}
