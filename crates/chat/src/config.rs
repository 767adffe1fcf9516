use botsmith_client::SessionConfigPayload;

pub const DEFAULT_BACKGROUND_COLOR: &str = "#000000";

/// Widget appearance and copy for one chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub greeting: String,
    pub placeholder: String,
    pub suggestions: Vec<String>,
    pub avatar_url: Option<String>,
    pub use_custom_background: bool,
    pub background_color: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: String::new(),
            placeholder: String::new(),
            suggestions: Vec::new(),
            avatar_url: None,
            use_custom_background: false,
            background_color: DEFAULT_BACKGROUND_COLOR.to_string(),
        }
    }
}

impl SessionConfig {
    /// Builds the domain view of a backend payload.
    ///
    /// `avatar_url` resolves an image id into an absolute URL.
    pub fn from_payload(
        payload: SessionConfigPayload,
        avatar_url: impl FnOnce(&str) -> String,
    ) -> Self {
        let background_color = payload
            .bot_msg_bg_color
            .map(|color| color.trim().to_string())
            .filter(|color| !color.is_empty())
            .unwrap_or_else(|| DEFAULT_BACKGROUND_COLOR.to_string());

        Self {
            greeting: payload.initial.unwrap_or_default(),
            placeholder: payload.placeholder.unwrap_or_default(),
            suggestions: split_suggestions(payload.suggested.as_deref().unwrap_or_default()),
            avatar_url: payload
                .img_id
                .filter(|img_id| !img_id.trim().is_empty())
                .map(|img_id| avatar_url(&img_id)),
            use_custom_background: payload.use_custom.unwrap_or(false),
            background_color,
        }
    }

    /// Background for assistant bubbles, or `None` to keep the theme default.
    pub fn assistant_background(&self) -> Option<&str> {
        self.use_custom_background
            .then_some(self.background_color.as_str())
    }
}

/// Splits the newline-delimited suggestion list, dropping blank lines.
pub fn split_suggestions(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
