use botsmith_client::{CodeInterpreterDelta, CodeOutput};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    User,
    Assistant,
}

/// One message in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

impl Turn {
    /// Creates a turn with the given speaker and text.
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }

    /// Creates a user turn.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Speaker::User, text)
    }

    /// Creates an assistant turn.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Speaker::Assistant, text)
    }

    /// True for an assistant turn that has not received any text yet.
    pub fn is_pending_assistant(&self) -> bool {
        self.speaker == Speaker::Assistant && self.text.is_empty()
    }
}

/// Ordered client-side projection of the conversation.
///
/// Turns are append-only. Only the last turn may grow, and only when it belongs to
/// the assistant; appending a new turn freezes every earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// All turns in order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Most recent turn.
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Drops every turn.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Appends a user turn and returns its index.
    pub fn push_user(&mut self, text: impl Into<String>) -> usize {
        self.push(Turn::user(text))
    }

    /// Appends an empty assistant turn and returns its index.
    pub fn push_assistant(&mut self) -> usize {
        self.push(Turn::assistant(String::new()))
    }

    fn push(&mut self, turn: Turn) -> usize {
        self.turns.push(turn);
        self.turns.len() - 1
    }

    /// Returns the index of the last turn when it is an open assistant turn.
    pub fn open_assistant_index(&self) -> Option<usize> {
        let index = self.turns.len().checked_sub(1)?;
        (self.turns[index].speaker == Speaker::Assistant).then_some(index)
    }

    /// Appends a text fragment verbatim to the open assistant turn.
    ///
    /// Returns false when the last turn is not an assistant turn; frozen turns are
    /// never touched.
    pub fn append_to_assistant(&mut self, fragment: &str) -> bool {
        match self.turns.last_mut() {
            Some(turn) if turn.speaker == Speaker::Assistant => {
                turn.text.push_str(fragment);
                true
            }
            _ => false,
        }
    }

    /// Renders code-execution data into the open assistant turn.
    ///
    /// The code fragment is appended verbatim and every `logs` output becomes a
    /// newline-delimited block. Other output kinds are skipped.
    pub fn append_code_interpreter(&mut self, delta: &CodeInterpreterDelta) -> bool {
        if self.open_assistant_index().is_none() {
            return false;
        }

        if let Some(input) = &delta.input {
            self.append_to_assistant(input);
        }
        for output in &delta.outputs {
            if let CodeOutput::Logs(logs) = output {
                self.append_to_assistant(&format!("\n{logs}\n"));
            }
        }
        true
    }
}
