/// Monotonic counter bumped every time the controller switches sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionEpoch(pub u64);

impl SessionEpoch {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Identifier for one run started by an accepted submit.
///
/// This must change on every submit so stale events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunSeq(pub u64);

impl RunSeq {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Routing key used for stale-event rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunTarget {
    pub epoch: SessionEpoch,
    pub run: RunSeq,
}

impl RunTarget {
    pub const fn new(epoch: SessionEpoch, run: RunSeq) -> Self {
        Self { epoch, run }
    }
}

/// One output record produced by the provider's code-execution tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeOutput {
    Logs(String),
    Image { file_id: String },
    Other { kind: String },
}

/// Incremental code-execution tool call data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeInterpreterDelta {
    pub input: Option<String>,
    pub outputs: Vec<CodeOutput>,
}

/// Provider-agnostic run event mapped into chat domain language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    RunStarted,
    TextDelta(String),
    CodeInterpreter(CodeInterpreterDelta),
    End,
    Error(String),
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error(_))
    }
}

/// Run event tagged with the run that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEventMapped {
    pub target: RunTarget,
    pub payload: RunEvent,
}

impl RunEventMapped {
    pub fn new(target: RunTarget, payload: RunEvent) -> Self {
        Self { target, payload }
    }
}
