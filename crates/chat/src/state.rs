use botsmith_client::RunTarget;

/// Lifecycle of the controller's single active run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    AwaitingRun(RunTarget),
    Streaming(RunTarget),
    Error(String),
}

/// State transition input for the run lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    Submit(RunTarget),
    RunOpened(RunTarget),
    Complete(RunTarget),
    Fail {
        target: Option<RunTarget>,
        message: String,
    },
    Cancel(RunTarget),
    Reset,
}

/// Rejection reason for illegal transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejection {
    Busy {
        active: RunTarget,
        attempted: RunTarget,
    },
    NoActiveRun,
    TargetMismatch {
        active: RunTarget,
        attempted: RunTarget,
    },
}

pub type TransitionResult = Result<SessionState, TransitionRejection>;

impl SessionState {
    /// Returns the in-flight run for `AwaitingRun` and `Streaming`.
    pub fn active_target(&self) -> Option<RunTarget> {
        match self {
            Self::AwaitingRun(target) | Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Error(_) => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_target().is_some()
    }

    /// Returns true when an incoming run event belongs to the streaming run.
    pub fn accepts_event(&self, target: RunTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            Self::Idle | Self::AwaitingRun(_) | Self::Streaming(_) => None,
        }
    }

    /// Applies one transition deterministically.
    ///
    /// `Idle` and `Error` accept a new submit; every other transition must name the
    /// in-flight run exactly.
    pub fn apply(&self, transition: SessionTransition) -> TransitionResult {
        match transition {
            SessionTransition::Submit(target) => self.apply_submit(target),
            SessionTransition::RunOpened(target) => self.apply_run_opened(target),
            SessionTransition::Complete(target) | SessionTransition::Cancel(target) => {
                self.expect_active(target).map(|_| Self::Idle)
            }
            SessionTransition::Fail {
                target: Some(target),
                message,
            } => self.expect_active(target).map(|_| Self::Error(message)),
            SessionTransition::Fail {
                target: None,
                message,
            } => Ok(Self::Error(message)),
            SessionTransition::Reset => Ok(Self::Idle),
        }
    }

    fn apply_submit(&self, target: RunTarget) -> TransitionResult {
        match self.active_target() {
            Some(active) => Err(TransitionRejection::Busy {
                active,
                attempted: target,
            }),
            None => Ok(Self::AwaitingRun(target)),
        }
    }

    fn apply_run_opened(&self, target: RunTarget) -> TransitionResult {
        match self {
            Self::AwaitingRun(active) if *active == target => Ok(Self::Streaming(target)),
            Self::AwaitingRun(active) | Self::Streaming(active) => {
                Err(TransitionRejection::TargetMismatch {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Idle | Self::Error(_) => Err(TransitionRejection::NoActiveRun),
        }
    }

    fn expect_active(&self, target: RunTarget) -> Result<RunTarget, TransitionRejection> {
        match self.active_target() {
            Some(active) if active == target => Ok(active),
            Some(active) => Err(TransitionRejection::TargetMismatch {
                active,
                attempted: target,
            }),
            None => Err(TransitionRejection::NoActiveRun),
        }
    }
}
