use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationLevel {
    Info,
    Error,
}

/// Transient user-facing message, shown once and then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    /// Creates an informational notification.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    /// Creates an error notification.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}

/// FIFO of notifications waiting to be displayed.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    pending: VecDeque<Notification>,
}

impl NotificationQueue {
    pub fn push(&mut self, notification: Notification) {
        self.pending.push_back(notification);
    }

    /// Removes and returns every pending notification, oldest first.
    pub fn drain(&mut self) -> Vec<Notification> {
        self.pending.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
