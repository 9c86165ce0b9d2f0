//! Status values describing subscribe-loop transitions and operation outcomes.

use crate::cursor::Cursor;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    Acknowledgment,
    Connected,
    Reconnected,
    Disconnected,
    UnexpectedDisconnect,
    Cancelled,
    AccessDenied,
    Timeout,
    NetworkIssues,
    MalformedResponse,
    BadRequest,
    RequestURITooLong,
    MalformedFilterExpression,
    RequestMessageCountExceeded,
    RateLimited,
}

impl StatusCategory {
    /// Category used to report a failed request outside the subscribe loop
    /// (heartbeat, leave, time).
    pub fn for_error(error: &Error) -> Self {
        match error {
            Error::NetworkUnreachable(_) => StatusCategory::NetworkIssues,
            Error::Timeout => StatusCategory::Timeout,
            Error::AccessDenied { .. } => StatusCategory::AccessDenied,
            Error::MalformedResponse(_) | Error::Decode(_) => StatusCategory::MalformedResponse,
            Error::Cancelled => StatusCategory::Cancelled,
            Error::Configuration(_) => StatusCategory::BadRequest,
            Error::RateLimited => StatusCategory::RateLimited,
            Error::BadRequest { status: 414, .. } => StatusCategory::RequestURITooLong,
            Error::BadRequest { .. } => StatusCategory::BadRequest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    Heartbeat,
    Leave,
    Time,
}

/// Immutable summary of one state transition or request outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub category: StatusCategory,
    pub operation: Operation,
    pub is_error: bool,
    /// Whether the client keeps retrying on its own after this status.
    pub retryable: bool,
    pub current_cursor: Cursor,
    pub previous_cursor: Cursor,
    pub affected_channels: Vec<String>,
    pub affected_groups: Vec<String>,
    pub error: Option<Error>,
}

impl Status {
    pub(crate) fn new(category: StatusCategory, operation: Operation) -> Self {
        Self {
            category,
            operation,
            is_error: false,
            retryable: false,
            current_cursor: Cursor::ZERO,
            previous_cursor: Cursor::ZERO,
            affected_channels: Vec::new(),
            affected_groups: Vec::new(),
            error: None,
        }
    }

    /// Error status; `is_error` and `retryable` follow from `error`.
    pub(crate) fn failure(category: StatusCategory, operation: Operation, error: Error) -> Self {
        let mut status = Self::new(category, operation);
        status.is_error = true;
        status.retryable = error.is_retryable();
        status.error = Some(error);
        status
    }

    pub(crate) fn with_cursors(mut self, current: Cursor, previous: Cursor) -> Self {
        self.current_cursor = current;
        self.previous_cursor = previous;
        self
    }

    pub(crate) fn with_affected(mut self, channels: Vec<String>, groups: Vec<String>) -> Self {
        self.affected_channels = channels;
        self.affected_groups = groups;
        self
    }

    pub(crate) fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Coarse state of the subscribe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected { unexpected: bool },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_status_inherits_retryability() {
        let s = Status::failure(
            StatusCategory::Timeout,
            Operation::Heartbeat,
            Error::Timeout,
        );
        assert!(s.is_error);
        assert!(s.retryable);

        let s = Status::failure(
            StatusCategory::AccessDenied,
            Operation::Subscribe,
            Error::AccessDenied {
                message: "Forbidden".into(),
                channels: vec![],
                groups: vec![],
            },
        );
        assert!(!s.retryable);
    }

    #[test]
    fn error_categories() {
        assert_eq!(
            StatusCategory::for_error(&Error::BadRequest {
                status: 414,
                message: String::new()
            }),
            StatusCategory::RequestURITooLong
        );
        assert_eq!(
            StatusCategory::for_error(&Error::NetworkUnreachable("x".into())),
            StatusCategory::NetworkIssues
        );
    }
}
