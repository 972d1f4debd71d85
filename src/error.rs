//! Stable error codes surfaced in job progress and command replies.

use thiserror::Error;

/// Pipeline errors that carry a short stable code. The code is what lands in
/// `sync_operations.progress.message` and in logs; the detail string is free
/// text for operators.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Enqueueing a sync operation failed
    #[error("SYNC_ENQUEUE_FAILED: {0}")]
    SyncEnqueueFailed(String),

    /// A message upsert batch exhausted its retries
    #[error("MESSAGE_SAVE_FAILED: {0}")]
    MessageSaveFailed(String),

    /// A window upsert failed
    #[error("WINDOW_SAVE_FAILED: {0}")]
    WindowSaveFailed(String),

    /// Reading window rows back for retrieval failed
    #[error("WINDOW_FETCH_FAILED: {0}")]
    WindowFetchFailed(String),

    /// The generative model call failed
    #[error("CHAT_FAILED: {0}")]
    ChatFailed(String),

    /// Reading the guild sync cursor failed
    #[error("SYNC_CURSOR_READ_FAILED: {0}")]
    SyncCursorReadFailed(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SyncEnqueueFailed(_) => "SYNC_ENQUEUE_FAILED",
            PipelineError::MessageSaveFailed(_) => "MESSAGE_SAVE_FAILED",
            PipelineError::WindowSaveFailed(_) => "WINDOW_SAVE_FAILED",
            PipelineError::WindowFetchFailed(_) => "WINDOW_FETCH_FAILED",
            PipelineError::ChatFailed(_) => "CHAT_FAILED",
            PipelineError::SyncCursorReadFailed(_) => "SYNC_CURSOR_READ_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_stable_prefix_of_display() {
        let err = PipelineError::MessageSaveFailed("batch 3 gave up".into());
        assert_eq!(err.code(), "MESSAGE_SAVE_FAILED");
        assert!(err.to_string().starts_with("MESSAGE_SAVE_FAILED: "));
    }
}
