use thiserror::Error;

use gubae_shared::{ConversationId, MessageId};
use gubae_store::StoreError;

/// Failures of messaging commands.
///
/// A failed command never leaves partial state behind: validation happens
/// before any write, and multi-row writes run in a single transaction.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Unknown or deactivated conversation.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Empty or oversized content, or a malformed reaction symbol.
    #[error("Invalid content: {0}")]
    ContentInvalid(String),

    /// Deliberately carries no detail so membership is not disclosed.
    #[error("Action not permitted")]
    Forbidden,

    /// Soft failure: the join was a no-op.
    #[error("Already a member of {0}")]
    AlreadyMember(ConversationId),

    /// The overlay changed since the caller read it; refetch and retry.
    #[error("Message {0} was modified concurrently")]
    ConflictingEdit(MessageId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::ConversationNotFound(_) => "conversation_not_found",
            ChatError::MessageNotFound(_) => "message_not_found",
            ChatError::ContentInvalid(_) => "content_invalid",
            ChatError::Forbidden => "forbidden",
            ChatError::AlreadyMember(_) => "already_member",
            ChatError::ConflictingEdit(_) => "conflicting_edit",
            ChatError::InvalidRequest(_) => "invalid_request",
            ChatError::Storage(_) | ChatError::Internal(_) => "internal",
        }
    }

    /// Non-fatal outcomes that callers may report as success.
    pub fn is_soft(&self) -> bool {
        matches!(self, ChatError::AlreadyMember(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::ConflictingEdit(_))
    }

    /// Replace a store-level "not found" with a domain error.
    pub(crate) fn not_found_as(self, replacement: ChatError) -> ChatError {
        match self {
            ChatError::Storage(StoreError::NotFound) => replacement,
            other => other,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type ChatResult<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_translated() {
        let id = ConversationId::new();
        let err = ChatError::from(StoreError::NotFound).not_found_as(ChatError::ConversationNotFound(id));
        assert!(matches!(err, ChatError::ConversationNotFound(got) if got == id));
    }

    #[test]
    fn test_other_storage_errors_pass_through() {
        let err = ChatError::from(StoreError::NoDataDir).not_found_as(ChatError::Forbidden);
        assert_eq!(err.code(), "internal");
    }

    #[test]
    fn test_soft_and_retryable() {
        assert!(ChatError::AlreadyMember(ConversationId::new()).is_soft());
        assert!(ChatError::ConflictingEdit(MessageId::new()).is_retryable());
        assert!(!ChatError::Forbidden.is_soft());
        assert_eq!(ChatError::Forbidden.to_string(), "Action not permitted");
    }
}
