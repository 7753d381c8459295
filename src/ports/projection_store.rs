//! ProjectionStore port - fast key-value home of denormalized read state.
//!
//! Written by the projection handler, read by the gateway (participant
//! checks, presence) and by clients' query APIs.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::foundation::{
    ClassId, ConversationId, DomainError, MessageId, Timestamp, UserId,
};
use crate::domain::projection::{
    CachedMessage, ClassMeta, ConversationMeta, LastMessage, WriteOutcome,
};

#[async_trait]
pub trait ProjectionStore: Send + Sync {
    // === Conversation lists (`conv:{user}:list`) ===

    /// Upserts `conv` in the user's list with the given activity score.
    async fn add_to_conversation_list(
        &self,
        user: &UserId,
        conv: &ConversationId,
        score_millis: i64,
    ) -> Result<(), DomainError>;

    /// Keeps only the `keep` most recent entries.
    async fn trim_conversation_list(&self, user: &UserId, keep: usize) -> Result<(), DomainError>;

    async fn remove_from_conversation_list(
        &self,
        user: &UserId,
        conv: &ConversationId,
    ) -> Result<(), DomainError>;

    /// Most recent first.
    async fn conversation_list(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationId>, DomainError>;

    // === Conversation meta (`conv:{id}:meta`) ===

    async fn set_conversation_info(
        &self,
        conv: &ConversationId,
        kind: &str,
        name: Option<&str>,
    ) -> Result<(), DomainError>;

    /// Replaces the last-message facet only if `last.seq` is newer.
    async fn advance_last_message(
        &self,
        conv: &ConversationId,
        last: &LastMessage,
    ) -> Result<WriteOutcome, DomainError>;

    /// Rewrites the preview text if `message` is still the last message.
    async fn refresh_last_message_text(
        &self,
        conv: &ConversationId,
        message: &MessageId,
        text: &str,
    ) -> Result<WriteOutcome, DomainError>;

    async fn conversation_meta(
        &self,
        conv: &ConversationId,
    ) -> Result<Option<ConversationMeta>, DomainError>;

    // === Unread counters (`conv:{conv}:unread:{user}`) ===

    async fn increment_unread(&self, conv: &ConversationId, user: &UserId)
        -> Result<i64, DomainError>;

    async fn reset_unread(&self, conv: &ConversationId, user: &UserId) -> Result<(), DomainError>;

    async fn unread_count(&self, conv: &ConversationId, user: &UserId) -> Result<i64, DomainError>;

    // === Participants (`conv:{id}:participants`) ===

    async fn add_participant(&self, conv: &ConversationId, user: &UserId)
        -> Result<(), DomainError>;

    async fn remove_participant(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<(), DomainError>;

    async fn is_participant(&self, conv: &ConversationId, user: &UserId)
        -> Result<bool, DomainError>;

    // === Message cache (`msg:{id}`) ===

    async fn cache_message(&self, msg: &CachedMessage, ttl: Duration) -> Result<(), DomainError>;

    /// Applies an edit unless the cached copy carries a newer edit.
    async fn apply_message_edit(
        &self,
        id: &MessageId,
        content: &str,
        edited_at: Timestamp,
    ) -> Result<WriteOutcome, DomainError>;

    async fn cached_message(&self, id: &MessageId) -> Result<Option<CachedMessage>, DomainError>;

    async fn delete_cached_message(&self, id: &MessageId) -> Result<(), DomainError>;

    // === Classes (`class:{id}:meta`) ===

    async fn set_class_meta(&self, class: &ClassId, meta: &ClassMeta) -> Result<(), DomainError>;

    async fn class_meta(&self, class: &ClassId) -> Result<Option<ClassMeta>, DomainError>;

    // === Ephemeral state ===

    async fn set_presence(&self, user: &UserId, status: &str, ttl: Duration)
        -> Result<(), DomainError>;

    /// `None` once the TTL has lapsed (offline).
    async fn presence(&self, user: &UserId) -> Result<Option<String>, DomainError>;

    async fn set_typing(
        &self,
        conv: &ConversationId,
        user: &UserId,
        ttl: Duration,
    ) -> Result<(), DomainError>;

    async fn typing_users(&self, conv: &ConversationId) -> Result<Vec<UserId>, DomainError>;
}
