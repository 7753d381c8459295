//! In-memory projection store with TTL emulation.
//!
//! # Testing only
//!
//! Uses `.expect()` on lock operations. Production uses `RedisProjectionStore`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::foundation::{
    ClassId, ConversationId, DomainError, ErrorCode, MessageId, Timestamp, UserId,
};
use crate::domain::projection::{
    CachedMessage, ClassMeta, ConversationMeta, LastMessage, WriteOutcome,
};
use crate::ports::ProjectionStore;

#[derive(Debug, Default)]
struct ProjectionState {
    lists: HashMap<UserId, HashMap<ConversationId, i64>>,
    meta: HashMap<ConversationId, ConversationMeta>,
    unread: HashMap<(ConversationId, UserId), i64>,
    participants: HashMap<ConversationId, HashSet<UserId>>,
    messages: HashMap<MessageId, (CachedMessage, Instant)>,
    classes: HashMap<ClassId, ClassMeta>,
    presence: HashMap<UserId, (String, Instant)>,
    typing: HashMap<(ConversationId, UserId), Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectionStore {
    state: Arc<Mutex<ProjectionState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the cache were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ProjectionState>, DomainError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::new(
                ErrorCode::CacheError,
                "projection store unavailable",
            ));
        }
        Ok(self
            .state
            .lock()
            .expect("InMemoryProjectionStore: lock poisoned"))
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn add_to_conversation_list(
        &self,
        user: &UserId,
        conv: &ConversationId,
        score_millis: i64,
    ) -> Result<(), DomainError> {
        self.lock()?
            .lists
            .entry(user.clone())
            .or_default()
            .insert(*conv, score_millis);
        Ok(())
    }

    async fn trim_conversation_list(&self, user: &UserId, keep: usize) -> Result<(), DomainError> {
        let mut state = self.lock()?;
        if let Some(list) = state.lists.get_mut(user) {
            if list.len() > keep {
                let mut ranked: Vec<(ConversationId, i64)> =
                    list.iter().map(|(c, s)| (*c, *s)).collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1));
                *list = ranked.into_iter().take(keep).collect();
            }
        }
        Ok(())
    }

    async fn remove_from_conversation_list(
        &self,
        user: &UserId,
        conv: &ConversationId,
    ) -> Result<(), DomainError> {
        if let Some(list) = self.lock()?.lists.get_mut(user) {
            list.remove(conv);
        }
        Ok(())
    }

    async fn conversation_list(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationId>, DomainError> {
        let state = self.lock()?;
        let mut ranked: Vec<(ConversationId, i64)> = state
            .lists
            .get(user)
            .map(|l| l.iter().map(|(c, s)| (*c, *s)).collect())
            .unwrap_or_default();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(ranked.into_iter().take(limit).map(|(c, _)| c).collect())
    }

    async fn set_conversation_info(
        &self,
        conv: &ConversationId,
        kind: &str,
        name: Option<&str>,
    ) -> Result<(), DomainError> {
        let mut state = self.lock()?;
        let meta = state.meta.entry(*conv).or_default();
        meta.kind = Some(kind.to_string());
        if let Some(name) = name {
            meta.name = Some(name.to_string());
        }
        Ok(())
    }

    async fn advance_last_message(
        &self,
        conv: &ConversationId,
        last: &LastMessage,
    ) -> Result<WriteOutcome, DomainError> {
        let mut state = self.lock()?;
        let meta = state.meta.entry(*conv).or_default();
        if let Some(current) = &meta.last_message {
            if current.seq >= last.seq {
                return Ok(WriteOutcome::Stale);
            }
        }
        meta.last_message = Some(last.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn refresh_last_message_text(
        &self,
        conv: &ConversationId,
        message: &MessageId,
        text: &str,
    ) -> Result<WriteOutcome, DomainError> {
        let mut state = self.lock()?;
        let Some(last) = state
            .meta
            .get_mut(conv)
            .and_then(|m| m.last_message.as_mut())
        else {
            return Ok(WriteOutcome::Missing);
        };
        if last.id != *message {
            return Ok(WriteOutcome::Stale);
        }
        last.text = text.to_string();
        Ok(WriteOutcome::Applied)
    }

    async fn conversation_meta(
        &self,
        conv: &ConversationId,
    ) -> Result<Option<ConversationMeta>, DomainError> {
        Ok(self.lock()?.meta.get(conv).cloned())
    }

    async fn increment_unread(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<i64, DomainError> {
        let mut state = self.lock()?;
        let count = state.unread.entry((*conv, user.clone())).or_default();
        *count += 1;
        Ok(*count)
    }

    async fn reset_unread(&self, conv: &ConversationId, user: &UserId) -> Result<(), DomainError> {
        self.lock()?.unread.remove(&(*conv, user.clone()));
        Ok(())
    }

    async fn unread_count(&self, conv: &ConversationId, user: &UserId) -> Result<i64, DomainError> {
        Ok(self
            .lock()?
            .unread
            .get(&(*conv, user.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn add_participant(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<(), DomainError> {
        self.lock()?
            .participants
            .entry(*conv)
            .or_default()
            .insert(user.clone());
        Ok(())
    }

    async fn remove_participant(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<(), DomainError> {
        if let Some(set) = self.lock()?.participants.get_mut(conv) {
            set.remove(user);
        }
        Ok(())
    }

    async fn is_participant(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DomainError> {
        Ok(self
            .lock()?
            .participants
            .get(conv)
            .is_some_and(|set| set.contains(user)))
    }

    async fn cache_message(&self, msg: &CachedMessage, ttl: Duration) -> Result<(), DomainError> {
        self.lock()?
            .messages
            .insert(msg.id, (msg.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn apply_message_edit(
        &self,
        id: &MessageId,
        content: &str,
        edited_at: Timestamp,
    ) -> Result<WriteOutcome, DomainError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let Some((cached, _)) = state
            .messages
            .get_mut(id)
            .filter(|(_, expires)| *expires > now)
        else {
            return Ok(WriteOutcome::Missing);
        };
        if cached.edited_at.is_some_and(|prev| prev >= edited_at) {
            return Ok(WriteOutcome::Stale);
        }
        cached.content = content.to_string();
        cached.edited_at = Some(edited_at);
        Ok(WriteOutcome::Applied)
    }

    async fn cached_message(&self, id: &MessageId) -> Result<Option<CachedMessage>, DomainError> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .messages
            .get(id)
            .filter(|(_, expires)| *expires > now)
            .map(|(msg, _)| msg.clone()))
    }

    async fn delete_cached_message(&self, id: &MessageId) -> Result<(), DomainError> {
        self.lock()?.messages.remove(id);
        Ok(())
    }

    async fn set_class_meta(&self, class: &ClassId, meta: &ClassMeta) -> Result<(), DomainError> {
        self.lock()?.classes.insert(*class, meta.clone());
        Ok(())
    }

    async fn class_meta(&self, class: &ClassId) -> Result<Option<ClassMeta>, DomainError> {
        Ok(self.lock()?.classes.get(class).cloned())
    }

    async fn set_presence(
        &self,
        user: &UserId,
        status: &str,
        ttl: Duration,
    ) -> Result<(), DomainError> {
        self.lock()?
            .presence
            .insert(user.clone(), (status.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn presence(&self, user: &UserId) -> Result<Option<String>, DomainError> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .presence
            .get(user)
            .filter(|(_, expires)| *expires > now)
            .map(|(status, _)| status.clone()))
    }

    async fn set_typing(
        &self,
        conv: &ConversationId,
        user: &UserId,
        ttl: Duration,
    ) -> Result<(), DomainError> {
        self.lock()?
            .typing
            .insert((*conv, user.clone()), Instant::now() + ttl);
        Ok(())
    }

    async fn typing_users(&self, conv: &ConversationId) -> Result<Vec<UserId>, DomainError> {
        let now = Instant::now();
        let mut users: Vec<UserId> = self
            .lock()?
            .typing
            .iter()
            .filter(|((c, _), expires)| c == conv && **expires > now)
            .map(|((_, u), _)| u.clone())
            .collect();
        users.sort();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn last(seq: i64) -> LastMessage {
        LastMessage {
            id: MessageId::new(),
            text: format!("message {}", seq),
            at_millis: seq * 1_000,
            sender: user("alice"),
            seq,
        }
    }

    #[tokio::test]
    async fn conversation_list_is_ranked_and_trimmed() {
        let store = InMemoryProjectionStore::new();
        let u = user("alice");
        let convs: Vec<ConversationId> = (0..4).map(|_| ConversationId::new()).collect();
        for (i, c) in convs.iter().enumerate() {
            store
                .add_to_conversation_list(&u, c, i as i64)
                .await
                .unwrap();
        }
        store.trim_conversation_list(&u, 2).await.unwrap();

        assert_eq!(
            store.conversation_list(&u, 10).await.unwrap(),
            vec![convs[3], convs[2]]
        );
    }

    #[tokio::test]
    async fn last_message_only_moves_forward() {
        let store = InMemoryProjectionStore::new();
        let conv = ConversationId::new();

        assert!(store.advance_last_message(&conv, &last(2)).await.unwrap().applied());
        assert_eq!(
            store.advance_last_message(&conv, &last(1)).await.unwrap(),
            WriteOutcome::Stale
        );
        assert_eq!(
            store.advance_last_message(&conv, &last(2)).await.unwrap(),
            WriteOutcome::Stale
        );

        let meta = store.conversation_meta(&conv).await.unwrap().unwrap();
        assert_eq!(meta.last_message.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn older_edit_does_not_overwrite_newer() {
        let store = InMemoryProjectionStore::new();
        let msg = CachedMessage {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender_id: user("alice"),
            seq: 1,
            content: "v1".into(),
            created_at: Timestamp::from_unix_millis(1_000),
            reply_to_id: None,
            edited_at: None,
        };
        store
            .cache_message(&msg, Duration::from_secs(60))
            .await
            .unwrap();

        let newer = Timestamp::from_unix_millis(3_000);
        let older = Timestamp::from_unix_millis(2_000);
        assert!(store
            .apply_message_edit(&msg.id, "v3", newer)
            .await
            .unwrap()
            .applied());
        assert_eq!(
            store.apply_message_edit(&msg.id, "v2", older).await.unwrap(),
            WriteOutcome::Stale
        );
        let cached = store.cached_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(cached.content, "v3");
    }

    #[tokio::test(start_paused = true)]
    async fn typing_entries_expire() {
        let store = InMemoryProjectionStore::new();
        let conv = ConversationId::new();
        store
            .set_typing(&conv, &user("bob"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.typing_users(&conv).await.unwrap(), vec![user("bob")]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.typing_users(&conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unread_counts_increment_and_reset() {
        let store = InMemoryProjectionStore::new();
        let conv = ConversationId::new();
        let u = user("carol");
        store.increment_unread(&conv, &u).await.unwrap();
        assert_eq!(store.increment_unread(&conv, &u).await.unwrap(), 2);
        store.reset_unread(&conv, &u).await.unwrap();
        assert_eq!(store.unread_count(&conv, &u).await.unwrap(), 0);
    }
}
