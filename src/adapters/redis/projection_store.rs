//! Redis-backed projection store.
//!
//! Guarded writes (last-message advance, preview refresh, message edits) are
//! Lua scripts so the compare and the write happen atomically.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::foundation::{
    ClassId, ConversationId, DomainError, MessageId, Timestamp, UserId,
};
use crate::domain::projection::{
    keys, CachedMessage, ClassMeta, ConversationMeta, LastMessage, WriteOutcome,
};
use crate::ports::ProjectionStore;

/// Sets the last-message fields only if `seq` moves forward.
/// Returns 1 when applied, 0 when stale.
static ADVANCE_LAST_MESSAGE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local current = redis.call('HGET', KEYS[1], 'last_msg_seq')
        if current and tonumber(current) >= tonumber(ARGV[5]) then
            return 0
        end
        redis.call('HSET', KEYS[1],
            'last_msg_id', ARGV[1],
            'last_msg_text', ARGV[2],
            'last_msg_at', ARGV[3],
            'last_msg_sender', ARGV[4],
            'last_msg_seq', ARGV[5])
        return 1
        "#,
    )
});

/// Rewrites the preview text if the message is still the last one.
/// Returns 1 applied, 0 stale, -1 missing.
static REFRESH_LAST_MESSAGE_TEXT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local id = redis.call('HGET', KEYS[1], 'last_msg_id')
        if not id then
            return -1
        end
        if id ~= ARGV[1] then
            return 0
        end
        redis.call('HSET', KEYS[1], 'last_msg_text', ARGV[2])
        return 1
        "#,
    )
});

/// Applies an edit only when it is newer than the cached one.
/// Returns 1 applied, 0 stale, -1 missing.
static APPLY_MESSAGE_EDIT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return -1
        end
        local prev = redis.call('HGET', KEYS[1], 'edited_at')
        if prev and tonumber(prev) >= tonumber(ARGV[2]) then
            return 0
        end
        redis.call('HSET', KEYS[1], 'content', ARGV[1], 'edited_at', ARGV[2])
        return 1
        "#,
    )
});

fn outcome(code: i64) -> WriteOutcome {
    match code {
        1 => WriteOutcome::Applied,
        0 => WriteOutcome::Stale,
        _ => WriteOutcome::Missing,
    }
}

fn cache_err(context: &'static str) -> impl Fn(redis::RedisError) -> DomainError {
    move |e| DomainError::cache(context, e)
}

fn corrupt(key: &str, field: &str) -> DomainError {
    DomainError::cache("Corrupt projection entry", format!("{} field {}", key, field))
}

fn parse_field<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &str,
    field: &str,
) -> Result<T, DomainError> {
    map.get(field)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| corrupt(key, field))
}

#[derive(Clone)]
pub struct RedisProjectionStore {
    conn: MultiplexedConnection,
}

impl RedisProjectionStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

impl std::fmt::Debug for RedisProjectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisProjectionStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ProjectionStore for RedisProjectionStore {
    async fn add_to_conversation_list(
        &self,
        user: &UserId,
        conv: &ConversationId,
        score_millis: i64,
    ) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(keys::conversation_list(user), conv.to_string(), score_millis)
            .await
            .map_err(cache_err("Failed to update conversation list"))
    }

    async fn trim_conversation_list(&self, user: &UserId, keep: usize) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        // Ranks are ascending by score; drop everything below the newest `keep`.
        let stop = -(keep as isize) - 1;
        conn.zremrangebyrank::<_, ()>(keys::conversation_list(user), 0, stop)
            .await
            .map_err(cache_err("Failed to trim conversation list"))
    }

    async fn remove_from_conversation_list(
        &self,
        user: &UserId,
        conv: &ConversationId,
    ) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(keys::conversation_list(user), conv.to_string())
            .await
            .map_err(cache_err("Failed to remove from conversation list"))
    }

    async fn conversation_list(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationId>, DomainError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrevrange(keys::conversation_list(user), 0, limit as isize - 1)
            .await
            .map_err(cache_err("Failed to read conversation list"))?;
        ids.iter()
            .map(|id| {
                id.parse()
                    .map_err(|_| corrupt(&keys::conversation_list(user), "member"))
            })
            .collect()
    }

    async fn set_conversation_info(
        &self,
        conv: &ConversationId,
        kind: &str,
        name: Option<&str>,
    ) -> Result<(), DomainError> {
        let mut fields = vec![("type", kind.to_string())];
        if let Some(name) = name {
            fields.push(("name", name.to_string()));
        }
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(keys::conversation_meta(conv), &fields)
            .await
            .map_err(cache_err("Failed to set conversation info"))
    }

    async fn advance_last_message(
        &self,
        conv: &ConversationId,
        last: &LastMessage,
    ) -> Result<WriteOutcome, DomainError> {
        let mut conn = self.conn.clone();
        let code: i64 = ADVANCE_LAST_MESSAGE
            .key(keys::conversation_meta(conv))
            .arg(last.id.to_string())
            .arg(&last.text)
            .arg(last.at_millis)
            .arg(last.sender.as_str())
            .arg(last.seq)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err("Failed to advance last message"))?;
        Ok(outcome(code))
    }

    async fn refresh_last_message_text(
        &self,
        conv: &ConversationId,
        message: &MessageId,
        text: &str,
    ) -> Result<WriteOutcome, DomainError> {
        let mut conn = self.conn.clone();
        let code: i64 = REFRESH_LAST_MESSAGE_TEXT
            .key(keys::conversation_meta(conv))
            .arg(message.to_string())
            .arg(text)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err("Failed to refresh last message preview"))?;
        Ok(outcome(code))
    }

    async fn conversation_meta(
        &self,
        conv: &ConversationId,
    ) -> Result<Option<ConversationMeta>, DomainError> {
        let key = keys::conversation_meta(conv);
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(cache_err("Failed to read conversation meta"))?;
        if map.is_empty() {
            return Ok(None);
        }

        let last_message = match map.get("last_msg_id") {
            Some(id) => Some(LastMessage {
                id: id.parse().map_err(|_| corrupt(&key, "last_msg_id"))?,
                text: map.get("last_msg_text").cloned().unwrap_or_default(),
                at_millis: parse_field(&map, &key, "last_msg_at")?,
                sender: parse_field(&map, &key, "last_msg_sender")?,
                seq: parse_field(&map, &key, "last_msg_seq")?,
            }),
            None => None,
        };

        Ok(Some(ConversationMeta {
            kind: map.get("type").cloned(),
            name: map.get("name").cloned(),
            last_message,
        }))
    }

    async fn increment_unread(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<i64, DomainError> {
        let mut conn = self.conn.clone();
        conn.incr(keys::unread(conv, user), 1_i64)
            .await
            .map_err(cache_err("Failed to increment unread count"))
    }

    async fn reset_unread(&self, conv: &ConversationId, user: &UserId) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::unread(conv, user))
            .await
            .map_err(cache_err("Failed to reset unread count"))
    }

    async fn unread_count(&self, conv: &ConversationId, user: &UserId) -> Result<i64, DomainError> {
        let mut conn = self.conn.clone();
        let count: Option<i64> = conn
            .get(keys::unread(conv, user))
            .await
            .map_err(cache_err("Failed to read unread count"))?;
        Ok(count.unwrap_or(0))
    }

    async fn add_participant(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(keys::participants(conv), user.as_str())
            .await
            .map_err(cache_err("Failed to add participant"))
    }

    async fn remove_participant(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(keys::participants(conv), user.as_str())
            .await
            .map_err(cache_err("Failed to remove participant"))
    }

    async fn is_participant(
        &self,
        conv: &ConversationId,
        user: &UserId,
    ) -> Result<bool, DomainError> {
        let mut conn = self.conn.clone();
        conn.sismember(keys::participants(conv), user.as_str())
            .await
            .map_err(cache_err("Failed to check participant"))
    }

    async fn cache_message(&self, msg: &CachedMessage, ttl: Duration) -> Result<(), DomainError> {
        let key = keys::message(&msg.id);
        let mut fields = vec![
            ("id", msg.id.to_string()),
            ("conversation_id", msg.conversation_id.to_string()),
            ("sender_id", msg.sender_id.to_string()),
            ("seq", msg.seq.to_string()),
            ("content", msg.content.clone()),
            ("created_at", msg.created_at.as_unix_millis().to_string()),
        ];
        if let Some(reply_to) = msg.reply_to_id {
            fields.push(("reply_to_id", reply_to.to_string()));
        }
        if let Some(edited_at) = msg.edited_at {
            fields.push(("edited_at", edited_at.as_unix_millis().to_string()));
        }

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(cache_err("Failed to cache message"))
    }

    async fn apply_message_edit(
        &self,
        id: &MessageId,
        content: &str,
        edited_at: Timestamp,
    ) -> Result<WriteOutcome, DomainError> {
        let mut conn = self.conn.clone();
        let code: i64 = APPLY_MESSAGE_EDIT
            .key(keys::message(id))
            .arg(content)
            .arg(edited_at.as_unix_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err("Failed to apply message edit"))?;
        Ok(outcome(code))
    }

    async fn cached_message(&self, id: &MessageId) -> Result<Option<CachedMessage>, DomainError> {
        let key = keys::message(id);
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(cache_err("Failed to read cached message"))?;
        if map.is_empty() {
            return Ok(None);
        }

        let optional_millis = |field: &str| -> Result<Option<Timestamp>, DomainError> {
            map.get(field)
                .map(|v| {
                    v.parse::<i64>()
                        .map(Timestamp::from_unix_millis)
                        .map_err(|_| corrupt(&key, field))
                })
                .transpose()
        };

        Ok(Some(CachedMessage {
            id: parse_field(&map, &key, "id")?,
            conversation_id: parse_field(&map, &key, "conversation_id")?,
            sender_id: parse_field(&map, &key, "sender_id")?,
            seq: parse_field(&map, &key, "seq")?,
            content: map.get("content").cloned().unwrap_or_default(),
            created_at: Timestamp::from_unix_millis(parse_field(&map, &key, "created_at")?),
            reply_to_id: map
                .get("reply_to_id")
                .map(|v| v.parse().map_err(|_| corrupt(&key, "reply_to_id")))
                .transpose()?,
            edited_at: optional_millis("edited_at")?,
        }))
    }

    async fn delete_cached_message(&self, id: &MessageId) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys::message(id))
            .await
            .map_err(cache_err("Failed to delete cached message"))
    }

    async fn set_class_meta(&self, class: &ClassId, meta: &ClassMeta) -> Result<(), DomainError> {
        let fields = [
            ("name", meta.name.clone()),
            ("code", meta.code.clone()),
            ("created_by", meta.created_by.to_string()),
        ];
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(keys::class_meta(class), &fields)
            .await
            .map_err(cache_err("Failed to set class meta"))
    }

    async fn class_meta(&self, class: &ClassId) -> Result<Option<ClassMeta>, DomainError> {
        let key = keys::class_meta(class);
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(cache_err("Failed to read class meta"))?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(ClassMeta {
            name: map.get("name").cloned().unwrap_or_default(),
            code: map.get("code").cloned().unwrap_or_default(),
            created_by: parse_field(&map, &key, "created_by")?,
        }))
    }

    async fn set_presence(
        &self,
        user: &UserId,
        status: &str,
        ttl: Duration,
    ) -> Result<(), DomainError> {
        let key = keys::presence(user);
        let mut conn = self.conn.clone();
        redis::pipe()
            .set(&key, status)
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(cache_err("Failed to set presence"))
    }

    async fn presence(&self, user: &UserId) -> Result<Option<String>, DomainError> {
        let mut conn = self.conn.clone();
        conn.get(keys::presence(user))
            .await
            .map_err(cache_err("Failed to read presence"))
    }

    async fn set_typing(
        &self,
        conv: &ConversationId,
        user: &UserId,
        ttl: Duration,
    ) -> Result<(), DomainError> {
        let key = keys::typing(conv, user);
        let mut conn = self.conn.clone();
        redis::pipe()
            .set(&key, "1")
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(cache_err("Failed to set typing indicator"))
    }

    async fn typing_users(&self, conv: &ConversationId) -> Result<Vec<UserId>, DomainError> {
        let prefix = keys::typing_prefix(conv);
        let pattern = format!("{}*", prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut users = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(cache_err("Failed to scan typing indicators"))?;
            for key in batch {
                if let Some(user) = key.strip_prefix(&prefix).and_then(|u| u.parse().ok()) {
                    users.push(user);
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        users.sort();
        users.dedup();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> RedisProjectionStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let client = redis::Client::open(url).expect("client");
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .expect("redis connection");
        RedisProjectionStore::new(conn)
    }

    #[test]
    fn script_codes_map_to_outcomes() {
        assert_eq!(outcome(1), WriteOutcome::Applied);
        assert_eq!(outcome(0), WriteOutcome::Stale);
        assert_eq!(outcome(-1), WriteOutcome::Missing);
    }

    #[tokio::test]
    #[ignore = "requires Redis (REDIS_URL)"]
    async fn last_message_is_sequence_guarded() {
        let store = store().await;
        let conv = ConversationId::new();
        let sender = UserId::new("alice").unwrap();
        let at = |seq: i64| LastMessage {
            id: MessageId::new(),
            text: format!("m{}", seq),
            at_millis: seq,
            sender: sender.clone(),
            seq,
        };

        assert!(store.advance_last_message(&conv, &at(5)).await.unwrap().applied());
        assert_eq!(
            store.advance_last_message(&conv, &at(4)).await.unwrap(),
            WriteOutcome::Stale
        );
        let meta = store.conversation_meta(&conv).await.unwrap().unwrap();
        assert_eq!(meta.last_message.unwrap().seq, 5);
    }

    #[tokio::test]
    #[ignore = "requires Redis (REDIS_URL)"]
    async fn cached_message_round_trips_through_hash() {
        let store = store().await;
        let msg = CachedMessage {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender_id: UserId::new("bob").unwrap(),
            seq: 3,
            content: "hello".into(),
            created_at: Timestamp::from_unix_millis(1_700_000_000_000),
            reply_to_id: None,
            edited_at: None,
        };
        store.cache_message(&msg, Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.cached_message(&msg.id).await.unwrap(), Some(msg));
    }
}
