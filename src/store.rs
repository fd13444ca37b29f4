//! Durable conversation-ownership store.
//!
//! One SQLite table binds each conversation id to the token identity that
//! created it. Writes are upserts, so duplicate or racing creation events
//! for the same id cannot corrupt the row; rows are never deleted. All
//! access goes through `spawn_blocking` so the async request path never
//! blocks on disk, and the single mutex-held connection serializes
//! conflicting writes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;

use crate::error::{GateError, GateResult};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversation_mappings (
    conversation_id TEXT PRIMARY KEY,
    user_key        TEXT NOT NULL,
    created_at      TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

/// A persisted binding of a conversation to its owning identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipBinding {
    /// Conversation id (unique key).
    pub conversation_id: String,
    /// Identity that owns the conversation.
    pub user_key: String,
    /// When the binding was first written.
    pub created_at: DateTime<Utc>,
}

/// Handle to the ownership store. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct ConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /// Open (or create) the store at the given path and ensure the schema.
    pub fn open(path: &Path) -> GateResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store. Used by tests; contents die with the handle.
    pub fn open_in_memory() -> GateResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> GateResult<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert a conversation -> identity binding.
    ///
    /// Last write wins for the same id; the unique key guarantees at most
    /// one owner per conversation at any point.
    pub async fn bind(&self, conversation_id: &str, user_key: &str) -> GateResult<()> {
        let conn = Arc::clone(&self.conn);
        let conversation_id = conversation_id.to_string();
        let user_key = user_key.to_string();

        self.run_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            conn.execute(
                "INSERT INTO conversation_mappings (conversation_id, user_key)
                 VALUES (?1, ?2)
                 ON CONFLICT(conversation_id) DO UPDATE SET user_key = excluded.user_key",
                params![conversation_id, user_key],
            )?;
            debug!(conversation_id, "bound conversation to caller");
            Ok(())
        })
        .await
    }

    /// Look up the binding for a conversation id, if any.
    pub async fn owner_of(&self, conversation_id: &str) -> GateResult<Option<OwnershipBinding>> {
        let conn = Arc::clone(&self.conn);
        let conversation_id = conversation_id.to_string();

        self.run_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            conn.query_row(
                "SELECT conversation_id, user_key, created_at
                 FROM conversation_mappings
                 WHERE conversation_id = ?1",
                params![conversation_id],
                |row| {
                    Ok(OwnershipBinding {
                        conversation_id: row.get(0)?,
                        user_key: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// Of the given ids, return the subset owned by `user_key`.
    ///
    /// One query regardless of how many ids the listing contains; the
    /// result is a hash set so the caller gets O(1) membership tests.
    pub async fn owned_subset(
        &self,
        user_key: &str,
        ids: Vec<String>,
    ) -> GateResult<HashSet<String>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let conn = Arc::clone(&self.conn);
        let user_key = user_key.to_string();

        self.run_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!(
                "SELECT conversation_id FROM conversation_mappings
                 WHERE user_key = ? AND conversation_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(std::iter::once(user_key).chain(ids)),
                |row| row.get::<_, String>(0),
            )?;
            rows.collect()
        })
        .await
    }

    async fn run_blocking<T, F>(&self, f: F) -> GateResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> rusqlite::Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| GateError::StoreTask(e.to_string()))?
            .map_err(GateError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_lookup() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.bind("conv-1", "alice").await.unwrap();

        let binding = store.owner_of("conv-1").await.unwrap().unwrap();
        assert_eq!(binding.conversation_id, "conv-1");
        assert_eq!(binding.user_key, "alice");
        // created_at came from the database default.
        assert!(binding.created_at <= Utc::now());

        assert!(store.owner_of("conv-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebind_overwrites_owner() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.bind("conv-1", "alice").await.unwrap();
        store.bind("conv-1", "bob").await.unwrap();

        let binding = store.owner_of("conv-1").await.unwrap().unwrap();
        assert_eq!(binding.user_key, "bob");
    }

    #[tokio::test]
    async fn test_uuid_shaped_ids_roundtrip() {
        let store = ConversationStore::open_in_memory().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        store.bind(&id, "alice").await.unwrap();
        assert_eq!(store.owner_of(&id).await.unwrap().unwrap().user_key, "alice");
    }

    #[tokio::test]
    async fn test_concurrent_binds_for_same_id_do_not_corrupt() {
        let store = ConversationStore::open_in_memory().unwrap();

        // Racing upserts for one id must leave exactly one well-formed row.
        let writes = (0..8).map(|i| {
            let store = store.clone();
            async move {
                let owner = if i % 2 == 0 { "alice" } else { "bob" };
                store.bind("conv-1", owner).await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        let binding = store.owner_of("conv-1").await.unwrap().unwrap();
        assert!(binding.user_key == "alice" || binding.user_key == "bob");
        let all = store
            .owned_subset(&binding.user_key, vec!["conv-1".to_string()])
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_binds_keep_single_row() {
        let store = ConversationStore::open_in_memory().unwrap();
        for _ in 0..3 {
            store.bind("conv-1", "alice").await.unwrap();
        }
        let owned = store
            .owned_subset("alice", vec!["conv-1".to_string()])
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[tokio::test]
    async fn test_owned_subset_filters_by_caller() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.bind("a", "alice").await.unwrap();
        store.bind("b", "bob").await.unwrap();
        store.bind("c", "alice").await.unwrap();

        let ids: Vec<String> = ["a", "b", "c", "unknown"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let owned = store.owned_subset("alice", ids).await.unwrap();

        assert_eq!(
            owned,
            HashSet::from(["a".to_string(), "c".to_string()]),
            "only alice's conversations, and nothing invented"
        );
    }

    #[tokio::test]
    async fn test_owned_subset_empty_ids() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.bind("a", "alice").await.unwrap();
        let owned = store.owned_subset("alice", Vec::new()).await.unwrap();
        assert!(owned.is_empty());
    }
}
