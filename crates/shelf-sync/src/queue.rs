// File: shelf-sync/src/queue.rs
// Purpose: Ordered, persisted log of mutations waiting for the server

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::book::BookDraft;
use crate::error::QueueError;
use crate::identifier::{random_token, RecordId};
use crate::store::{PersistentStore, ACTION_QUEUE_KEY};

/// Mutation performed on a record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[serde(alias = "add")]
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Create => write!(f, "create"),
            ActionKind::Update => write!(f, "update"),
            ActionKind::Delete => write!(f, "delete"),
        }
    }
}

/// Target and content of a queued mutation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    #[serde(flatten)]
    pub draft: Option<BookDraft>,
}

impl ActionPayload {
    pub fn create(draft: BookDraft) -> Self {
        Self { id: None, draft: Some(draft) }
    }

    pub fn update(id: RecordId, draft: BookDraft) -> Self {
        Self { id: Some(id), draft: Some(draft) }
    }

    pub fn delete(id: RecordId) -> Self {
        Self { id: Some(id), draft: None }
    }

    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = Some(id);
        self
    }
}

/// A mutation that has not been confirmed by the server yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Queue bookkeeping id, unrelated to the record id
    #[serde(rename = "id")]
    pub queue_id: String,
    #[serde(rename = "action")]
    pub kind: ActionKind,
    #[serde(rename = "timestamp")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(rename = "data")]
    pub payload: ActionPayload,
    /// Number of sync passes that tried and failed to apply this action
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedAction {
    pub fn record_id(&self) -> Option<&RecordId> {
        self.payload.id.as_ref()
    }
}

/// Validate a mutation and turn it into a queue entry
///
/// Create gets a fresh local id when none is given. Update and Delete have
/// no target without an id and are rejected.
pub fn prepare(kind: ActionKind, payload: ActionPayload) -> Result<QueuedAction, QueueError> {
    let payload = match kind {
        ActionKind::Create => {
            if payload.draft.is_none() {
                return Err(QueueError::MissingDraft { kind });
            }
            match payload.id {
                Some(_) => payload,
                None => payload.with_id(RecordId::new_local()),
            }
        }
        ActionKind::Update => {
            if payload.id.is_none() {
                return Err(QueueError::MissingIdentifier { kind });
            }
            if payload.draft.is_none() {
                return Err(QueueError::MissingDraft { kind });
            }
            payload
        }
        ActionKind::Delete => {
            if payload.id.is_none() {
                return Err(QueueError::MissingIdentifier { kind });
            }
            payload
        }
    };

    let enqueued_at = Utc::now();
    Ok(QueuedAction {
        queue_id: format!("{}-{}", enqueued_at.to_rfc3339(), random_token(9)),
        kind,
        enqueued_at,
        payload,
        attempts: 0,
        last_error: None,
    })
}

/// The pending action queue
///
/// Kept in memory and written through to the store on every change. Order
/// of insertion is the replay order. Every change is built on a copy and
/// only becomes visible once the store accepted it, so a failed write
/// leaves memory and disk agreeing on the previous queue.
pub struct ActionQueue {
    store: PersistentStore,
    items: Mutex<Vec<QueuedAction>>,
}

/// What a finished sync pass does to the queue
#[derive(Debug, Clone, Copy)]
pub struct QueueOutcome<'a> {
    /// Queue ids of actions the server accepted
    pub resolved: &'a HashSet<String>,
    /// Queue id to the reason the action failed
    pub failures: &'a HashMap<String, String>,
    /// Local ids promoted during the pass, with their server ids
    pub rewrites: &'a HashMap<RecordId, RecordId>,
}

impl ActionQueue {
    /// Load the queue from the store, an absent document is an empty queue
    pub async fn open(store: PersistentStore) -> Result<Self> {
        let items: Vec<QueuedAction> = store.get_list(ACTION_QUEUE_KEY).await?;
        if !items.is_empty() {
            tracing::info!("Restored {} pending actions", items.len());
        }
        Ok(Self {
            store,
            items: Mutex::new(items),
        })
    }

    async fn commit(&self, items: &mut Vec<QueuedAction>, next: Vec<QueuedAction>) -> Result<()> {
        self.store.set(ACTION_QUEUE_KEY, &next).await?;
        *items = next;
        Ok(())
    }

    /// Validate and append an action
    ///
    /// The outer `Result` is a storage failure, the inner one a rejected action.
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        payload: ActionPayload,
    ) -> Result<Result<QueuedAction, QueueError>> {
        let action = match prepare(kind, payload) {
            Ok(action) => action,
            Err(e) => {
                tracing::warn!("Rejected {} action: {}", kind, e);
                return Ok(Err(e));
            }
        };

        let mut items = self.items.lock().await;
        let mut next = items.clone();
        next.push(action.clone());
        self.commit(&mut items, next).await?;

        tracing::debug!(
            "Queued {} for {} ({} pending)",
            action.kind,
            action.record_id().map(RecordId::as_str).unwrap_or("(new)"),
            items.len()
        );
        Ok(Ok(action))
    }

    /// All pending actions in replay order
    pub async fn peek_all(&self) -> Vec<QueuedAction> {
        self.items.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Drop the actions with the given queue ids
    pub async fn remove(&self, queue_ids: &HashSet<String>) -> Result<()> {
        self.reconcile(&QueueOutcome {
            resolved: queue_ids,
            failures: &HashMap::new(),
            rewrites: &HashMap::new(),
        })
        .await
    }

    /// Drop every action targeting a record, returning how many were dropped
    pub async fn prune_record(&self, id: &RecordId) -> Result<usize> {
        let mut items = self.items.lock().await;
        let next: Vec<QueuedAction> = items
            .iter()
            .filter(|item| item.record_id() != Some(id))
            .cloned()
            .collect();
        let pruned = items.len() - next.len();
        if pruned > 0 {
            self.commit(&mut items, next).await?;
        }
        Ok(pruned)
    }

    /// Apply the result of a sync pass in one write
    ///
    /// Resolved actions leave the queue, failed ones count an attempt, and
    /// the rest (including actions queued while the pass ran) are pointed at
    /// the server ids of promoted records. A Create whose local id got
    /// promoted was superseded by a later action in the same pass and is
    /// dropped rather than replayed with its older fields.
    pub async fn reconcile(&self, outcome: &QueueOutcome<'_>) -> Result<()> {
        let mut items = self.items.lock().await;
        let mut next = Vec::with_capacity(items.len());
        let mut changed = false;

        for item in items.iter() {
            if outcome.resolved.contains(&item.queue_id) {
                changed = true;
                continue;
            }
            let promoted = item.record_id().and_then(|id| outcome.rewrites.get(id));
            if item.kind == ActionKind::Create && promoted.is_some() {
                tracing::debug!("Dropping superseded create {}", item.queue_id);
                changed = true;
                continue;
            }

            let mut item = item.clone();
            if let Some(server_id) = promoted {
                item.payload.id = Some(server_id.clone());
                changed = true;
            }
            if let Some(reason) = outcome.failures.get(&item.queue_id) {
                item.attempts += 1;
                item.last_error = Some(reason.clone());
                changed = true;
            }
            next.push(item);
        }

        if changed {
            self.commit(&mut items, next).await?;
        }
        Ok(())
    }

    /// Actions that failed at least once, for inspection
    pub async fn failed(&self) -> Vec<QueuedAction> {
        self.items
            .lock()
            .await
            .iter()
            .filter(|item| item.attempts > 0)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;

    fn memory_store() -> (MemoryStorage, PersistentStore) {
        let storage = MemoryStorage::new();
        let store = PersistentStore::new(Arc::new(storage.clone()));
        (storage, store)
    }

    fn dune() -> BookDraft {
        BookDraft::new("Dune", "Frank Herbert", 15.99)
    }

    #[test]
    fn test_create_synthesizes_local_id() {
        let action = prepare(ActionKind::Create, ActionPayload::create(dune())).unwrap();
        assert!(action.record_id().unwrap().is_local());
        assert_eq!(action.attempts, 0);
    }

    #[test]
    fn test_create_keeps_given_id() {
        let id = RecordId::new_local();
        let action =
            prepare(ActionKind::Create, ActionPayload::create(dune()).with_id(id.clone())).unwrap();
        assert_eq!(action.record_id(), Some(&id));
    }

    #[rstest]
    #[case(ActionKind::Update, ActionPayload { id: None, draft: Some(dune()) })]
    #[case(ActionKind::Delete, ActionPayload::default())]
    fn test_missing_identifier_rejected(#[case] kind: ActionKind, #[case] payload: ActionPayload) {
        assert_eq!(prepare(kind, payload), Err(QueueError::MissingIdentifier { kind }));
    }

    #[rstest]
    #[case(ActionKind::Create, ActionPayload::default())]
    #[case(ActionKind::Update, ActionPayload::delete(RecordId::server("1")))]
    fn test_missing_draft_rejected(#[case] kind: ActionKind, #[case] payload: ActionPayload) {
        assert_eq!(prepare(kind, payload), Err(QueueError::MissingDraft { kind }));
    }

    #[test]
    fn test_persisted_shape() {
        let action = prepare(
            ActionKind::Update,
            ActionPayload::update(RecordId::server("srv-1"), dune()),
        )
        .unwrap();
        let value = serde_json::to_value(&action).unwrap();

        assert_eq!(value["action"], "update");
        assert_eq!(value["data"]["id"], "srv-1");
        assert_eq!(value["data"]["title"], "Dune");
        assert!(value["id"].as_str().unwrap().contains('-'));
    }

    #[test]
    fn test_decodes_legacy_add_entries() {
        let action: QueuedAction = serde_json::from_value(json!({
            "id": "2024-01-01T00:00:00Z-abc",
            "action": "add",
            "timestamp": "2024-01-01T00:00:00Z",
            "data": {"id": "local_1_aaaaaaaaa", "title": "Dune", "price": 15.99}
        }))
        .unwrap();

        assert_eq!(action.kind, ActionKind::Create);
        assert!(action.record_id().unwrap().is_local());
        assert_eq!(action.attempts, 0);
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order_and_persists() {
        let (storage, store) = memory_store();
        let queue = ActionQueue::open(store.clone()).await.unwrap();

        let created = queue
            .enqueue(ActionKind::Create, ActionPayload::create(dune()))
            .await
            .unwrap()
            .unwrap();
        let local = created.record_id().unwrap().clone();
        queue
            .enqueue(ActionKind::Update, ActionPayload::update(local.clone(), dune()))
            .await
            .unwrap()
            .unwrap();
        queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(local))
            .await
            .unwrap()
            .unwrap();

        let kinds: Vec<ActionKind> = queue.peek_all().await.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Create, ActionKind::Update, ActionKind::Delete]);

        let persisted = storage.get(ACTION_QUEUE_KEY).await.unwrap().unwrap();
        assert_eq!(persisted.as_array().unwrap().len(), 3);

        // Reopening restores the same queue
        let reopened = ActionQueue::open(store).await.unwrap();
        assert_eq!(reopened.peek_all().await, queue.peek_all().await);
    }

    #[tokio::test]
    async fn test_rejected_enqueue_never_enters_queue() {
        let (_, store) = memory_store();
        let queue = ActionQueue::open(store).await.unwrap();

        let result = queue
            .enqueue(ActionKind::Delete, ActionPayload::default())
            .await
            .unwrap();

        assert!(result.is_err());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_by_queue_id() {
        let (_, store) = memory_store();
        let queue = ActionQueue::open(store).await.unwrap();
        let first = queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(RecordId::server("1")))
            .await
            .unwrap()
            .unwrap();
        let second = queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(RecordId::server("2")))
            .await
            .unwrap()
            .unwrap();

        queue.remove(&HashSet::from([first.queue_id])).await.unwrap();
        assert_eq!(queue.peek_all().await, vec![second]);
    }

    #[tokio::test]
    async fn test_prune_record() {
        let (_, store) = memory_store();
        let queue = ActionQueue::open(store).await.unwrap();

        let created = queue
            .enqueue(ActionKind::Create, ActionPayload::create(dune()))
            .await
            .unwrap()
            .unwrap();
        let local = created.record_id().unwrap().clone();
        queue
            .enqueue(ActionKind::Update, ActionPayload::update(local.clone(), dune()))
            .await
            .unwrap()
            .unwrap();
        queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(RecordId::server("srv-7")))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(queue.prune_record(&local).await.unwrap(), 2);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.prune_record(&local).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_applies_pass_result() {
        let (storage, store) = memory_store();
        let queue = ActionQueue::open(store).await.unwrap();

        let accepted = queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(RecordId::server("srv-1")))
            .await
            .unwrap()
            .unwrap();
        let refused = queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(RecordId::server("srv-7")))
            .await
            .unwrap()
            .unwrap();
        let local = RecordId::new_local();
        let queued_later = queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(local.clone()))
            .await
            .unwrap()
            .unwrap();

        let resolved = HashSet::from([accepted.queue_id]);
        let failures = HashMap::from([(refused.queue_id.clone(), "timeout".to_string())]);
        let rewrites = HashMap::from([(local, RecordId::server("srv-42"))]);
        queue
            .reconcile(&QueueOutcome {
                resolved: &resolved,
                failures: &failures,
                rewrites: &rewrites,
            })
            .await
            .unwrap();

        let items = queue.peek_all().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].queue_id, refused.queue_id);
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[0].last_error.as_deref(), Some("timeout"));
        assert_eq!(items[1].queue_id, queued_later.queue_id);
        assert_eq!(items[1].record_id(), Some(&RecordId::server("srv-42")));
        assert_eq!(queue.failed().await.len(), 1);

        let persisted = storage.get(ACTION_QUEUE_KEY).await.unwrap().unwrap();
        assert_eq!(persisted.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_drops_superseded_create() {
        let (_, store) = memory_store();
        let queue = ActionQueue::open(store).await.unwrap();

        let created = queue
            .enqueue(ActionKind::Create, ActionPayload::create(dune()))
            .await
            .unwrap()
            .unwrap();
        let local = created.record_id().unwrap().clone();

        let failures = HashMap::from([(created.queue_id, "unavailable".to_string())]);
        let rewrites = HashMap::from([(local, RecordId::server("srv-42"))]);
        queue
            .reconcile(&QueueOutcome {
                resolved: &HashSet::new(),
                failures: &failures,
                rewrites: &rewrites,
            })
            .await
            .unwrap();

        assert!(queue.is_empty().await);
    }

    /// Accepts reads, refuses every write
    struct ReadOnlyStorage(MemoryStorage);

    #[async_trait::async_trait]
    impl Storage for ReadOnlyStorage {
        async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
            self.0.get(key).await
        }
        async fn set(&self, _: &str, _: serde_json::Value) -> Result<()> {
            anyhow::bail!("disk full")
        }
        async fn remove(&self, _: &str) -> Result<()> {
            anyhow::bail!("disk full")
        }
        async fn keys(&self) -> Result<Vec<String>> {
            self.0.keys().await
        }
        fn name(&self) -> &'static str {
            "read-only"
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_queue_unchanged() {
        let (storage, store) = memory_store();
        let queue = ActionQueue::open(store).await.unwrap();
        let created = queue
            .enqueue(ActionKind::Create, ActionPayload::create(dune()))
            .await
            .unwrap()
            .unwrap();
        let before = queue.peek_all().await;

        let read_only = PersistentStore::new(Arc::new(ReadOnlyStorage(storage)));
        let queue = ActionQueue::open(read_only).await.unwrap();
        assert_eq!(queue.peek_all().await, before);

        let resolved = HashSet::from([created.queue_id.clone()]);
        let outcome = QueueOutcome {
            resolved: &resolved,
            failures: &HashMap::new(),
            rewrites: &HashMap::new(),
        };
        assert!(queue.reconcile(&outcome).await.is_err());
        assert!(queue
            .enqueue(ActionKind::Delete, ActionPayload::delete(RecordId::server("1")))
            .await
            .is_err());
        assert!(queue.prune_record(created.record_id().unwrap()).await.is_err());

        assert_eq!(queue.peek_all().await, before);
    }
}
