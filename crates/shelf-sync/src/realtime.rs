// File: shelf-sync/src/realtime.rs
// Purpose: Push notification decoding, merge rules and aggregate refresh debouncing

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::book::{Book, ServerBook};
use crate::catalog::CatalogChange;
use crate::identifier::{deserialize_server_id, RecordId};

/// Server push notification about a record
///
/// Decoded through [`PushEvent::decode`], which keeps every id a server id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    NewBook(Book),
    UpdateBook(Book),
    DeleteBook { id: RecordId },
}

/// Wire envelope, decoded before the type is known
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl PushEvent {
    /// Decode a push message
    ///
    /// `Ok(None)` means a well-formed message of a type this client does not
    /// handle (the server also pushes genre events).
    pub fn decode(text: &str) -> serde_json::Result<Option<Self>> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let event = match envelope.kind.as_str() {
            "new_book" => PushEvent::NewBook(serde_json::from_value::<ServerBook>(envelope.data)?.into()),
            "update_book" => {
                PushEvent::UpdateBook(serde_json::from_value::<ServerBook>(envelope.data)?.into())
            }
            "delete_book" => {
                #[derive(Deserialize)]
                struct Deleted {
                    #[serde(deserialize_with = "deserialize_server_id")]
                    id: RecordId,
                }
                let Deleted { id } = serde_json::from_value(envelope.data)?;
                PushEvent::DeleteBook { id }
            }
            other => {
                tracing::warn!("Ignoring unknown push message type: {}", other);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    pub fn record_id(&self) -> &RecordId {
        match self {
            PushEvent::NewBook(book) | PushEvent::UpdateBook(book) => &book.id,
            PushEvent::DeleteBook { id } => id,
        }
    }

    /// Change for the in-memory view and change for the cache
    ///
    /// The view only shows what it already listed (an update for a record on
    /// another page is not pulled in), while the cache keeps every record it
    /// hears about.
    pub fn changes(&self) -> (CatalogChange, CatalogChange) {
        match self {
            PushEvent::NewBook(book) => (
                CatalogChange::InsertIfAbsent(book.clone()),
                CatalogChange::Upsert(book.clone()),
            ),
            PushEvent::UpdateBook(book) => (
                CatalogChange::Replace(book.clone()),
                CatalogChange::Upsert(book.clone()),
            ),
            PushEvent::DeleteBook { id } => (
                CatalogChange::Remove(id.clone()),
                CatalogChange::Remove(id.clone()),
            ),
        }
    }
}

/// Collapses bursts of triggers into one delayed run
///
/// Each trigger restarts the window; only the action of the last trigger in
/// a burst runs.
#[derive(Clone)]
pub struct Debouncer {
    window: Duration,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn trigger<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let window = self.window;

        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if generation.load(Ordering::SeqCst) == ticket {
                action().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_decode_book_events() {
        let text = json!({
            "type": "new_book",
            "data": {"id": 42, "title": "Dune", "author": "Frank Herbert", "price": 15.99}
        })
        .to_string();

        let event = PushEvent::decode(&text).unwrap().unwrap();
        assert_eq!(event.record_id(), &RecordId::server("42"));
        assert!(matches!(event, PushEvent::NewBook(ref book) if book.title() == "Dune"));

        let deleted = PushEvent::decode(r#"{"type":"delete_book","data":{"id":"7"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(deleted, PushEvent::DeleteBook { id: RecordId::server("7") });
    }

    #[test]
    fn test_pushed_ids_are_server_ids() {
        let text = r#"{"type":"update_book","data":{"id":"local_9","title":"Dune"}}"#;
        let event = PushEvent::decode(text).unwrap().unwrap();
        assert_eq!(event.record_id(), &RecordId::server("local_9"));

        let deleted = PushEvent::decode(r#"{"type":"delete_book","data":{"id":"local_9"}}"#)
            .unwrap()
            .unwrap();
        assert!(!deleted.record_id().is_local());
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let decoded = PushEvent::decode(r#"{"type":"new_genre","data":{"id":1}}"#).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        assert!(PushEvent::decode("not json").is_err());
        assert!(PushEvent::decode(r#"{"type":"delete_book","data":{}}"#).is_err());
    }

    #[test]
    fn test_update_changes() {
        let book = crate::book::BookDraft::new("Dune", "Frank Herbert", 9.99)
            .into_book(RecordId::server("1"));
        let (view, cache) = PushEvent::UpdateBook(book.clone()).changes();

        assert_eq!(view, CatalogChange::Replace(book.clone()));
        assert_eq!(cache, CatalogChange::Upsert(book));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_runs_last_trigger_once() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let runs = runs.clone();
            debouncer.trigger(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
