// File: shelf-sync/src/cache.rs
// Purpose: Persisted mirror of the last known-good record collection

use anyhow::Result;
use std::collections::HashSet;

use crate::book::Book;
use crate::catalog::CatalogChange;
use crate::identifier::RecordId;
use crate::store::{PersistentStore, BOOKS_CACHE_KEY, LOCAL_IDS_KEY};

/// Local cache of records plus the bookkeeping of never-synced ids
///
/// Every change is applied to the in-memory mirror and written through to the
/// store before the call returns. The engine keeps the cache behind the same
/// lock as its in-memory view so both move together.
pub struct LocalCache {
    store: PersistentStore,
    books: Vec<Book>,
    local_ids: Vec<RecordId>,
}

impl LocalCache {
    /// Load the cache, absent documents read as empty
    pub async fn load(store: PersistentStore) -> Result<Self> {
        let books: Vec<Book> = store.get_list(BOOKS_CACHE_KEY).await?;
        let local_ids: Vec<RecordId> = store.get_list(LOCAL_IDS_KEY).await?;
        tracing::debug!(
            "Loaded {} cached books ({} local) from {} storage",
            books.len(),
            local_ids.len(),
            store.backend_name()
        );
        Ok(Self {
            store,
            books,
            local_ids,
        })
    }

    pub fn snapshot(&self) -> &[Book] {
        &self.books
    }

    pub fn get(&self, id: &RecordId) -> Option<&Book> {
        self.books.iter().find(|book| &book.id == id)
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Apply a change and persist the result if anything moved
    pub async fn apply(&mut self, change: &CatalogChange) -> Result<bool> {
        let changed = change.apply(&mut self.books);
        if changed {
            self.store.set(BOOKS_CACHE_KEY, &self.books).await?;
        }
        Ok(changed)
    }

    pub async fn replace_all(&mut self, books: Vec<Book>) -> Result<()> {
        self.apply(&CatalogChange::ReplaceAll(books)).await.map(|_| ())
    }

    pub async fn upsert(&mut self, book: Book) -> Result<()> {
        self.apply(&CatalogChange::Upsert(book)).await.map(|_| ())
    }

    pub async fn replace_if_present(&mut self, book: Book) -> Result<bool> {
        self.apply(&CatalogChange::Replace(book)).await
    }

    pub async fn remove(&mut self, id: &RecordId) -> Result<bool> {
        self.apply(&CatalogChange::Remove(id.clone())).await
    }

    pub async fn append_unique(&mut self, books: Vec<Book>) -> Result<bool> {
        self.apply(&CatalogChange::AppendUnique(books)).await
    }

    pub async fn promote(&mut self, local: &RecordId, server: Book) -> Result<bool> {
        self.apply(&CatalogChange::Promote {
            local: local.clone(),
            server,
        })
        .await
    }

    /// Ids minted on this device that the server has not confirmed yet
    pub fn local_ids(&self) -> &[RecordId] {
        &self.local_ids
    }

    pub async fn track_local(&mut self, id: RecordId) -> Result<()> {
        if !id.is_local() || self.local_ids.contains(&id) {
            return Ok(());
        }
        self.local_ids.push(id);
        self.store.set(LOCAL_IDS_KEY, &self.local_ids).await
    }

    pub async fn untrack_local(&mut self, ids: &HashSet<RecordId>) -> Result<()> {
        let before = self.local_ids.len();
        self.local_ids.retain(|id| !ids.contains(id));
        if self.local_ids.len() != before {
            self.store.set(LOCAL_IDS_KEY, &self.local_ids).await?;
        }
        Ok(())
    }
}
