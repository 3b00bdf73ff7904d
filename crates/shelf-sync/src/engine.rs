// File: shelf-sync/src/engine.rs
// Purpose: Offline engine orchestration

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::book::{Book, BookDraft};
use crate::cache::LocalCache;
use crate::catalog::{self, CatalogChange};
use crate::client::{BookFilter, HttpResourceClient, ListQuery, ResourceClient, SortOrder};
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::error::{EngineError, EngineResult};
use crate::identifier::RecordId;
use crate::push::{PushConnector, PushListener, WebSocketConnector};
use crate::queue::{ActionKind, ActionPayload, ActionQueue, QueueOutcome, QueuedAction};
use crate::realtime::{Debouncer, PushEvent};
use crate::storage::Storage;
use crate::store::PersistentStore;
use crate::sync::{self, DrainResult, PassOutcome, SyncCoordinator, SyncPhase};

/// Shown instead of a server listing while offline
pub const OFFLINE_NOTICE: &str = "App is offline. Displaying cached data.";

/// User-facing sync indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Offline,
    ServerUnreachable,
    Syncing,
    Pending { count: usize },
    Synced,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Offline => write!(f, "offline"),
            SyncStatus::ServerUnreachable => write!(f, "server unreachable"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Pending { count } => write!(f, "{} pending", count),
            SyncStatus::Synced => write!(f, "synced"),
        }
    }
}

/// What the user currently sees
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogView {
    pub books: Vec<Book>,
    /// Query of the current listing; `page` is the next page to request
    pub query: ListQuery,
    pub current_page: u32,
    pub total_pages: u32,
    pub offline_notice: Option<String>,
    /// Message of the last failed operation
    pub last_error: Option<String>,
}

impl CatalogView {
    fn new(query: ListQuery, books: Vec<Book>) -> Self {
        Self {
            books,
            query,
            current_page: 0,
            total_pages: 1,
            offline_notice: None,
            last_error: None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.current_page < self.total_pages
    }
}

/// View and cache, always changed together
struct Shared {
    view: CatalogView,
    cache: LocalCache,
}

impl Shared {
    async fn apply(&mut self, change: &CatalogChange) -> anyhow::Result<()> {
        change.apply(&mut self.view.books);
        self.cache.apply(change).await?;
        Ok(())
    }
}

/// Handles of the engine's background tasks
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// The offline-first engine
///
/// Owns connectivity, cache, queue and sync coordinator. Every user mutation
/// is applied optimistically to the view and the cache; it goes to the
/// server directly when the server is reachable and through the queue
/// otherwise.
pub struct OfflineEngine {
    config: EngineConfig,
    client: Arc<dyn ResourceClient>,
    store: PersistentStore,
    shared: Mutex<Shared>,
    queue: ActionQueue,
    connectivity: Arc<ConnectivityMonitor>,
    coordinator: SyncCoordinator,
    stats: Arc<RwLock<Option<Value>>>,
    stats_debouncer: Debouncer,
}

impl OfflineEngine {
    /// Create an engine over the given client and storage
    pub async fn new(
        config: EngineConfig,
        client: Arc<dyn ResourceClient>,
        storage: Arc<dyn Storage>,
    ) -> EngineResult<Self> {
        Self::with_store(config, client, PersistentStore::new(storage)).await
    }

    /// Create an engine talking HTTP to the configured server
    pub async fn from_config(config: EngineConfig) -> EngineResult<Self> {
        let client = Arc::new(HttpResourceClient::from_config(&config)?);
        let store = PersistentStore::from_backend(&config.storage).await?;
        Self::with_store(config, client, store).await
    }

    async fn with_store(
        config: EngineConfig,
        client: Arc<dyn ResourceClient>,
        store: PersistentStore,
    ) -> EngineResult<Self> {
        store.initialize().await?;
        let cache = LocalCache::load(store.clone()).await?;
        let queue = ActionQueue::open(store.clone()).await?;

        let query = ListQuery {
            page: 1,
            limit: config.page_size,
            sort_by: config.default_sort_by.clone(),
            order: config.default_order,
            filter: BookFilter::default(),
        };
        let view = CatalogView::new(query, cache.snapshot().to_vec());

        tracing::info!(
            "Offline engine ready ({} storage, {} cached books, {} pending actions)",
            store.backend_name(),
            cache.len(),
            queue.len().await
        );

        Ok(Self {
            connectivity: Arc::new(ConnectivityMonitor::new(client.clone(), config.probe_timeout)),
            stats_debouncer: Debouncer::new(config.stats_debounce),
            config,
            client,
            store,
            shared: Mutex::new(Shared { view, cache }),
            queue,
            coordinator: SyncCoordinator::new(),
            stats: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn storage_name(&self) -> &'static str {
        self.store.backend_name()
    }

    fn can_reach_server(&self) -> bool {
        self.connectivity.state().can_reach_server()
    }

    /// Apply the platform online signal (probes when coming back online)
    pub async fn set_online(&self, online: bool) -> ConnectivityState {
        self.connectivity.set_online(online).await
    }

    // --- Reads ---

    pub async fn view(&self) -> CatalogView {
        self.shared.lock().await.view.clone()
    }

    pub async fn books(&self) -> Vec<Book> {
        self.shared.lock().await.view.books.clone()
    }

    pub async fn cached_books(&self) -> Vec<Book> {
        self.shared.lock().await.cache.snapshot().to_vec()
    }

    pub async fn pending_actions(&self) -> Vec<QueuedAction> {
        self.queue.peek_all().await
    }

    /// Queued actions the server refused or that could not be delivered
    pub async fn failed_actions(&self) -> Vec<QueuedAction> {
        self.queue.failed().await
    }

    pub async fn latest_stats(&self) -> Option<Value> {
        self.stats.read().await.clone()
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.coordinator.phase()
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.connectivity.state();
        if !state.online {
            return SyncStatus::Offline;
        }
        if !state.server_reachable {
            return SyncStatus::ServerUnreachable;
        }
        if self.coordinator.is_running() {
            return SyncStatus::Syncing;
        }
        match self.queue.len().await {
            0 => SyncStatus::Synced,
            count => SyncStatus::Pending { count },
        }
    }

    // --- Listing ---

    /// Load a page of the current listing
    ///
    /// Page 1 replaces the view and the cache, later pages append records not
    /// seen yet. Offline, the cache is served instead.
    pub async fn fetch_books(&self, page: u32) -> EngineResult<CatalogView> {
        self.load_page(page, None, None).await
    }

    /// Load the page after the last one fetched
    pub async fn fetch_next_page(&self) -> EngineResult<CatalogView> {
        let next = self.shared.lock().await.view.current_page + 1;
        self.load_page(next, None, None).await
    }

    pub async fn sort_books(&self, sort_by: &str, order: SortOrder) -> EngineResult<CatalogView> {
        let mut query = self.shared.lock().await.view.query.clone();
        query.sort_by = sort_by.to_string();
        query.order = order;
        self.load_page(1, Some(query), None).await
    }

    pub async fn filter_books(&self, filter: BookFilter) -> EngineResult<CatalogView> {
        let mut query = self.shared.lock().await.view.query.clone();
        query.filter = filter;
        self.load_page(1, Some(query), None).await
    }

    /// `resolved` is set for the refetch that ends a sync pass: local ids
    /// settled by that pass are not merged back in as placeholders.
    async fn load_page(
        &self,
        page: u32,
        new_query: Option<ListQuery>,
        resolved: Option<&HashSet<RecordId>>,
    ) -> EngineResult<CatalogView> {
        let page = page.max(1);
        let query = {
            let mut shared = self.shared.lock().await;
            if let Some(query) = new_query {
                shared.view = CatalogView::new(query, Vec::new());
            }
            ListQuery {
                page,
                ..shared.view.query.clone()
            }
        };

        if !self.can_reach_server() {
            tracing::debug!("Serving listing from cache while offline");
            let mut shared = self.shared.lock().await;
            let books: Vec<Book> = shared
                .cache
                .snapshot()
                .iter()
                .filter(|book| query.filter.matches(book))
                .cloned()
                .collect();
            let view = &mut shared.view;
            view.books = books;
            view.current_page = 1;
            view.total_pages = 1;
            view.offline_notice = Some(OFFLINE_NOTICE.to_string());
            return Ok(view.clone());
        }

        let result = self.client.list_books(&query).await;
        let pending_deletes = self.pending_deletes().await;
        let mut shared = self.shared.lock().await;

        match result {
            Ok(listing) => {
                let mut books: Vec<Book> = listing
                    .books
                    .into_iter()
                    .filter(|book| !pending_deletes.contains(&book.id))
                    .collect();

                // The listing after a pass was requested before pushes that
                // landed while it was in flight, the cache holds their values
                if resolved.is_some() {
                    let pushed = self.coordinator.take_touched();
                    if !pushed.is_empty() {
                        books = books
                            .into_iter()
                            .filter_map(|book| {
                                if pushed.contains(&book.id) {
                                    shared.cache.get(&book.id).cloned()
                                } else {
                                    Some(book)
                                }
                            })
                            .collect();
                    }
                }

                if page == 1 {
                    let no_resolved = HashSet::new();
                    let placeholders = catalog::pending_placeholders(
                        shared.cache.snapshot(),
                        resolved.unwrap_or(&no_resolved),
                    );
                    catalog::append_unique(&mut books, &placeholders);
                    shared.apply(&CatalogChange::ReplaceAll(books)).await?;
                } else {
                    shared.apply(&CatalogChange::AppendUnique(books)).await?;
                }

                let view = &mut shared.view;
                view.current_page = listing.current_page;
                view.total_pages = listing.total_pages;
                view.offline_notice = None;
                view.last_error = None;
                tracing::debug!("Loaded page {} of {}", view.current_page, view.total_pages);
                Ok(view.clone())
            }
            Err(e) => {
                tracing::error!("Failed to fetch books: {}", e);
                shared.view.last_error = Some(e.to_string());
                if page > 1 {
                    return Err(e.into());
                }
                let cached = shared.cache.snapshot().to_vec();
                let view = &mut shared.view;
                view.books = cached;
                view.current_page = 1;
                Ok(view.clone())
            }
        }
    }

    async fn pending_deletes(&self) -> HashSet<RecordId> {
        self.queue
            .peek_all()
            .await
            .into_iter()
            .filter(|action| action.kind == ActionKind::Delete)
            .filter_map(|action| action.payload.id)
            .collect()
    }

    // --- Mutations ---

    /// Add a record
    ///
    /// Returns the server record, or a placeholder with a local id when the
    /// create was queued.
    pub async fn add_book(&self, draft: BookDraft) -> EngineResult<Book> {
        let draft = draft.normalized();

        if self.can_reach_server() {
            match self.client.create_book(&draft).await {
                Ok(book) => {
                    self.shared
                        .lock()
                        .await
                        .apply(&CatalogChange::Upsert(book.clone()))
                        .await?;
                    self.schedule_stats_refresh();
                    return Ok(book);
                }
                Err(e) => self.note_failure("add book", &e).await,
            }
        }

        let local = RecordId::new_local();
        let placeholder = draft.clone().into_book(local.clone());

        let mut shared = self.shared.lock().await;
        catalog::insert_if_absent(&mut shared.view.books, placeholder.clone());
        shared.cache.upsert(placeholder.clone()).await?;
        shared.cache.track_local(local.clone()).await?;
        self.queue
            .enqueue(ActionKind::Create, ActionPayload::create(draft).with_id(local))
            .await??;

        tracing::info!("Queued new book {}", placeholder.id);
        Ok(placeholder)
    }

    /// Update a record
    ///
    /// Returns the server record, or the optimistic record when the update
    /// was queued.
    pub async fn update_book(&self, id: &RecordId, draft: BookDraft) -> EngineResult<Book> {
        let draft = draft.normalized();
        let optimistic = draft.clone().into_book(id.clone());

        {
            let mut shared = self.shared.lock().await;
            if id.is_local() && !shared.cache.local_ids().contains(id) {
                return Err(EngineError::UnknownRecord(id.clone()));
            }
            shared.apply(&CatalogChange::Replace(optimistic.clone())).await?;

            if id.is_local() || !self.can_reach_server() {
                self.queue
                    .enqueue(ActionKind::Update, ActionPayload::update(id.clone(), draft))
                    .await??;
                tracing::info!("Queued update of {}", id);
                return Ok(optimistic);
            }
        }

        match self.client.update_book(id.as_str(), &draft).await {
            Ok(book) => {
                self.shared
                    .lock()
                    .await
                    .apply(&CatalogChange::Replace(book.clone()))
                    .await?;
                self.schedule_stats_refresh();
                Ok(book)
            }
            Err(e) => {
                self.note_failure("update book", &e).await;
                let _shared = self.shared.lock().await;
                self.queue
                    .enqueue(ActionKind::Update, ActionPayload::update(id.clone(), draft))
                    .await??;
                Ok(optimistic)
            }
        }
    }

    /// Delete a record
    ///
    /// A record that never reached the server is dropped together with its
    /// queued actions. While a pass is running its create may be on the way,
    /// and after a failed pass it may already exist on the server, so in both
    /// cases a delete is queued instead and remapped by the pass.
    pub async fn delete_book(&self, id: &RecordId) -> EngineResult<()> {
        {
            let mut shared = self.shared.lock().await;
            shared.apply(&CatalogChange::Remove(id.clone())).await?;

            if id.is_local() {
                if !shared.cache.local_ids().contains(id) {
                    return Ok(());
                }
                let unsettled = self.coordinator.unsettled_server_id(id);
                if let Some(server_id) = &unsettled {
                    shared.apply(&CatalogChange::Remove(server_id.clone())).await?;
                }
                if self.coordinator.is_running() || unsettled.is_some() {
                    self.queue
                        .enqueue(ActionKind::Delete, ActionPayload::delete(id.clone()))
                        .await??;
                    tracing::info!("Queued delete of {} for the sync pass", id);
                } else {
                    let pruned = self.queue.prune_record(id).await?;
                    shared.cache.untrack_local(&HashSet::from([id.clone()])).await?;
                    tracing::info!("Dropped unsynced book {} ({} queued actions)", id, pruned);
                }
                return Ok(());
            }

            if !self.can_reach_server() {
                self.queue
                    .enqueue(ActionKind::Delete, ActionPayload::delete(id.clone()))
                    .await??;
                tracing::info!("Queued delete of {}", id);
                return Ok(());
            }
        }

        match self.client.delete_book(id.as_str()).await {
            Ok(()) => {
                self.schedule_stats_refresh();
                Ok(())
            }
            Err(e) => {
                self.note_failure("delete book", &e).await;
                let _shared = self.shared.lock().await;
                self.queue
                    .enqueue(ActionKind::Delete, ActionPayload::delete(id.clone()))
                    .await??;
                Ok(())
            }
        }
    }

    async fn note_failure(&self, operation: &str, error: &crate::error::ClientError) {
        tracing::warn!("Failed to {} online, queueing: {}", operation, error);
        self.shared.lock().await.view.last_error = Some(error.to_string());
        if error.is_transient() {
            self.connectivity.mark_unreachable();
        }
    }

    // --- Sync ---

    /// Run one sync pass if possible
    pub async fn sync_now(&self) -> EngineResult<PassOutcome> {
        if !self.can_reach_server() {
            return Ok(PassOutcome::Unavailable);
        }
        let Some(guard) = self.coordinator.try_begin() else {
            tracing::debug!("Sync already in progress, ignoring trigger");
            return Ok(PassOutcome::AlreadyRunning);
        };

        let items = self.queue.peek_all().await;
        if items.is_empty() {
            return Ok(PassOutcome::NothingToSync);
        }

        tracing::info!("Syncing {} pending actions", items.len());
        guard.enter(SyncPhase::Draining);
        let result = sync::drain(self.client.as_ref(), &items, guard.take_unsettled()).await;

        guard.enter(SyncPhase::Reconciling);
        let resolved_locals = result.resolved_locals();
        {
            let mut shared = self.shared.lock().await;
            let touched = guard.take_touched();
            if let Err(e) = self.settle(&mut shared, &result, &touched).await {
                tracing::error!("Failed to reconcile sync results: {}", e);
                guard.keep_unsettled(result.mapping);
                return Err(e.into());
            }
            shared.cache.untrack_local(&resolved_locals).await?;
        }

        let report = result.report();
        tracing::info!(
            "Sync finished: {} processed, {} failed, {} ids promoted",
            report.processed,
            report.failed,
            report.id_mapping.len()
        );

        if let Err(e) = self.load_page(1, None, Some(&resolved_locals)).await {
            tracing::warn!("Refetch after sync failed: {}", e);
        }
        drop(guard);

        self.schedule_stats_refresh();
        Ok(PassOutcome::Completed(report))
    }

    /// Bring cache, view and queue in line with a drain
    ///
    /// Runs under the shared lock so no mutation can interleave, and the
    /// queue goes last: until it is written the next pass replays the same
    /// actions against the promotions this one made.
    async fn settle(
        &self,
        shared: &mut Shared,
        result: &DrainResult,
        touched: &HashSet<RecordId>,
    ) -> anyhow::Result<()> {
        for change in sync::plan_reconciliation(result, touched) {
            shared.apply(&change).await?;
        }
        let rewrites = result.mapping.rewrites();
        self.queue
            .reconcile(&QueueOutcome {
                resolved: &result.resolved,
                failures: &result.failures,
                rewrites: &rewrites,
            })
            .await
    }

    // --- Realtime ---

    /// Merge a push notification into view and cache
    pub async fn handle_push_event(&self, event: PushEvent) -> EngineResult<()> {
        let (view_change, cache_change) = event.changes();
        {
            let mut shared = self.shared.lock().await;
            view_change.apply(&mut shared.view.books);
            shared.cache.apply(&cache_change).await?;
            self.coordinator.mark_touched(event.record_id());
        }
        tracing::debug!("Applied push event for {}", event.record_id());
        self.schedule_stats_refresh();
        Ok(())
    }

    // --- Aggregates ---

    /// Fetch the aggregate document now
    pub async fn refresh_stats(&self) -> EngineResult<Option<Value>> {
        refresh_stats(self.client.as_ref(), &self.connectivity, &self.stats).await?;
        Ok(self.latest_stats().await)
    }

    fn schedule_stats_refresh(&self) {
        let client = self.client.clone();
        let connectivity = self.connectivity.clone();
        let stats = self.stats.clone();
        self.stats_debouncer.trigger(move || async move {
            if let Err(e) = refresh_stats(client.as_ref(), &connectivity, &stats).await {
                tracing::warn!("Failed to refresh stats: {}", e);
            }
        });
    }

    // --- Background tasks ---

    /// Start probing, auto-sync and the push listener
    pub fn start(self: &Arc<Self>) -> BackgroundTasks {
        let connector = Arc::new(WebSocketConnector::new(self.config.ws_url.clone()));
        self.start_with(connector)
    }

    pub fn start_with(self: &Arc<Self>, connector: Arc<dyn PushConnector>) -> BackgroundTasks {
        BackgroundTasks {
            handles: vec![
                self.spawn_auto_sync(),
                self.spawn_probe(),
                self.spawn_push_listener(connector),
            ],
        }
    }

    pub fn spawn_probe(self: &Arc<Self>) -> JoinHandle<()> {
        let connectivity = self.connectivity.clone();
        let interval = self.config.probe_interval;
        tokio::spawn(async move { connectivity.run(interval).await })
    }

    pub fn spawn_push_listener(self: &Arc<Self>, connector: Arc<dyn PushConnector>) -> JoinHandle<()> {
        let listener = PushListener::new(connector, self.config.reconnect);
        let engine = self.clone();
        tokio::spawn(async move {
            listener
                .run(|event| {
                    let engine = engine.clone();
                    async move {
                        if let Err(e) = engine.handle_push_event(event).await {
                            tracing::error!("Failed to apply push event: {}", e);
                        }
                    }
                })
                .await
        })
    }

    /// Sync on every reachability rise, and periodically while work is queued
    ///
    /// A rise syncs after `sync_delay` regardless of backoff. Periodic passes
    /// wait `retry.base`, stretched by the backoff while passes keep leaving
    /// failed actions behind.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.auto_sync_loop().await })
    }

    async fn auto_sync_loop(&self) {
        let mut connectivity = self.connectivity.subscribe();
        let mut reachable = connectivity.borrow_and_update().can_reach_server();
        let mut failing_passes: u32 = 0;
        // Already reachable at startup: drain whatever an earlier run left queued
        let mut next_attempt = if reachable {
            Instant::now()
        } else {
            Instant::now() + self.config.retry.base
        };

        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let now = connectivity.borrow_and_update().can_reach_server();
                    let rising = now && !reachable;
                    reachable = now;
                    if !rising {
                        continue;
                    }
                    tracing::info!("Server reachable again, syncing");
                    tokio::time::sleep(self.config.sync_delay).await;
                }
                _ = tokio::time::sleep_until(next_attempt) => {}
            }

            match self.sync_now().await {
                Ok(PassOutcome::Completed(report)) if report.failed > 0 => failing_passes += 1,
                Ok(PassOutcome::Completed(_)) | Ok(PassOutcome::NothingToSync) => failing_passes = 0,
                Ok(PassOutcome::AlreadyRunning) | Ok(PassOutcome::Unavailable) => {}
                Err(e) => {
                    tracing::error!("Sync pass failed: {}", e);
                    failing_passes += 1;
                }
            }

            let wait = match failing_passes {
                0 => self.config.retry.base,
                n => self.config.retry.backoff(n),
            };
            next_attempt = Instant::now() + wait;
        }
    }
}

async fn refresh_stats(
    client: &dyn ResourceClient,
    connectivity: &ConnectivityMonitor,
    stats: &RwLock<Option<Value>>,
) -> Result<(), crate::error::ClientError> {
    if !connectivity.state().can_reach_server() {
        tracing::debug!("Skipping stats refresh while offline");
        return Ok(());
    }
    let latest = client.fetch_stats().await?;
    *stats.write().await = Some(latest);
    Ok(())
}
