// File: shelf-sync/src/sync.rs
// Purpose: Sync pass state machine, queue draining and reconciliation planning

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use crate::book::Book;
use crate::catalog::CatalogChange;
use crate::client::ResourceClient;
use crate::error::ClientError;
use crate::identifier::RecordId;
use crate::queue::{ActionKind, QueuedAction};

/// Phase of the sync coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    /// Replaying queued actions against the server
    Draining,
    /// Applying the results to queue, cache and view
    Reconciling,
}

/// Local ids confirmed by the server during one pass
///
/// Built while draining and dropped once its rewrites are applied. A pass
/// that fails before that hands the mapping to the next one. A local id maps
/// at most once; later actions on the same record refresh the mapped
/// representation but never the server id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdMapping {
    entries: HashMap<RecordId, Book>,
}

impl IdMapping {
    /// Record a promotion, returning false if the local id was already mapped
    pub fn insert(&mut self, local: RecordId, server: Book) -> bool {
        if self.entries.contains_key(&local) {
            return false;
        }
        self.entries.insert(local, server);
        true
    }

    pub fn server_id(&self, local: &RecordId) -> Option<&RecordId> {
        self.entries.get(local).map(|book| &book.id)
    }

    pub fn contains(&self, local: &RecordId) -> bool {
        self.entries.contains_key(local)
    }

    fn refresh(&mut self, local: &RecordId, server: Book) {
        if let Some(entry) = self.entries.get_mut(local) {
            if entry.id == server.id {
                *entry = server;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &Book)> {
        self.entries.iter()
    }

    pub fn locals(&self) -> HashSet<RecordId> {
        self.entries.keys().cloned().collect()
    }

    /// `local -> server id` pairs used to rewrite remaining references
    pub fn rewrites(&self) -> HashMap<RecordId, RecordId> {
        self.entries
            .iter()
            .map(|(local, book)| (local.clone(), book.id.clone()))
            .collect()
    }

    /// Plain token pairs for reporting
    pub fn tokens(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(local, book)| (local.as_str().to_string(), book.id.as_str().to_string()))
            .collect()
    }
}

/// Summary of a completed pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Actions accepted by the server (or resolved without a call)
    pub processed: usize,
    /// Actions that stay queued for the next pass
    pub failed: usize,
    /// Local token to server token
    pub id_mapping: HashMap<String, String>,
}

/// What a sync trigger led to
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed(SyncReport),
    /// Another pass holds the in-flight flag, this trigger was dropped
    AlreadyRunning,
    /// Offline or the server is unreachable
    Unavailable,
    NothingToSync,
}

/// Everything a drain learned from the server
#[derive(Debug, Default)]
pub struct DrainResult {
    /// Queue ids of actions that no longer need replaying
    pub resolved: HashSet<String>,
    /// Queue id to failure reason
    pub failures: HashMap<String, String>,
    pub mapping: IdMapping,
    /// Server representation of records updated by server id
    pub updated: Vec<Book>,
    /// Records that are gone, local or server ids
    pub deleted: Vec<RecordId>,
}

impl DrainResult {
    pub fn report(&self) -> SyncReport {
        SyncReport {
            processed: self.resolved.len(),
            failed: self.failures.len(),
            id_mapping: self.mapping.tokens(),
        }
    }

    /// Local ids settled by this pass, promoted or deleted before they synced
    pub fn resolved_locals(&self) -> HashSet<RecordId> {
        let mut locals = self.mapping.locals();
        locals.extend(self.deleted.iter().filter(|id| id.is_local()).cloned());
        locals
    }
}

/// Replay actions in order, isolating per-item failures
///
/// Makes one server call per action at most. A delete of a local record that
/// never reached the server resolves without a call. `known` carries
/// promotions from an earlier pass that never got reconciled, so their
/// records are not created twice.
pub async fn drain(
    client: &dyn ResourceClient,
    items: &[QueuedAction],
    known: IdMapping,
) -> DrainResult {
    let mut result = DrainResult {
        mapping: known,
        ..DrainResult::default()
    };

    for item in items {
        match replay(client, item, &mut result).await {
            Ok(()) => {
                tracing::debug!("Synced {} {}", item.kind, item.queue_id);
                result.resolved.insert(item.queue_id.clone());
            }
            Err(e) => {
                tracing::warn!(
                    "Keeping {} {} queued (attempt {}): {}",
                    item.kind,
                    item.queue_id,
                    item.attempts + 1,
                    e
                );
                result.failures.insert(item.queue_id.clone(), e.to_string());
            }
        }
    }

    settle_superseded(items, &mut result);
    result
}

/// Resolve failed actions that a later action of the pass made moot
///
/// A failed create whose record got created by a later update carries older
/// fields, and anything on a local record deleted later in the pass has
/// nothing left to do.
fn settle_superseded(items: &[QueuedAction], result: &mut DrainResult) {
    for item in items {
        let Some(local @ RecordId::Local(_)) = item.record_id() else {
            continue;
        };
        let superseded = (item.kind == ActionKind::Create && result.mapping.contains(local))
            || result.deleted.contains(local);
        if superseded && result.failures.remove(&item.queue_id).is_some() {
            tracing::debug!("{} {} superseded later in the pass", item.kind, item.queue_id);
            result.resolved.insert(item.queue_id.clone());
        }
    }
}

async fn replay(
    client: &dyn ResourceClient,
    item: &QueuedAction,
    result: &mut DrainResult,
) -> Result<(), ClientError> {
    let id = item.payload.id.as_ref();
    let draft = item.payload.draft.as_ref();

    match (item.kind, id) {
        (ActionKind::Create, _) | (ActionKind::Update, Some(RecordId::Local(_))) => {
            let draft = draft.ok_or_else(|| missing("book fields"))?;
            match id {
                Some(local @ RecordId::Local(_)) => match result.mapping.server_id(local).cloned() {
                    // Already created earlier in this pass
                    Some(server_id) => {
                        let book = client.update_book(server_id.as_str(), draft).await?;
                        result.mapping.refresh(local, book);
                    }
                    None => {
                        let book = client.create_book(draft).await?;
                        result.mapping.insert(local.clone(), book);
                    }
                },
                Some(RecordId::Server(_)) | None => {
                    let book = client.create_book(draft).await?;
                    result.updated.push(book);
                }
            }
        }
        (ActionKind::Update, Some(server_id @ RecordId::Server(_))) => {
            let draft = draft.ok_or_else(|| missing("book fields"))?;
            let book = client.update_book(server_id.as_str(), draft).await?;
            result.updated.push(book);
        }
        (ActionKind::Delete, Some(local @ RecordId::Local(_))) => {
            if let Some(server_id) = result.mapping.server_id(local).cloned() {
                delete_remote(client, &server_id).await?;
                result.deleted.push(server_id);
            }
            result.deleted.push(local.clone());
        }
        (ActionKind::Delete, Some(server_id @ RecordId::Server(_))) => {
            delete_remote(client, server_id).await?;
            result.deleted.push(server_id.clone());
        }
        (ActionKind::Update | ActionKind::Delete, None) => return Err(missing("record id")),
    }

    Ok(())
}

/// A record the server no longer knows is as deleted as it gets
async fn delete_remote(client: &dyn ResourceClient, id: &RecordId) -> Result<(), ClientError> {
    match client.delete_book(id.as_str()).await {
        Err(ClientError::Rejected { status: 404, .. }) => {
            tracing::debug!("Book {} already gone on the server", id);
            Ok(())
        }
        other => other,
    }
}

fn missing(what: &str) -> ClientError {
    ClientError::Rejected {
        status: 400,
        message: format!("queued action has no {}", what),
    }
}

/// Changes that bring a collection in line with a finished drain
///
/// Records in `touched` received a push event while the pass was running;
/// the pushed value is newer than anything the drain saw, so it is kept.
pub fn plan_reconciliation(result: &DrainResult, touched: &HashSet<RecordId>) -> Vec<CatalogChange> {
    let mut changes = Vec::new();

    for (local, server) in result.mapping.iter() {
        if touched.contains(&server.id) {
            changes.push(CatalogChange::Remove(local.clone()));
        } else {
            changes.push(CatalogChange::Promote {
                local: local.clone(),
                server: server.clone(),
            });
        }
    }

    changes.extend(
        result
            .updated
            .iter()
            .filter(|book| !touched.contains(&book.id))
            .cloned()
            .map(CatalogChange::Replace),
    );

    changes.extend(result.deleted.iter().cloned().map(CatalogChange::Remove));
    changes
}

/// Guards the single in-flight pass
///
/// A trigger that finds the flag taken is dropped, never queued behind the
/// running pass.
pub struct SyncCoordinator {
    in_flight: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    touched: Mutex<HashSet<RecordId>>,
    unsettled: Mutex<IdMapping>,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCoordinator {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            in_flight: AtomicBool::new(false),
            phase,
            touched: Mutex::new(HashSet::new()),
            unsettled: Mutex::new(IdMapping::default()),
        }
    }

    /// Take the in-flight flag, `None` if a pass is already running
    pub fn try_begin(&self) -> Option<PassGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(PassGuard { coordinator: self })
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Note that a push event changed a record while a pass is running
    pub fn mark_touched(&self, id: &RecordId) {
        if !self.is_running() {
            return;
        }
        if let Ok(mut touched) = self.touched.lock() {
            touched.insert(id.clone());
        }
    }

    /// Server id of a local record that a failed pass already created
    pub fn unsettled_server_id(&self, local: &RecordId) -> Option<RecordId> {
        self.unsettled
            .lock()
            .ok()
            .and_then(|mapping| mapping.server_id(local).cloned())
    }

    pub(crate) fn take_touched(&self) -> HashSet<RecordId> {
        self.touched
            .lock()
            .map(|mut touched| std::mem::take(&mut *touched))
            .unwrap_or_default()
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }
}

/// Holds the in-flight flag for the duration of a pass
///
/// Dropping the guard (including on an early error return) returns the
/// coordinator to idle.
pub struct PassGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl PassGuard<'_> {
    pub fn enter(&self, phase: SyncPhase) {
        tracing::debug!("Sync phase: {:?}", phase);
        self.coordinator.set_phase(phase);
    }

    /// Records pushed during the pass so far, clearing the marks
    pub fn take_touched(&self) -> HashSet<RecordId> {
        self.coordinator.take_touched()
    }

    /// Promotions left over by a pass that failed before reconciling
    pub fn take_unsettled(&self) -> IdMapping {
        self.coordinator
            .unsettled
            .lock()
            .map(|mut mapping| std::mem::take(&mut *mapping))
            .unwrap_or_default()
    }

    /// Hand promotions that were not reconciled to the next pass
    pub fn keep_unsettled(&self, mapping: IdMapping) {
        if mapping.is_empty() {
            return;
        }
        if let Ok(mut unsettled) = self.coordinator.unsettled.lock() {
            tracing::warn!("Keeping {} unreconciled promotions for the next sync", mapping.len());
            *unsettled = mapping;
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.take_touched();
        self.coordinator.set_phase(SyncPhase::Idle);
        self.coordinator.in_flight.store(false, Ordering::Release);
    }
}
