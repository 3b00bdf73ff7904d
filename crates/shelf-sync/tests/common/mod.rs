// Shared test doubles for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use shelf_sync::store::ACTION_QUEUE_KEY;
use shelf_sync::{
    Book, BookDraft, BookPage, ClientError, EngineConfig, ListQuery, MemoryStorage, OfflineEngine,
    RecordId, ResourceClient, Storage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Server operations, for call logs and scripted failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Create,
    Update,
    Delete,
    Stats,
}

/// One call that reached the fake server
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List { page: u32 },
    Create { title: String },
    Update { id: String, title: String },
    Delete { id: String },
    Stats,
}

#[derive(Default)]
struct ServerState {
    books: Vec<Book>,
    next_id: u64,
    calls: Vec<Call>,
    failures: HashMap<Op, VecDeque<ClientError>>,
}

/// In-memory stand-in for the books API
///
/// Ids are handed out as `srv-42`, `srv-43`, ... Mutations can be held at a
/// gate after the server applied them but before the response returns, and
/// listings at a second gate after the page was read.
pub struct FakeResourceClient {
    state: Mutex<ServerState>,
    reachable: AtomicBool,
    gate: watch::Sender<bool>,
    list_gate: watch::Sender<bool>,
    held: Notify,
}

impl FakeResourceClient {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        let (list_gate, _) = watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(ServerState {
                next_id: 42,
                ..Default::default()
            }),
            reachable: AtomicBool::new(true),
            gate,
            list_gate,
            held: Notify::new(),
        })
    }

    /// Put a record on the server as if another client created it
    pub fn seed(&self, id: &str, draft: BookDraft) -> Book {
        let book = draft.into_book(RecordId::server(id));
        self.server_upsert(book.clone());
        book
    }

    /// Change server state without going through the client
    pub fn server_upsert(&self, book: Book) {
        let mut state = self.state.lock().unwrap();
        match state.books.iter().position(|b| b.id == book.id) {
            Some(index) => state.books[index] = book,
            None => state.books.push(book),
        }
    }

    pub fn server_books(&self) -> Vec<Book> {
        self.state.lock().unwrap().books.clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// The next `op` call fails with `error`
    pub fn fail_next(&self, op: Op, error: ClientError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Mutating calls only
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(call, Call::Create { .. } | Call::Update { .. } | Call::Delete { .. })
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Hold every mutation at the gate until `open_gate`
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Hold every listing at the gate until `open_list_gate`
    pub fn close_list_gate(&self) {
        self.list_gate.send_replace(false);
    }

    pub fn open_list_gate(&self) {
        self.list_gate.send_replace(true);
    }

    /// Wait until a call is held at a closed gate
    pub async fn wait_until_held(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.held.notified())
            .await
            .expect("no call reached the gate");
    }

    async fn pass_gate(&self, gate: &watch::Sender<bool>) {
        if *gate.borrow() {
            return;
        }
        self.held.notify_one();
        let mut gate = gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    fn begin(&self, op: Op, call: Call) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn list_books(&self, query: &ListQuery) -> Result<BookPage, ClientError> {
        self.begin(Op::List, Call::List { page: query.page })?;
        let page = {
            let state = self.state.lock().unwrap();
            let limit = query.limit.max(1) as usize;
            let total_pages = state.books.len().div_ceil(limit).max(1) as u32;
            let books = state
                .books
                .iter()
                .skip((query.page.saturating_sub(1)) as usize * limit)
                .take(limit)
                .cloned()
                .collect();
            BookPage {
                books,
                current_page: query.page,
                total_pages,
            }
        };
        self.pass_gate(&self.list_gate).await;
        Ok(page)
    }

    async fn create_book(&self, draft: &BookDraft) -> Result<Book, ClientError> {
        self.begin(Op::Create, Call::Create { title: draft.title.clone() })?;
        let book = {
            let mut state = self.state.lock().unwrap();
            let id = format!("srv-{}", state.next_id);
            state.next_id += 1;
            let book = draft.clone().into_book(RecordId::server(id));
            state.books.push(book.clone());
            book
        };
        self.pass_gate(&self.gate).await;
        Ok(book)
    }

    async fn update_book(&self, server_id: &str, draft: &BookDraft) -> Result<Book, ClientError> {
        self.begin(
            Op::Update,
            Call::Update {
                id: server_id.to_string(),
                title: draft.title.clone(),
            },
        )?;
        let book = {
            let mut state = self.state.lock().unwrap();
            let Some(index) = state.books.iter().position(|b| b.id.as_str() == server_id) else {
                return Err(ClientError::Rejected {
                    status: 404,
                    message: "Book not found".to_string(),
                });
            };
            let book = draft.clone().into_book(RecordId::server(server_id));
            state.books[index] = book.clone();
            book
        };
        self.pass_gate(&self.gate).await;
        Ok(book)
    }

    async fn delete_book(&self, server_id: &str) -> Result<(), ClientError> {
        self.begin(Op::Delete, Call::Delete { id: server_id.to_string() })?;
        let existed = {
            let mut state = self.state.lock().unwrap();
            let before = state.books.len();
            state.books.retain(|b| b.id.as_str() != server_id);
            state.books.len() != before
        };
        self.pass_gate(&self.gate).await;
        if existed {
            Ok(())
        } else {
            Err(ClientError::Rejected {
                status: 404,
                message: "Book not found".to_string(),
            })
        }
    }

    async fn fetch_stats(&self) -> Result<Value, ClientError> {
        self.begin(Op::Stats, Call::Stats)?;
        let count = self.state.lock().unwrap().books.len();
        Ok(json!({ "totalBooks": count }))
    }

    async fn check_server(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Memory storage whose queue writes can be made to fail
#[derive(Clone, Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    refuse_queue_writes: Arc<AtomicBool>,
}

impl FlakyStorage {
    pub fn refuse_queue_writes(&self, refuse: bool) {
        self.refuse_queue_writes.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        if key == ACTION_QUEUE_KEY && self.refuse_queue_writes.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner.remove(key).await
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        self.inner.keys().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        sync_delay: Duration::ZERO,
        stats_debounce: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Engine over the fake client and in-memory storage, probed reachable
pub async fn online_engine(client: Arc<FakeResourceClient>, storage: MemoryStorage) -> OfflineEngine {
    let engine = OfflineEngine::new(test_config(), client, Arc::new(storage))
        .await
        .unwrap();
    engine.set_online(true).await;
    engine
}

pub fn draft(title: &str, price: f64) -> BookDraft {
    BookDraft::new(title, "Author", price)
}

pub fn titles(books: &[Book]) -> Vec<String> {
    books.iter().map(|b| b.title().to_string()).collect()
}

pub fn ids(books: &[Book]) -> Vec<String> {
    books.iter().map(|b| b.id.as_str().to_string()).collect()
}

/// Poll until `check` holds or a second passes
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelf_sync=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
