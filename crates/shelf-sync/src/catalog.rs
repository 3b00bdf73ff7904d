// File: shelf-sync/src/catalog.rs
// Purpose: Pure transformations over a record collection

use std::collections::HashSet;

use crate::book::Book;
use crate::identifier::RecordId;

/// A change to a record collection
///
/// The in-memory collection and the local cache always receive the same
/// change, so they hold the same record set afterwards. Every variant matches
/// records by identifier, never by position, which makes applying a change
/// twice harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogChange {
    /// Add the record unless one with the same id is already present
    InsertIfAbsent(Book),
    /// Replace the record with the same id, or append it
    Upsert(Book),
    /// Replace the record with the same id, ignore unknown ids
    Replace(Book),
    Remove(RecordId),
    /// A local placeholder has been confirmed by the server
    Promote { local: RecordId, server: Book },
    /// Wholesale replacement (first page of a fresh listing)
    ReplaceAll(Vec<Book>),
    /// Append records whose ids are not present yet (later pages)
    AppendUnique(Vec<Book>),
}

impl CatalogChange {
    /// Apply the change, returning whether the collection was modified
    pub fn apply(&self, books: &mut Vec<Book>) -> bool {
        match self {
            CatalogChange::InsertIfAbsent(book) => insert_if_absent(books, book.clone()),
            CatalogChange::Upsert(book) => {
                upsert(books, book.clone());
                true
            }
            CatalogChange::Replace(book) => replace_existing(books, book.clone()),
            CatalogChange::Remove(id) => remove(books, id),
            CatalogChange::Promote { local, server } => promote(books, local, server.clone()),
            CatalogChange::ReplaceAll(all) => {
                *books = all.clone();
                true
            }
            CatalogChange::AppendUnique(page) => append_unique(books, page) > 0,
        }
    }
}

pub fn position(books: &[Book], id: &RecordId) -> Option<usize> {
    books.iter().position(|book| &book.id == id)
}

pub fn insert_if_absent(books: &mut Vec<Book>, book: Book) -> bool {
    if position(books, &book.id).is_some() {
        return false;
    }
    books.push(book);
    true
}

pub fn upsert(books: &mut Vec<Book>, book: Book) {
    match position(books, &book.id) {
        Some(index) => books[index] = book,
        None => books.push(book),
    }
}

pub fn replace_existing(books: &mut Vec<Book>, book: Book) -> bool {
    match position(books, &book.id) {
        Some(index) => {
            books[index] = book;
            true
        }
        None => false,
    }
}

pub fn remove(books: &mut Vec<Book>, id: &RecordId) -> bool {
    let before = books.len();
    books.retain(|book| &book.id != id);
    books.len() != before
}

/// Swap a local placeholder for its server record
///
/// If the server record is already present (a push event got there first)
/// the placeholder is dropped instead, so the record never appears twice.
/// A promotion repeated after the placeholder is gone refreshes the server
/// record in place.
pub fn promote(books: &mut Vec<Book>, local: &RecordId, server: Book) -> bool {
    let Some(index) = position(books, local) else {
        let Some(existing) = position(books, &server.id) else {
            return false;
        };
        books[existing] = server;
        return true;
    };

    if position(books, &server.id).is_some() {
        books.remove(index);
    } else {
        books[index] = server;
    }
    true
}

/// Append the records whose ids are not present yet, returning how many were added
pub fn append_unique(books: &mut Vec<Book>, page: &[Book]) -> usize {
    let mut known: HashSet<RecordId> = books.iter().map(|book| book.id.clone()).collect();
    let mut added = 0;
    for book in page {
        if known.insert(book.id.clone()) {
            books.push(book.clone());
            added += 1;
        }
    }
    added
}

/// Local placeholders that should survive a fresh server listing
///
/// Records minted on this device are not in the server's answer yet. They
/// are kept unless they appear in `resolved` (promoted by the sync pass that
/// requested the listing).
pub fn pending_placeholders(books: &[Book], resolved: &HashSet<RecordId>) -> Vec<Book> {
    books
        .iter()
        .filter(|book| book.id.is_local() && !resolved.contains(&book.id))
        .cloned()
        .collect()
}
