use anyhow::Result;
use colored::Colorize;
use shelf_sync::{BookDraft, OfflineEngine, RecordId};

use super::list::print_book;

/// Fields given on the command line for an update
pub struct FieldChanges {
    pub title: Option<String>,
    pub author: Option<String>,
    pub price: Option<f64>,
    pub genre: Option<String>,
    pub rating: Option<f64>,
}

impl FieldChanges {
    fn apply_to(self, mut draft: BookDraft) -> BookDraft {
        if let Some(title) = self.title {
            draft.title = title;
        }
        if let Some(author) = self.author {
            draft.author = author;
        }
        if let Some(price) = self.price {
            draft.price = price;
        }
        if let Some(genre) = self.genre {
            draft.genre = genre;
        }
        if let Some(rating) = self.rating {
            draft.rating = rating;
        }
        draft
    }
}

pub async fn add(engine: &OfflineEngine, draft: BookDraft) -> Result<()> {
    let book = engine.add_book(draft).await?;
    if book.id.is_local() {
        println!("{}", "Saved locally, will sync when the server is reachable".yellow());
    } else {
        println!("{}", "Book added".green().bold());
    }
    print_book(&book);
    Ok(())
}

pub async fn update(engine: &OfflineEngine, id: &str, changes: FieldChanges) -> Result<()> {
    let id = RecordId::parse(id);
    let current = engine
        .cached_books()
        .await
        .into_iter()
        .find(|book| book.id == id)
        .map(|book| book.fields)
        .unwrap_or_default();

    let book = engine.update_book(&id, changes.apply_to(current)).await?;
    let queued = engine
        .pending_actions()
        .await
        .iter()
        .any(|action| action.record_id() == Some(&id));
    if queued {
        println!("{}", "Update queued".yellow());
    } else {
        println!("{}", "Book updated".green().bold());
    }
    print_book(&book);
    Ok(())
}

pub async fn delete(engine: &OfflineEngine, id: &str) -> Result<()> {
    let id = RecordId::parse(id);
    engine.delete_book(&id).await?;
    println!("{} {}", "Deleted".green().bold(), id);
    Ok(())
}
