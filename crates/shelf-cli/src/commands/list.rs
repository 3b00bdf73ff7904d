use anyhow::Result;
use colored::Colorize;
use shelf_sync::{Book, BookFilter, CatalogView, OfflineEngine, SortOrder};

pub async fn execute(
    engine: &OfflineEngine,
    page: u32,
    sort: Option<String>,
    order: Option<SortOrder>,
    filter: BookFilter,
) -> Result<()> {
    let view = if sort.is_some() || order.is_some() {
        let current = engine.view().await.query;
        let sort_by = sort.unwrap_or(current.sort_by);
        engine.sort_books(&sort_by, order.unwrap_or(current.order)).await?;
        engine.filter_books(filter).await?
    } else if !filter.is_empty() {
        engine.filter_books(filter).await?
    } else {
        engine.fetch_books(1).await?
    };

    let view = if page > 1 {
        let mut view = view;
        while view.current_page < page && view.has_more() {
            view = engine.fetch_next_page().await?;
        }
        view
    } else {
        view
    };

    print_view(&view);
    Ok(())
}

fn print_view(view: &CatalogView) {
    if let Some(notice) = &view.offline_notice {
        println!("{}", notice.yellow());
        println!();
    }
    if let Some(error) = &view.last_error {
        println!("{} {}", "Last request failed:".red(), error);
        println!();
    }

    if view.books.is_empty() {
        println!("{}", "No books found".dimmed());
        return;
    }

    print_books(&view.books);
    println!();
    println!(
        "Page {} of {} ({} shown)",
        view.current_page.max(1),
        view.total_pages.max(1),
        view.books.len()
    );
}

pub fn print_books(books: &[Book]) {
    for book in books {
        print_book(book);
    }
}

pub fn print_book(book: &Book) {
    let id = if book.id.is_local() {
        format!("{} (unsynced)", book.id).yellow()
    } else {
        book.id.to_string().cyan()
    };
    let fields = &book.fields;
    println!(
        "{}  {} by {}  {:.2}{}",
        id,
        fields.title.bold(),
        fields.author,
        fields.price,
        if fields.genre.is_empty() {
            String::new()
        } else {
            format!("  [{}]", fields.genre)
        }
    );
}
