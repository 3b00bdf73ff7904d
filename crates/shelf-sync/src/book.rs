// File: shelf-sync/src/book.rs
// Purpose: Catalog record types

use serde::{Deserialize, Deserializer, Serialize};

use crate::identifier::{deserialize_server_id, RecordId};

/// A catalog record as held by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: BookDraft,
}

impl Book {
    pub fn new(id: RecordId, fields: BookDraft) -> Self {
        Self { id, fields }
    }

    pub fn title(&self) -> &str {
        &self.fields.title
    }

    pub fn price(&self) -> f64 {
        self.fields.price
    }
}

/// Business fields of a record, without its identifier
///
/// This is what travels to the server on create and update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BookDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    /// Category of the book
    #[serde(default, alias = "category")]
    pub genre: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rating: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
}

impl BookDraft {
    pub fn new(title: impl Into<String>, author: impl Into<String>, price: f64) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            price,
            ..Default::default()
        }
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = genre.into();
        self
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = rating;
        self
    }

    /// Clean up user input before it is stored or sent
    ///
    /// Non-finite numbers collapse to zero and text fields are trimmed.
    pub fn normalized(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.author = self.author.trim().to_string();
        self.genre = self.genre.trim().to_string();
        if !self.price.is_finite() {
            self.price = 0.0;
        }
        if !self.rating.is_finite() {
            self.rating = 0.0;
        }
        self
    }

    pub fn into_book(self, id: RecordId) -> Book {
        Book::new(id, self)
    }
}

/// A record as the server sends it
///
/// Persisted documents recover the id kind from its prefix; anything decoded
/// from a server response or push message is a server record.
#[derive(Debug, Deserialize)]
pub struct ServerBook {
    #[serde(deserialize_with = "deserialize_server_id")]
    id: RecordId,
    #[serde(flatten)]
    fields: BookDraft,
}

impl From<ServerBook> for Book {
    fn from(wire: ServerBook) -> Self {
        Book::new(wire.id, wire.fields)
    }
}

/// `deserialize_with` helper for lists of server records
pub fn deserialize_server_books<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Book>, D::Error> {
    let books = Vec::<ServerBook>::deserialize(deserializer)?;
    Ok(books.into_iter().map(Book::from).collect())
}

/// Accept numbers, numeric strings and null
///
/// Decimal columns come back from the server as strings.
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Float(f64),
        Text(String),
        Null(()),
    }

    Ok(match Number::deserialize(deserializer)? {
        Number::Float(value) => value,
        Number::Text(text) => text.trim().parse().unwrap_or(0.0),
        Number::Null(()) => 0.0,
    })
}
