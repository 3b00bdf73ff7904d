// File: shelf-sync/src/client.rs
// Purpose: Boundary toward the books REST API

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use crate::book::{deserialize_server_books, Book, BookDraft, ServerBook};
use crate::error::ClientError;

/// Sort direction of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

impl FromStr for SortOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(anyhow::anyhow!("Unknown sort order: {}", other)),
        }
    }
}

/// Narrowing criteria for a listing, every field optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookFilter {
    pub search: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub author: Option<String>,
    pub genre: Option<String>,
    pub min_rating: Option<f64>,
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
}

impl BookFilter {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Whether a cached record passes the filter
    ///
    /// Used when listings are served from the cache while offline.
    pub fn matches(&self, book: &Book) -> bool {
        let fields = &book.fields;
        let contains = |haystack: &str, needle: &str| {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        };

        if let Some(term) = self.search.as_deref().filter(|t| !t.is_empty()) {
            if !contains(&fields.title, term)
                && !contains(&fields.author, term)
                && !contains(&fields.genre, term)
            {
                return false;
            }
        }
        if self.min_price.is_some_and(|min| fields.price < min)
            || self.max_price.is_some_and(|max| fields.price > max)
            || self.min_rating.is_some_and(|min| fields.rating < min)
        {
            return false;
        }
        if let Some(author) = &self.author {
            if !contains(&fields.author, author) {
                return false;
            }
        }
        if let Some(genre) = &self.genre {
            if !fields.genre.eq_ignore_ascii_case(genre) {
                return false;
            }
        }
        match fields.year {
            Some(year) => {
                !(self.year_from.is_some_and(|from| year < from)
                    || self.year_to.is_some_and(|to| year > to))
            }
            None => self.year_from.is_none() && self.year_to.is_none(),
        }
    }
}

/// Parameters of one listing request
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    pub sort_by: String,
    pub order: SortOrder,
    pub filter: BookFilter,
}

impl ListQuery {
    /// Query string pairs in the server's naming
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", self.page.to_string()),
            ("limit", self.limit.to_string()),
        ];
        if !self.sort_by.is_empty() {
            pairs.push(("sortBy", self.sort_by.clone()));
            pairs.push(("order", self.order.as_str().to_string()));
        }

        let f = &self.filter;
        if let Some(search) = f.search.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("filter", search.to_string()));
        }
        let optional = [
            ("minPrice", f.min_price.map(|v| v.to_string())),
            ("maxPrice", f.max_price.map(|v| v.to_string())),
            ("author", f.author.clone()),
            ("genre", f.genre.clone()),
            ("minRating", f.min_rating.map(|v| v.to_string())),
            ("yearFrom", f.year_from.map(|v| v.to_string())),
            ("yearTo", f.year_to.map(|v| v.to_string())),
        ];
        pairs.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.map(|value| (name, value))),
        );
        pairs
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookPage {
    #[serde(default, deserialize_with = "deserialize_server_books")]
    pub books: Vec<Book>,
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default = "first_page")]
    pub total_pages: u32,
}

fn first_page() -> u32 {
    1
}

/// Operations the engine needs from the server
///
/// The engine only ever talks to the server through this trait, so tests can
/// substitute a scripted implementation.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list_books(&self, query: &ListQuery) -> Result<BookPage, ClientError>;

    async fn create_book(&self, draft: &BookDraft) -> Result<Book, ClientError>;

    async fn update_book(&self, server_id: &str, draft: &BookDraft) -> Result<Book, ClientError>;

    async fn delete_book(&self, server_id: &str) -> Result<(), ClientError>;

    /// Aggregate document, opaque to the engine
    async fn fetch_stats(&self) -> Result<Value, ClientError>;

    /// Cheap reachability probe; never fails, an unreachable server is `false`
    async fn check_server(&self) -> bool;
}

/// [`ResourceClient`] over HTTP
#[derive(Clone)]
pub struct HttpResourceClient {
    http: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
}

impl HttpResourceClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            probe_timeout,
        })
    }

    pub fn from_config(config: &crate::config::EngineConfig) -> Result<Self, ClientError> {
        Self::new(&config.api_base_url, config.request_timeout, config.probe_timeout)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base_url, path))
    }

    async fn send(builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = builder.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(rejection(response).await)
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        builder: RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = Self::send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

/// Turn a non-success response into a rejection, keeping the server's message
async fn rejection(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ClientError::Rejected {
        status: status.as_u16(),
        message: error_message(status, &body),
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["message", "error"]
                .iter()
                .find_map(|field| value.get(field).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| format!("HTTP error! Status: {}", status.as_u16()))
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    async fn list_books(&self, query: &ListQuery) -> Result<BookPage, ClientError> {
        let builder = self
            .request(Method::GET, "/books")
            .query(&query.to_query_pairs());
        Self::send_json(builder).await
    }

    async fn create_book(&self, draft: &BookDraft) -> Result<Book, ClientError> {
        let created: ServerBook = Self::send_json(self.request(Method::POST, "/books").json(draft)).await?;
        Ok(created.into())
    }

    async fn update_book(&self, server_id: &str, draft: &BookDraft) -> Result<Book, ClientError> {
        let path = format!("/books/{}", server_id);
        let updated: ServerBook = Self::send_json(self.request(Method::PATCH, &path).json(draft)).await?;
        Ok(updated.into())
    }

    async fn delete_book(&self, server_id: &str) -> Result<(), ClientError> {
        let path = format!("/books/{}", server_id);
        Self::send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn fetch_stats(&self) -> Result<Value, ClientError> {
        Self::send_json(self.request(Method::GET, "/books/stats")).await
    }

    async fn check_server(&self) -> bool {
        let cache_buster = Utc::now().timestamp_millis().to_string();
        let builder = self
            .request(Method::HEAD, "/books")
            .query(&[("limit", "1"), ("_", cache_buster.as_str())])
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .timeout(self.probe_timeout);

        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Server check failed: {}", e);
                false
            }
        }
    }
}
