// File: shelf-sync/src/identifier.rs
// Purpose: Record identifiers, locally minted or assigned by the server

use chrono::Utc;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Prefix carried by every client-minted identifier
pub const LOCAL_PREFIX: &str = "local_";

/// Identifier of a catalog record
///
/// The kind is decided once, when the identifier is created. Persisted
/// documents store the plain token; on the way back in the kind is recovered
/// from the `local_` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
    /// Minted on this device, not yet confirmed by the server
    Local(String),
    /// Assigned by the server
    Server(String),
}

impl RecordId {
    /// Mint a fresh local identifier: `local_<millis>_<9 random chars>`
    pub fn new_local() -> Self {
        Self::Local(format!(
            "{}{}_{}",
            LOCAL_PREFIX,
            Utc::now().timestamp_millis(),
            random_token(9)
        ))
    }

    /// Wrap a token the server handed out
    pub fn server(token: impl Into<String>) -> Self {
        Self::Server(token.into())
    }

    /// Recover the identifier kind from a persisted token
    pub fn parse(token: impl Into<String>) -> Self {
        let token = token.into();
        if token.starts_with(LOCAL_PREFIX) {
            Self::Local(token)
        } else {
            Self::Server(token)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecordId::Local(token) | RecordId::Server(token) => token,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RecordId::Local(_))
    }

    /// The server token, if this identifier has been confirmed
    pub fn server_token(&self) -> Option<&str> {
        match self {
            RecordId::Server(token) => Some(token),
            RecordId::Local(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_token(deserializer).map(RecordId::parse)
    }
}

/// Decode an id the server handed out
///
/// Server payloads never carry local ids, so the prefix is not consulted: a
/// server token that happens to start with `local_` stays a server id.
pub fn deserialize_server_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RecordId, D::Error> {
    deserialize_token(deserializer).map(RecordId::Server)
}

fn deserialize_token<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    // Some backends hand out numeric keys
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Text(String),
        Number(i64),
    }

    match Token::deserialize(deserializer)? {
        Token::Text(text) if text.is_empty() => Err(de::Error::custom("record id must not be empty")),
        Token::Text(text) => Ok(text),
        Token::Number(n) => Ok(n.to_string()),
    }
}

/// Random lowercase alphanumeric token used for local and queue ids
pub(crate) fn random_token(len: usize) -> String {
    let mut token = String::with_capacity(len);
    while token.len() < len {
        let chunk = Uuid::new_v4().simple().to_string();
        token.extend(chunk.chars().take(len - token.len()));
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_local_shape() {
        let id = RecordId::new_local();
        assert!(id.is_local());

        let token = id.as_str();
        let rest = token.strip_prefix(LOCAL_PREFIX).unwrap();
        let (millis, suffix) = rest.split_once('_').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
    }

    #[test]
    fn test_local_ids_are_unique() {
        let a = RecordId::new_local();
        let b = RecordId::new_local();
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_infers_kind() {
        assert!(RecordId::parse("local_1_abc").is_local());
        assert_eq!(RecordId::parse("64f0c2"), RecordId::Server("64f0c2".to_string()));
    }

    #[test]
    fn test_serde_plain_string() {
        let json = serde_json::to_string(&RecordId::server("srv-1")).unwrap();
        assert_eq!(json, "\"srv-1\"");

        let id: RecordId = serde_json::from_str("\"local_99_abcdefghi\"").unwrap();
        assert!(id.is_local());

        let numeric: RecordId = serde_json::from_str("42").unwrap();
        assert_eq!(numeric, RecordId::server("42"));

        assert!(serde_json::from_str::<RecordId>("\"\"").is_err());
    }

    #[test]
    fn test_server_ids_ignore_the_local_prefix() {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(deserialize_with = "deserialize_server_id")]
            id: RecordId,
        }

        let wire: Wire = serde_json::from_str(r#"{"id":"local_7"}"#).unwrap();
        assert_eq!(wire.id, RecordId::server("local_7"));

        let wire: Wire = serde_json::from_str(r#"{"id":7}"#).unwrap();
        assert_eq!(wire.id, RecordId::server("7"));
    }
}
