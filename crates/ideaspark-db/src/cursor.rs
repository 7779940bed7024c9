//! Opaque pagination cursors: Base64 of `{"field", "value", "_id"}`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{DbError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cursor {
    pub field: String,
    pub value: Value,
    #[serde(rename = "_id")]
    pub id: String,
}

impl Cursor {
    pub fn new(field: impl Into<String>, value: Value, id: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value,
            id: id.into(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// Decode a client-supplied token. Query strings turn `+` into a space,
    /// so spaces are restored first; URL-safe tokens are accepted too.
    pub fn decode(token: &str) -> Result<Self> {
        let token = token.trim().replace(' ', "+");
        let bytes = STANDARD
            .decode(&token)
            .or_else(|_| URL_SAFE_NO_PAD.decode(token.trim_end_matches('=')))
            .map_err(|_| DbError::InvalidCursor("not base64".into()))?;

        let cursor: Cursor = serde_json::from_slice(&bytes)
            .map_err(|e| DbError::InvalidCursor(e.to_string()))?;

        if cursor.field.is_empty() {
            return Err(DbError::InvalidCursor("empty field".into()));
        }
        if cursor.value.is_array() || cursor.value.is_object() {
            return Err(DbError::InvalidCursor("value must be a scalar".into()));
        }
        if cursor.id.parse::<Uuid>().is_err() {
            return Err(DbError::InvalidCursor("_id is not an identifier".into()));
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_what_it_encodes() {
        let cursor = Cursor::new(
            "createdAt",
            json!("2025-01-01T00:00:00.000000Z"),
            Uuid::now_v7().to_string(),
        );
        let token = cursor.encode().unwrap();
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn wire_format_uses_underscore_id() {
        let id = Uuid::now_v7().to_string();
        let token = Cursor::new("id", json!(id), id.clone()).encode().unwrap();
        let raw: Value = serde_json::from_slice(&STANDARD.decode(token).unwrap()).unwrap();
        assert_eq!(raw["_id"], json!(id));
        assert_eq!(raw["field"], json!("id"));
    }

    #[test]
    fn tolerates_query_string_mangling() {
        let id = Uuid::now_v7().to_string();
        let json = format!(r#"{{"field":"title","value":"a>?b","_id":"{}"}}"#, id);
        let standard = STANDARD.encode(&json);
        assert!(Cursor::decode(&standard.replace('+', " ")).is_ok());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode(&json)).is_ok());
    }

    #[test]
    fn rejects_malformed_tokens() {
        let id = Uuid::now_v7().to_string();
        let bad = [
            "%%%".to_string(),
            STANDARD.encode("not json"),
            STANDARD.encode(r#"{"field":"id","value":1}"#),
            STANDARD.encode(format!(
                r#"{{"field":"id","value":1,"_id":"{}","extra":true}}"#,
                id
            )),
            STANDARD.encode(format!(r#"{{"field":"id","value":[1],"_id":"{}"}}"#, id)),
            STANDARD.encode(r#"{"field":"id","value":1,"_id":"nope"}"#),
        ];
        for token in bad {
            assert!(
                matches!(Cursor::decode(&token), Err(DbError::InvalidCursor(_))),
                "accepted {}",
                token
            );
        }
    }
}
