//! Collection metadata: which table backs a document collection, which
//! document keys map to which columns, and how values cross the boundary.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::{Type, Value as SqlValue};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{DbError, Result, format_timestamp};

/// A row as seen by callers: document keys (camelCase) to JSON values.
pub type Document = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Id,
    Text,
    Integer,
    Bool,
    Timestamp,
    /// JSON array of strings stored as text. Readable, not filterable.
    TextList,
}

#[derive(Debug)]
pub struct Column {
    pub key: &'static str,
    pub sql: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

/// A to-one reference resolved after the page is fetched (`populate`).
#[derive(Debug)]
pub struct Relation {
    pub key: &'static str,
    pub local: &'static str,
    pub target: &'static Collection,
}

#[derive(Debug)]
pub struct Collection {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [Column],
    pub relations: &'static [Relation],
}

pub const ID: &str = "id";
pub const CREATED_AT: &str = "createdAt";
pub const IS_DELETED_SQL: &str = "is_deleted";

const fn col(key: &'static str, sql: &'static str, kind: ColumnKind) -> Column {
    Column {
        key,
        sql,
        kind,
        nullable: false,
    }
}

const fn nullable(key: &'static str, sql: &'static str, kind: ColumnKind) -> Column {
    Column {
        key,
        sql,
        kind,
        nullable: true,
    }
}

pub static USERS: Collection = Collection {
    name: "users",
    table: "users",
    columns: &[
        col("id", "id", ColumnKind::Id),
        col("username", "username", ColumnKind::Text),
        nullable("email", "email", ColumnKind::Text),
        col("role", "role", ColumnKind::Text),
        col("remainingIdeas", "remaining_ideas", ColumnKind::Integer),
        col("lastIdeaResetAt", "last_idea_reset_at", ColumnKind::Timestamp),
        col("isDeleted", "is_deleted", ColumnKind::Bool),
        col("createdAt", "created_at", ColumnKind::Timestamp),
        col("updatedAt", "updated_at", ColumnKind::Timestamp),
    ],
    relations: &[],
};

pub static CONVERSATIONS: Collection = Collection {
    name: "conversations",
    table: "conversations",
    columns: &[
        col("id", "id", ColumnKind::Id),
        col("userId", "user_id", ColumnKind::Id),
        col("title", "title", ColumnKind::Text),
        col("lastMessageAt", "last_message_at", ColumnKind::Timestamp),
        col("isDeleted", "is_deleted", ColumnKind::Bool),
        col("createdAt", "created_at", ColumnKind::Timestamp),
        col("updatedAt", "updated_at", ColumnKind::Timestamp),
    ],
    relations: &[],
};

pub static MESSAGES: Collection = Collection {
    name: "messages",
    table: "messages",
    columns: &[
        col("id", "id", ColumnKind::Id),
        col("userId", "user_id", ColumnKind::Id),
        col("conversationId", "conversation_id", ColumnKind::Id),
        col("content", "content", ColumnKind::Text),
        col("sender", "sender", ColumnKind::Text),
        col("containsIdea", "contains_idea", ColumnKind::Bool),
        nullable("ideaId", "idea_id", ColumnKind::Id),
        col("isDeleted", "is_deleted", ColumnKind::Bool),
        col("createdAt", "created_at", ColumnKind::Timestamp),
        col("updatedAt", "updated_at", ColumnKind::Timestamp),
    ],
    relations: &[Relation {
        key: "idea",
        local: "ideaId",
        target: &IDEAS,
    }],
};

pub static IDEAS: Collection = Collection {
    name: "ideas",
    table: "ideas",
    columns: &[
        col("id", "id", ColumnKind::Id),
        col("userId", "user_id", ColumnKind::Id),
        col("conversationId", "conversation_id", ColumnKind::Id),
        col("messageId", "message_id", ColumnKind::Id),
        col("title", "title", ColumnKind::Text),
        col("summary", "summary", ColumnKind::Text),
        col("category", "category", ColumnKind::Text),
        col("icon", "icon", ColumnKind::Text),
        col("problemSolved", "problem_solved", ColumnKind::Text),
        col("targetAudience", "target_audience", ColumnKind::Text),
        col("coreFeatures", "core_features", ColumnKind::TextList),
        col("benefits", "benefits", ColumnKind::TextList),
        col("techStack", "tech_stack", ColumnKind::TextList),
        col("monetization", "monetization", ColumnKind::TextList),
        col("challenges", "challenges", ColumnKind::TextList),
        col("nextSteps", "next_steps", ColumnKind::TextList),
        col("isDeleted", "is_deleted", ColumnKind::Bool),
        col("createdAt", "created_at", ColumnKind::Timestamp),
        col("updatedAt", "updated_at", ColumnKind::Timestamp),
    ],
    relations: &[],
};

impl Collection {
    /// Resolve a document key to its column. Unknown keys are rejected so
    /// client-supplied sort fields never reach the SQL text unchecked.
    pub fn column(&'static self, key: &str) -> Result<&'static Column> {
        self.columns
            .iter()
            .find(|c| c.key == key)
            .ok_or_else(|| DbError::Validation(format!("unknown field '{}' on {}", key, self.name)))
    }

    pub fn id_column(&'static self) -> &'static Column {
        &self.columns[0]
    }

    pub fn relation(&'static self, key: &str) -> Result<&'static Relation> {
        self.relations
            .iter()
            .find(|r| r.key == key)
            .ok_or_else(|| {
                DbError::Validation(format!("unknown relation '{}' on {}", key, self.name))
            })
    }
}

impl Column {
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.sql)
    }

    /// Convert a JSON value to the SQL value stored in this column.
    pub fn to_sql(&self, value: &Value) -> Result<SqlValue> {
        let mismatch = || {
            DbError::Validation(format!(
                "value {} does not fit field '{}'",
                value, self.key
            ))
        };

        if value.is_null() {
            return if self.nullable {
                Ok(SqlValue::Null)
            } else {
                Err(mismatch())
            };
        }

        match self.kind {
            ColumnKind::Id => {
                let text = value.as_str().ok_or_else(mismatch)?;
                let id: Uuid = text.parse().map_err(|_| mismatch())?;
                Ok(SqlValue::Text(id.to_string()))
            }
            ColumnKind::Text => Ok(SqlValue::Text(
                value.as_str().ok_or_else(mismatch)?.to_string(),
            )),
            ColumnKind::Integer => Ok(SqlValue::Integer(value.as_i64().ok_or_else(mismatch)?)),
            ColumnKind::Bool => Ok(SqlValue::Integer(
                value.as_bool().ok_or_else(mismatch)? as i64,
            )),
            ColumnKind::Timestamp => {
                let text = value.as_str().ok_or_else(mismatch)?;
                let ts: DateTime<Utc> = text.parse().map_err(|_| mismatch())?;
                Ok(SqlValue::Text(format_timestamp(&ts)))
            }
            ColumnKind::TextList => Err(DbError::Validation(format!(
                "field '{}' cannot be compared",
                self.key
            ))),
        }
    }

    /// Read this column at `idx` into a JSON value.
    pub fn read(&self, row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
        let value = match self.kind {
            ColumnKind::Id | ColumnKind::Text | ColumnKind::Timestamp => row
                .get::<_, Option<String>>(idx)?
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnKind::Integer => row
                .get::<_, Option<i64>>(idx)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnKind::Bool => row
                .get::<_, Option<i64>>(idx)?
                .map(|v| Value::Bool(v != 0))
                .unwrap_or(Value::Null),
            ColumnKind::TextList => match row.get::<_, Option<String>>(idx)? {
                Some(text) => serde_json::from_str(&text).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
                })?,
                None => Value::Array(vec![]),
            },
        };
        Ok(value)
    }
}

/// Read `columns` from `row`, starting at column index `offset`.
pub fn read_document(
    row: &Row<'_>,
    columns: &[&'static Column],
    offset: usize,
) -> rusqlite::Result<Document> {
    let mut doc = Document::new();
    for (i, column) in columns.iter().enumerate() {
        doc.insert(column.key.to_string(), column.read(row, offset + i)?);
    }
    Ok(doc)
}

pub fn decode<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_field_is_a_validation_error() {
        assert!(matches!(
            MESSAGES.column("password"),
            Err(DbError::Validation(_))
        ));
        assert_eq!(MESSAGES.column("createdAt").unwrap().sql, "created_at");
    }

    #[test]
    fn timestamps_are_normalised_for_comparison() {
        let column = CONVERSATIONS.column("lastMessageAt").unwrap();
        let sql = column.to_sql(&json!("2025-05-01T19:00:00+02:00")).unwrap();
        assert_eq!(
            sql,
            SqlValue::Text("2025-05-01T17:00:00.000000Z".to_string())
        );
    }

    #[test]
    fn null_only_fits_nullable_columns() {
        let idea_id = MESSAGES.column("ideaId").unwrap();
        assert_eq!(idea_id.to_sql(&Value::Null).unwrap(), SqlValue::Null);

        let content = MESSAGES.column("content").unwrap();
        assert!(content.to_sql(&Value::Null).is_err());
    }

    #[test]
    fn ids_must_be_uuids() {
        let column = MESSAGES.column("conversationId").unwrap();
        assert!(column.to_sql(&json!("not-a-uuid")).is_err());
        assert!(column.to_sql(&json!(Uuid::new_v4().to_string())).is_ok());
    }

    #[test]
    fn relations_resolve_by_key() {
        let relation = MESSAGES.relation("idea").unwrap();
        assert_eq!(relation.target.table, "ideas");
        assert!(CONVERSATIONS.relation("idea").is_err());
    }
}
