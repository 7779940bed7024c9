use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use ideaspark_types::models::{Conversation, Idea, Message, NewIdea, Sender, User, UserRole};

use crate::collections::{
    CONVERSATIONS, Collection, Column, Document, IS_DELETED_SQL, USERS, decode, read_document,
};
use crate::models::UserCredentials;
use crate::{Database, DbError, Result, format_timestamp, now_timestamp};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        email: Option<&str>,
        daily_ideas: i64,
    ) -> Result<User> {
        let id = Uuid::now_v7();
        let (now, ts) = now_timestamp();
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, email, remaining_ideas, last_idea_reset_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)",
                params![id.to_string(), username, password_hash, email, daily_ideas, ts],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DbError::Conflict("username or email already registered".into())
                } else {
                    e.into()
                }
            })?;
            Ok(())
        })?;

        Ok(User {
            id,
            username: username.to_string(),
            email: email.map(str::to_string),
            role: UserRole::User,
            remaining_ideas: daily_ideas,
            last_idea_reset_at: now,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_credentials(&self, username: &str) -> Result<Option<UserCredentials>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, password, role FROM users
                     WHERE username = ?1 AND is_deleted = 0",
                    [username],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, username, password, role)) = row else {
                return Ok(None);
            };
            Ok(Some(UserCredentials {
                id: parse_id(&id)?,
                username,
                password,
                role: if role == "admin" {
                    UserRole::Admin
                } else {
                    UserRole::User
                },
            }))
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<User> {
        self.with_conn(|conn| {
            let doc = fetch_document(conn, &USERS, id)?.ok_or(DbError::NotFound)?;
            decode(doc)
        })
    }

    // -- Conversations --

    /// Create a conversation and its first user message in one transaction.
    pub fn create_conversation(
        &self,
        owner: Uuid,
        title: &str,
        first_message: &str,
    ) -> Result<(Conversation, Message)> {
        let id = Uuid::now_v7();
        let (now, ts) = now_timestamp();
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM users WHERE id = ?1 AND is_deleted = 0",
                    [owner.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(DbError::NotFound);
            }

            tx.execute(
                "INSERT INTO conversations (id, user_id, title, last_message_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
                params![id.to_string(), owner.to_string(), title, ts],
            )?;
            let message = insert_message(&tx, id, owner, first_message, Sender::User, now)?;
            tx.commit()?;

            let conversation = Conversation {
                id,
                user_id: owner,
                title: title.to_string(),
                last_message_at: now,
                is_deleted: false,
                created_at: now,
                updated_at: now,
            };
            Ok((conversation, message))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.with_conn(|conn| {
            let doc = fetch_document(conn, &CONVERSATIONS, id)?.ok_or(DbError::NotFound)?;
            decode(doc)
        })
    }

    // -- Messages --

    /// Persist a message sent by `owner`. Ownership, the daily quota and
    /// the insert commit or fail together.
    pub fn insert_user_message(
        &self,
        conversation_id: Uuid,
        owner: Uuid,
        content: &str,
        daily_ideas: i64,
    ) -> Result<Message> {
        let (now, _) = now_timestamp();
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let conversation_owner = query_owner(&tx, conversation_id)?;
            if conversation_owner != owner {
                return Err(DbError::Forbidden);
            }
            consume_quota(&tx, owner, daily_ideas, now)?;

            let message = insert_message(&tx, conversation_id, owner, content, Sender::User, now)?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Persist an assistant message. The author is the conversation owner.
    pub fn insert_system_message(&self, conversation_id: Uuid, content: &str) -> Result<Message> {
        let (now, _) = now_timestamp();
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let owner = query_owner(&tx, conversation_id)?;
            let message =
                insert_message(&tx, conversation_id, owner, content, Sender::System, now)?;
            tx.commit()?;
            Ok(message)
        })
    }

    // -- Ideas --

    /// Record an idea extracted from `message_id` and link the message to it.
    pub fn insert_idea(&self, message_id: Uuid, idea: &NewIdea) -> Result<Idea> {
        let id = Uuid::now_v7();
        let (now, ts) = now_timestamp();
        let lists = [
            serde_json::to_string(&idea.core_features)?,
            serde_json::to_string(&idea.benefits)?,
            serde_json::to_string(&idea.tech_stack)?,
            serde_json::to_string(&idea.monetization)?,
            serde_json::to_string(&idea.challenges)?,
            serde_json::to_string(&idea.next_steps)?,
        ];

        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let (user_id, conversation_id): (String, String) = tx
                .query_row(
                    "SELECT user_id, conversation_id FROM messages WHERE id = ?1 AND is_deleted = 0",
                    [message_id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .ok_or(DbError::NotFound)?;

            tx.execute(
                "INSERT INTO ideas (id, user_id, conversation_id, message_id, title, summary, category, icon,
                                    problem_solved, target_audience, core_features, benefits, tech_stack,
                                    monetization, challenges, next_steps, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
                params![
                    id.to_string(),
                    user_id,
                    conversation_id,
                    message_id.to_string(),
                    idea.title,
                    idea.summary,
                    idea.category.as_str(),
                    idea.icon.as_str(),
                    idea.problem_solved,
                    idea.target_audience,
                    lists[0],
                    lists[1],
                    lists[2],
                    lists[3],
                    lists[4],
                    lists[5],
                    ts,
                ],
            )?;
            tx.execute(
                "UPDATE messages SET contains_idea = 1, idea_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![id.to_string(), ts, message_id.to_string()],
            )?;
            tx.commit()?;

            Ok(Idea {
                id,
                user_id: parse_id(&user_id)?,
                conversation_id: parse_id(&conversation_id)?,
                message_id,
                title: idea.title.clone(),
                summary: idea.summary.clone(),
                category: idea.category,
                icon: idea.icon,
                problem_solved: idea.problem_solved.clone(),
                target_audience: idea.target_audience.clone(),
                core_features: idea.core_features.clone(),
                benefits: idea.benefits.clone(),
                tech_stack: idea.tech_stack.clone(),
                monetization: idea.monetization.clone(),
                challenges: idea.challenges.clone(),
                next_steps: idea.next_steps.clone(),
                is_deleted: false,
                created_at: now,
                updated_at: now,
            })
        })
    }

    // -- Soft delete --

    /// Mark a row deleted. Returns false if it was missing or already deleted.
    pub fn soft_delete(&self, collection: &'static Collection, id: Uuid) -> Result<bool> {
        self.set_deleted(collection, id, true)
    }

    /// Undo `soft_delete`. Returns false if the row was missing or live.
    pub fn restore(&self, collection: &'static Collection, id: Uuid) -> Result<bool> {
        self.set_deleted(collection, id, false)
    }

    fn set_deleted(
        &self,
        collection: &'static Collection,
        id: Uuid,
        deleted: bool,
    ) -> Result<bool> {
        let (_, ts) = now_timestamp();
        let sql = format!(
            "UPDATE \"{}\" SET \"{col}\" = ?1, updated_at = ?2 WHERE {} = ?3 AND \"{col}\" = ?4",
            collection.table,
            collection.id_column().quoted(),
            col = IS_DELETED_SQL,
        );
        self.with_conn_mut(|conn| {
            let changed = conn.execute(&sql, params![deleted, ts, id.to_string(), !deleted])?;
            Ok(changed > 0)
        })
    }
}

fn fetch_document(
    conn: &Connection,
    collection: &'static Collection,
    id: Uuid,
) -> Result<Option<Document>> {
    let columns: Vec<&'static Column> = collection.columns.iter().collect();
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE {} = ?1 AND \"{}\" = 0",
        crate::query::column_list(&columns, None),
        collection.table,
        collection.id_column().quoted(),
        IS_DELETED_SQL
    );
    let doc = conn
        .query_row(&sql, [id.to_string()], |row| read_document(row, &columns, 0))
        .optional()?;
    Ok(doc)
}

/// Owner of a live conversation, or `NotFound`.
fn query_owner(conn: &Connection, conversation_id: Uuid) -> Result<Uuid> {
    let owner: String = conn
        .query_row(
            "SELECT user_id FROM conversations WHERE id = ?1 AND is_deleted = 0",
            [conversation_id.to_string()],
            |r| r.get(0),
        )
        .optional()?
        .ok_or(DbError::NotFound)?;
    parse_id(&owner)
}

/// Take one idea from the owner's daily budget. A budget last reset before
/// today starts over at `daily_ideas`. Reset and decrement are one statement.
fn consume_quota(
    conn: &Connection,
    user: Uuid,
    daily_ideas: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let day_start = format_timestamp(&now.date_naive().and_time(NaiveTime::MIN).and_utc());
    let changed = conn.execute(
        "UPDATE users SET
             remaining_ideas = CASE WHEN last_idea_reset_at < ?2 THEN ?3 - 1 ELSE remaining_ideas - 1 END,
             last_idea_reset_at = CASE WHEN last_idea_reset_at < ?2 THEN ?4 ELSE last_idea_reset_at END,
             updated_at = ?4
         WHERE id = ?1
           AND ((last_idea_reset_at < ?2 AND ?3 > 0) OR remaining_ideas > 0)",
        params![user.to_string(), day_start, daily_ideas, format_timestamp(&now)],
    )?;
    if changed == 0 {
        return Err(DbError::QuotaExceeded);
    }
    Ok(())
}

/// Insert a message and bump the conversation's `last_message_at`.
fn insert_message(
    conn: &Connection,
    conversation_id: Uuid,
    owner: Uuid,
    content: &str,
    sender: Sender,
    now: DateTime<Utc>,
) -> Result<Message> {
    let id = Uuid::now_v7();
    let ts = format_timestamp(&now);
    conn.execute(
        "INSERT INTO messages (id, user_id, conversation_id, content, sender, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            id.to_string(),
            owner.to_string(),
            conversation_id.to_string(),
            content,
            sender.as_str(),
            ts
        ],
    )?;
    conn.execute(
        "UPDATE conversations SET last_message_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![ts, conversation_id.to_string()],
    )?;

    Ok(Message {
        id,
        user_id: owner,
        conversation_id,
        content: content.to_string(),
        sender,
        contains_idea: false,
        idea_id: None,
        idea: None,
        is_deleted: false,
        created_at: now,
        updated_at: now,
    })
}

fn parse_id(s: &str) -> Result<Uuid> {
    s.parse()
        .map_err(|_| DbError::Validation(format!("malformed id in store: {}", s)))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
