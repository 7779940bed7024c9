use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (users, conversations, messages, ideas)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id                  TEXT PRIMARY KEY,
                username            TEXT NOT NULL UNIQUE,
                password            TEXT NOT NULL,
                email               TEXT UNIQUE,
                role                TEXT NOT NULL DEFAULT 'user',
                remaining_ideas     INTEGER NOT NULL DEFAULT 10,
                last_idea_reset_at  TEXT NOT NULL,
                is_deleted          INTEGER NOT NULL DEFAULT 0,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE TABLE conversations (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL REFERENCES users(id),
                title            TEXT NOT NULL,
                last_message_at  TEXT NOT NULL,
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE INDEX idx_conversations_user
                ON conversations(user_id, created_at, id);
            CREATE INDEX idx_conversations_activity
                ON conversations(user_id, last_message_at, id);

            CREATE TABLE messages (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL REFERENCES users(id),
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                content          TEXT NOT NULL,
                sender           TEXT NOT NULL CHECK (sender IN ('user', 'system')),
                contains_idea    INTEGER NOT NULL DEFAULT 0,
                idea_id          TEXT,
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at, id);

            CREATE TABLE ideas (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL REFERENCES users(id),
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                message_id       TEXT NOT NULL REFERENCES messages(id),
                title            TEXT NOT NULL,
                summary          TEXT NOT NULL,
                category         TEXT NOT NULL DEFAULT 'All',
                icon             TEXT NOT NULL DEFAULT 'lightning',
                problem_solved   TEXT NOT NULL,
                target_audience  TEXT NOT NULL,
                core_features    TEXT NOT NULL DEFAULT '[]',
                benefits         TEXT NOT NULL DEFAULT '[]',
                tech_stack       TEXT NOT NULL DEFAULT '[]',
                monetization     TEXT NOT NULL DEFAULT '[]',
                challenges       TEXT NOT NULL DEFAULT '[]',
                next_steps       TEXT NOT NULL DEFAULT '[]',
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE INDEX idx_ideas_user ON ideas(user_id, category, created_at);
            CREATE INDEX idx_ideas_message ON ideas(message_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (background jobs)");
        conn.execute_batch(
            "
            CREATE TABLE jobs (
                id            TEXT PRIMARY KEY,
                kind          TEXT NOT NULL,
                payload       TEXT NOT NULL,
                priority      INTEGER NOT NULL DEFAULT 0,
                status        TEXT NOT NULL DEFAULT 'pending',
                attempts      INTEGER NOT NULL DEFAULT 0,
                max_attempts  INTEGER NOT NULL DEFAULT 3,
                run_at        TEXT NOT NULL,
                locked_until  TEXT,
                last_error    TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                finished_at   TEXT
            );

            CREATE INDEX idx_jobs_ready ON jobs(status, priority, run_at);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
