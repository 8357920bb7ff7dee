use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite,
};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::models::{Ballot, Poll, PollOption};

/// Durable record of polls, their options and the ballot ledger.
#[async_trait]
pub trait PollStore: Send + Sync + 'static {
    async fn insert_poll(&self, poll: &Poll) -> Result<(), StoreError>;

    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>, StoreError>;

    async fn list_polls(&self) -> Result<Vec<Poll>, StoreError>;

    /// Overwrites title, description, window and option set of an existing poll.
    async fn replace_poll(&self, poll: &Poll) -> Result<(), StoreError>;

    async fn delete_poll(&self, poll_id: &str) -> Result<bool, StoreError>;

    /// Sets the early-close override. Returns false if it was already set.
    async fn mark_closed(
        &self,
        poll_id: &str,
        closed_by: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Appends a ballot unless one exists for (poll, voter). Returns whether it was inserted.
    async fn insert_ballot(&self, ballot: &Ballot) -> Result<bool, StoreError>;

    /// All ballots of a poll in the order they were accepted.
    async fn ballots_for_poll(&self, poll_id: &str) -> Result<Vec<Ballot>, StoreError>;

    async fn ballot_of(&self, poll_id: &str, voter_id: &str) -> Result<Option<Ballot>, StoreError>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// A private in-memory database. One connection that never expires, so
    /// every query sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query("PRAGMA foreign_keys = ON;").execute(pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                starts_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                closed_by TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                id TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL,
                label TEXT NOT NULL,
                description TEXT,
                position INTEGER NOT NULL,
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        // No cascade: a poll with ballots cannot be deleted.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ballots (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                poll_id TEXT NOT NULL,
                voter_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                cast_at TEXT NOT NULL,
                UNIQUE (poll_id, voter_id),
                FOREIGN KEY (poll_id) REFERENCES polls(id),
                FOREIGN KEY (option_id) REFERENCES poll_options(id)
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn options_by_poll(&self) -> Result<HashMap<String, Vec<PollOption>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, poll_id, label, description
            FROM poll_options
            ORDER BY poll_id, position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<PollOption>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.get::<String, _>("poll_id"))
                .or_default()
                .push(option_from_row(&row));
        }
        Ok(grouped)
    }
}

#[async_trait]
impl PollStore for Database {
    async fn insert_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (id, title, description, starts_at, ends_at, created_by, created_at, closed_at, closed_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(poll.starts_at.to_rfc3339())
        .bind(poll.ends_at.to_rfc3339())
        .bind(&poll.created_by)
        .bind(poll.created_at.to_rfc3339())
        .bind(poll.closed_at.map(|dt| dt.to_rfc3339()))
        .bind(&poll.closed_by)
        .execute(&mut *tx)
        .await?;

        for (i, option) in poll.options.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_options (id, poll_id, label, description, position)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&option.id)
            .bind(&poll.id)
            .bind(&option.label)
            .bind(&option.description)
            .bind(i as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>, StoreError> {
        let Some(poll_row) = sqlx::query(
            r#"
            SELECT id, title, description, starts_at, ends_at, created_by, created_at, closed_at, closed_by
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let options = sqlx::query(
            r#"
            SELECT id, label, description
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(option_from_row)
        .collect();

        poll_from_row(&poll_row, options).map(Some)
    }

    async fn list_polls(&self) -> Result<Vec<Poll>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, description, starts_at, ends_at, created_by, created_at, closed_at, closed_by
            FROM polls
            ORDER BY created_at, rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut options = self.options_by_poll().await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                poll_from_row(row, options.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn replace_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE polls
            SET title = ?, description = ?, starts_at = ?, ends_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(poll.starts_at.to_rfc3339())
        .bind(poll.ends_at.to_rfc3339())
        .bind(&poll.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM poll_options WHERE poll_id = ?")
            .bind(&poll.id)
            .execute(&mut *tx)
            .await?;

        for (i, option) in poll.options.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_options (id, poll_id, label, description, position)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&option.id)
            .bind(&poll.id)
            .bind(&option.label)
            .bind(&option.description)
            .bind(i as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_poll(&self, poll_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM polls WHERE id = ?")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_closed(
        &self,
        poll_id: &str,
        closed_by: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE polls
            SET closed_at = ?, closed_by = ?
            WHERE id = ? AND closed_at IS NULL
            "#,
        )
        .bind(closed_at.to_rfc3339())
        .bind(closed_by)
        .bind(poll_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_ballot(&self, ballot: &Ballot) -> Result<bool, StoreError> {
        // Existence check and insert in one statement
        let result = sqlx::query(
            r#"
            INSERT INTO ballots (poll_id, voter_id, option_id, cast_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(poll_id, voter_id) DO NOTHING
            "#,
        )
        .bind(&ballot.poll_id)
        .bind(&ballot.voter_id)
        .bind(&ballot.option_id)
        .bind(ballot.cast_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ballots_for_poll(&self, poll_id: &str) -> Result<Vec<Ballot>, StoreError> {
        sqlx::query(
            r#"
            SELECT poll_id, voter_id, option_id, cast_at
            FROM ballots
            WHERE poll_id = ?
            ORDER BY seq
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(ballot_from_row)
        .collect()
    }

    async fn ballot_of(&self, poll_id: &str, voter_id: &str) -> Result<Option<Ballot>, StoreError> {
        sqlx::query(
            r#"
            SELECT poll_id, voter_id, option_id, cast_at
            FROM ballots
            WHERE poll_id = ? AND voter_id = ?
            "#,
        )
        .bind(poll_id)
        .bind(voter_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(ballot_from_row)
        .transpose()
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("failed to parse {}: {}", field, e)))
}

fn option_from_row(row: &SqliteRow) -> PollOption {
    PollOption {
        id: row.get("id"),
        label: row.get("label"),
        description: row.get("description"),
    }
}

fn poll_from_row(row: &SqliteRow, options: Vec<PollOption>) -> Result<Poll, StoreError> {
    let closed_at: Option<String> = row.get("closed_at");

    Ok(Poll {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        options,
        starts_at: parse_timestamp(&row.get::<String, _>("starts_at"), "starts_at")?,
        ends_at: parse_timestamp(&row.get::<String, _>("ends_at"), "ends_at")?,
        created_by: row.get("created_by"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"), "created_at")?,
        closed_at: closed_at
            .as_deref()
            .map(|raw| parse_timestamp(raw, "closed_at"))
            .transpose()?,
        closed_by: row.get("closed_by"),
    })
}

fn ballot_from_row(row: &SqliteRow) -> Result<Ballot, StoreError> {
    Ok(Ballot {
        poll_id: row.get("poll_id"),
        voter_id: row.get("voter_id"),
        option_id: row.get("option_id"),
        cast_at: parse_timestamp(&row.get::<String, _>("cast_at"), "cast_at")?,
    })
}
