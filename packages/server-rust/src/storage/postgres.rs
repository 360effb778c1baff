//! PostgreSQL store backed by `sqlx`.
//!
//! Every write that carries outbox events runs in one transaction together
//! with the `outbox_events` inserts.

use anyhow::Context;
use async_trait::async_trait;
use socialstream_core::{ContentType, EventMessage, RoutingKey};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::records::{
    Credentials, Media, NewCredentials, NewUserProfile, OutboxEvent, Post, UserProfile,
};
use super::store::{CredentialStore, MediaStore, OutboxStore, PostStore, StoreError, UserStore};

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS credentials (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS user_profiles (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        dob TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        owner_id BIGINT NOT NULL,
        body TEXT NOT NULL,
        media_id TEXT,
        created_at_ms BIGINT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS media (
        id TEXT PRIMARY KEY,
        compressed_id TEXT NOT NULL,
        owner_id BIGINT NOT NULL,
        status TEXT NOT NULL
    )",
    r"CREATE TABLE IF NOT EXISTS outbox_events (
        seq BIGSERIAL PRIMARY KEY,
        id UUID NOT NULL UNIQUE,
        exchange TEXT NOT NULL,
        routing_key TEXT NOT NULL,
        content_type TEXT NOT NULL,
        payload BYTEA NOT NULL,
        correlation_id TEXT,
        source TEXT,
        timestamp_ms BIGINT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        published_at TIMESTAMPTZ
    )",
    r"CREATE INDEX IF NOT EXISTS outbox_events_unpublished
        ON outbox_events (seq) WHERE published_at IS NULL",
];

/// Store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects a pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to PostgreSQL")?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to create schema")?;
        }
        info!("PostgreSQL schema ready");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(backend)
    }
}

fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.into())
}

/// Maps a unique violation to [`StoreError::Conflict`] using `describe` to
/// name the conflicting value from the violated constraint.
fn classify(error: sqlx::Error, describe: impl FnOnce(Option<&str>) -> String) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.is_unique_violation() {
            return StoreError::Conflict(describe(db.constraint()));
        }
    }
    backend(error)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

async fn enqueue(
    tx: &mut Transaction<'static, Postgres>,
    events: &[EventMessage],
) -> Result<(), sqlx::Error> {
    for event in events {
        sqlx::query(
            r"
            INSERT INTO outbox_events (
                id, exchange, routing_key, content_type, payload,
                correlation_id, source, timestamp_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(event.message_id)
        .bind(&event.exchange)
        .bind(event.routing_key.as_str())
        .bind(event.content_type.as_mime())
        .bind(&event.payload)
        .bind(&event.correlation_id)
        .bind(&event.source)
        .bind(to_i64(event.timestamp_ms))
        .execute(&mut **tx)
        .await?;
        debug!(event_id = %event.message_id, routing_key = %event.routing_key, "event queued in outbox");
    }
    Ok(())
}

fn outbox_from_row(row: &PgRow) -> anyhow::Result<OutboxEvent> {
    let routing_key: String = row.try_get("routing_key")?;
    let content_type: String = row.try_get("content_type")?;
    let attempts: i32 = row.try_get("attempts")?;
    let message = EventMessage {
        message_id: row.try_get("id")?,
        exchange: row.try_get("exchange")?,
        routing_key: RoutingKey::new(routing_key)?,
        content_type: content_type.parse::<ContentType>()?,
        payload: row.try_get("payload")?,
        correlation_id: row.try_get("correlation_id")?,
        source: row.try_get("source")?,
        timestamp_ms: to_u64(row.try_get("timestamp_ms")?),
    };
    Ok(OutboxEvent {
        id: message.message_id,
        message,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        last_error: row.try_get("last_error")?,
    })
}

fn profile_from_row(row: &PgRow) -> Result<UserProfile, sqlx::Error> {
    Ok(UserProfile {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        dob: row.try_get("dob")?,
    })
}

fn media_from_row(row: &PgRow) -> Result<Media, sqlx::Error> {
    Ok(Media {
        id: row.try_get("id")?,
        compressed_id: row.try_get("compressed_id")?,
        owner_id: row.try_get("owner_id")?,
        status: row.try_get("status")?,
    })
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn insert_credentials(
        &self,
        credentials: NewCredentials,
        events: Vec<EventMessage>,
    ) -> Result<Credentials, StoreError> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            r"
            INSERT INTO credentials (username, email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING id
            ",
        )
        .bind(&credentials.username)
        .bind(&credentials.email)
        .bind(&credentials.password_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            classify(e, |constraint| match constraint {
                Some(c) if c.contains("email") => format!("email {}", credentials.email),
                _ => format!("username {}", credentials.username),
            })
        })?;
        let user_id: i64 = row.try_get("id").map_err(backend)?;

        enqueue(&mut tx, &events).await.map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        Ok(Credentials {
            user_id,
            username: credentials.username,
            email: credentials.email,
            password_hash: credentials.password_hash,
        })
    }

    async fn credentials_by_email(&self, email: &str) -> Result<Option<Credentials>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, email, password_hash FROM credentials WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| -> Result<Credentials, sqlx::Error> {
            Ok(Credentials {
                user_id: row.try_get("id")?,
                username: row.try_get("username")?,
                email: row.try_get("email")?,
                password_hash: row.try_get("password_hash")?,
            })
        })
        .transpose()
        .map_err(backend)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn insert_profile(&self, profile: NewUserProfile) -> Result<UserProfile, StoreError> {
        let row = sqlx::query(
            r"
            INSERT INTO user_profiles (username, email, first_name, last_name, dob)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, username, email, first_name, last_name, dob
            ",
        )
        .bind(&profile.username)
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.dob)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, |_| format!("username {}", profile.username)))?;

        profile_from_row(&row).map_err(backend)
    }

    async fn profile_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT id, username, email, first_name, last_name, dob
            FROM user_profiles WHERE username = $1
            ",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(profile_from_row).transpose().map_err(backend)
    }
}

#[async_trait]
impl PostStore for PgStore {
    async fn insert_post(&self, post: Post, events: Vec<EventMessage>) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r"
            INSERT INTO posts (id, owner_id, body, media_id, created_at_ms)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(&post.id)
        .bind(post.owner_id)
        .bind(&post.body)
        .bind(&post.media_id)
        .bind(to_i64(post.created_at_ms))
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, |_| format!("post {}", post.id)))?;

        enqueue(&mut tx, &events).await.map_err(backend)?;
        tx.commit().await.map_err(backend)
    }

    async fn post_by_id(&self, id: &str) -> Result<Option<Post>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_id, body, media_id, created_at_ms FROM posts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| -> Result<Post, sqlx::Error> {
            Ok(Post {
                id: row.try_get("id")?,
                owner_id: row.try_get("owner_id")?,
                body: row.try_get("body")?,
                media_id: row.try_get("media_id")?,
                created_at_ms: to_u64(row.try_get("created_at_ms")?),
            })
        })
        .transpose()
        .map_err(backend)
    }
}

#[async_trait]
impl MediaStore for PgStore {
    async fn insert_media(
        &self,
        media: Media,
        events: Vec<EventMessage>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "INSERT INTO media (id, compressed_id, owner_id, status) VALUES ($1, $2, $3, $4)",
        )
        .bind(&media.id)
        .bind(&media.compressed_id)
        .bind(media.owner_id)
        .bind(&media.status)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, |_| format!("media {}", media.id)))?;

        enqueue(&mut tx, &events).await.map_err(backend)?;
        tx.commit().await.map_err(backend)
    }

    async fn media_by_id(&self, id: &str) -> Result<Option<Media>, StoreError> {
        let row = sqlx::query("SELECT id, compressed_id, owner_id, status FROM media WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(media_from_row).transpose().map_err(backend)
    }

    async fn update_media_status(
        &self,
        id: &str,
        compressed_id: &str,
        status: &str,
    ) -> Result<Media, StoreError> {
        let row = sqlx::query(
            r"
            UPDATE media SET compressed_id = $2, status = $3
            WHERE id = $1
            RETURNING id, compressed_id, owner_id, status
            ",
        )
        .bind(id)
        .bind(compressed_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => media_from_row(&row).map_err(backend),
            None => Err(StoreError::NotFound(format!("media {id}"))),
        }
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn pending_events(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, exchange, routing_key, content_type, payload,
                   correlation_id, source, timestamp_ms, attempts, last_error
            FROM outbox_events
            WHERE published_at IS NULL AND attempts < $1
            ORDER BY seq ASC
            LIMIT $2
            ",
        )
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(outbox_from_row)
            .collect::<anyhow::Result<Vec<_>>>()
            .context("failed to parse outbox rows")
            .map_err(StoreError::Backend)
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE outbox_events SET published_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            warn!(event_id = %id, "outbox event not found when marking as published");
            return Err(StoreError::NotFound(format!("outbox event {id}")));
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r"
            UPDATE outbox_events
            SET attempts = attempts + 1, last_error = $2
            WHERE id = $1
            RETURNING attempts
            ",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("outbox event {id}")));
        };
        let attempts: i32 = row.try_get("attempts").map_err(backend)?;
        Ok(u32::try_from(attempts).unwrap_or_default())
    }
}
