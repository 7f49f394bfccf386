use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::{EventRecord, EventStore};
use crate::claim::ClaimError;
use crate::pass;

const EVENT_COLUMNS: &str = "id, server, channel, start_date, end_date, response_message, pass, \
                             file_url, is_whitelisted, created_by, created_date, is_active";

/// Postgres error raised when `lock_timeout` expires while waiting for a row lock.
const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgEventStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Connect to the database and bring the schema up to date.
    pub async fn connect(url: &str, lock_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .context("failed connecting to the database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed running database migrations")?;

        info!("Database ready");
        Ok(Self::new(pool, lock_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_claim(&self, event_id: Uuid, claimant: &str) -> Result<String, ClaimError> {
        let mut tx = self.pool.begin().await.map_err(claim_error)?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(claim_error)?;

        // Locking the event row serializes all claims of this event, while claims for other
        // events proceed in parallel.
        let is_whitelisted = sqlx::query_scalar::<_, bool>(
            "SELECT is_whitelisted FROM events WHERE id = $1 FOR UPDATE",
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(claim_error)?
        .ok_or(ClaimError::NoSuchEvent)?;

        if is_whitelisted {
            let listed = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM whitelist WHERE event_id = $1 AND user_id = $2)",
            )
            .bind(event_id)
            .bind(claimant)
            .fetch_one(&mut *tx)
            .await
            .map_err(claim_error)?;

            if !listed {
                return Err(ClaimError::NotWhitelisted);
            }
        }

        let claimed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM codes WHERE event_id = $1 AND username = $2)",
        )
        .bind(event_id)
        .bind(claimant)
        .fetch_one(&mut *tx)
        .await
        .map_err(claim_error)?;

        if claimed {
            return Err(ClaimError::AlreadyClaimed);
        }

        let code = sqlx::query_scalar::<_, String>(
            r#"
            SELECT code
            FROM codes
            WHERE event_id = $1 AND username IS NULL
            ORDER BY random()
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(claim_error)?
        .ok_or(ClaimError::NoCodesLeft)?;

        sqlx::query("UPDATE codes SET username = $2, claimed_date = NOW() WHERE code = $1")
            .bind(&code)
            .bind(claimant)
            .execute(&mut *tx)
            .await
            .map_err(claim_error)?;

        tx.commit().await.map_err(claim_error)?;

        Ok(code)
    }
}

/// Translate database failures of the claim transaction into claim outcomes.
fn claim_error(err: sqlx::Error) -> ClaimError {
    let code = err
        .as_database_error()
        .and_then(|e| e.code())
        .map(|c| c.into_owned());

    match code.as_deref() {
        Some(LOCK_NOT_AVAILABLE) => ClaimError::Contended,
        Some(UNIQUE_VIOLATION) => ClaimError::AlreadyClaimed,
        _ => ClaimError::Store(err.into()),
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_event(&self, event: &EventRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, server, channel, start_date, end_date, response_message, pass,
                                file_url, is_whitelisted, created_by, created_date, is_active,
                                pass_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(event.id)
        .bind(&event.server)
        .bind(&event.channel)
        .bind(event.start_date)
        .bind(event.end_date)
        .bind(&event.response_message)
        .bind(&event.pass)
        .bind(&event.file_url)
        .bind(event.is_whitelisted)
        .bind(&event.created_by)
        .bind(event.created_date)
        .bind(event.is_active)
        .bind(pass::normalize(&event.pass))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed saving event {}", event.id))?;

        Ok(())
    }

    async fn update_event(&self, event: &EventRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET channel = $2, start_date = $3, end_date = $4, response_message = $5, pass = $6,
                file_url = $7, pass_key = $8
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(&event.channel)
        .bind(event.start_date)
        .bind(event.end_date)
        .bind(&event.response_message)
        .bind(&event.pass)
        .bind(&event.file_url)
        .bind(pass::normalize(&event.pass))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed updating event {}", event.id))?;

        anyhow::ensure!(
            result.rows_affected() == 1,
            "event {} does not exist",
            event.id
        );
        Ok(())
    }

    async fn find_event_by_pass(
        &self,
        pass: &str,
        active_only: bool,
    ) -> Result<Option<EventRecord>> {
        let key = pass::normalize(pass);
        if key.is_empty() {
            return Ok(None);
        }

        let event = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {} FROM events WHERE pass_key = $1 AND ($2 = FALSE OR is_active) \
             ORDER BY start_date LIMIT 1",
            EVENT_COLUMNS
        ))
        .bind(key)
        .bind(active_only)
        .fetch_optional(&self.pool)
        .await?;

        debug!("Pass lookup matched {:?}", event.as_ref().map(|e| e.id));
        Ok(event)
    }

    async fn find_events_by_guild(
        &self,
        guild: &str,
        active_only: bool,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {} FROM events WHERE server = $1 AND ($2 = FALSE OR is_active) \
             ORDER BY start_date",
            EVENT_COLUMNS
        ))
        .bind(guild)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_active_events_ending_after(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRecord>(&format!(
            "SELECT {} FROM events WHERE is_active AND end_date >= $1 ORDER BY start_date",
            EVENT_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn insert_code(&self, event_id: Uuid, code: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO codes (code, event_id) VALUES ($1, $2) ON CONFLICT (code) DO NOTHING",
        )
        .bind(code)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_codes(&self, event_id: Uuid, claimed_only: bool) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM codes WHERE event_id = $1 AND ($2 = FALSE OR username IS NOT NULL)",
        )
        .bind(event_id)
        .bind(claimed_only)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn claim_random_unclaimed_code(
        &self,
        event_id: Uuid,
        claimant: &str,
    ) -> Result<String, ClaimError> {
        self.try_claim(event_id, claimant).await
    }

    async fn is_user_banned(&self, user: &str) -> Result<bool> {
        let banned = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM banned WHERE user_id = $1)",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;

        Ok(banned)
    }

    async fn add_to_whitelist(&self, event_id: Uuid, user: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO whitelist (event_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(event_id)
        .bind(user)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
