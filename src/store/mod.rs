//! Typed access to the durable record of events, code pools and participants.
//!
//! The store keeps no state of its own besides the database handle. Everything that has to
//! survive a restart goes through here.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::claim::ClaimError;

mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// A configured distribution event.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct EventRecord {
    pub id: Uuid,
    /// Name of the owning guild.
    pub server: String,
    /// Channel that receives the start and end announcements.
    pub channel: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Sent privately to participants, `{code}` is replaced with the claimed code.
    pub response_message: String,
    pub pass: String,
    /// Comma separated list of the files codes were loaded from.
    pub file_url: Option<String>,
    pub is_whitelisted: bool,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub is_active: bool,
}

impl EventRecord {
    /// Render the response for a participant that received `code`.
    pub fn response_for(&self, code: &str) -> String {
        self.response_message.replace("{code}", code)
    }
}

/// Number of codes that were inserted into a pool and of those that already existed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ingested {
    pub added: usize,
    pub duplicates: usize,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: &EventRecord) -> Result<()>;

    /// Overwrite the configurable fields of an existing event.
    async fn update_event(&self, event: &EventRecord) -> Result<()>;

    /// Find the event whose pass matches `pass` under [`crate::pass::matches`].
    async fn find_event_by_pass(&self, pass: &str, active_only: bool)
        -> Result<Option<EventRecord>>;

    async fn find_events_by_guild(&self, guild: &str, active_only: bool)
        -> Result<Vec<EventRecord>>;

    /// Active events that still have to end, used to rebuild timers after a restart.
    async fn find_active_events_ending_after(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>>;

    /// Add a code to the pool of an event. Returns `false` if the code already exists.
    async fn insert_code(&self, event_id: Uuid, code: &str) -> Result<bool>;

    async fn count_codes(&self, event_id: Uuid, claimed_only: bool) -> Result<i64>;

    /// Atomically hand one random unclaimed code of the event to `claimant`.
    ///
    /// Whitelist membership, an earlier claim of the same claimant and pool exhaustion are
    /// checked within the same atomic unit as the assignment.
    async fn claim_random_unclaimed_code(
        &self,
        event_id: Uuid,
        claimant: &str,
    ) -> Result<String, ClaimError>;

    async fn is_user_banned(&self, user: &str) -> Result<bool>;

    async fn add_to_whitelist(&self, event_id: Uuid, user: &str) -> Result<()>;
}

/// Insert every code into the pool of `event_id`, counting duplicates instead of failing on them.
pub async fn ingest_codes(
    store: &dyn EventStore,
    event_id: Uuid,
    codes: &[String],
) -> Result<Ingested> {
    let mut ingested = Ingested::default();

    for code in codes {
        if store.insert_code(event_id, code).await? {
            ingested.added += 1;
        } else {
            ingested.duplicates += 1;
        }
    }

    Ok(ingested)
}
