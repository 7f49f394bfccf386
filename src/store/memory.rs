//! In-memory event store for development mode and tests. Data is lost on restart.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use uuid::Uuid;

use super::{EventRecord, EventStore};
use crate::claim::ClaimError;
use crate::pass;

#[derive(Debug)]
struct CodeRow {
    code: String,
    event_id: Uuid,
    username: Option<String>,
    claimed_date: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    events: HashMap<Uuid, EventRecord>,
    // Insertion order is kept so that tests can reason about the pool.
    codes: Vec<CodeRow>,
    whitelist: HashSet<(Uuid, String)>,
    banned: HashSet<String>,
}

/// All tables live behind one lock, which makes every operation, claims included, atomic.
#[derive(Default)]
pub struct MemoryEventStore {
    state: Mutex<State>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&self, user: &str) {
        self.state.lock().banned.insert(user.to_owned());
    }

    /// Codes of an event and who claimed them, in insertion order.
    pub fn codes(&self, event_id: Uuid) -> Vec<(String, Option<String>)> {
        self.state
            .lock()
            .codes
            .iter()
            .filter(|c| c.event_id == event_id)
            .map(|c| (c.code.clone(), c.username.clone()))
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_event(&self, event: &EventRecord) -> Result<()> {
        let mut state = self.state.lock();
        if state.events.contains_key(&event.id) {
            return Err(anyhow!("event {} already exists", event.id));
        }

        state.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn update_event(&self, event: &EventRecord) -> Result<()> {
        let mut state = self.state.lock();
        let stored = state
            .events
            .get_mut(&event.id)
            .ok_or_else(|| anyhow!("event {} does not exist", event.id))?;

        stored.channel = event.channel.clone();
        stored.start_date = event.start_date;
        stored.end_date = event.end_date;
        stored.response_message = event.response_message.clone();
        stored.pass = event.pass.clone();
        stored.file_url = event.file_url.clone();
        Ok(())
    }

    async fn find_event_by_pass(
        &self,
        pass: &str,
        active_only: bool,
    ) -> Result<Option<EventRecord>> {
        Ok(self
            .state
            .lock()
            .events
            .values()
            .filter(|e| !active_only || e.is_active)
            .find(|e| pass::matches(pass, &e.pass))
            .cloned())
    }

    async fn find_events_by_guild(
        &self,
        guild: &str,
        active_only: bool,
    ) -> Result<Vec<EventRecord>> {
        let mut events: Vec<_> = self
            .state
            .lock()
            .events
            .values()
            .filter(|e| e.server == guild && (!active_only || e.is_active))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_date);
        Ok(events)
    }

    async fn find_active_events_ending_after(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        Ok(self
            .state
            .lock()
            .events
            .values()
            .filter(|e| e.is_active && e.end_date >= now)
            .cloned()
            .collect())
    }

    async fn insert_code(&self, event_id: Uuid, code: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.events.contains_key(&event_id) {
            return Err(anyhow!("event {} does not exist", event_id));
        }
        if state.codes.iter().any(|c| c.code == code) {
            return Ok(false);
        }

        state.codes.push(CodeRow {
            code: code.to_owned(),
            event_id,
            username: None,
            claimed_date: None,
        });
        Ok(true)
    }

    async fn count_codes(&self, event_id: Uuid, claimed_only: bool) -> Result<i64> {
        let count = self
            .state
            .lock()
            .codes
            .iter()
            .filter(|c| c.event_id == event_id && (!claimed_only || c.username.is_some()))
            .count();
        Ok(count as i64)
    }

    async fn claim_random_unclaimed_code(
        &self,
        event_id: Uuid,
        claimant: &str,
    ) -> Result<String, ClaimError> {
        let mut state = self.state.lock();

        let event = state.events.get(&event_id).ok_or(ClaimError::NoSuchEvent)?;
        if event.is_whitelisted
            && !state.whitelist.contains(&(event_id, claimant.to_owned()))
        {
            return Err(ClaimError::NotWhitelisted);
        }

        let mut unclaimed = Vec::new();
        for (idx, code) in state.codes.iter().enumerate() {
            if code.event_id != event_id {
                continue;
            }
            match &code.username {
                Some(user) if user == claimant => return Err(ClaimError::AlreadyClaimed),
                Some(_) => {}
                None => unclaimed.push(idx),
            }
        }

        let idx = *unclaimed
            .choose(&mut rand::thread_rng())
            .ok_or(ClaimError::NoCodesLeft)?;
        let code = &mut state.codes[idx];
        code.username = Some(claimant.to_owned());
        code.claimed_date = Some(Utc::now());

        Ok(code.code.clone())
    }

    async fn is_user_banned(&self, user: &str) -> Result<bool> {
        Ok(self.state.lock().banned.contains(user))
    }

    async fn add_to_whitelist(&self, event_id: Uuid, user: &str) -> Result<()> {
        self.state.lock().whitelist.insert((event_id, user.to_owned()));
        Ok(())
    }
}
