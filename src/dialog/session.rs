use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::UserId;
use crate::store::EventRecord;

pub const DEFAULT_RESPONSE: &str = "Thanks for participating in the event. Here is a link where \
                                    you can claim your POAP token: {code} ";

/// Whether the dialog creates a new event or edits an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Setup,
    Update,
}

/// The question the dialog is waiting an answer for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Select,
    Channel,
    Start,
    End,
    Response,
    Pass,
    File,
}

/// An event under construction. Fields stay empty until the matching step was answered, or
/// carry the stored values when updating.
#[derive(Clone, Debug, PartialEq)]
pub struct Draft {
    pub id: Uuid,
    pub server: String,
    pub channel: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub response_message: Option<String>,
    pub pass: Option<String>,
    pub file_url: Option<String>,
    pub is_whitelisted: bool,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
}

impl Draft {
    pub fn new(server: &str, created_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            server: server.to_owned(),
            channel: None,
            start_date: None,
            end_date: None,
            response_message: None,
            pass: None,
            file_url: None,
            is_whitelisted: false,
            created_by: created_by.to_owned(),
            created_date: Utc::now(),
        }
    }

    pub fn append_file_url(&mut self, url: &str) {
        self.file_url = Some(match self.file_url.take() {
            Some(urls) => format!("{}, {}", urls, url),
            None => url.to_owned(),
        });
    }

    pub fn to_record(&self) -> Result<EventRecord> {
        let missing = |field| anyhow!("draft {} has no {}", self.id, field);

        Ok(EventRecord {
            id: self.id,
            server: self.server.clone(),
            channel: self.channel.clone().ok_or_else(|| missing("channel"))?,
            start_date: self.start_date.ok_or_else(|| missing("start date"))?,
            end_date: self.end_date.ok_or_else(|| missing("end date"))?,
            response_message: self
                .response_message
                .clone()
                .unwrap_or_else(|| DEFAULT_RESPONSE.to_owned()),
            pass: self.pass.clone().ok_or_else(|| missing("pass"))?,
            file_url: self.file_url.clone(),
            is_whitelisted: self.is_whitelisted,
            created_by: self.created_by.clone(),
            created_date: self.created_date,
            is_active: true,
        })
    }
}

impl From<EventRecord> for Draft {
    fn from(event: EventRecord) -> Self {
        Self {
            id: event.id,
            server: event.server,
            channel: Some(event.channel),
            start_date: Some(event.start_date),
            end_date: Some(event.end_date),
            response_message: Some(event.response_message),
            pass: Some(event.pass),
            file_url: event.file_url,
            is_whitelisted: event.is_whitelisted,
            created_by: event.created_by,
            created_date: event.created_date,
        }
    }
}

/// The single live configuration dialog.
#[derive(Debug)]
pub struct Session {
    /// Distinguishes this session from later ones, for the inactivity watcher.
    pub id: u64,
    pub mode: Mode,
    pub step: Step,
    pub draft: Draft,
    pub owner: UserId,
    pub owner_name: String,
    pub deadline: Instant,
}

const FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse an admin supplied date and time. Times without offset are taken as UTC, a bare date
/// means midnight.
pub fn parse_time(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return Some(time.with_timezone(&Utc));
    }

    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(input, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// The way times are shown in prompts.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M").to_string()
}
