//! Test doubles for the platform, the notifier and the code source.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::ingest::CodeSource;
use crate::models::{MessageRef, UserId};
use crate::platform::Messenger;
use crate::scheduler::Notifier;
use crate::store::EventRecord;

/// Knows a fixed set of guilds and channels and records everything sent.
#[derive(Default)]
pub struct RecordingMessenger {
    guilds: Vec<(String, Vec<String>)>,
    /// Users with direct messages disabled.
    closed_dms: Vec<UserId>,
    pub direct: Mutex<Vec<(UserId, String)>>,
    pub channel: Mutex<Vec<(String, String, String)>>,
    pub replies: Mutex<Vec<(MessageRef, String)>>,
    pub reactions: Mutex<Vec<(MessageRef, String)>>,
}

impl RecordingMessenger {
    pub fn with_guild(mut self, name: &str, channels: &[&str]) -> Self {
        self.guilds.push((
            name.to_owned(),
            channels.iter().map(|c| (*c).to_owned()).collect(),
        ));
        self
    }

    pub fn with_closed_dms(mut self, user: UserId) -> Self {
        self.closed_dms.push(user);
        self
    }

    /// Direct messages sent to `user`, oldest first.
    pub fn direct_to(&self, user: UserId) -> Vec<String> {
        self.direct
            .lock()
            .iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn last_direct_to(&self, user: UserId) -> Option<String> {
        self.direct_to(user).pop()
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies.lock().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    fn lookup_guild(&self, name: &str) -> Option<u64> {
        self.guilds
            .iter()
            .position(|(guild, _)| guild == name)
            .map(|idx| idx as u64)
    }

    fn lookup_channel(&self, guild: u64, name: &str) -> Option<u64> {
        self.guilds
            .get(guild as usize)?
            .1
            .iter()
            .position(|c| c == name)
            .map(|idx| idx as u64)
    }

    fn channel_names(&self, guild: u64) -> Vec<String> {
        self.guilds
            .get(guild as usize)
            .map(|(_, channels)| channels.clone())
            .unwrap_or_default()
    }

    async fn send_to_channel(&self, guild: &str, channel: &str, text: &str) -> Result<()> {
        self.channel
            .lock()
            .push((guild.to_owned(), channel.to_owned(), text.to_owned()));
        Ok(())
    }

    async fn send_direct(&self, user: UserId, text: &str) -> Result<()> {
        if self.closed_dms.contains(&user) {
            return Err(anyhow!("cannot send messages to this user"));
        }
        self.direct.lock().push((user, text.to_owned()));
        Ok(())
    }

    async fn reply(&self, to: MessageRef, text: &str) -> Result<()> {
        self.replies.lock().push((to, text.to_owned()));
        Ok(())
    }

    async fn react(&self, to: MessageRef, emoji: &str) -> Result<()> {
        self.reactions.lock().push((to, emoji.to_owned()));
        Ok(())
    }
}

/// Counts start and end transitions per event.
#[derive(Default)]
pub struct RecordingNotifier {
    counts: Mutex<HashMap<Uuid, (u32, u32)>>,
}

impl RecordingNotifier {
    /// Number of start and end notifications seen for an event.
    pub fn counts(&self, event_id: Uuid) -> (u32, u32) {
        self.counts
            .lock()
            .get(&event_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn event_started(&self, event: &EventRecord) -> Result<()> {
        self.counts.lock().entry(event.id).or_default().0 += 1;
        Ok(())
    }

    async fn event_ended(&self, event: &EventRecord) -> Result<()> {
        self.counts.lock().entry(event.id).or_default().1 += 1;
        Ok(())
    }
}

/// Serves code lists from memory, keyed by URL.
#[derive(Default)]
pub struct StaticCodes {
    files: HashMap<String, Vec<String>>,
}

impl StaticCodes {
    pub fn with_file(mut self, url: &str, codes: &[&str]) -> Self {
        self.files.insert(
            url.to_owned(),
            codes.iter().map(|c| (*c).to_owned()).collect(),
        );
        self
    }
}

#[async_trait]
impl CodeSource for StaticCodes {
    async fn fetch_codes(&self, url: &str) -> Result<Vec<String>> {
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 for {}", url))
    }
}

/// Serves one code list, but only once the test lets the download finish.
#[derive(Default)]
pub struct GatedCodes {
    codes: Vec<String>,
    /// Signalled when a download begins.
    pub started: Notify,
    /// Signal to let the pending download return.
    pub release: Notify,
}

impl GatedCodes {
    pub fn new(codes: &[&str]) -> Self {
        Self {
            codes: codes.iter().map(|c| (*c).to_owned()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl CodeSource for GatedCodes {
    async fn fetch_codes(&self, _url: &str) -> Result<Vec<String>> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(self.codes.clone())
    }
}
