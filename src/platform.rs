//! The operations the bot needs from the messaging platform.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{MessageRef, UserId};

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Find a guild the bot is a member of by its name.
    fn lookup_guild(&self, name: &str) -> Option<u64>;

    /// Find a text channel of a guild by its name.
    fn lookup_channel(&self, guild: u64, name: &str) -> Option<u64>;

    /// Names of all text channels of a guild, to help admins pick one.
    fn channel_names(&self, guild: u64) -> Vec<String>;

    async fn send_to_channel(&self, guild: &str, channel: &str, text: &str) -> Result<()>;

    async fn send_direct(&self, user: UserId, text: &str) -> Result<()>;

    async fn reply(&self, to: MessageRef, text: &str) -> Result<()>;

    async fn react(&self, to: MessageRef, emoji: &str) -> Result<()>;
}
