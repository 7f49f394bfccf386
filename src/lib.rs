//! A Discord bot that hands out one claim code per member during time-boxed events.
//!
//! Guild admins configure events through a direct-message dialog, the scheduler opens and
//! closes the claim window of every event, and members claim a code by sending the event's
//! pass phrase to the bot.

pub mod bot;
pub mod claim;
pub mod dialog;
pub mod discord;
pub mod ingest;
pub mod models;
pub mod pass;
pub mod platform;
pub mod scheduler;
pub mod settings;
pub mod store;

#[cfg(test)]
mod testing;

pub use bot::Bot;
pub use claim::{ClaimArbitrator, ClaimError, ClaimedCode};
pub use dialog::DialogEngine;
pub use scheduler::{ChannelNotifier, ClaimWindows, EventScheduler};
pub use store::{EventRecord, EventStore, MemoryEventStore, PgEventStore};
