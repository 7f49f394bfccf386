//! Opens and closes the claim window of events at their configured times.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use parking_lot::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::platform::Messenger;
use crate::store::{EventRecord, EventStore};

mod timers;

pub use timers::Timers;

pub const START_MESSAGE: &str =
    "The POAP distribution event is now active. *DM me to get your POAP*";
pub const END_MESSAGE: &str = "The POAP distribution event has ended.";

/// Events that currently accept claims. This is the only place the claim path asks.
#[derive(Clone, Default)]
pub struct ClaimWindows {
    open: Arc<RwLock<HashSet<Uuid>>>,
}

impl ClaimWindows {
    pub fn open(&self, event_id: Uuid) -> bool {
        self.open.write().insert(event_id)
    }

    pub fn close(&self, event_id: Uuid) -> bool {
        self.open.write().remove(&event_id)
    }

    pub fn is_open(&self, event_id: Uuid) -> bool {
        self.open.read().contains(&event_id)
    }
}

/// Receives the start and end transitions of events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn event_started(&self, event: &EventRecord) -> Result<()>;
    async fn event_ended(&self, event: &EventRecord) -> Result<()>;
}

/// Announces transitions in the public channel configured for the event.
pub struct ChannelNotifier {
    messenger: Arc<dyn Messenger>,
}

impl ChannelNotifier {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn event_started(&self, event: &EventRecord) -> Result<()> {
        self.messenger
            .send_to_channel(&event.server, &event.channel, START_MESSAGE)
            .await
    }

    async fn event_ended(&self, event: &EventRecord) -> Result<()> {
        self.messenger
            .send_to_channel(&event.server, &event.channel, END_MESSAGE)
            .await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Phase {
    Start,
    End,
}

/// What to do with an event whose start time already passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LateStart {
    /// Start right away, announcement included.
    Announce,
    /// Rejoin the running window quietly, as after a restart.
    Rejoin,
}

/// Where an event stands after scheduling it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheduled {
    /// Waiting for the start time.
    Pending,
    /// The claim window is open, waiting for the end time.
    Running,
    /// Ended or deactivated, nothing is pending.
    Finished,
}

#[derive(Clone)]
pub struct EventScheduler {
    timers: Timers<(Uuid, Phase)>,
    windows: ClaimWindows,
    notifier: Arc<dyn Notifier>,
}

impl EventScheduler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            timers: Timers::default(),
            windows: ClaimWindows::default(),
            notifier,
        }
    }

    pub fn windows(&self) -> ClaimWindows {
        self.windows.clone()
    }

    /// Schedule a freshly configured or updated event, replacing whatever was pending for it.
    /// An event that should already have started starts immediately.
    pub fn schedule_event(&self, event: &EventRecord) -> Scheduled {
        self.plan(event, LateStart::Announce)
    }

    /// Rebuild the timers of all active events that did not end yet, after a restart. Events
    /// that are already running get their end timer back without a second start announcement.
    pub async fn recover(&self, store: &dyn EventStore) -> Result<usize> {
        let events = store.find_active_events_ending_after(Utc::now()).await?;
        info!("Recovering {} pending events", events.len());

        for event in &events {
            info!(
                "Active event: {} | {} - {}",
                event.id, event.start_date, event.end_date
            );
            self.plan(event, LateStart::Rejoin);
        }

        Ok(events.len())
    }

    fn plan(&self, event: &EventRecord, late: LateStart) -> Scheduled {
        // No start or end of this scheduler fires while its timers are rearranged.
        let _exclusive = self.timers.exclusive();
        let now = Utc::now();
        let id = event.id;

        if !event.is_active || event.end_date <= now {
            self.timers.cancel(&(id, Phase::Start));
            self.timers.cancel(&(id, Phase::End));
            self.windows.close(id);
            debug!("Event {} is over, nothing to schedule", id);
            return Scheduled::Finished;
        }

        let end_at = instant_at(event.end_date, now);

        if event.start_date > now {
            self.timers.cancel(&(id, Phase::End));
            self.windows.close(id);

            let start_at = instant_at(event.start_date, now);
            let this = self.clone();
            let fired = event.clone();
            let replaced = self.timers.schedule((id, Phase::Start), start_at, move || {
                this.open(&fired, end_at);
                async move { this.announce_start(&fired).await }
            });

            if replaced {
                info!("Replacing start timer for event {}", id);
            }
            info!(
                "Event {} starting at {}, in {} secs",
                id,
                event.start_date,
                (event.start_date - now).num_seconds()
            );
            return Scheduled::Pending;
        }

        self.timers.cancel(&(id, Phase::Start));
        let was_open = self.windows.is_open(id);
        self.open(event, end_at);

        if late == LateStart::Announce && !was_open {
            let this = self.clone();
            let event = event.clone();
            tokio::spawn(async move { this.announce_start(&event).await });
        } else {
            info!("Rejoined running event {}", id);
        }

        Scheduled::Running
    }

    /// Open the claim window and arm the end timer.
    fn open(&self, event: &EventRecord, end_at: Instant) {
        self.windows.open(event.id);

        let this = self.clone();
        let fired = event.clone();
        let replaced = self.timers.schedule((event.id, Phase::End), end_at, move || {
            this.windows.close(fired.id);
            async move { this.announce_end(&fired).await }
        });

        if replaced {
            info!("Replacing end timer for event {}", event.id);
        }
        info!("Event {} ending at {}", event.id, event.end_date);
    }

    async fn announce_start(&self, event: &EventRecord) {
        info!("Event {} started in {}", event.id, event.server);
        if let Err(e) = self.notifier.event_started(event).await {
            error!("Failed announcing start of event {}: {:?}", event.id, e);
        }
    }

    async fn announce_end(&self, event: &EventRecord) {
        info!("Event {} ended in {}", event.id, event.server);

        if let Err(e) = self.notifier.event_ended(event).await {
            error!("Failed announcing end of event {}: {:?}", event.id, e);
        }
    }

    pub fn is_pending(&self, event_id: Uuid) -> bool {
        self.timers.is_pending(&(event_id, Phase::Start))
            || self.timers.is_pending(&(event_id, Phase::End))
    }
}

/// Monotonic instant for a wall clock time, relative to `now`. Times in the past map to the
/// current instant.
fn instant_at(time: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    Instant::now() + (time - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::store::{fixtures, MemoryEventStore};
    use crate::testing::RecordingNotifier;

    fn event_in(start: i64, end: i64) -> EventRecord {
        let now = Utc::now();
        let mut event = fixtures::event("guild", "secret");
        event.start_date = now + ChronoDuration::seconds(start);
        event.end_date = now + ChronoDuration::seconds(end);
        event
    }

    fn scheduler() -> (EventScheduler, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        (EventScheduler::new(notifier.clone()), notifier)
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        // Let spawned notifications run.
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn window_opens_and_closes_on_time() {
        let (scheduler, notifier) = scheduler();
        let windows = scheduler.windows();
        let event = event_in(10, 20);

        assert_eq!(Scheduled::Pending, scheduler.schedule_event(&event));
        assert!(!windows.is_open(event.id));

        advance(12).await;
        assert!(windows.is_open(event.id));
        assert_eq!((1, 0), notifier.counts(event.id));

        advance(10).await;
        assert!(!windows.is_open(event.id));
        assert_eq!((1, 1), notifier.counts(event.id));
        assert!(!scheduler.is_pending(event.id));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_only_fires_at_new_times() {
        let (scheduler, notifier) = scheduler();
        let windows = scheduler.windows();
        let event = event_in(10, 20);
        scheduler.schedule_event(&event);

        let mut moved = event.clone();
        moved.start_date = event.start_date + ChronoDuration::seconds(20);
        moved.end_date = event.end_date + ChronoDuration::seconds(20);
        scheduler.schedule_event(&moved);

        advance(25).await;
        assert_eq!((0, 0), notifier.counts(event.id));
        assert!(!windows.is_open(event.id));

        advance(10).await;
        assert_eq!((1, 0), notifier.counts(event.id));
        assert!(windows.is_open(event.id));

        advance(10).await;
        assert_eq!((1, 1), notifier.counts(event.id));
        assert!(!windows.is_open(event.id));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_at_the_start_deadline_keeps_one_outcome() {
        let (scheduler, notifier) = scheduler();
        let windows = scheduler.windows();
        let event = event_in(10, 30);
        scheduler.schedule_event(&event);

        // Reschedule exactly when the old start is due.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut moved = event.clone();
        moved.start_date = Utc::now() + ChronoDuration::seconds(50);
        moved.end_date = Utc::now() + ChronoDuration::seconds(110);
        assert_eq!(Scheduled::Pending, scheduler.schedule_event(&moved));
        assert!(!windows.is_open(event.id));

        // The old end passes without opening anything or announcing an end.
        advance(25).await;
        assert!(!windows.is_open(event.id));
        assert_eq!(0, notifier.counts(event.id).1);

        advance(30).await;
        assert!(windows.is_open(event.id));

        advance(60).await;
        assert!(!windows.is_open(event.id));
        assert_eq!(1, notifier.counts(event.id).1);
        assert!(!scheduler.is_pending(event.id));
    }

    #[tokio::test(start_paused = true)]
    async fn late_start_starts_immediately() {
        let (scheduler, notifier) = scheduler();
        let event = event_in(-30, 30);

        assert_eq!(Scheduled::Running, scheduler.schedule_event(&event));
        advance(1).await;

        assert!(scheduler.windows().is_open(event.id));
        assert_eq!((1, 0), notifier.counts(event.id));

        advance(30).await;
        assert_eq!((1, 1), notifier.counts(event.id));
    }

    #[tokio::test(start_paused = true)]
    async fn updating_a_running_event_does_not_announce_again() {
        let (scheduler, notifier) = scheduler();
        let event = event_in(-30, 30);
        scheduler.schedule_event(&event);
        advance(1).await;

        let mut extended = event.clone();
        extended.end_date = event.end_date + ChronoDuration::seconds(60);
        assert_eq!(Scheduled::Running, scheduler.schedule_event(&extended));

        advance(40).await;
        assert_eq!((1, 0), notifier.counts(event.id));
        assert!(scheduler.windows().is_open(event.id));

        advance(60).await;
        assert_eq!((1, 1), notifier.counts(event.id));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_events_are_not_scheduled() {
        let (scheduler, notifier) = scheduler();
        let event = event_in(-60, -30);

        assert_eq!(Scheduled::Finished, scheduler.schedule_event(&event));
        advance(60).await;

        assert_eq!((0, 0), notifier.counts(event.id));
        assert!(!scheduler.is_pending(event.id));
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_rejoins_running_events_quietly() {
        let (scheduler, notifier) = scheduler();
        let store = MemoryEventStore::new();
        let running = event_in(-30, 30);
        let upcoming = event_in(10, 40);
        let finished = event_in(-60, -30);
        for event in [&running, &upcoming, &finished] {
            store.insert_event(event).await.unwrap();
        }

        assert_eq!(2, scheduler.recover(&store).await.unwrap());
        advance(1).await;

        assert!(scheduler.windows().is_open(running.id));
        assert_eq!((0, 0), notifier.counts(running.id));
        assert!(!scheduler.windows().is_open(upcoming.id));

        advance(60).await;
        assert_eq!((0, 1), notifier.counts(running.id));
        assert_eq!((1, 1), notifier.counts(upcoming.id));
        assert_eq!((0, 0), notifier.counts(finished.id));
    }
}
