//! Routes decoded platform messages to the dialog, the claim path and the admin commands.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_humanize::HumanTime;
use log::{debug, error, info, warn};

use crate::claim::ClaimArbitrator;
use crate::dialog::{format_time, Answer, DialogEngine};
use crate::models::{Command, Event, Message, MessageRef};
use crate::platform::Messenger;
use crate::scheduler::{ClaimWindows, END_MESSAGE, START_MESSAGE};
use crate::store::{EventRecord, EventStore};

pub const INSTRUCTIONS: &str = ":warning: :warning: :warning: :warning: **You MUST send me a \
                                DIRECT MESSAGE with the code** :warning: :warning: :warning: \
                                :warning:  (click my name)";

pub struct Bot {
    dialog: DialogEngine,
    arbitrator: ClaimArbitrator,
    store: Arc<dyn EventStore>,
    messenger: Arc<dyn Messenger>,
    windows: ClaimWindows,
}

impl Bot {
    pub fn new(
        dialog: DialogEngine,
        arbitrator: ClaimArbitrator,
        store: Arc<dyn EventStore>,
        messenger: Arc<dyn Messenger>,
        windows: ClaimWindows,
    ) -> Self {
        Self {
            dialog,
            arbitrator,
            store,
            messenger,
            windows,
        }
    }

    pub async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::Ping(msg) => {
                info!("Ping message");
                self.reply(msg.reference(), "pong").await;
            }
            Event::Command(command, msg) => self.command(command, &msg).await?,
            Event::Direct(msg) => self.direct(&msg).await?,
            Event::Shutdown => {}
        }

        Ok(())
    }

    async fn command(&self, command: Command, msg: &Message) -> Result<()> {
        let guild = match &msg.guild {
            Some(guild) => guild,
            None => return Ok(()),
        };

        if !msg.is_admin {
            info!(
                "{} lacks permission for {:?} in {}",
                msg.author.name, command, guild
            );
            return Ok(());
        }

        info!("{:?} request from {} in {}", command, msg.author.name, guild);
        match command {
            Command::Setup => {
                self.dialog.begin_setup(&msg.author, guild).await?;
            }
            Command::Update => {
                self.dialog.begin_update(&msg.author, guild).await?;
            }
            Command::Status => self.status(msg, guild).await?,
            Command::Instructions => {
                self.react(msg.reference(), "🤙").await;
                self.reply(msg.reference(), INSTRUCTIONS).await;
            }
        }

        Ok(())
    }

    /// A direct message is either an answer for the running dialog or a claim attempt.
    async fn direct(&self, msg: &Message) -> Result<()> {
        debug!("DM from {}: {}", msg.author.name, msg.content);

        let answer = self
            .dialog
            .submit_answer(msg.author.id, &msg.content, &msg.attachments)
            .await?;
        if answer == Answer::Consumed {
            return Ok(());
        }

        let claimant = msg.author.id.to_string();
        if self.store.is_user_banned(&claimant).await? {
            info!("Ignoring banned user {}/{}", msg.author.name, claimant);
            return Ok(());
        }

        let text = match self.arbitrator.claim(&msg.content, &claimant).await {
            Ok(claimed) => {
                info!("OK for {}/{}", msg.author.name, claimant);
                claimed.response()
            }
            Err(e) if e.is_rejection() => {
                info!("Claim of {}/{} rejected: {}", msg.author.name, claimant, e);
                e.to_string()
            }
            Err(e) => {
                error!("Claim of {}/{} failed: {:?}", msg.author.name, claimant, e);
                "Something went wrong, please try again later".to_owned()
            }
        };

        self.reply(msg.reference(), &text).await;
        Ok(())
    }

    /// Send the admin an overview of every event of the guild that did not end yet.
    async fn status(&self, msg: &Message, guild: &str) -> Result<()> {
        let now = Utc::now();
        let events: Vec<_> = self
            .store
            .find_events_by_guild(guild, true)
            .await?
            .into_iter()
            .filter(|e| e.end_date >= now)
            .collect();

        for event in &events {
            let total = self.store.count_codes(event.id, false).await?;
            let claimed = self.store.count_codes(event.id, true).await?;
            let open = self.windows.is_open(event.id);

            let text = describe(event, total, claimed, open, now);
            if let Err(e) = self.messenger.send_direct(msg.author.id, &text).await {
                warn!("Failed sending status to {}: {:?}", msg.author.name, e);
            }
        }

        if !events.is_empty() {
            self.react(msg.reference(), "🙌").await;
        }

        Ok(())
    }

    async fn reply(&self, to: MessageRef, text: &str) {
        if let Err(e) = self.messenger.reply(to, text).await {
            error!("Failed replying in channel {}: {:?}", to.channel_id, e);
        }
    }

    async fn react(&self, to: MessageRef, emoji: &str) {
        if let Err(e) = self.messenger.react(to, emoji).await {
            error!("Failed reacting in channel {}: {:?}", to.channel_id, e);
        }
    }
}

fn describe(
    event: &EventRecord,
    total: i64,
    claimed: i64,
    open: bool,
    now: DateTime<Utc>,
) -> String {
    let pending = if event.start_date > now {
        format!("Event will start {}", HumanTime::from(event.start_date - now))
    } else if event.end_date > now {
        format!("Event will end {}", HumanTime::from(event.end_date - now))
    } else {
        "Event finished".to_owned()
    };

    format!(
        "Event in guild: {}\n\
         Channel: {}\n\
         Start: {}\n\
         End: {}\n\
         Event start message: {}\n\
         Event end message: {}\n\
         Response to member messages: {}\n\
         Pass to get the code: {}\n\
         Codes url: {}\n\
         Total Codes: {}\n\
         Claimed Codes: {}\n\
         Accepting claims: {}\n\
         {}",
        event.server,
        event.channel,
        format_time(event.start_date),
        format_time(event.end_date),
        START_MESSAGE,
        END_MESSAGE,
        event.response_message,
        event.pass,
        event.file_url.as_deref().unwrap_or("-"),
        total,
        claimed,
        if open { "yes" } else { "no" },
        pending
    )
}
