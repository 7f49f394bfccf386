//! The private question and answer dialog admins use to configure events.
//!
//! Only one dialog can run at a time. It is bound to the admin that started it and is dropped
//! after completion, on `!cancel`, or when the admin stops answering for too long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::ingest::CodeSource;
use crate::models::{Attachment, Author, UserId};
use crate::pass;
use crate::platform::Messenger;
use crate::scheduler::EventScheduler;
use crate::store::{self, EventRecord, EventStore};

mod session;

pub use session::{format_time, parse_time, Draft, Mode, Session, Step, DEFAULT_RESPONSE};

const CANCEL: &str = "!cancel";
const KEEP: &str = "-";

/// Answers that can't be accepted for the current step. The step is asked again.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Unknown codeword, try again")]
    UnknownEvent,
    #[error("I can't find a channel named {name}. Try again -> {available}")]
    UnknownChannel { name: String, available: String },
    #[error("mmmm {0} It's a valid date? Try again 🙏")]
    InvalidDate(String),
    #[error("The end has to be after the start ({0}). Try again 🙏")]
    EndBeforeStart(String),
    #[error("Please choose a secret pass for your users")]
    PassRequired,
    #[error("Please choose another secret pass. Try again 🙏")]
    PassTaken,
    #[error("No file attachment found! Attach your links.txt file, or answer - to skip")]
    MissingAttachment,
    #[error("I couldn't read {0}. Send another file!")]
    Unreadable(String),
    #[error("I couldn't find any codes in {0}. Send another file!")]
    NoCodes(String),
}

/// Result of trying to start a dialog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Begin {
    Started,
    /// Another dialog is running, nothing changed.
    Busy,
    /// An update was requested for a guild without events.
    NoEvents,
}

/// Whether a direct message was taken by the dialog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Answer {
    Consumed,
    /// No dialog is running for this user, the message is for someone else.
    NotForDialog,
}

enum Transition {
    Advance(Step),
    Reprompt(InputError),
    /// All steps answered, with the codes to add to the pool.
    Finish(Vec<String>),
}

#[derive(Clone)]
pub struct DialogEngine {
    session: Arc<Mutex<Option<Session>>>,
    turn: Arc<Mutex<()>>,
    next_id: Arc<AtomicU64>,
    store: Arc<dyn EventStore>,
    messenger: Arc<dyn Messenger>,
    codes: Arc<dyn CodeSource>,
    scheduler: EventScheduler,
    timeout: Duration,
}

impl DialogEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        messenger: Arc<dyn Messenger>,
        codes: Arc<dyn CodeSource>,
        scheduler: EventScheduler,
        timeout: Duration,
    ) -> Self {
        Self {
            session: Arc::default(),
            turn: Arc::default(),
            next_id: Arc::default(),
            store,
            messenger,
            codes,
            scheduler,
            timeout,
        }
    }

    /// Start configuring a new event for `guild`.
    pub async fn begin_setup(&self, user: &Author, guild: &str) -> Result<Begin> {
        let draft = Draft::new(guild, &user.name);
        let session = self.new_session(Mode::Setup, Step::Channel, draft, user);
        let first = prompt(Step::Channel, &session.draft);

        if let Err(holder) = self.occupy(session).await {
            self.reject_busy(user, &holder).await;
            return Ok(Begin::Busy);
        }

        info!("Setup of a new event in {} by {}", guild, user.name);
        self.tell(
            user.id,
            &format!(
                "Hi {}! You want to set me up for an event in {}? I'll ask for the details, one \
                 at a time.",
                user.name, guild
            ),
        )
        .await;
        self.tell(user.id, "To accept the suggested value, respond with \"-\"")
            .await;
        self.tell(user.id, &first).await;

        Ok(Begin::Started)
    }

    /// Start editing one of the active events of `guild`.
    pub async fn begin_update(&self, user: &Author, guild: &str) -> Result<Begin> {
        if let Some(holder) = self.holder().await {
            self.reject_busy(user, &holder).await;
            return Ok(Begin::Busy);
        }

        let mut events = self.store.find_events_by_guild(guild, true).await?;
        if events.is_empty() {
            self.tell(user.id, &format!("No events in server {}", guild))
                .await;
            return Ok(Begin::NoEvents);
        }

        let (session, first) = if events.len() == 1 {
            let draft = Draft::from(events.remove(0));
            let session = self.new_session(Mode::Update, Step::Channel, draft, user);
            let first = prompt(Step::Channel, &session.draft);
            (session, first)
        } else {
            let passes: Vec<_> = events.iter().map(|e| e.pass.as_str()).collect();
            let first = format!(
                "Which event do you want to update? Enter the corresponding codeword (`{}`)",
                passes.join("`, `")
            );
            let draft = Draft::new(guild, &user.name);
            (self.new_session(Mode::Update, Step::Select, draft, user), first)
        };

        if let Err(holder) = self.occupy(session).await {
            self.reject_busy(user, &holder).await;
            return Ok(Begin::Busy);
        }

        info!("Update of events in {} by {}", guild, user.name);
        self.tell(
            user.id,
            "Okay, let's update your event! I'll take you through the same dialog you already \
             know and love. On each step you can enter '-' to keep your old setting.",
        )
        .await;
        self.tell(user.id, &first).await;

        Ok(Begin::Started)
    }

    /// Feed a direct message from `user` into the running dialog, if it belongs to them.
    ///
    /// The session lock is only held to read and write the session. Everybody else's messages
    /// never wait for the downloads, store calls and messages an answer causes.
    pub async fn submit_answer(
        &self,
        user: UserId,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<Answer> {
        if !self.is_owner(user).await {
            return Ok(Answer::NotForDialog);
        }

        // Answers of the owner are handled one after another.
        let _turn = self.turn.lock().await;
        let text = text.trim();

        let snapshot = {
            let mut current = self.session.lock().await;
            match current.as_mut() {
                Some(session) if session.owner == user => {
                    session.deadline = Instant::now() + self.timeout;
                    if text.eq_ignore_ascii_case(CANCEL) {
                        info!("Dialog {} cancelled by its owner", session.id);
                        *current = None;
                        None
                    } else {
                        Some((session.id, session.step, session.draft.clone()))
                    }
                }
                _ => return Ok(Answer::NotForDialog),
            }
        };

        let (id, step, mut draft) = match snapshot {
            Some(snapshot) => snapshot,
            None => {
                self.tell(user, "Okay, setup cancelled. Nothing was saved.")
                    .await;
                return Ok(Answer::Consumed);
            }
        };

        let transition = match self.answer(step, &mut draft, text, attachments).await {
            Ok(transition) => transition,
            Err(e) => {
                error!("Failed handling answer for step {:?}: {:?}", step, e);
                self.tell(user, "Something went wrong on my side, please answer again.")
                    .await;
                return Ok(Answer::Consumed);
            }
        };

        let mut current = self.session.lock().await;
        let session = match current.as_mut() {
            Some(session) if session.id == id => session,
            _ => {
                info!("Dialog {} ended while its {:?} answer was handled", id, step);
                return Ok(Answer::Consumed);
            }
        };

        let reply = match transition {
            Transition::Advance(next) => {
                session.step = next;
                session.draft = draft;
                prompt(next, &session.draft)
            }
            Transition::Reprompt(reason) => {
                info!("Rejected answer for step {:?}: {}", step, reason);
                reason.to_string()
            }
            Transition::Finish(codes) => {
                session.draft = draft;
                let finished = current.take();
                drop(current);

                if let Some(session) = finished {
                    self.complete(session, codes).await;
                }
                return Ok(Answer::Consumed);
            }
        };
        drop(current);

        self.tell(user, &reply).await;
        Ok(Answer::Consumed)
    }

    /// Whether a dialog is currently running.
    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// A copy of the current draft, if a dialog is running.
    pub async fn draft(&self) -> Option<Draft> {
        self.session.lock().await.as_ref().map(|s| s.draft.clone())
    }

    pub async fn step(&self) -> Option<Step> {
        self.session.lock().await.as_ref().map(|s| s.step)
    }

    fn new_session(&self, mode: Mode, step: Step, draft: Draft, user: &Author) -> Session {
        Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            mode,
            step,
            draft,
            owner: user.id,
            owner_name: user.name.clone(),
            deadline: Instant::now() + self.timeout,
        }
    }

    /// Install `session` unless another one is running. Returns the name of the admin holding
    /// the running one.
    async fn occupy(&self, session: Session) -> Result<(), String> {
        let mut current = self.session.lock().await;
        if let Some(running) = &*current {
            return Err(running.owner_name.clone());
        }

        self.watch_expiry(session.id);
        *current = Some(session);
        Ok(())
    }

    async fn holder(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.owner_name.clone())
    }

    async fn is_owner(&self, user: UserId) -> bool {
        matches!(&*self.session.lock().await, Some(session) if session.owner == user)
    }

    async fn reject_busy(&self, user: &Author, holder: &str) {
        warn!(
            "{} tried to start a dialog while {} is configuring an event",
            user.name, holder
        );
        self.tell(
            user.id,
            &format!(
                "{} is currently setting up an event with me. Please try again once they are done.",
                holder
            ),
        )
        .await;
    }

    /// Apply `text` to a copy of the draft. Runs without holding the session lock.
    async fn answer(
        &self,
        step: Step,
        draft: &mut Draft,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<Transition> {
        let transition = match step {
            Step::Select => {
                let events = self.store.find_events_by_guild(&draft.server, true).await?;
                match events.into_iter().find(|e| pass::matches(text, &e.pass)) {
                    Some(event) => {
                        *draft = Draft::from(event);
                        Transition::Advance(Step::Channel)
                    }
                    None => Transition::Reprompt(InputError::UnknownEvent),
                }
            }
            Step::Channel => {
                let answer = if text == KEEP {
                    draft.channel.clone().unwrap_or_default()
                } else {
                    text.strip_prefix('#').unwrap_or(text).to_owned()
                };

                match self.check_channel(&draft.server, &answer) {
                    Ok(()) => {
                        draft.channel = Some(answer);
                        Transition::Advance(Step::Start)
                    }
                    Err(e) => Transition::Reprompt(e),
                }
            }
            Step::Start => {
                if text == KEEP {
                    if draft.start_date.is_none() {
                        draft.start_date = Some(Utc::now());
                    }
                    Transition::Advance(Step::End)
                } else if let Some(start) = parse_time(text) {
                    draft.start_date = Some(start);
                    Transition::Advance(Step::End)
                } else {
                    Transition::Reprompt(InputError::InvalidDate(text.to_owned()))
                }
            }
            Step::End => {
                let start = draft.start_date.unwrap_or_else(Utc::now);
                let end = if text == KEEP {
                    Some(draft.end_date.unwrap_or_else(|| default_end(start)))
                } else {
                    parse_time(text)
                };

                match end {
                    None => Transition::Reprompt(InputError::InvalidDate(text.to_owned())),
                    Some(end) if end <= start => {
                        Transition::Reprompt(InputError::EndBeforeStart(format_time(start)))
                    }
                    Some(end) => {
                        draft.end_date = Some(end);
                        Transition::Advance(Step::Response)
                    }
                }
            }
            Step::Response => {
                if text == KEEP {
                    if draft.response_message.is_none() {
                        draft.response_message = Some(DEFAULT_RESPONSE.to_owned());
                    }
                } else {
                    draft.response_message = Some(text.to_owned());
                }
                Transition::Advance(Step::Pass)
            }
            Step::Pass => {
                if text == KEEP {
                    match draft.pass {
                        Some(_) => Transition::Advance(Step::File),
                        None => Transition::Reprompt(InputError::PassRequired),
                    }
                } else if pass::normalize(text).is_empty() {
                    Transition::Reprompt(InputError::PassRequired)
                } else {
                    let taken = self
                        .store
                        .find_event_by_pass(text, true)
                        .await?
                        .map_or(false, |e| e.id != draft.id);

                    if taken {
                        Transition::Reprompt(InputError::PassTaken)
                    } else {
                        info!("Pass for event {} chosen", draft.id);
                        draft.pass = Some(text.to_owned());
                        Transition::Advance(Step::File)
                    }
                }
            }
            Step::File => {
                if text == KEEP {
                    Transition::Finish(Vec::new())
                } else if let Some(file) = attachments.first() {
                    info!("File {} ({}) is attached", file.filename, file.url);
                    match self.codes.fetch_codes(&file.url).await {
                        Ok(codes) if codes.is_empty() => {
                            Transition::Reprompt(InputError::NoCodes(file.filename.clone()))
                        }
                        Ok(codes) => {
                            draft.append_file_url(&file.url);
                            Transition::Finish(codes)
                        }
                        Err(e) => {
                            warn!("Failed reading code file {}: {:?}", file.url, e);
                            Transition::Reprompt(InputError::Unreadable(file.filename.clone()))
                        }
                    }
                } else {
                    Transition::Reprompt(InputError::MissingAttachment)
                }
            }
        };

        Ok(transition)
    }

    fn check_channel(&self, guild: &str, name: &str) -> Result<(), InputError> {
        let guild_id = self.messenger.lookup_guild(guild);
        let found = guild_id.and_then(|id| self.messenger.lookup_channel(id, name));

        match (guild_id, found) {
            (_, Some(_)) => Ok(()),
            (id, None) => Err(InputError::UnknownChannel {
                name: name.to_owned(),
                available: id
                    .map(|id| self.messenger.channel_names(id))
                    .unwrap_or_default()
                    .iter()
                    .map(|c| format!("#{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Persist the finished draft, fill its pool and hand it to the scheduler. Nothing is
    /// scheduled unless the event was stored.
    async fn complete(&self, session: Session, codes: Vec<String>) {
        let owner = session.owner;
        let event = match session.draft.to_record() {
            Ok(event) => event,
            Err(e) => {
                error!("Dialog {} finished with an incomplete draft: {:?}", session.id, e);
                self.tell(owner, "Something went wrong, the event was not saved. Please start again.")
                    .await;
                return;
            }
        };

        let saved = match session.mode {
            Mode::Setup => self.store.insert_event(&event).await,
            Mode::Update => self.store.update_event(&event).await,
        };
        if let Err(e) = saved {
            error!("Failed saving event {}: {:?}", event.id, e);
            self.tell(
                owner,
                "I couldn't save the event, so nothing was scheduled. Please start again.",
            )
            .await;
            return;
        }

        if !codes.is_empty() {
            self.fill_pool(owner, &event, &codes).await;
        }

        self.tell(
            owner,
            "Thank you. That's everything. I'll start the event at the appointed time.",
        )
        .await;

        info!("Dialog {} completed, event {} saved", session.id, event.id);
        self.scheduler.schedule_event(&event);
    }

    async fn fill_pool(&self, owner: UserId, event: &EventRecord, codes: &[String]) {
        match store::ingest_codes(self.store.as_ref(), event.id, codes).await {
            Ok(ingested) => {
                info!(
                    "Added {} codes to event {}, {} duplicates",
                    ingested.added, event.id, ingested.duplicates
                );
                self.tell(owner, &format!("DONE! {} codes added", ingested.added))
                    .await;
                if ingested.duplicates > 0 {
                    self.tell(owner, &format!("{} duplicates detected", ingested.duplicates))
                        .await;
                }
                if ingested.added == 0 {
                    self.tell(
                        owner,
                        "No new codes were added. Use !update to send another file.",
                    )
                    .await;
                }
            }
            Err(e) => {
                error!("Failed adding codes to event {}: {:?}", event.id, e);
                self.tell(
                    owner,
                    "The event was saved, but adding the codes failed. Use !update to send the \
                     file again.",
                )
                .await;
            }
        }
    }

    /// Drop the session `id` once its deadline passes without being extended.
    fn watch_expiry(&self, id: u64) {
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                let deadline = match &*this.session.lock().await {
                    Some(session) if session.id == id => session.deadline,
                    _ => return,
                };

                tokio::time::sleep_until(deadline).await;

                let mut current = this.session.lock().await;
                let owner = match &*current {
                    Some(session) if session.id == id => {
                        if Instant::now() < session.deadline {
                            continue;
                        }
                        session.owner
                    }
                    _ => return,
                };

                info!("Dialog {} expired", id);
                *current = None;
                drop(current);

                this.tell(
                    owner,
                    "Setup expired before answers received. Start again if you wish to complete \
                     setup.",
                )
                .await;
                return;
            }
        });
    }

    /// Send a direct message, logging instead of failing when it can't be delivered.
    async fn tell(&self, user: UserId, text: &str) {
        if let Err(e) = self.messenger.send_direct(user, text).await {
            warn!("Failed sending direct message to {}: {:?}", user, e);
        }
    }
}

fn default_end(start: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    start + chrono::Duration::hours(1)
}

/// The question for `step`, with the value that `-` keeps.
fn prompt(step: Step, draft: &Draft) -> String {
    match step {
        Step::Select => "Which event do you want to update? Enter its codeword".to_owned(),
        Step::Channel => format!(
            "First: which channel should I speak in public? ({}) *Hint: only for start and end \
             event",
            draft.channel.as_deref().unwrap_or_default()
        ),
        Step::Start => format!(
            "Date and time to START 🛫 ? *Hint: Time in UTC this format 👉  yyyy-mm-dd hh:mm ({})",
            format_time(draft.start_date.unwrap_or_else(Utc::now))
        ),
        Step::End => format!(
            "Date and time to END 🛬  the event? ({})",
            format_time(
                draft
                    .end_date
                    .unwrap_or_else(|| default_end(draft.start_date.unwrap_or_else(Utc::now)))
            )
        ),
        Step::Response => format!(
            "Response to send privately to members during the event? ({})",
            draft.response_message.as_deref().unwrap_or(DEFAULT_RESPONSE)
        ),
        Step::Pass => format!(
            "Choose secret 🔒 pass (like a word, a hash from youtube or a complete link). This \
             pass is for your users.{}",
            draft
                .pass
                .as_ref()
                .map(|p| format!(" ({})", p))
                .unwrap_or_default()
        ),
        Step::File => format!(
            "Please attach your links.txt file{}",
            draft
                .file_url
                .as_ref()
                .map(|u| format!(" ({}), or answer - to keep the current codes", u))
                .unwrap_or_else(|| ", or answer - to add codes later".to_owned())
        ),
    }
}
