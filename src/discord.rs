use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::mpsc::Sender;
use twilight_cache_inmemory::{InMemoryCache, ResourceType};
use twilight_gateway::{
    cluster::{Cluster, Events},
    Event,
};
use twilight_http::request::channel::reaction::RequestReactionType;
use twilight_http::Client as HttpClient;
use twilight_model::channel::{ChannelType, Message};
use twilight_model::gateway::Intents;
use twilight_model::id::marker::{ChannelMarker, GuildMarker, UserMarker};
use twilight_model::id::Id;
use twilight_model::user::User;

use crate::models::{self, Command, MessageRef, UserId};
use crate::platform::Messenger;
use crate::settings;

/// Gateway connection state shared between the event loop and outgoing requests.
pub struct Discord {
    http: HttpClient,
    cache: InMemoryCache,
    admin_role: String,
}

pub async fn start(
    settings: &settings::Discord,
    admin_role: &str,
    sender: Sender<models::Event>,
) -> Result<Arc<Discord>> {
    // This is the default scheme. It will automatically create as many
    // shards as is suggested by Discord.
    // (twilight-gateway 0.11: leaving the scheme unset is the automatic scheme.)
    debug!("Using scheme : Auto");

    let intents = Intents::GUILDS
        | Intents::GUILD_MESSAGES
        | Intents::DIRECT_MESSAGES
        | Intents::MESSAGE_CONTENT;

    let (cluster, events) = Cluster::builder(settings.bot_token.clone(), intents)
        .build()
        .await
        .context("failed setting up the Discord gateway")?;
    let cluster = Arc::new(cluster);

    debug!("Cluster set up");

    // Start all shards in the cluster in the background.
    let cluster_spawn = Arc::clone(&cluster);
    tokio::spawn(async move {
        debug!("Spawning cluster");
        cluster_spawn.up().await;

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed setting up CTRL+C listener: {}", e);
        }

        debug!("Stopping cluster");
        cluster_spawn.down();
    });

    // Only guilds, their channels and roles are needed to resolve names and permissions.
    debug!("Setting up cache for twilight");
    let cache = InMemoryCache::builder()
        .resource_types(
            ResourceType::GUILD
                | ResourceType::CHANNEL
                | ResourceType::ROLE
                | ResourceType::USER_CURRENT,
        )
        .build();

    let discord = Arc::new(Discord {
        http: HttpClient::new(settings.bot_token.clone()),
        cache,
        admin_role: admin_role.to_owned(),
    });

    // Handle Discord events on a separate task.
    tokio::spawn(handle_events(Arc::clone(&discord), events, sender));

    Ok(discord)
}

async fn handle_events(discord: Arc<Discord>, mut events: Events, sender: Sender<models::Event>) {
    while let Some((shard_id, event)) = events.next().await {
        debug!("{} | Received event : {:?}", shard_id, event.kind());
        discord.cache.update(&event);

        match event {
            Event::MessageCreate(msg) => {
                let msg = match discord.decode(msg.0) {
                    Some(msg) => msg,
                    None => continue,
                };

                if sender.send(msg).await.is_err() {
                    return;
                }
            }
            Event::ShardConnected(conn) => info!("Connected on shard {}", conn.shard_id),
            Event::Ready(_) => info!("Discord client ready!"),
            _ => {}
        }
    }

    sender.send(models::Event::Shutdown).await.ok();
}

impl Discord {
    /// Turn a gateway message into something the bot reacts to, if it is one.
    fn decode(&self, msg: Message) -> Option<models::Event> {
        if msg.author.bot {
            return None;
        }

        if msg.content == "ping" {
            return Some(models::Event::Ping(self.convert(msg)));
        }

        if msg.guild_id.is_none() {
            info!("DM from {}", msg.author.name);
            return Some(models::Event::Direct(self.convert(msg)));
        }

        let me = self.cache.current_user()?.id;
        if msg.mention_everyone || !msg.mentions.iter().any(|m| m.id == me) {
            return None;
        }

        info!("{} - Message mentions me with: {}", msg.author.name, msg.content);
        let command = Command::parse(&msg.content)?;
        Some(models::Event::Command(command, self.convert(msg)))
    }

    fn convert(&self, m: Message) -> models::Message {
        let guild = m
            .guild_id
            .and_then(|id| self.cache.guild(id).map(|g| g.name().to_owned()));
        let is_admin = m.guild_id.map_or(false, |id| self.is_admin(id, &m));

        models::Message {
            channel_id: m.channel_id.get(),
            message_id: m.id.get(),
            author: m.author.into(),
            content: m.content,
            attachments: m
                .attachments
                .into_iter()
                .map(|a| models::Attachment {
                    filename: a.filename,
                    url: a.url,
                })
                .collect(),
            guild,
            is_admin,
        }
    }

    /// Guild owners and members of the admin role may configure events.
    fn is_admin(&self, guild: Id<GuildMarker>, m: &Message) -> bool {
        let owner = self
            .cache
            .guild(guild)
            .map_or(false, |g| g.owner_id() == m.author.id);

        owner
            || m.member.as_ref().map_or(false, |member| {
                member.roles.iter().any(|id| {
                    self.cache
                        .role(*id)
                        .map_or(false, |r| r.resource().name == self.admin_role)
                })
            })
    }

    fn text_channels(&self, guild: Id<GuildMarker>) -> Vec<(Id<ChannelMarker>, String)> {
        let ids: Vec<_> = match self.cache.guild_channels(guild) {
            Some(ids) => ids.value().iter().copied().collect(),
            None => return Vec::new(),
        };

        ids.into_iter()
            .filter_map(|id| {
                let channel = self.cache.channel(id)?;
                if channel.kind != ChannelType::GuildText {
                    return None;
                }
                channel.name.clone().map(|name| (id, name))
            })
            .collect()
    }
}

#[async_trait]
impl Messenger for Discord {
    fn lookup_guild(&self, name: &str) -> Option<u64> {
        let found = self
            .cache
            .iter()
            .guilds()
            .find(|g| g.value().name() == name)
            .map(|g| g.key().get());

        if found.is_none() {
            info!("Guild {} not found", name);
        }
        found
    }

    fn lookup_channel(&self, guild: u64, name: &str) -> Option<u64> {
        let guild = Id::new_checked(guild)?;
        self.text_channels(guild)
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id.get())
    }

    fn channel_names(&self, guild: u64) -> Vec<String> {
        Id::new_checked(guild)
            .map(|guild| {
                self.text_channels(guild)
                    .into_iter()
                    .map(|(_, name)| name)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn send_to_channel(&self, guild: &str, channel: &str, text: &str) -> Result<()> {
        info!("Sending to {} #{}: {}", guild, channel, text);

        let channel_id = self
            .lookup_guild(guild)
            .and_then(|g| self.lookup_channel(g, channel))
            .and_then(Id::<ChannelMarker>::new_checked)
            .with_context(|| format!("channel #{} not found in {}", channel, guild))?;

        self.http
            .create_message(channel_id)
            .content(text)?
            .exec()
            .await?;

        Ok(())
    }

    async fn send_direct(&self, user: UserId, text: &str) -> Result<()> {
        let user = Id::<UserMarker>::new_checked(user).context("invalid user id")?;

        let channel = self
            .http
            .create_private_channel(user)
            .exec()
            .await?
            .model()
            .await?;

        self.http
            .create_message(channel.id)
            .content(text)?
            .exec()
            .await
            .with_context(|| format!("failed sending DM to {}", user))?;

        debug!("DM sent to {}", user);
        Ok(())
    }

    async fn reply(&self, to: MessageRef, text: &str) -> Result<()> {
        let channel = Id::new_checked(to.channel_id).context("invalid channel id")?;
        let message = Id::new_checked(to.message_id).context("invalid message id")?;

        self.http
            .create_message(channel)
            .reply(message)
            .content(text)?
            .exec()
            .await?;

        Ok(())
    }

    async fn react(&self, to: MessageRef, emoji: &str) -> Result<()> {
        let channel = Id::new_checked(to.channel_id).context("invalid channel id")?;
        let message = Id::new_checked(to.message_id).context("invalid message id")?;

        self.http
            .create_reaction(channel, message, &RequestReactionType::Unicode { name: emoji })
            .exec()
            .await?;

        Ok(())
    }
}

impl From<User> for models::Author {
    fn from(u: User) -> Self {
        Self {
            id: u.id.get(),
            name: u.name,
        }
    }
}
