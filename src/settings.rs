//! Authentication, logging and behaviour settings for the bot.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use simplelog::LevelFilter;
use tokio::fs;

/// Main structure that holds all the settings of this bot.
pub struct Settings {
    /// Logger specific configuration.
    pub logging: Logging,
    /// Discord related settings.
    pub discord: Discord,
    /// Where events and codes are stored.
    pub database: Database,
    /// Dialog and claim behaviour.
    pub bot: Bot,
}

/// All configuration for the logging of the bot, including different logging backends like a file
/// or the terminal.
#[derive(Deserialize)]
pub struct Logging {
    /// Logging settings for the terminal backend.
    pub terminal: Option<BaseLogger>,
    /// File backend settings.
    pub file: Option<FileLogger>,
}

/// The base logger describes the very basic settings that apply to each logging backend.
#[derive(Deserialize)]
pub struct BaseLogger {
    /// Maximum logging level that the backend outputs.
    #[serde(with = "SerdeLevelFilter")]
    pub filter: LevelFilter,
}

/// Logging configuration specific to file backends.
#[derive(Deserialize)]
pub struct FileLogger {
    /// base logging backend configuration.
    #[serde(flatten)]
    pub base: BaseLogger,
    /// Location of the file to write logs to.
    pub path: PathBuf,
}

/// Configuration for the Discord API.
#[derive(Deserialize)]
pub struct Discord {
    /// A token to authenticate against the Discord API as a bot and send messages.
    pub bot_token: String,
}

/// Connection settings for the event store.
#[derive(Deserialize)]
pub struct Database {
    /// A Postgres connection URL, or `memory://` to keep everything in memory.
    pub url: String,
}

impl Database {
    pub fn is_in_memory(&self) -> bool {
        self.url.starts_with("memory:")
    }
}

/// Behaviour of the configuration dialog and the claim path.
#[derive(Deserialize)]
#[serde(default)]
pub struct Bot {
    /// Members of this role may configure events, next to the guild owner.
    pub admin_role: String,
    /// Time without an answer after which a configuration dialog is dropped.
    #[serde(deserialize_with = "human_duration")]
    pub dialog_timeout: Duration,
    /// Upper bound for downloading an attached code file.
    #[serde(deserialize_with = "human_duration")]
    pub download_timeout: Duration,
    pub claims: Claims,
}

impl Default for Bot {
    fn default() -> Self {
        Self {
            admin_role: "POAP MASTER".to_owned(),
            dialog_timeout: Duration::from_secs(300),
            download_timeout: Duration::from_secs(30),
            claims: Claims::default(),
        }
    }
}

/// Lock contention handling for code claims.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Claims {
    /// How many times a claim is attempted before giving up on a busy event.
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on every further one.
    #[serde(deserialize_with = "human_duration")]
    pub initial_backoff: Duration,
    /// How long a single claim waits for the event lock inside the database.
    #[serde(deserialize_with = "human_duration")]
    pub lock_timeout: Duration,
}

impl Default for Claims {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// A wrapper for the [LevelFilter] that allows to use it in [serde], as it doesn't provide support
/// for it out of the box.
#[derive(Deserialize)]
#[serde(remote = "LevelFilter", rename_all = "lowercase")]
enum SerdeLevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Parse durations like `5m` or `250ms` with [humantime].
fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(&value).map_err(de::Error::custom)
}

/// An intermediate structure for the authentication related settings that allows to parse them
/// separately and merge them into a single [Settings] structure later.
#[derive(Deserialize)]
struct Auth {
    discord: Discord,
    database: Database,
}

impl Settings {
    /// Create a new instance of the settings and fill it with the configuration from the
    /// `config/log.toml`, `config/auth.toml` and optional `config/bot.toml` files. All auth
    /// related settings are overwritten by env vars if they exist.
    pub async fn new() -> Result<Self> {
        let logging = load_toml("config/log.toml").await?;
        let Auth {
            mut discord,
            mut database,
        } = load_toml("config/auth.toml").await?;

        let bot = if fs::metadata("config/bot.toml").await.is_ok() {
            load_toml("config/bot.toml").await?
        } else {
            Bot::default()
        };

        if let Ok(bot_token) = env::var("DISCORD_BOT_TOKEN") {
            discord.bot_token = bot_token;
        }

        if let Ok(url) = env::var("DATABASE_URL") {
            database.url = url;
        }

        Ok(Self {
            logging,
            discord,
            database,
            bot,
        })
    }
}

/// Load any deserializable structure from the given file path as TOML and provide helpful error
/// messages in case something goes wrong during the process.
async fn load_toml<T>(path: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read(path)
        .await
        .with_context(|| format!("failed loading config file at '{}'", path))?;

    toml::from_slice(&content)
        .with_context(|| format!("failed to parse TOML config from '{}'", path))
}
