use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use tokio::sync::mpsc;

use poap_bot::ingest::HttpCodeSource;
use poap_bot::models::Event;
use poap_bot::settings::{self, Settings};
use poap_bot::{
    discord, Bot, ChannelNotifier, ClaimArbitrator, DialogEngine, EventScheduler, EventStore,
    MemoryEventStore, PgEventStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Loading .env file
    dotenv::dotenv().ok();
    // Load settings file
    let settings = Settings::new().await?;

    // Setting up an combined logger which will log to the terminal and a file
    init_logger(&settings.logging)?;

    info!("Configuring ...");
    let store = open_store(&settings).await?;

    info!("Starting ...");
    let (tx, mut rx) = mpsc::channel(100);
    let messenger = discord::start(&settings.discord, &settings.bot.admin_role, tx).await?;

    let scheduler = EventScheduler::new(Arc::new(ChannelNotifier::new(messenger.clone())));
    let recovered = scheduler
        .recover(store.as_ref())
        .await
        .context("failed restoring event schedules")?;
    info!("Restored schedules for {} events", recovered);

    let dialog = DialogEngine::new(
        Arc::clone(&store),
        messenger.clone(),
        Arc::new(HttpCodeSource::new(settings.bot.download_timeout)?),
        scheduler.clone(),
        settings.bot.dialog_timeout,
    );
    let arbitrator = ClaimArbitrator::new(
        Arc::clone(&store),
        scheduler.windows(),
        settings.bot.claims.clone(),
    );
    let bot = Arc::new(Bot::new(
        dialog,
        arbitrator,
        store,
        messenger,
        scheduler.windows(),
    ));

    while let Some(event) = rx.recv().await {
        if let Event::Shutdown = event {
            break;
        }

        let bot = Arc::clone(&bot);
        tokio::spawn(async move {
            if let Err(e) = bot.handle(event).await {
                error!("failed handling event: {:?}", e);
            }
        });
    }

    info!("Shutting down");
    Ok(())
}

fn init_logger(settings: &settings::Logging) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();

    if let Some(terminal) = &settings.terminal {
        loggers.push(TermLogger::new(
            terminal.filter,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }

    if let Some(file) = &settings.file {
        let out = File::create(&file.path)
            .with_context(|| format!("failed creating log file at {:?}", file.path))?;
        loggers.push(WriteLogger::new(file.base.filter, Config::default(), out));
    }

    CombinedLogger::init(loggers).context("logger failed to set up")
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn EventStore>> {
    if settings.database.is_in_memory() {
        info!("Using the in-memory store, events are lost on restart");
        return Ok(Arc::new(MemoryEventStore::new()));
    }

    debug!("Connecting to the database");
    let store = PgEventStore::connect(&settings.database.url, settings.bot.claims.lock_timeout)
        .await?;
    Ok(Arc::new(store))
}
