use anyhow::Result;
use serenity::{
    async_trait,
    model::gateway::{GatewayIntents, Ready},
    prelude::{Context, EventHandler},
    Client,
};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use open_music_engine::{
    audio::{EventBus, PlaybackNotice, SessionRegistry},
    cache::{CachedTrack, MetadataCache},
    config::Config,
    sources::{CachedResolver, DirectUrlResolver},
    storage::JsonCacheStore,
    transport::SongbirdTransport,
};

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("✅ Connected as {} to {} guilds", ready.user.name, ready.guilds.len());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_engine=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Starting Open Music engine v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    if config.discord_token.is_empty() {
        anyhow::bail!("DISCORD_TOKEN must be set");
    }
    info!("{}", config.summary());

    // Metadata cache, warmed from disk and swept in the background
    let store = Arc::new(JsonCacheStore::<CachedTrack>::new(config.cache_dir()).await?);
    let cache = Arc::new(MetadataCache::with_store(config.cache_max_age, store));
    let warmed = cache.load().await;
    info!("💾 Metadata cache warmed with {} entries", warmed);

    let shutdown = CancellationToken::new();
    let eviction = cache
        .clone()
        .spawn_eviction(config.cache_eviction_interval, shutdown.clone());

    let resolver = Arc::new(CachedResolver::new(DirectUrlResolver::new(), cache.clone()));

    // Voice transport and sessions
    let songbird = Songbird::serenity();
    let bus = EventBus::new();
    let transport = Arc::new(SongbirdTransport::new(songbird.clone(), bus.clone()));
    let registry = SessionRegistry::new(transport, bus, config.engine_settings());

    tokio::spawn(log_notices(registry.clone()));

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler)
        .register_songbird_with(songbird)
        .await?;

    {
        let mut data = client.data.write().await;
        data.insert::<SessionRegistry>(registry.clone());
        data.insert::<CachedResolver<DirectUrlResolver>>(resolver);
    }

    let shard_manager = client.shard_manager.clone();
    tokio::spawn({
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Could not listen for Ctrl+C: {:?}", e);
                return;
            }
            info!("⚠️ Shutdown signal received, closing sessions...");
            registry.shutdown().await;
            shutdown.cancel();
            shard_manager.shutdown_all().await;
        }
    });

    info!("🚀 Engine running");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    shutdown.cancel();
    if let Err(e) = eviction.await {
        warn!("Cache eviction task ended abnormally: {:?}", e);
    }
    let metrics = cache.metrics();
    info!(
        "📊 Cache: {} hits, {} misses, {} evictions ({:.0}% hit rate)",
        metrics.hits,
        metrics.misses,
        metrics.evictions,
        metrics.hit_rate() * 100.0
    );

    Ok(())
}

/// Stand-in for a front-end: reports playback notices in the log.
async fn log_notices(registry: SessionRegistry) {
    let mut notices = registry.subscribe();
    loop {
        match notices.recv().await {
            Ok(PlaybackNotice::TrackStarted { guild_id, title, .. }) => {
                info!("🎶 [{}] Now playing: {}", guild_id, title)
            }
            Ok(PlaybackNotice::TrackErrored { guild_id, title, cause })
            | Ok(PlaybackNotice::TrackAbandoned { guild_id, title, cause }) => {
                warn!("[{}] {} failed: {}", guild_id, title, cause)
            }
            Ok(notice) => info!("{:?}", notice),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Notice log fell behind, {} notices skipped", missed)
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
