use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use serenity::{
    model::id::{ChannelId, GuildId, UserId},
    prelude::TypeMapKey,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{sync::broadcast, time::timeout};
use tracing::{debug, info, warn};

use super::{
    events::{CloseReason, EventBus, PlaybackNotice},
    queue::{LoopMode, QueuedTrack, QueuedTrackHandle},
    session::{spawn_session, QueueSnapshot, SessionContext, SessionHandle, SessionId},
};
use crate::{
    config::EngineSettings,
    error::{PlaybackResult, TransportError, ValidationError},
    sources::PlayableTrack,
    transport::VoiceTransport,
};

const NOTICE_CAPACITY: usize = 256;

/// Process-wide map from guild to its single live session.
///
/// This is the surface the command front-end talks to. Every method is safe
/// to call concurrently; creation for one guild is atomic on the map entry.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: Arc<DashMap<GuildId, SessionHandle>>,
    bus: EventBus,
    transport: Arc<dyn VoiceTransport>,
    settings: EngineSettings,
    notices: broadcast::Sender<PlaybackNotice>,
    next_session: AtomicU64,
    play_ids: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn VoiceTransport>, bus: EventBus, settings: EngineSettings) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Arc::new(DashMap::new()),
                bus,
                transport,
                settings,
                notices,
                next_session: AtomicU64::new(1),
                play_ids: Arc::new(AtomicU64::new(1)),
            }),
        }
    }

    /// Returns the guild's session, starting one if there is none.
    pub fn get_or_create(&self, guild_id: GuildId) -> SessionHandle {
        match self.inner.sessions.entry(guild_id) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                let handle = self.spawn(guild_id);
                entry.insert(handle.clone());
                handle
            }
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(self.spawn(guild_id)).value().clone(),
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.inner
            .sessions
            .get(&guild_id)
            .map(|handle| handle.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Tears down the guild's session, if any. Removing an absent guild is a no-op.
    ///
    /// The session unregisters itself once the transport has left, so the
    /// entry stays put until then.
    pub async fn remove(&self, guild_id: GuildId) {
        let Some(handle) = self.get(guild_id) else {
            return;
        };
        if let Err(e) = handle.close(CloseReason::Stopped).await {
            debug!("Session for guild {} was already gone: {}", guild_id, e);
            let id = handle.id();
            self.inner
                .sessions
                .remove_if(&guild_id, |_, current| current.id() == id);
        }
    }

    /// Connects to a voice channel. A failed join leaves no session behind.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<SessionHandle> {
        let limit = self.inner.settings.transport_timeout;
        timeout(limit, self.inner.transport.join(guild_id, channel_id))
            .await
            .unwrap_or(Err(TransportError::Timeout(limit)))?;

        Ok(self.get_or_create(guild_id))
    }

    /// Adds a resolved track, starting playback when the guild is idle.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        track: PlayableTrack,
        requested_by: UserId,
    ) -> PlaybackResult<QueuedTrackHandle> {
        let session = self.get_or_create(guild_id);
        match session.enqueue(track.clone(), requested_by).await {
            // The session closed under us; a fresh one takes the track.
            Err(e) if matches!(e.validation(), Some(ValidationError::NoSession)) => {
                debug!("Session for guild {} closed during enqueue, retrying", guild_id);
                self.get_or_create(guild_id).enqueue(track, requested_by).await
            }
            result => result,
        }
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        self.get(guild_id)?.snapshot().await
    }

    pub async fn skip(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.existing(guild_id)?.skip().await
    }

    pub async fn pause(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.existing(guild_id)?.pause().await
    }

    pub async fn resume(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.existing(guild_id)?.resume().await
    }

    pub async fn set_loop_mode(&self, guild_id: GuildId, mode: LoopMode) -> PlaybackResult<()> {
        self.existing(guild_id)?.set_loop_mode(mode).await
    }

    pub async fn shuffle(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.existing(guild_id)?.shuffle().await
    }

    /// Removes the pending track at a 1-based position.
    pub async fn remove_track(&self, guild_id: GuildId, position: usize) -> PlaybackResult<QueuedTrack> {
        self.existing(guild_id)?.remove(position).await
    }

    /// Stops playback, clears the queue and leaves voice.
    ///
    /// Works in any state. Without a session the transport is still told to
    /// leave, in case a connection outlived its session.
    pub async fn stop(&self, guild_id: GuildId) -> PlaybackResult<()> {
        if let Some(session) = self.get(guild_id) {
            match session.stop().await {
                Err(e) if matches!(e.validation(), Some(ValidationError::NoSession)) => {}
                result => return result,
            }
        }

        let limit = self.inner.settings.transport_timeout;
        match timeout(limit, self.inner.transport.leave(guild_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not leave voice in guild {}: {}", guild_id, e),
            Err(_) => warn!("Leaving voice in guild {} timed out", guild_id),
        }
        Ok(())
    }

    /// Same as [`Self::stop`]; clearing a guild ends its session.
    pub async fn clear(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.stop(guild_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackNotice> {
        self.inner.notices.subscribe()
    }

    pub fn active_guilds(&self) -> Vec<GuildId> {
        self.inner.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Closes every live session, leaving voice everywhere.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("🛑 Closing {} sessions", handles.len());

        join_all(handles.iter().map(|handle| handle.close(CloseReason::Shutdown))).await;
        // Closed sessions unregister themselves; this catches any that died early.
        self.inner.sessions.retain(|_, handle| !handle.is_closed());
    }

    fn existing(&self, guild_id: GuildId) -> Result<SessionHandle, ValidationError> {
        self.get(guild_id).ok_or(ValidationError::NoSession)
    }

    fn spawn(&self, guild_id: GuildId) -> SessionHandle {
        let id = SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed));
        spawn_session(
            guild_id,
            id,
            SessionContext {
                transport: self.inner.transport.clone(),
                bus: self.inner.bus.clone(),
                sessions: self.inner.sessions.clone(),
                notices: self.inner.notices.clone(),
                play_ids: self.inner.play_ids.clone(),
                settings: self.inner.settings.clone(),
            },
        )
    }
}

impl TypeMapKey for SessionRegistry {
    type Value = SessionRegistry;
}
