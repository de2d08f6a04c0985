//! Event plumbing between the voice transport and guild sessions.
//!
//! Transport callbacks publish [`TransportEvent`]s on the [`EventBus`], which
//! forwards each one to the single live session of its guild. Sessions in
//! turn broadcast [`PlaybackNotice`]s for whoever renders "now playing"
//! messages or error reports.

use dashmap::DashMap;
use serenity::model::id::{GuildId, UserId};
use std::sync::Arc;
use tracing::debug;

use super::session::{SessionId, SessionMessage};

/// Identifies one attempt to play a track. A replay gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub guild_id: GuildId,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    Started(PlayId),
    Paused(PlayId),
    Resumed(PlayId),
    Ended(PlayId),
    Errored { play: PlayId, cause: String },
    /// The voice connection for the guild went away.
    Disconnected,
}

impl TransportEventKind {
    pub fn play_id(&self) -> Option<PlayId> {
        match self {
            Self::Started(id) | Self::Paused(id) | Self::Resumed(id) | Self::Ended(id) => Some(*id),
            Self::Errored { play, .. } => Some(*play),
            Self::Disconnected => None,
        }
    }
}

/// Routes transport events to the session that owns the guild.
#[derive(Clone, Default)]
pub struct EventBus {
    routes: Arc<DashMap<GuildId, (SessionId, flume::Sender<SessionMessage>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an event. Returns `false` when no session is listening.
    pub fn publish(&self, event: TransportEvent) -> bool {
        let sender = self
            .routes
            .get(&event.guild_id)
            .map(|route| route.value().1.clone());

        match sender {
            Some(tx) => tx.send(SessionMessage::Transport(event.kind)).is_ok(),
            None => {
                debug!(
                    "Dropping {:?} for guild {} without a session",
                    event.kind, event.guild_id
                );
                false
            }
        }
    }

    pub(crate) fn attach(&self, guild_id: GuildId, session: SessionId, tx: flume::Sender<SessionMessage>) {
        self.routes.insert(guild_id, (session, tx));
    }

    pub(crate) fn detach(&self, guild_id: GuildId, session: SessionId) {
        self.routes.remove_if(&guild_id, |_, (id, _)| *id == session);
    }
}

/// Something a front-end may want to tell users about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackNotice {
    TrackStarted {
        guild_id: GuildId,
        title: String,
        requested_by: UserId,
    },
    /// The track failed mid-play; the queue moved on.
    TrackErrored {
        guild_id: GuildId,
        title: String,
        cause: String,
    },
    /// The track could not be started and was dropped.
    TrackAbandoned {
        guild_id: GuildId,
        title: String,
        cause: String,
    },
    QueueFinished {
        guild_id: GuildId,
    },
    SessionClosed {
        guild_id: GuildId,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Stopped,
    Disconnected,
    Idle,
    Shutdown,
}
