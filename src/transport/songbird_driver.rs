use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::HttpRequest,
    tracks::{PlayMode, TrackHandle},
    CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{PlayRequest, VoiceTransport};
use crate::{
    audio::events::{EventBus, PlayId, TransportEvent, TransportEventKind},
    error::TransportError,
};

/// Voice transport backed by songbird.
///
/// Streams are fetched over HTTP by songbird itself; every track gets event
/// hooks that report back to the [`EventBus`] under the request's [`PlayId`].
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    bus: EventBus,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, bus: EventBus) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            bus,
            tracks: DashMap::new(),
        }
    }

    fn track(&self, guild_id: GuildId) -> Result<TrackHandle, TransportError> {
        self.tracks
            .get(&guild_id)
            .map(|handle| handle.value().clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), TransportError> {
        info!("🔗 Joining channel {} in guild {}", channel_id, guild_id);

        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| TransportError::Join(format!("{:?}", e)))?;

        let mut call = call.lock().await;
        // Rejoining must not stack a second disconnect hook.
        call.remove_all_global_events();
        call.add_global_event(
            Event::Core(CoreEvent::DriverDisconnect),
            DisconnectForwarder {
                guild_id,
                bus: self.bus.clone(),
            },
        );

        info!("✅ Connected to channel {} in guild {}", channel_id, guild_id);
        Ok(())
    }

    async fn play(&self, guild_id: GuildId, request: PlayRequest) -> Result<(), TransportError> {
        let call = self.manager.get(guild_id).ok_or(TransportError::NotConnected)?;
        let input = HttpRequest::new(self.http.clone(), request.stream_locator.clone());

        let handle = {
            let mut call = call.lock().await;
            call.stop();
            call.play_input(input.into())
        };

        let hooks = [
            TrackEvent::Playable,
            TrackEvent::Play,
            TrackEvent::Pause,
            TrackEvent::End,
            TrackEvent::Error,
        ];
        for event in hooks {
            let forwarder = TrackEventForwarder {
                guild_id,
                play_id: request.play_id,
                event,
                bus: self.bus.clone(),
            };
            handle
                .add_event(Event::Track(event), forwarder)
                .map_err(|e| TransportError::Play(format!("{:?}", e)))?;
        }

        debug!("🎵 Handed {} to songbird as {:?}", request.title, request.play_id);
        self.tracks.insert(guild_id, handle);
        Ok(())
    }

    async fn pause(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.track(guild_id)?
            .pause()
            .map_err(|e| TransportError::Control(format!("{:?}", e)))
    }

    async fn resume(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.track(guild_id)?
            .play()
            .map_err(|e| TransportError::Control(format!("{:?}", e)))
    }

    async fn stop(&self, guild_id: GuildId) -> Result<(), TransportError> {
        match self.tracks.remove(&guild_id) {
            Some((_, handle)) => handle
                .stop()
                .map_err(|e| TransportError::Control(format!("{:?}", e))),
            None => {
                if let Some(call) = self.manager.get(guild_id) {
                    call.lock().await.stop();
                }
                Ok(())
            }
        }
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.tracks.remove(&guild_id);
        if self.manager.get(guild_id).is_none() {
            debug!("Guild {} has no voice call to leave", guild_id);
            return Ok(());
        }

        self.manager
            .remove(guild_id)
            .await
            .map_err(|e| TransportError::Leave(format!("{:?}", e)))?;
        info!("👋 Left voice in guild {}", guild_id);
        Ok(())
    }
}

/// Reports one kind of track event for a single play attempt.
struct TrackEventForwarder {
    guild_id: GuildId,
    play_id: PlayId,
    event: TrackEvent,
    bus: EventBus,
}

#[async_trait]
impl VoiceEventHandler for TrackEventForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let play = self.play_id;
        let kind = match self.event {
            TrackEvent::Playable => TransportEventKind::Started(play),
            // `Play` only fires when a paused track plays again.
            TrackEvent::Play => TransportEventKind::Resumed(play),
            TrackEvent::Pause => TransportEventKind::Paused(play),
            TrackEvent::End => TransportEventKind::Ended(play),
            TrackEvent::Error => {
                let cause = match ctx {
                    EventContext::Track(tracks) => tracks
                        .iter()
                        .find_map(|(state, _)| match &state.playing {
                            PlayMode::Errored(e) => Some(format!("{:?}", e)),
                            _ => None,
                        })
                        .unwrap_or_else(|| "unknown playback error".to_string()),
                    _ => "unknown playback error".to_string(),
                };
                warn!("❌ Track error in guild {}: {}", self.guild_id, cause);
                TransportEventKind::Errored { play, cause }
            }
            _ => return None,
        };

        self.bus.publish(TransportEvent {
            guild_id: self.guild_id,
            kind,
        });
        None
    }
}

struct DisconnectForwarder {
    guild_id: GuildId,
    bus: EventBus,
}

#[async_trait]
impl VoiceEventHandler for DisconnectForwarder {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        warn!("🔌 Voice driver disconnected in guild {}", self.guild_id);
        self.bus.publish(TransportEvent {
            guild_id: self.guild_id,
            kind: TransportEventKind::Disconnected,
        });
        None
    }
}
