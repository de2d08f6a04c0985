//! The voice transport seam.
//!
//! A transport joins voice channels and plays audio streams. It reports what
//! happens to each stream by publishing events on the
//! [`EventBus`](crate::audio::events::EventBus), tagged with the
//! [`PlayId`] it was given in the [`PlayRequest`].

pub mod songbird_driver;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};

use crate::{audio::events::PlayId, error::TransportError};

pub use songbird_driver::SongbirdTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRequest {
    pub play_id: PlayId,
    pub stream_locator: String,
    pub title: String,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), TransportError>;

    /// Starts a stream, replacing whatever the guild was playing.
    async fn play(&self, guild_id: GuildId, request: PlayRequest) -> Result<(), TransportError>;

    async fn pause(&self, guild_id: GuildId) -> Result<(), TransportError>;

    async fn resume(&self, guild_id: GuildId) -> Result<(), TransportError>;

    /// Stops the current stream. The transport still reports it as ended.
    async fn stop(&self, guild_id: GuildId) -> Result<(), TransportError>;

    /// Leaves voice. Leaving a guild that is not connected is not an error.
    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError>;
}
