use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use super::{PlayRequest, VoiceTransport};
use crate::{audio::events::PlayId, error::TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Join(GuildId, ChannelId),
    Play(String),
    Pause,
    Resume,
    Stop,
    Leave(GuildId),
}

/// Transport that records every call and never emits events on its own.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<Call>>,
    plays: Mutex<Vec<PlayRequest>>,
    pub failing_plays: AtomicUsize,
    pub failing_join: AtomicBool,
    pub join_delay: Mutex<Option<Duration>>,
    pub play_delay: Mutex<Option<Duration>>,
    pub stop_delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn last_play(&self) -> PlayId {
        self.plays.lock().last().map(|p| p.play_id).expect("nothing played")
    }

    pub fn played(&self) -> Vec<String> {
        self.plays.lock().iter().map(|p| p.title.clone()).collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

async fn stall(delay: &Mutex<Option<Duration>>) {
    let delay = *delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl VoiceTransport for RecordingTransport {
    async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Join(guild_id, channel_id));
        stall(&self.join_delay).await;
        if self.failing_join.load(Ordering::SeqCst) {
            return Err(TransportError::Join("missing permissions".into()));
        }
        Ok(())
    }

    async fn play(&self, _guild_id: GuildId, request: PlayRequest) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Play(request.title.clone()));
        self.plays.lock().push(request);
        stall(&self.play_delay).await;
        if self.failing_plays.load(Ordering::SeqCst) > 0 {
            self.failing_plays.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Play("decoder exploded".into()));
        }
        Ok(())
    }

    async fn pause(&self, _guild_id: GuildId) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Pause);
        Ok(())
    }

    async fn resume(&self, _guild_id: GuildId) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Resume);
        Ok(())
    }

    async fn stop(&self, _guild_id: GuildId) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Stop);
        stall(&self.stop_delay).await;
        Ok(())
    }

    async fn leave(&self, guild_id: GuildId) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Leave(guild_id));
        Ok(())
    }
}
