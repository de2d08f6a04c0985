//! Per-guild playback session.
//!
//! Every guild gets one actor task that owns its [`GuildQueue`] and playback
//! state. Commands from the front-end and events from the transport arrive on
//! the same channel and are handled one at a time, in order, so a skip and a
//! natural end of the same track can never be processed concurrently.

use chrono::Utc;
use dashmap::DashMap;
use serenity::model::id::{GuildId, UserId};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, oneshot},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use super::{
    events::{CloseReason, EventBus, PlayId, PlaybackNotice, TransportEventKind},
    queue::{GuildQueue, LoopMode, QueuedTrack, QueuedTrackHandle, TrackId},
};
use crate::{
    config::EngineSettings,
    error::{PlaybackError, PlaybackResult, TransportError, ValidationError},
    sources::PlayableTrack,
    transport::{PlayRequest, VoiceTransport},
};

/// Distinguishes successive sessions of the same guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing current.
    Idle,
    /// Play issued, waiting for the transport to confirm.
    Starting,
    Playing,
    Paused,
    /// The current track finished and the loop policy is being applied.
    Ending,
    Terminated,
}

/// Read-only view of a session.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub state: PlaybackState,
    pub current: Option<QueuedTrack>,
    pub pending: Vec<QueuedTrack>,
    pub loop_mode: LoopMode,
    pub history_len: usize,
    /// Time the current track has actually been playing.
    pub elapsed: Option<Duration>,
}

pub(crate) enum SessionMessage {
    Command(Command),
    Transport(TransportEventKind),
}

type Reply<T> = oneshot::Sender<PlaybackResult<T>>;

pub(crate) enum Command {
    Enqueue {
        track: PlayableTrack,
        requested_by: UserId,
        reply: Reply<QueuedTrackHandle>,
    },
    Skip(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    SetLoopMode(LoopMode, Reply<()>),
    Shuffle(Reply<()>),
    Remove(usize, Reply<QueuedTrack>),
    Snapshot(oneshot::Sender<QueueSnapshot>),
    Stop(CloseReason, Reply<()>),
}

/// Cheap handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    guild_id: GuildId,
    tx: flume::Sender<SessionMessage>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// True once the session's actor has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }

    pub async fn enqueue(&self, track: PlayableTrack, requested_by: UserId) -> PlaybackResult<QueuedTrackHandle> {
        self.request(|reply| Command::Enqueue {
            track,
            requested_by,
            reply,
        })
        .await
    }

    pub async fn skip(&self) -> PlaybackResult<()> {
        self.request(Command::Skip).await
    }

    pub async fn pause(&self) -> PlaybackResult<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> PlaybackResult<()> {
        self.request(Command::Resume).await
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> PlaybackResult<()> {
        self.request(|reply| Command::SetLoopMode(mode, reply)).await
    }

    pub async fn shuffle(&self) -> PlaybackResult<()> {
        self.request(Command::Shuffle).await
    }

    pub async fn remove(&self, position: usize) -> PlaybackResult<QueuedTrack> {
        self.request(|reply| Command::Remove(position, reply)).await
    }

    pub async fn stop(&self) -> PlaybackResult<()> {
        self.request(|reply| Command::Stop(CloseReason::Stopped, reply)).await
    }

    pub(crate) async fn close(&self, reason: CloseReason) -> PlaybackResult<()> {
        self.request(|reply| Command::Stop(reason, reply)).await
    }

    /// `None` if the session has already terminated.
    pub async fn snapshot(&self) -> Option<QueueSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Command(Command::Snapshot(reply)))
            .ok()?;
        rx.await.ok()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> PlaybackResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Command(build(reply)))
            .map_err(|_| ValidationError::NoSession)?;
        // A dropped reply means the session terminated before handling us.
        rx.await.unwrap_or(Err(ValidationError::NoSession.into()))
    }
}

/// Shared pieces a session needs from the registry that spawned it.
pub(crate) struct SessionContext {
    pub transport: Arc<dyn VoiceTransport>,
    pub bus: EventBus,
    pub sessions: Arc<DashMap<GuildId, SessionHandle>>,
    pub notices: broadcast::Sender<PlaybackNotice>,
    pub play_ids: Arc<AtomicU64>,
    pub settings: EngineSettings,
}

pub(crate) fn spawn_session(guild_id: GuildId, id: SessionId, ctx: SessionContext) -> SessionHandle {
    let (tx, rx) = flume::unbounded();
    ctx.bus.attach(guild_id, id, tx.clone());

    let actor = SessionActor {
        guild_id,
        id,
        queue: GuildQueue::new(ctx.settings.max_queue_size),
        state: PlaybackState::Idle,
        current_play: None,
        deadline: None,
        attempt: None,
        start_attempts: 0,
        error_streak: 0,
        last_activity: Instant::now(),
        rx,
        ctx,
    };
    tokio::spawn(actor.run());
    info!("🎛️ Session started for guild {}", guild_id);

    SessionHandle { id, guild_id, tx }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// The transport has not confirmed a play.
    StartConfirm,
    /// The transport has not reported the end of a stopped track.
    StopConfirm,
    /// A failed start is due for another attempt.
    Retry,
}

enum Wake {
    Message(SessionMessage),
    Deadline,
    Closed,
}

struct SessionActor {
    guild_id: GuildId,
    id: SessionId,
    queue: GuildQueue,
    state: PlaybackState,
    current_play: Option<PlayId>,
    deadline: Option<(Instant, Deadline)>,
    /// Track the start counters below refer to.
    attempt: Option<TrackId>,
    /// Consecutive failed starts of the current track.
    start_attempts: u8,
    /// Consecutive mid-play errors of the current track.
    error_streak: u8,
    last_activity: Instant,
    rx: flume::Receiver<SessionMessage>,
    ctx: SessionContext,
}

impl SessionActor {
    async fn run(mut self) {
        while self.state != PlaybackState::Terminated {
            let wake_at = self.next_wakeup();
            // Mailbox first, so a stop is never stuck behind pending retries.
            let wake = tokio::select! {
                biased;
                message = self.rx.recv_async() => message.map(Wake::Message).unwrap_or(Wake::Closed),
                _ = sleep_until(wake_at) => Wake::Deadline,
            };

            match wake {
                Wake::Message(SessionMessage::Command(command)) => self.handle_command(command).await,
                Wake::Message(SessionMessage::Transport(event)) => self.handle_event(event).await,
                Wake::Deadline => self.handle_deadline().await,
                Wake::Closed => self.terminate(CloseReason::Shutdown).await,
            }
        }
        // Dropping queued requests makes their callers see NoSession.
        let stranded = self.rx.drain().count();
        debug!(
            "Session actor for guild {} exited ({} queued messages dropped)",
            self.guild_id, stranded
        );
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let transport = self.deadline.map(|(at, _)| at);
        let idle = match (self.state, self.ctx.settings.idle_timeout) {
            (PlaybackState::Idle, Some(limit)) => Some(self.last_activity + limit),
            _ => None,
        };
        match (transport, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.queue.touch(Utc::now());
    }

    async fn handle_command(&mut self, command: Command) {
        if !matches!(command, Command::Snapshot(_)) {
            self.touch();
        }
        match command {
            Command::Enqueue {
                track,
                requested_by,
                reply,
            } => {
                let result = self.enqueue(track, requested_by).await;
                let _ = reply.send(result);
            }
            Command::Skip(reply) => {
                let result = self.skip().await;
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            Command::Resume(reply) => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            Command::SetLoopMode(mode, reply) => {
                self.queue.set_loop_mode(mode);
                let _ = reply.send(Ok(()));
            }
            Command::Shuffle(reply) => {
                self.queue.shuffle();
                let _ = reply.send(Ok(()));
            }
            Command::Remove(position, reply) => {
                let result = self.queue.remove(position).map_err(PlaybackError::from);
                let _ = reply.send(result);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Stop(reason, reply) => {
                self.terminate(reason).await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn enqueue(&mut self, track: PlayableTrack, requested_by: UserId) -> PlaybackResult<QueuedTrackHandle> {
        let mut handle = self.queue.enqueue(track, requested_by, Utc::now())?;

        if self.state == PlaybackState::Idle {
            self.play_current().await;
            if let Some(position) = self.queue.position_of(handle.id) {
                handle.position = position;
            }
        }

        Ok(handle)
    }

    async fn skip(&mut self) -> PlaybackResult<()> {
        match self.state {
            PlaybackState::Playing | PlaybackState::Paused => {
                let current = self
                    .queue
                    .current_mut()
                    .ok_or(ValidationError::NothingPlaying)?;
                if !current.state.mark_skipped() {
                    debug!("Skip already in progress for {}", current.title());
                    return Ok(());
                }
                info!("⏭️ Skipping: {}", current.title());

                // The completion is applied when the transport reports the end.
                match self.call(self.ctx.transport.stop(self.guild_id)).await {
                    Ok(()) => {
                        self.arm(Deadline::StopConfirm);
                    }
                    Err(e) => {
                        warn!("Stop failed in guild {}, completing locally: {}", self.guild_id, e);
                        self.finish_current(None).await;
                    }
                }
                Ok(())
            }
            PlaybackState::Starting => {
                // Nothing confirmed yet, so no end signal is guaranteed.
                if let Some(current) = self.queue.current_mut() {
                    current.state.mark_skipped();
                    info!("⏭️ Skipping before start: {}", current.title());
                }
                if let Err(e) = self.call(self.ctx.transport.stop(self.guild_id)).await {
                    debug!("Stop before start failed: {}", e);
                }
                self.finish_current(None).await;
                Ok(())
            }
            _ => Err(ValidationError::NothingPlaying.into()),
        }
    }

    async fn pause(&mut self) -> PlaybackResult<()> {
        match self.state {
            PlaybackState::Playing => {}
            PlaybackState::Paused => return Err(ValidationError::AlreadyPaused.into()),
            _ => return Err(ValidationError::NothingPlaying.into()),
        }

        self.call(self.ctx.transport.pause(self.guild_id)).await?;
        if let Some(current) = self.queue.current_mut() {
            current.state.mark_paused(Utc::now());
        }
        self.state = PlaybackState::Paused;
        info!("⏸️ Paused in guild {}", self.guild_id);
        Ok(())
    }

    async fn resume(&mut self) -> PlaybackResult<()> {
        match self.state {
            PlaybackState::Paused => {}
            PlaybackState::Playing => return Err(ValidationError::NotPaused.into()),
            _ => return Err(ValidationError::NothingPlaying.into()),
        }

        self.call(self.ctx.transport.resume(self.guild_id)).await?;
        if let Some(current) = self.queue.current_mut() {
            current.state.mark_resumed(Utc::now());
        }
        self.state = PlaybackState::Playing;
        info!("▶️ Resumed in guild {}", self.guild_id);
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEventKind) {
        if event == TransportEventKind::Disconnected {
            warn!("🔌 Voice connection dropped in guild {}", self.guild_id);
            self.terminate(CloseReason::Disconnected).await;
            return;
        }

        if event.play_id() != self.current_play || self.current_play.is_none() {
            debug!("Ignoring stale {:?} in guild {}", event, self.guild_id);
            return;
        }

        self.touch();
        let now = Utc::now();
        match (self.state, event) {
            (PlaybackState::Starting, TransportEventKind::Started(_)) => {
                self.deadline = None;
                self.start_attempts = 0;
                self.state = PlaybackState::Playing;
                if let Some(current) = self.queue.current_mut() {
                    current.state.mark_started(now);
                    info!("🎵 Now playing: {}", current.title());
                    let _ = self.ctx.notices.send(PlaybackNotice::TrackStarted {
                        guild_id: self.guild_id,
                        title: current.title().to_string(),
                        requested_by: current.requested_by,
                    });
                }
            }
            (PlaybackState::Playing, TransportEventKind::Paused(_)) => {
                if let Some(current) = self.queue.current_mut() {
                    current.state.mark_paused(now);
                }
                self.state = PlaybackState::Paused;
            }
            (PlaybackState::Paused, TransportEventKind::Resumed(_)) => {
                if let Some(current) = self.queue.current_mut() {
                    current.state.mark_resumed(now);
                }
                self.state = PlaybackState::Playing;
            }
            (PlaybackState::Playing | PlaybackState::Paused, TransportEventKind::Ended(_)) => {
                self.finish_current(None).await;
            }
            (PlaybackState::Playing | PlaybackState::Paused, TransportEventKind::Errored { cause, .. }) => {
                self.finish_current(Some(cause)).await;
            }
            (PlaybackState::Starting, TransportEventKind::Ended(_)) => {
                self.start_failed("stream ended before it started".to_string());
                self.play_current().await;
            }
            (PlaybackState::Starting, TransportEventKind::Errored { cause, .. }) => {
                self.start_failed(cause);
                self.play_current().await;
            }
            (state, event) => {
                debug!("Ignoring {:?} while {:?} in guild {}", event, state, self.guild_id);
            }
        }
    }

    async fn handle_deadline(&mut self) {
        let Some((_, kind)) = self.deadline.take() else {
            if self.state == PlaybackState::Idle {
                info!("💤 Guild {} idle for too long, leaving", self.guild_id);
                self.terminate(CloseReason::Idle).await;
            }
            return;
        };

        let limit = self.ctx.settings.transport_timeout;
        match kind {
            Deadline::StartConfirm => {
                warn!("Transport did not confirm playback in guild {} within {:?}", self.guild_id, limit);
                if let Err(e) = self.call(self.ctx.transport.stop(self.guild_id)).await {
                    debug!("Stop after start timeout failed: {}", e);
                }
                self.start_failed(TransportError::Timeout(limit).to_string());
                self.play_current().await;
            }
            Deadline::StopConfirm => {
                warn!("Transport did not report the end of a stopped track in guild {}", self.guild_id);
                self.finish_current(None).await;
            }
            Deadline::Retry => self.play_current().await,
        }
    }

    /// Applies the loop policy to the finished current track and moves on.
    /// `error` carries the cause when the track failed mid-play.
    async fn finish_current(&mut self, error: Option<String>) {
        self.state = PlaybackState::Ending;
        self.deadline = None;
        self.current_play = None;

        let Some(current) = self.queue.current() else {
            self.play_current().await;
            return;
        };
        let title = current.title().to_string();
        let mut skipped = current.state.was_skipped;

        match error {
            Some(cause) => {
                warn!("❌ Track failed in guild {}: {} ({})", self.guild_id, title, cause);
                let _ = self.ctx.notices.send(PlaybackNotice::TrackErrored {
                    guild_id: self.guild_id,
                    title: title.clone(),
                    cause,
                });
                self.error_streak += 1;
                if self.error_streak > 1 && !skipped {
                    warn!("Track {} failed twice in a row, dropping it", title);
                    skipped = true;
                }
            }
            None => self.error_streak = 0,
        }

        let outcome = self.queue.record_completion(skipped);
        debug!("Finished {} -> {:?}", title, outcome);
        self.play_current().await;
    }

    /// Plays whatever [`GuildQueue::advance`] leaves as current.
    ///
    /// Makes at most one play call. A failed call schedules the next attempt
    /// through [`Deadline::Retry`], so queued commands run in between. A start
    /// that fails is retried once; a second consecutive failure drops the
    /// track and moves on to the next one.
    async fn play_current(&mut self) {
        let next = self
            .queue
            .advance()
            .map(|current| (current.id, current.track.clone()));
        let Some((id, track)) = next else {
            self.go_idle();
            return;
        };

        if let Err(e) = self.issue_play(id, track).await {
            self.start_failed(e.to_string());
            self.deadline = Some((Instant::now(), Deadline::Retry));
        }
    }

    async fn issue_play(&mut self, id: TrackId, track: PlayableTrack) -> Result<(), TransportError> {
        if self.attempt != Some(id) {
            self.attempt = Some(id);
            self.start_attempts = 0;
            self.error_streak = 0;
        }
        self.start_attempts += 1;

        let play_id = PlayId(self.ctx.play_ids.fetch_add(1, Ordering::Relaxed));
        self.current_play = Some(play_id);
        self.state = PlaybackState::Starting;

        let request = PlayRequest {
            play_id,
            stream_locator: track.stream_locator.clone(),
            title: track.title().to_string(),
        };
        debug!("Starting {} as {:?} in guild {}", request.title, play_id, self.guild_id);
        self.call(self.ctx.transport.play(self.guild_id, request)).await?;
        self.arm(Deadline::StartConfirm);
        Ok(())
    }

    /// Records a failed start of the current track. After the second failure
    /// in a row the track is dropped from the queue.
    fn start_failed(&mut self, cause: String) {
        self.current_play = None;
        let Some(current) = self.queue.current() else {
            return;
        };
        let title = current.title().to_string();

        if self.start_attempts < 2 {
            warn!("Could not start {} in guild {}, retrying once: {}", title, self.guild_id, cause);
            return;
        }

        warn!("🚫 Giving up on {} in guild {}: {}", title, self.guild_id, cause);
        let _ = self.ctx.notices.send(PlaybackNotice::TrackAbandoned {
            guild_id: self.guild_id,
            title,
            cause,
        });
        if let Some(current) = self.queue.current_mut() {
            current.state.mark_skipped();
        }
        self.queue.record_completion(true);
    }

    fn go_idle(&mut self) {
        let was_active = self.state != PlaybackState::Idle;
        self.state = PlaybackState::Idle;
        self.current_play = None;
        self.deadline = None;
        self.last_activity = Instant::now();
        if was_active {
            let _ = self.ctx.notices.send(PlaybackNotice::QueueFinished {
                guild_id: self.guild_id,
            });
        }
    }

    /// Tears the session down. Safe from any state.
    ///
    /// The transport is told to stop and leave while this session is still
    /// registered, so nothing spawned for the guild afterwards is affected.
    async fn terminate(&mut self, reason: CloseReason) {
        if self.state == PlaybackState::Terminated {
            return;
        }

        if let Some(current) = self.queue.current_mut() {
            current.state.mark_skipped();
            self.queue.record_completion(true);
        }
        self.queue.clear();

        if let Err(e) = self.call(self.ctx.transport.stop(self.guild_id)).await {
            debug!("Stop during teardown of guild {} failed: {}", self.guild_id, e);
        }
        if let Err(e) = self.call(self.ctx.transport.leave(self.guild_id)).await {
            warn!("Could not leave voice in guild {}: {}", self.guild_id, e);
        }

        // Only now may a replacement session take over the guild. Requests
        // that reached this session meanwhile are dropped and see NoSession.
        let id = self.id;
        self.ctx.sessions.remove_if(&self.guild_id, |_, handle| handle.id == id);
        self.ctx.bus.detach(self.guild_id, id);

        self.state = PlaybackState::Terminated;
        self.current_play = None;
        self.deadline = None;
        let _ = self.ctx.notices.send(PlaybackNotice::SessionClosed {
            guild_id: self.guild_id,
            reason,
        });
        info!("⏹️ Session closed for guild {} ({:?})", self.guild_id, reason);
    }

    fn snapshot(&self) -> QueueSnapshot {
        let current = self.queue.current().cloned();
        let elapsed = current.as_ref().and_then(|c| c.state.elapsed(Utc::now()));
        QueueSnapshot {
            state: self.state,
            current,
            pending: self.queue.pending().cloned().collect(),
            loop_mode: self.queue.loop_mode(),
            history_len: self.queue.history_len(),
            elapsed,
        }
    }

    fn arm(&mut self, kind: Deadline) {
        self.deadline = Some((Instant::now() + self.ctx.settings.transport_timeout, kind));
    }

    /// Runs a transport call under the configured timeout.
    async fn call<F>(&self, operation: F) -> Result<(), TransportError>
    where
        F: Future<Output = Result<(), TransportError>>,
    {
        let limit = self.ctx.settings.transport_timeout;
        timeout(limit, operation)
            .await
            .unwrap_or(Err(TransportError::Timeout(limit)))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
