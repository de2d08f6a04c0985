use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serenity::model::id::UserId;
use std::{collections::VecDeque, fmt, str::FromStr, time::Duration};
use tracing::{debug, info};

use crate::{error::ValidationError, sources::PlayableTrack};

/// Most recent finished tracks kept per guild.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl FromStr for LoopMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "track" | "song" => Ok(Self::Track),
            "queue" | "all" => Ok(Self::Queue),
            other => Err(ValidationError::InvalidLoopMode(other.to_string())),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Track => write!(f, "track"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

/// Timing and skip bookkeeping for one queued track.
///
/// `paused_at` is only set while `is_paused`; `total_paused` only grows, and
/// only when a pause is resolved by a resume.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackPlaybackState {
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub total_paused: Duration,
    pub is_paused: bool,
    pub was_skipped: bool,
}

impl TrackPlaybackState {
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
        self.paused_at = None;
        self.is_paused = false;
    }

    pub fn mark_paused(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_paused {
            return false;
        }
        self.is_paused = true;
        self.paused_at = Some(now);
        true
    }

    pub fn mark_resumed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_paused {
            return false;
        }
        if let Some(paused_at) = self.paused_at.take() {
            let paused_for = now.signed_duration_since(paused_at).to_std().unwrap_or_default();
            self.total_paused += paused_for;
        }
        self.is_paused = false;
        true
    }

    /// Stamps the skip flag. Only the first call has any effect.
    pub fn mark_skipped(&mut self) -> bool {
        if self.was_skipped {
            return false;
        }
        self.was_skipped = true;
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Time spent actually playing, excluding pauses.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started_at = self.started_at?;
        let until = if self.is_paused {
            self.paused_at.unwrap_or(now)
        } else {
            now
        };
        let wall = until.signed_duration_since(started_at).to_std().unwrap_or_default();
        Some(wall.saturating_sub(self.total_paused))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTrack {
    pub id: TrackId,
    pub track: PlayableTrack,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
    pub state: TrackPlaybackState,
}

impl QueuedTrack {
    pub fn title(&self) -> &str {
        self.track.title()
    }
}

/// What the caller gets back from an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTrackHandle {
    pub id: TrackId,
    pub title: String,
    /// 0 when the track is playing now, otherwise its 1-based place in line.
    pub position: usize,
}

/// Where a finished track went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Stays current and plays again.
    Replay,
    /// Went back to the end of the pending list.
    Requeued,
    /// Moved to history.
    Archived,
}

/// Per-guild queue state. Pure data and transitions, no I/O.
#[derive(Debug)]
pub struct GuildQueue {
    pending: VecDeque<QueuedTrack>,
    current: Option<QueuedTrack>,
    history: VecDeque<QueuedTrack>,
    loop_mode: LoopMode,
    max_size: usize,
    last_activity: DateTime<Utc>,
    next_id: u64,
}

impl GuildQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            history: VecDeque::new(),
            loop_mode: LoopMode::Off,
            max_size,
            last_activity: Utc::now(),
            next_id: 1,
        }
    }

    /// Appends a track to the pending list.
    ///
    /// Never starts playback; when nothing is current the caller is expected
    /// to call [`Self::advance`] next.
    pub fn enqueue(
        &mut self,
        track: PlayableTrack,
        requested_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<QueuedTrackHandle, ValidationError> {
        // The current track counts, so a queue-loop requeue never overflows.
        if self.len() >= self.max_size {
            return Err(ValidationError::QueueFull { max: self.max_size });
        }

        let id = TrackId(self.next_id);
        self.next_id += 1;
        let item = QueuedTrack {
            id,
            track,
            requested_by,
            added_at: now,
            state: TrackPlaybackState::default(),
        };
        info!("➕ Added to queue: {}", item.title());
        let title = item.title().to_string();
        self.pending.push_back(item);
        self.touch(now);

        Ok(QueuedTrackHandle {
            id,
            title,
            position: self.pending.len(),
        })
    }

    /// 0 for the current track, 1-based for pending ones.
    pub fn position_of(&self, id: TrackId) -> Option<usize> {
        if self.current.as_ref().is_some_and(|c| c.id == id) {
            return Some(0);
        }
        self.pending
            .iter()
            .position(|item| item.id == id)
            .map(|index| index + 1)
    }

    /// Installs the next pending track as current unless one is already set.
    ///
    /// This is the only way a track becomes current. Returns the current
    /// track afterwards, or `None` when the queue ran dry.
    pub fn advance(&mut self) -> Option<&QueuedTrack> {
        if self.current.is_none() {
            self.current = self.pending.pop_front();
            match &self.current {
                Some(item) => info!("➡️ Next in queue: {}", item.title()),
                None => info!("📭 Queue is empty"),
            }
        }
        self.current.as_ref()
    }

    /// Applies the loop policy to the current track once it has finished.
    ///
    /// A skipped track always goes to history, whatever the loop mode.
    pub fn record_completion(&mut self, was_skipped: bool) -> Option<Completion> {
        let mut finished = self.current.take()?;

        let outcome = if was_skipped {
            finished.state.was_skipped = true;
            self.push_history(finished);
            Completion::Archived
        } else {
            match self.loop_mode {
                LoopMode::Track => {
                    finished.state.reset();
                    debug!("🔂 Repeating track: {}", finished.title());
                    self.current = Some(finished);
                    Completion::Replay
                }
                LoopMode::Queue => {
                    finished.state.reset();
                    debug!("🔁 Track sent to the back of the queue: {}", finished.title());
                    self.pending.push_back(finished);
                    Completion::Requeued
                }
                LoopMode::Off => {
                    self.push_history(finished);
                    Completion::Archived
                }
            }
        };

        Some(outcome)
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Loop disabled"),
            LoopMode::Track => info!("🔂 Looping current track"),
            LoopMode::Queue => info!("🔁 Looping queue"),
        }
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Drops pending and current tracks. History is kept.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
        info!("🗑️ Queue cleared");
    }

    pub fn shuffle(&mut self) {
        let mut items: Vec<_> = self.pending.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.pending.extend(items);
        info!("🔀 Queue shuffled");
    }

    /// Removes the pending track at a 1-based position.
    pub fn remove(&mut self, position: usize) -> Result<QueuedTrack, ValidationError> {
        position
            .checked_sub(1)
            .and_then(|index| self.pending.remove(index))
            .ok_or(ValidationError::NoSuchPosition(position))
    }

    pub fn current(&self) -> Option<&QueuedTrack> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut QueuedTrack> {
        self.current.as_mut()
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Pending tracks plus the current one.
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> impl Iterator<Item = &QueuedTrack> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn history(&self) -> impl Iterator<Item = &QueuedTrack> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    fn push_history(&mut self, item: QueuedTrack) {
        self.history.push_back(item);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::TrackMetadata;
    use pretty_assertions::assert_eq;

    fn track(name: &str) -> PlayableTrack {
        TrackMetadata::new(name, format!("https://example.com/{}", name))
            .into_playable(format!("https://cdn.example.com/{}.webm", name))
    }

    fn user() -> UserId {
        UserId::new(42)
    }

    fn queue_with(names: &[&str]) -> GuildQueue {
        let mut queue = GuildQueue::new(100);
        for name in names {
            queue.enqueue(track(name), user(), Utc::now()).unwrap();
        }
        queue
    }

    fn titles<'a>(items: impl Iterator<Item = &'a QueuedTrack>) -> Vec<String> {
        items.map(|item| item.title().to_string()).collect()
    }

    #[test]
    fn enqueue_is_fifo_with_one_based_positions() {
        let mut queue = GuildQueue::new(100);
        let a = queue.enqueue(track("a"), user(), Utc::now()).unwrap();
        let b = queue.enqueue(track("b"), user(), Utc::now()).unwrap();
        let c = queue.enqueue(track("c"), user(), Utc::now()).unwrap();

        assert_eq!((a.position, b.position, c.position), (1, 2, 3));
        assert_eq!(titles(queue.pending()), vec!["a", "b", "c"]);
        assert!(!queue.is_playing());

        queue.advance();
        assert_eq!(queue.position_of(a.id), Some(0));
        assert_eq!(queue.position_of(b.id), Some(1));
        assert_eq!(queue.position_of(c.id), Some(2));
        assert_eq!(titles(queue.pending()), vec!["b", "c"]);
    }

    #[test]
    fn advance_keeps_an_existing_current_track() {
        let mut queue = queue_with(&["a", "b"]);
        assert_eq!(queue.advance().map(|t| t.title().to_string()), Some("a".into()));
        assert_eq!(queue.advance().map(|t| t.title().to_string()), Some("a".into()));
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.is_playing());
    }

    #[test]
    fn advance_on_empty_queue_goes_idle() {
        let mut queue = queue_with(&["a"]);
        queue.advance();
        queue.record_completion(false);

        assert!(queue.advance().is_none());
        assert!(!queue.is_playing());
        assert_eq!(queue.history_len(), 1);
    }

    #[test]
    fn full_queue_rejects_tracks() {
        let mut queue = GuildQueue::new(2);
        queue.enqueue(track("a"), user(), Utc::now()).unwrap();
        queue.enqueue(track("b"), user(), Utc::now()).unwrap();

        assert_eq!(
            queue.enqueue(track("c"), user(), Utc::now()),
            Err(ValidationError::QueueFull { max: 2 })
        );
    }

    #[test]
    fn queue_loop_requeue_stays_within_capacity() {
        let mut queue = GuildQueue::new(2);
        queue.set_loop_mode(LoopMode::Queue);
        queue.enqueue(track("a"), user(), Utc::now()).unwrap();
        queue.advance();
        queue.enqueue(track("b"), user(), Utc::now()).unwrap();

        assert_eq!(
            queue.enqueue(track("c"), user(), Utc::now()),
            Err(ValidationError::QueueFull { max: 2 })
        );

        assert_eq!(queue.record_completion(false), Some(Completion::Requeued));
        assert_eq!(titles(queue.pending()), vec!["b", "a"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn track_loop_replays_until_skipped() {
        let mut queue = queue_with(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Track);
        queue.advance();

        for _ in 0..3 {
            assert_eq!(queue.record_completion(false), Some(Completion::Replay));
            assert_eq!(queue.advance().unwrap().title(), "a");
        }
        assert_eq!(queue.history_len(), 0);

        queue.current_mut().unwrap().state.mark_skipped();
        assert_eq!(queue.record_completion(true), Some(Completion::Archived));
        assert_eq!(queue.advance().unwrap().title(), "b");
        assert_eq!(titles(queue.history()), vec!["a"]);
    }

    #[test]
    fn queue_loop_requeues_with_fresh_state() {
        let mut queue = queue_with(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.advance();

        let now = Utc::now();
        let state = &mut queue.current_mut().unwrap().state;
        state.mark_started(now);
        state.mark_paused(now);
        state.mark_resumed(now + chrono::Duration::seconds(3));

        assert_eq!(queue.record_completion(false), Some(Completion::Requeued));
        assert_eq!(titles(queue.pending()), vec!["b", "a"]);

        let requeued = queue.pending().last().unwrap();
        assert_eq!(requeued.state, TrackPlaybackState::default());
        assert!(!queue.is_playing());
    }

    #[test]
    fn skip_under_queue_loop_does_not_requeue() {
        let mut queue = queue_with(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.advance();

        assert_eq!(queue.record_completion(true), Some(Completion::Archived));
        assert_eq!(titles(queue.pending()), vec!["b"]);
        assert!(queue.history().next().unwrap().state.was_skipped);
    }

    #[test]
    fn history_is_capped() {
        let mut queue = GuildQueue::new(100);
        for i in 0..(HISTORY_LIMIT + 1) {
            queue.enqueue(track(&format!("t{}", i)), user(), Utc::now()).unwrap();
            queue.advance();
            queue.record_completion(false);
        }

        assert_eq!(queue.history_len(), HISTORY_LIMIT);
        assert_eq!(queue.history().next().unwrap().title(), "t1");
        assert_eq!(
            queue.history().last().unwrap().title(),
            format!("t{}", HISTORY_LIMIT)
        );
    }

    #[test]
    fn completion_without_current_is_a_no_op() {
        let mut queue = queue_with(&["a"]);
        assert_eq!(queue.record_completion(false), None);
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn clear_keeps_history() {
        let mut queue = queue_with(&["a", "b", "c"]);
        queue.advance();
        queue.record_completion(false);
        queue.advance();

        queue.clear();

        assert!(!queue.is_playing());
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(titles(queue.history()), vec!["a"]);
    }

    #[test]
    fn remove_and_shuffle_only_touch_pending() {
        let mut queue = queue_with(&["a", "b", "c", "d"]);
        queue.advance();

        assert_eq!(queue.remove(2).unwrap().title(), "c");
        assert_eq!(queue.remove(0), Err(ValidationError::NoSuchPosition(0)));
        assert_eq!(queue.remove(9), Err(ValidationError::NoSuchPosition(9)));

        queue.shuffle();
        let mut pending = titles(queue.pending());
        pending.sort();
        assert_eq!(pending, vec!["b", "d"]);
        assert_eq!(queue.current().unwrap().title(), "a");
    }

    #[test]
    fn pause_then_resume_accumulates_exactly() {
        let start = Utc::now();
        let mut state = TrackPlaybackState::default();
        state.mark_started(start);

        let paused = start + chrono::Duration::seconds(10);
        assert!(state.mark_paused(paused));
        assert!(!state.mark_paused(paused + chrono::Duration::seconds(1)));
        assert_eq!(state.paused_at, Some(paused));

        assert!(state.mark_resumed(paused + chrono::Duration::milliseconds(1500)));
        assert_eq!(state.total_paused, Duration::from_millis(1500));
        assert_eq!(state.paused_at, None);
        assert_eq!(state.started_at, Some(start));
        assert!(!state.mark_resumed(paused + chrono::Duration::seconds(5)));

        let now = start + chrono::Duration::seconds(20);
        assert_eq!(state.elapsed(now), Some(Duration::from_millis(18_500)));
    }

    #[test]
    fn skip_flag_is_set_once() {
        let mut state = TrackPlaybackState::default();
        assert!(state.mark_skipped());
        assert!(!state.mark_skipped());
        assert!(state.was_skipped);
    }

    #[test]
    fn loop_mode_parsing() {
        assert_eq!("none".parse::<LoopMode>(), Ok(LoopMode::Off));
        assert_eq!("Track".parse::<LoopMode>(), Ok(LoopMode::Track));
        assert_eq!(" queue ".parse::<LoopMode>(), Ok(LoopMode::Queue));
        assert_eq!(
            "forever".parse::<LoopMode>(),
            Err(ValidationError::InvalidLoopMode("forever".into()))
        );
    }
}
