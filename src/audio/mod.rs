//! # Audio Module
//!
//! Per-guild playback sessions for the Open Music engine.
//!
//! ## Architecture
//!
//! ### [`registry`] - Session Registry
//! - One live session per guild, created on first use
//! - The surface the command front-end calls into
//! - Teardown on stop, disconnect, idle timeout and shutdown
//!
//! ### [`session`] - Playback State Machine
//! - One actor task per guild; commands and transport events share its mailbox
//! - Skip, pause/resume, bounded start retries and stop confirmation
//!
//! ### [`queue`] - Queue Engine
//! - Pending tracks, current slot and bounded history
//! - Loop modes (off / track / queue), pause timing bookkeeping
//! - Pure data, no I/O
//!
//! ### [`events`] - Event Bus
//! - Routes transport events to the guild's live session
//! - Broadcasts [`events::PlaybackNotice`]s for the front-end
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use open_music_engine::audio::registry::SessionRegistry;
//! # use open_music_engine::sources::PlayableTrack;
//! # use serenity::model::id::{ChannelId, GuildId, UserId};
//! # async fn demo(registry: SessionRegistry, track: PlayableTrack) -> anyhow::Result<()> {
//! let guild = GuildId::new(1);
//! registry.join(guild, ChannelId::new(2)).await?;
//! let handle = registry.enqueue(guild, track, UserId::new(3)).await?;
//! println!("queued at #{}", handle.position);
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod queue;
pub mod registry;
pub mod session;

pub use events::{CloseReason, EventBus, PlayId, PlaybackNotice, TransportEvent, TransportEventKind};
pub use queue::{GuildQueue, LoopMode, QueuedTrack, QueuedTrackHandle};
pub use registry::SessionRegistry;
pub use session::{PlaybackState, QueueSnapshot, SessionHandle};
