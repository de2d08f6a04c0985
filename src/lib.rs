//! # Open Music Engine
//!
//! Playback session engine for the Open Music Discord bot: per-guild queues,
//! a playback state machine driven by voice transport events, and a
//! look-aside metadata cache for content resolvers.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
pub mod transport;

pub use audio::SessionRegistry;
pub use config::{Config, EngineSettings};
pub use error::{PlaybackError, PlaybackResult};
