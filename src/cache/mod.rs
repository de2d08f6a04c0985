//! # Cache Module
//!
//! Look-aside metadata cache used by content resolvers.
//!
//! A locator that was resolved once is served from here until it has gone
//! unread for longer than the configured maximum age. Reads refresh the
//! access time, so tracks that keep getting requested never expire. A
//! background task sweeps stale entries at start and then on a fixed period.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_MAX_AGE=7days           # Entries unread for longer are evicted
//! CACHE_EVICTION_INTERVAL=6h    # How often the sweep runs
//! ```
//!
//! ## Durability
//!
//! When built with a [`CacheStore`] every write goes through to the store
//! as one `{data, createdAt, accessedAt}` record per locator. A failing
//! store never fails a lookup; it only turns hits into misses.
//!
//! ## Limitations
//!
//! Keys are exact locator strings. `https://youtu.be/x` and
//! `https://www.youtube.com/watch?v=x` are cached separately.

pub mod ttl_cache;

use serde::{Deserialize, Serialize};

use crate::sources::{PlayableTrack, TrackMetadata};

pub use ttl_cache::{CacheMetrics, CacheRecord, CacheStore, TtlCache};

/// Cache of resolved tracks keyed by the locator they were resolved from.
pub type MetadataCache = TtlCache<CachedTrack>;

/// What the cache remembers about a locator.
///
/// The stream locator is only present once the track has been resolved all
/// the way to a playable stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTrack {
    pub metadata: TrackMetadata,
    pub stream_locator: Option<String>,
}

impl CachedTrack {
    pub fn playable(&self) -> Option<PlayableTrack> {
        self.stream_locator
            .as_ref()
            .map(|stream| self.metadata.clone().into_playable(stream.clone()))
    }
}

impl From<TrackMetadata> for CachedTrack {
    fn from(metadata: TrackMetadata) -> Self {
        Self {
            metadata,
            stream_locator: None,
        }
    }
}

impl From<PlayableTrack> for CachedTrack {
    fn from(track: PlayableTrack) -> Self {
        Self {
            metadata: track.metadata,
            stream_locator: Some(track.stream_locator),
        }
    }
}
