//! Track descriptors and the content resolver seam.
//!
//! Resolution happens in two explicit stages: a locator resolves to
//! [`TrackMetadata`], and a [`TrackMetadata`] resolves to a [`PlayableTrack`]
//! once a stream locator is known. Only playable tracks can be queued.

pub mod cached;
pub mod direct_url;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ResolveError;

pub use cached::CachedResolver;
pub use direct_url::DirectUrlResolver;

/// Common interface of every content source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Looks up the descriptor for a single track locator.
    async fn resolve_track(&self, locator: &str) -> Result<TrackMetadata, ResolveError>;

    /// Finds the playable stream for an already described track.
    async fn resolve_stream(&self, track: &TrackMetadata) -> Result<PlayableTrack, ResolveError>;

    /// Expands a playlist locator into its tracks.
    async fn resolve_playlist(&self, locator: &str) -> Result<Vec<TrackMetadata>, ResolveError>;

    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<TrackMetadata>, ResolveError>;
}

/// Immutable description of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    /// Canonical page URL of the track.
    pub url: String,
    /// `None` for live streams.
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<u64>,
}

impl TrackMetadata {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            duration: None,
            thumbnail: None,
            description: None,
            view_count: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_view_count(mut self, views: u64) -> Self {
        self.view_count = Some(views);
        self
    }

    /// Human readable duration such as `3:07` or `1:02:03`.
    pub fn duration_label(&self) -> String {
        match self.duration {
            Some(d) => format_duration(d),
            None => "Live".to_string(),
        }
    }

    pub fn into_playable(self, stream_locator: impl Into<String>) -> PlayableTrack {
        PlayableTrack {
            metadata: self,
            stream_locator: stream_locator.into(),
        }
    }
}

/// A track whose audio stream has been located.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayableTrack {
    pub metadata: TrackMetadata,
    pub stream_locator: String,
}

impl PlayableTrack {
    pub fn title(&self) -> &str {
        &self.metadata.title
    }

    pub fn url(&self) -> &str {
        &self.metadata.url
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_labels() {
        let track = TrackMetadata::new("a", "https://x/a");
        assert_eq!(track.duration_label(), "Live");
        assert_eq!(
            track.clone().with_duration(Duration::from_secs(187)).duration_label(),
            "3:07"
        );
        assert_eq!(
            track.with_duration(Duration::from_secs(3723)).duration_label(),
            "1:02:03"
        );
    }
}
