use async_trait::async_trait;
use serenity::prelude::TypeMapKey;
use std::sync::Arc;
use tracing::debug;

use super::{ContentResolver, PlayableTrack, TrackMetadata};
use crate::{
    cache::{CachedTrack, MetadataCache},
    error::ResolveError,
};

/// Wraps a resolver so single-track lookups go through the metadata cache.
///
/// Playlist expansion and search are passed straight through; only the
/// per-locator answers are worth remembering.
pub struct CachedResolver<R> {
    inner: R,
    cache: Arc<MetadataCache>,
}

impl<R: ContentResolver> CachedResolver<R> {
    pub fn new(inner: R, cache: Arc<MetadataCache>) -> Self {
        Self { inner, cache }
    }

    /// Resolves a locator all the way to a playable track.
    pub async fn resolve_playable(&self, locator: &str) -> Result<PlayableTrack, ResolveError> {
        let metadata = match self.cache.get(locator).await {
            Some(cached) => match cached.playable() {
                Some(playable) => {
                    debug!("✅ Cache hit for {}", locator);
                    return Ok(playable);
                }
                None => cached.metadata,
            },
            None => self.inner.resolve_track(locator).await?,
        };

        let playable = self.inner.resolve_stream(&metadata).await?;
        self.cache
            .set(locator, CachedTrack::from(playable.clone()))
            .await;
        Ok(playable)
    }
}

/// Command handlers fetch the shared resolver from the client's data map.
impl<R: ContentResolver + 'static> TypeMapKey for CachedResolver<R> {
    type Value = Arc<CachedResolver<R>>;
}

#[async_trait]
impl<R: ContentResolver> ContentResolver for CachedResolver<R> {
    async fn resolve_track(&self, locator: &str) -> Result<TrackMetadata, ResolveError> {
        if let Some(cached) = self.cache.get(locator).await {
            debug!("✅ Cache hit for {}", locator);
            return Ok(cached.metadata);
        }

        let metadata = self.inner.resolve_track(locator).await?;
        self.cache
            .set(locator, CachedTrack::from(metadata.clone()))
            .await;
        Ok(metadata)
    }

    async fn resolve_stream(&self, track: &TrackMetadata) -> Result<PlayableTrack, ResolveError> {
        if let Some(playable) = self.cache.get(&track.url).await.and_then(|c| c.playable()) {
            return Ok(playable);
        }

        let playable = self.inner.resolve_stream(track).await?;
        self.cache
            .set(track.url.clone(), CachedTrack::from(playable.clone()))
            .await;
        Ok(playable)
    }

    async fn resolve_playlist(&self, locator: &str) -> Result<Vec<TrackMetadata>, ResolveError> {
        self.inner.resolve_playlist(locator).await
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<TrackMetadata>, ResolveError> {
        self.inner.search(query, max_results).await
    }
}
