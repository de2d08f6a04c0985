use async_trait::async_trait;
use url::Url;

use super::{ContentResolver, PlayableTrack, TrackMetadata};
use crate::error::ResolveError;

const AUDIO_EXTENSIONS: [&str; 6] = [".mp3", ".wav", ".ogg", ".flac", ".m4a", ".opus"];

/// Resolves plain http(s) links to audio files. The link is its own stream.
#[derive(Debug, Default, Clone)]
pub struct DirectUrlResolver;

impl DirectUrlResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn is_valid_url(locator: &str) -> bool {
        let Ok(url) = Url::parse(locator) else {
            return false;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }
        let path = url.path().to_lowercase();
        AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    fn title_from(url: &Url) -> String {
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .unwrap_or_else(|| url.as_str().to_string())
    }
}

#[async_trait]
impl ContentResolver for DirectUrlResolver {
    async fn resolve_track(&self, locator: &str) -> Result<TrackMetadata, ResolveError> {
        if !Self::is_valid_url(locator) {
            return Err(ResolveError::Unsupported(locator.to_string()));
        }
        let url = Url::parse(locator).map_err(|e| ResolveError::Unsupported(e.to_string()))?;
        Ok(TrackMetadata::new(Self::title_from(&url), locator))
    }

    async fn resolve_stream(&self, track: &TrackMetadata) -> Result<PlayableTrack, ResolveError> {
        if !Self::is_valid_url(&track.url) {
            return Err(ResolveError::Unsupported(track.url.clone()));
        }
        Ok(track.clone().into_playable(track.url.clone()))
    }

    async fn resolve_playlist(&self, locator: &str) -> Result<Vec<TrackMetadata>, ResolveError> {
        Err(ResolveError::Unsupported(locator.to_string()))
    }

    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<TrackMetadata>, ResolveError> {
        Err(ResolveError::Unsupported(query.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_url_detection() {
        assert!(DirectUrlResolver::is_valid_url("https://cdn.example.com/music/song.mp3"));
        assert!(DirectUrlResolver::is_valid_url("http://example.com/a/B.FLAC?token=1"));
        assert!(!DirectUrlResolver::is_valid_url("https://example.com/watch?v=abc"));
        assert!(!DirectUrlResolver::is_valid_url("ftp://example.com/song.mp3"));
        assert!(!DirectUrlResolver::is_valid_url("song.mp3"));
    }

    #[tokio::test]
    async fn direct_links_are_their_own_stream() {
        let resolver = DirectUrlResolver::new();
        let meta = resolver
            .resolve_track("https://cdn.example.com/music/song.mp3")
            .await
            .unwrap();
        assert_eq!(meta.title, "song.mp3");

        let playable = resolver.resolve_stream(&meta).await.unwrap();
        assert_eq!(playable.stream_locator, "https://cdn.example.com/music/song.mp3");
    }
}
