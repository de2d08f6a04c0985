use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};

/// Engine limits and timeouts handed to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub max_queue_size: usize,
    /// Bound on join, transport calls, and start/stop confirmation.
    pub transport_timeout: Duration,
    /// `None` keeps idle sessions around forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            transport_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Paths
    pub data_dir: PathBuf,

    // Playback
    pub max_queue_size: usize,
    pub transport_timeout: Duration,
    pub idle_timeout: Option<Duration>,

    // Metadata cache
    pub cache_max_age: Duration,
    pub cache_eviction_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        // Create directories if they don't exist
        std::fs::create_dir_all(config.cache_dir())
            .with_context(|| format!("creating {}", config.cache_dir().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Builds a config from any key lookup, applying defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let duration = |key: &str, default: &str| -> Result<Duration> {
            let raw = var(key, default);
            humantime::parse_duration(raw.trim()).with_context(|| format!("{} is not a duration: {:?}", key, raw))
        };

        let idle_timeout = duration("IDLE_TIMEOUT", "5m")?;

        Ok(Self {
            discord_token: var("DISCORD_TOKEN", ""),
            data_dir: var("DATA_DIR", "/app/data").into(),
            max_queue_size: var("MAX_QUEUE_SIZE", "1000")
                .trim()
                .parse()
                .context("MAX_QUEUE_SIZE must be a whole number")?,
            transport_timeout: duration("TRANSPORT_TIMEOUT", "5s")?,
            idle_timeout: (!idle_timeout.is_zero()).then_some(idle_timeout),
            cache_max_age: duration("CACHE_MAX_AGE", "7days")?,
            cache_eviction_interval: duration("CACHE_EVICTION_INTERVAL", "6h")?,
        })
    }

    /// Sanity checks that catch common mistakes before the bot starts.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.transport_timeout.is_zero() {
            anyhow::bail!("Transport timeout must be greater than 0");
        }

        if self.cache_max_age.is_zero() {
            anyhow::bail!("Cache max age must be greater than 0");
        }

        if self.cache_eviction_interval.is_zero() {
            anyhow::bail!("Cache eviction interval must be greater than 0");
        }

        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_queue_size: self.max_queue_size,
            transport_timeout: self.transport_timeout,
            idle_timeout: self.idle_timeout,
        }
    }

    /// Returns a summary of the configuration for logging. Never includes the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Data: {}\n  \
            Playback: {} max queue, {} transport timeout, idle leave {}\n  \
            Cache: {} max age, eviction every {}",
            self.data_dir.display(),
            self.max_queue_size,
            humantime::format_duration(self.transport_timeout),
            self.idle_timeout
                .map_or("disabled".to_string(), |d| humantime::format_duration(d).to_string()),
            humantime::format_duration(self.cache_max_age),
            humantime::format_duration(self.cache_eviction_interval),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        let settings = EngineSettings::default();
        Self {
            // Discord (no default, must be provided)
            discord_token: String::new(),
            data_dir: "/app/data".into(),
            max_queue_size: settings.max_queue_size,
            transport_timeout: settings.transport_timeout,
            idle_timeout: settings.idle_timeout,
            cache_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            cache_eviction_interval: Duration::from_secs(6 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[("DISCORD_TOKEN", "secret")]).unwrap();
        let defaults = Config::default();

        assert_eq!(config.data_dir, defaults.data_dir);
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.transport_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.cache_max_age, defaults.cache_max_age);
        assert_eq!(config.cache_eviction_interval, defaults.cache_eviction_interval);
        assert_eq!(config.engine_settings(), EngineSettings::default());
        config.validate().unwrap();
    }

    #[test]
    fn durations_are_humantime() {
        let config = load(&[
            ("TRANSPORT_TIMEOUT", "750ms"),
            ("IDLE_TIMEOUT", "0s"),
            ("CACHE_MAX_AGE", "1day 12h"),
            ("DATA_DIR", "/tmp/music"),
        ])
        .unwrap();

        assert_eq!(config.transport_timeout, Duration::from_millis(750));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.cache_max_age, Duration::from_secs(36 * 60 * 60));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/music/cache"));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(load(&[("MAX_QUEUE_SIZE", "lots")]).is_err());
        assert!(load(&[("TRANSPORT_TIMEOUT", "soon")]).is_err());

        let config = load(&[("MAX_QUEUE_SIZE", "0")]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_the_token() {
        let config = load(&[("DISCORD_TOKEN", "super-secret-token")]).unwrap();
        let summary = config.summary();

        assert!(!summary.contains("super-secret-token"));
        assert!(summary.contains("1000 max queue"));
        assert!(summary.contains("idle leave 5m"));
    }
}
