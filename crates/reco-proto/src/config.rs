use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub recommender: RecommenderConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub page: PageConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// JSON key-value file backing the persistence port.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl SocketConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Remote recommendation / feedback service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommenderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Skip the network entirely and always serve placeholder tracks.
    #[serde(default)]
    pub use_mock: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts before degrading to a placeholder.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

/// How to reach the browser tab hosting the streaming page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// DevTools endpoint of a browser started with `--remote-debugging-port`.
    #[serde(default = "default_devtools_url")]
    pub devtools_url: String,
    /// A tab whose URL contains this string is adopted as the host page.
    #[serde(default = "default_host_match")]
    pub host_match: String,
    /// Opened in a new tab when no matching tab exists.
    #[serde(default = "default_start_url")]
    pub start_url: String,
}

/// Host-page markup hooks.  The host page is not ours; when its markup
/// drifts, these are what need updating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageConfig {
    #[serde(default = "default_search_path")]
    pub search_path: String,
    /// Substring of the location once search results are showing.
    #[serde(default = "default_search_marker")]
    pub search_marker: String,
    #[serde(default = "default_result_item")]
    pub result_item: String,
    #[serde(default = "default_play_button")]
    pub play_button: String,
    #[serde(default = "default_play_control")]
    pub play_control: String,
    #[serde(default = "default_playing_class")]
    pub playing_class: String,
    #[serde(default = "default_progress")]
    pub progress: String,
    #[serde(default = "default_title_link")]
    pub title_link: String,
    #[serde(default = "default_artist_link")]
    pub artist_link: String,
}

/// Timing constants of the listen loop.  These were tuned against the host
/// page's update latency and are not fixed law.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Remaining seconds at which a track counts as finished.
    #[serde(default = "default_end_threshold_secs")]
    pub end_threshold_secs: u64,
    /// Wait after a successful play before fingerprinting the track.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Wait after in-page navigation before looking for result markup.
    #[serde(default = "default_spa_settle_ms")]
    pub spa_settle_ms: u64,
    /// Persist the listening counter every N counted ticks.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default = "default_element_timeout_ms")]
    pub element_timeout_ms: u64,
}

impl SessionConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn spa_settle(&self) -> Duration {
        Duration::from_millis(self.spa_settle_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            use_mock: false,
            timeout_secs: default_request_timeout_secs(),
            retries: default_retries(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            devtools_url: default_devtools_url(),
            host_match: default_host_match(),
            start_url: default_start_url(),
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            search_path: default_search_path(),
            search_marker: default_search_marker(),
            result_item: default_result_item(),
            play_button: default_play_button(),
            play_control: default_play_control(),
            playing_class: default_playing_class(),
            progress: default_progress(),
            title_link: default_title_link(),
            artist_link: default_artist_link(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            end_threshold_secs: default_end_threshold_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            spa_settle_ms: default_spa_settle_ms(),
            checkpoint_every: default_checkpoint_every(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            element_timeout_ms: default_element_timeout_ms(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("session.json")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_retries() -> u32 {
    1
}

fn default_devtools_url() -> String {
    "http://127.0.0.1:9222".to_string()
}

fn default_host_match() -> String {
    "soundcloud.com".to_string()
}

fn default_start_url() -> String {
    "https://soundcloud.com".to_string()
}

fn default_search_path() -> String {
    "/search/sounds".to_string()
}

fn default_search_marker() -> String {
    "/search".to_string()
}

fn default_result_item() -> String {
    ".searchList__item".to_string()
}

fn default_play_button() -> String {
    ".sc-button-play".to_string()
}

fn default_play_control() -> String {
    ".playControl".to_string()
}

fn default_playing_class() -> String {
    "playing".to_string()
}

fn default_progress() -> String {
    ".playbackTimeline__progressWrapper".to_string()
}

fn default_title_link() -> String {
    ".playControls .playbackSoundBadge__titleLink".to_string()
}

fn default_artist_link() -> String {
    ".playControls .playbackSoundBadge__lightLink".to_string()
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_end_threshold_secs() -> u64 {
    2
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_spa_settle_ms() -> u64 {
    1000
}

fn default_checkpoint_every() -> u64 {
    5
}

fn default_navigation_timeout_ms() -> u64 {
    5000
}

fn default_element_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing the defaults there first if it is missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.socket.port, platform::DAEMON_TCP_PORT);
        assert_eq!(config.socket.bind_address, "127.0.0.1");
        assert_eq!(config.session.end_threshold_secs, 2);
        assert_eq!(config.session.checkpoint_every, 5);
        assert_eq!(config.session.tick(), Duration::from_secs(1));
        assert!(!config.recommender.use_mock);
        assert!(config.daemon.state_file.ends_with("reco/session.json"));
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [session]
            settle_delay_ms = 3500

            [page]
            result_item = ".results li"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.settle_delay(), Duration::from_millis(3500));
        assert_eq!(config.session.tick_ms, 1000);
        assert_eq!(config.page.result_item, ".results li");
        assert_eq!(config.page.play_button, ".sc-button-play");
        assert_eq!(config.recommender.base_url, "http://localhost:5000");
    }

    #[test]
    fn test_load_from_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.socket.port, config.socket.port);
        assert_eq!(reloaded.browser.host_match, "soundcloud.com");
    }
}
