//! Host-page automation.
//!
//! Two layers:
//! - `PageDriver`: raw primitives against whatever hosts the page (CDP in
//!   production, a scripted fake in tests).
//! - `PageAdapter`: what the session controller needs: search, wait for
//!   navigation, click the page's own play control, read now-playing state.
//!
//! The host page's markup is outside our control.  Reads never fail: missing
//! markup or a driver error reads as "nothing playing / nothing known".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reco_proto::config::PageConfig;
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::observe::observe_until;

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        after: Duration,
    },
    #[error("page driver: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    /// Client-side route change; the document (and our hooks) survive.
    SameDocument,
    /// New document; anything injected into the old one is gone.
    FullLoad,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub url: String,
    pub kind: NavigationKind,
}

/// Snapshot of one element matched by a selector.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Element {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Element {
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// `attr(name)` if non-blank, else the trimmed text content.
    fn attr_or_text(&self, name: &str) -> String {
        match self.attr(name).map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => self.text.trim().to_string(),
        }
    }
}

/// Playback position in whole seconds as reported by the host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub current: u64,
    pub maximum: u64,
}

impl Progress {
    /// True within `threshold` seconds of a known (non-zero) end, once the
    /// track has actually started.
    pub fn is_near_end(&self, threshold: u64) -> bool {
        self.maximum > 0 && self.current >= self.maximum.saturating_sub(threshold) && self.current > 1
    }
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn current_url(&self) -> Result<String, PageError>;
    async fn query(&self, selector: &str) -> Result<Option<Element>, PageError>;
    /// Click the first match.  `Ok(false)` when nothing matched.
    async fn click(&self, selector: &str) -> Result<bool, PageError>;
    /// Route to `path` through the page's own client-side router.
    async fn navigate_in_page(&self, path: &str) -> Result<(), PageError>;
    /// Fires (coalesced) whenever the document changes.
    fn mutations(&self) -> broadcast::Receiver<()>;
    fn navigations(&self) -> broadcast::Receiver<NavigationEvent>;
}

#[async_trait]
pub trait PageAdapter: Send + Sync {
    /// Start navigating to search results for `query`.  Returns once the
    /// navigation is issued, not when it completes.
    async fn search(&self, query: &str) -> Result<(), PageError>;
    async fn wait_for_url(&self, fragment: &str, timeout: Duration) -> Result<(), PageError>;
    async fn wait_for_element(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Element, PageError>;
    /// Wait for the first search result's play control and click it.
    async fn play_first_result(&self, timeout: Duration) -> bool;
    async fn is_playing(&self) -> bool;
    async fn progress(&self) -> Option<Progress>;
    /// `"<artist> - <title>"` from the now-playing badge.
    async fn current_track_signature(&self) -> Option<String>;
    /// A new subscription to navigation events.  Other subscribers may exist.
    fn navigation(&self) -> broadcast::Receiver<NavigationEvent>;
}

pub struct HostPageAdapter<D> {
    driver: D,
    selectors: PageConfig,
}

impl<D: PageDriver> HostPageAdapter<D> {
    pub fn new(driver: D, selectors: PageConfig) -> Self {
        Self { driver, selectors }
    }

    /// `search_path?q=<query>`, form-encoded.
    fn search_target(&self, query: &str) -> Result<String, PageError> {
        let mut url = Url::parse("https://host.invalid/")
            .map_err(|e| PageError::Driver(e.to_string()))?;
        url.set_path(&self.selectors.search_path);
        url.query_pairs_mut().append_pair("q", query);
        Ok(format!("{}?{}", url.path(), url.query().unwrap_or_default()))
    }

    async fn read(&self, selector: &str) -> Option<Element> {
        match self.driver.query(selector).await {
            Ok(found) => found,
            Err(e) => {
                debug!("page: read {} failed: {}", selector, e);
                None
            }
        }
    }
}

fn parse_position(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v as u64)
        .unwrap_or(0)
}

#[async_trait]
impl<D: PageDriver> PageAdapter for HostPageAdapter<D> {
    async fn search(&self, query: &str) -> Result<(), PageError> {
        let target = self.search_target(query)?;
        info!("page: searching {:?} via {}", query, target);
        self.driver.navigate_in_page(&target).await
    }

    async fn wait_for_url(&self, fragment: &str, timeout: Duration) -> Result<(), PageError> {
        let driver = &self.driver;
        let rx = driver.navigations();
        let found = observe_until(rx, timeout, |event: Option<NavigationEvent>| async move {
            let url = match event {
                Some(ev) => ev.url,
                None => driver.current_url().await.ok()?,
            };
            url.contains(fragment).then_some(())
        })
        .await;

        found.ok_or_else(|| PageError::Timeout {
            waiting_for: format!("location containing {:?}", fragment),
            after: timeout,
        })
    }

    async fn wait_for_element(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Element, PageError> {
        let driver = &self.driver;
        let rx = driver.mutations();
        let found = observe_until(rx, timeout, |_| async move {
            driver.query(selector).await.ok().flatten()
        })
        .await;

        found.ok_or_else(|| PageError::Timeout {
            waiting_for: selector.to_string(),
            after: timeout,
        })
    }

    async fn play_first_result(&self, timeout: Duration) -> bool {
        let item = &self.selectors.result_item;
        if let Err(e) = self.wait_for_element(item, timeout).await {
            warn!("page: no search results: {}", e);
            return false;
        }

        let button = format!("{} {}", item, self.selectors.play_button);
        if let Err(e) = self.wait_for_element(&button, timeout).await {
            warn!("page: no play control on results: {}", e);
            return false;
        }

        match self.driver.click(&button).await {
            Ok(true) => {
                info!("page: play control clicked");
                true
            }
            Ok(false) => {
                warn!("page: play control vanished before click");
                false
            }
            Err(e) => {
                warn!("page: click failed: {}", e);
                false
            }
        }
    }

    async fn is_playing(&self) -> bool {
        self.read(&self.selectors.play_control)
            .await
            .map(|el| el.has_class(&self.selectors.playing_class))
            .unwrap_or(false)
    }

    async fn progress(&self) -> Option<Progress> {
        let el = self.read(&self.selectors.progress).await?;
        Some(Progress {
            current: parse_position(el.attr("aria-valuenow")),
            maximum: parse_position(el.attr("aria-valuemax")),
        })
    }

    async fn current_track_signature(&self) -> Option<String> {
        let title = self.read(&self.selectors.title_link).await?;
        let artist = self
            .read(&self.selectors.artist_link)
            .await
            .map(|el| el.attr_or_text("title"))
            .unwrap_or_default();
        Some(format!("{} - {}", artist, title.attr_or_text("title")))
    }

    fn navigation(&self) -> broadcast::Receiver<NavigationEvent> {
        self.driver.navigations()
    }
}
