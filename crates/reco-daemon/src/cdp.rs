//! Chrome DevTools Protocol page driver.
//!
//! Architecture:
//!
//! ```text
//!   CdpDriver::attach()
//!         │
//!         ├── handler_task    ← drives the chromiumoxide connection
//!         ├── binding_task    ← Runtime.bindingCalled(__recoMutation) → mutations
//!         ├── frame_task      ← Page.frameNavigated (top frame)      → FullLoad
//!         └── history_task    ← Page.navigatedWithinDocument         → SameDocument
//! ```
//!
//! DOM access is done with small `Runtime.evaluate` snippets that always
//! return a JSON string, so a missing element comes back as `"null"` rather
//! than as a remote-object edge case.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventFrameNavigated, EventNavigatedWithinDocument,
};
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::{Browser, Page};
use futures_util::StreamExt;
use reco_proto::config::BrowserConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::page::{Element, NavigationEvent, NavigationKind, PageDriver, PageError};

const MUTATION_BINDING: &str = "__recoMutation";

/// Installs a MutationObserver that reports through the CDP binding, at most
/// once per 50ms.  Guarded so re-evaluation on the same document is a no-op.
const OBSERVER_SCRIPT: &str = r#"(() => {
  if (window.__recoObserverInstalled) return;
  window.__recoObserverInstalled = true;
  let pending = false;
  const notify = () => {
    pending = false;
    try { window.__recoMutation(''); } catch (_) {}
  };
  const start = () => {
    new MutationObserver(() => {
      if (!pending) { pending = true; setTimeout(notify, 50); }
    }).observe(document.documentElement, { childList: true, subtree: true, attributes: true });
  };
  if (document.documentElement) start();
  else document.addEventListener('DOMContentLoaded', start);
})()"#;

pub struct CdpDriver {
    // Keeps the DevTools connection open for as long as the driver lives.
    _browser: Browser,
    page: Page,
    mutation_tx: broadcast::Sender<()>,
    navigation_tx: broadcast::Sender<NavigationEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl CdpDriver {
    /// Connect to a running browser and adopt (or open) the host tab.
    pub async fn attach(config: &BrowserConfig) -> anyhow::Result<Self> {
        info!("cdp: connecting to {}", config.devtools_url);
        let (browser, mut handler) = Browser::connect(config.devtools_url.clone()).await?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("cdp: connection handler error: {}", e);
                    break;
                }
            }
            debug!("cdp: handler task exiting");
        }));

        let page = Self::find_host_page(&browser, config).await?;

        let (mutation_tx, _) = broadcast::channel::<()>(64);
        let (navigation_tx, _) = broadcast::channel::<NavigationEvent>(64);

        page.execute(AddBindingParams::new(MUTATION_BINDING)).await?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(OBSERVER_SCRIPT))
            .await?;
        page.evaluate(OBSERVER_SCRIPT).await?;

        let mut bindings = page.event_listener::<EventBindingCalled>().await?;
        let tx = mutation_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(call) = bindings.next().await {
                if call.name == MUTATION_BINDING {
                    // No subscribers is fine: nobody is waiting on the DOM.
                    let _ = tx.send(());
                }
            }
        }));

        let mut frames = page.event_listener::<EventFrameNavigated>().await?;
        let tx = navigation_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(ev) = frames.next().await {
                if ev.frame.parent_id.is_some() {
                    continue;
                }
                debug!("cdp: document load {}", ev.frame.url);
                let _ = tx.send(NavigationEvent {
                    url: ev.frame.url.clone(),
                    kind: NavigationKind::FullLoad,
                });
            }
        }));

        let mut history = page.event_listener::<EventNavigatedWithinDocument>().await?;
        let tx = navigation_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(ev) = history.next().await {
                debug!("cdp: in-page navigation {}", ev.url);
                let _ = tx.send(NavigationEvent {
                    url: ev.url.clone(),
                    kind: NavigationKind::SameDocument,
                });
            }
        }));

        info!("cdp: attached to host page");
        Ok(Self {
            _browser: browser,
            page,
            mutation_tx,
            navigation_tx,
            tasks,
        })
    }

    async fn find_host_page(browser: &Browser, config: &BrowserConfig) -> anyhow::Result<Page> {
        for page in browser.pages().await? {
            let url = page.url().await?.unwrap_or_default();
            if url.contains(&config.host_match) {
                info!("cdp: adopting existing tab {}", url);
                return Ok(page);
            }
        }
        info!("cdp: no {} tab open, opening {}", config.host_match, config.start_url);
        Ok(browser.new_page(config.start_url.as_str()).await?)
    }

    /// Evaluate `expr` (which must produce a JSON string) and decode it.
    async fn eval_json<T: serde::de::DeserializeOwned>(&self, expr: String) -> Result<T, PageError> {
        let raw: String = self
            .page
            .evaluate(expr)
            .await
            .map_err(|e| PageError::Driver(e.to_string()))?
            .into_value()
            .map_err(|e| PageError::Driver(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| PageError::Driver(e.to_string()))
    }
}

impl Drop for CdpDriver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// JS string literal for `s`.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[async_trait]
impl PageDriver for CdpDriver {
    async fn current_url(&self) -> Result<String, PageError> {
        self.eval_json("JSON.stringify(window.location.href)".to_string())
            .await
    }

    async fn query(&self, selector: &str) -> Result<Option<Element>, PageError> {
        let expr = format!(
            r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return 'null';
  return JSON.stringify({{
    text: el.innerText || el.textContent || '',
    classes: Array.from(el.classList),
    attributes: Object.fromEntries(Array.from(el.attributes).map(a => [a.name, a.value])),
  }});
}})()"#,
            sel = js_string(selector)
        );
        self.eval_json(expr).await
    }

    async fn click(&self, selector: &str) -> Result<bool, PageError> {
        let expr = format!(
            r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return 'false';
  el.click();
  return 'true';
}})()"#,
            sel = js_string(selector)
        );
        self.eval_json(expr).await
    }

    async fn navigate_in_page(&self, path: &str) -> Result<(), PageError> {
        // A synthetic anchor click goes through the page's own router, so
        // single-page hosts switch views without a document reload.
        let expr = format!(
            r#"(() => {{
  const link = document.createElement('a');
  link.href = {href};
  link.style.display = 'none';
  document.body.appendChild(link);
  link.click();
  setTimeout(() => link.remove(), 100);
  return 'null';
}})()"#,
            href = js_string(path)
        );
        self.eval_json::<Option<()>>(expr).await.map(|_| ())
    }

    fn mutations(&self) -> broadcast::Receiver<()> {
        self.mutation_tx.subscribe()
    }

    fn navigations(&self) -> broadcast::Receiver<NavigationEvent> {
        self.navigation_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_string_escapes_selector() {
        assert_eq!(js_string(".a .b"), "\".a .b\"");
        assert_eq!(js_string("a[title=\"x\"]"), "\"a[title=\\\"x\\\"]\"");
    }

    #[test]
    fn test_element_decodes_from_snapshot_json() {
        let raw = r#"{"text":"Track X","classes":["playControl","playing"],"attributes":{"title":"Track X"}}"#;
        let el: Option<Element> = serde_json::from_str(raw).unwrap();
        let el = el.unwrap();
        assert!(el.has_class("playing"));
        assert_eq!(el.attr("title"), Some("Track X"));

        let missing: Option<Element> = serde_json::from_str("null").unwrap();
        assert!(missing.is_none());
    }
}
