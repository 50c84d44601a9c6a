//! Daemon side of the presentation surface.
//!
//! The surface holds no session state of its own: it keeps the last
//! `PanelState` it was told to show and announces every change to connected
//! panels.  User intents travel the other way as `Command`s through the
//! socket server.

use std::sync::Arc;

use async_trait::async_trait;
use reco_proto::protocol::{Algorithm, Notice, PanelPosition, PanelState, View};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Everything fanned out to connected panels.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// The panel snapshot changed; clients re-read it.
    PanelUpdated,
    Notice(Notice),
    Log(String),
}

#[async_trait]
pub trait PresentationSurface: Send + Sync {
    /// Show exactly this view.
    async fn render(&self, view: View);
    async fn update_timer(&self, seconds: u64);
    async fn notify(&self, notice: Notice);
    /// Settings shown on the panel.  Handed over by the controller at start-up
    /// and whenever they change.
    async fn configure(&self, user_id: &str, algorithm: Algorithm, position: PanelPosition);
    async fn set_visible(&self, visible: bool);
    async fn toggle_visibility(&self);
}

pub struct BroadcastSurface {
    state: Arc<RwLock<PanelState>>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastSurface {
    pub fn new(broadcast_tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self {
            state: Arc::new(RwLock::new(PanelState::default())),
            broadcast_tx,
        }
    }

    pub async fn snapshot(&self) -> PanelState {
        self.state.read().await.clone()
    }

    /// Apply `f`; bump `rev` and announce only if something changed.
    async fn update<F: FnOnce(&mut PanelState)>(&self, f: F) {
        let changed = {
            let mut state = self.state.write().await;
            let before = state.clone();
            f(&mut state);
            if *state != before {
                state.rev += 1;
                true
            } else {
                false
            }
        };
        if changed {
            // No connected panels is fine.
            let _ = self.broadcast_tx.send(BroadcastMessage::PanelUpdated);
        }
    }
}

#[async_trait]
impl PresentationSurface for BroadcastSurface {
    async fn render(&self, view: View) {
        debug!("surface: render {:?}", view);
        self.update(|s| s.view = view).await;
    }

    async fn update_timer(&self, seconds: u64) {
        self.update(|s| s.timer_secs = seconds).await;
    }

    async fn notify(&self, notice: Notice) {
        debug!("surface: notice {:?}", notice);
        let _ = self.broadcast_tx.send(BroadcastMessage::Notice(notice));
    }

    async fn configure(&self, user_id: &str, algorithm: Algorithm, position: PanelPosition) {
        self.update(|s| {
            s.user_id = user_id.to_string();
            s.algorithm = algorithm;
            s.position = position;
        })
        .await;
    }

    async fn set_visible(&self, visible: bool) {
        self.update(|s| s.visible = visible).await;
    }

    async fn toggle_visibility(&self) {
        self.update(|s| s.visible = !s.visible).await;
    }
}
