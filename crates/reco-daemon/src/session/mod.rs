//! SessionController: single owner of the listen-and-recommend session.
//!
//! Every input (panel intents, host-page navigation, the 1 Hz monitoring
//! tick, the post-play settle timer) is handled on one loop, one at a time.
//! A Loading sequence runs inline inside the handler that started it, so at
//! most one exists and nothing else mutates the session while it runs.
//!
//! ```text
//!            Start / autoplay pending
//!   Idle ─────────────────────────────▶ Loading ──play ok──▶ Playing
//!    ▲                                    │                   │  │
//!    │          timeout / no result       │      Next / end   │  │
//!    ├────────────────────────────────────┘    of track ──────┘  │
//!    │                                        (back to Loading)  │
//!    └──────────────── Stop / track changed by user ─────────────┘
//! ```
//!
//! Collaborators hold no session state.  Only the controller touches the
//! key-value store; survival across a host-page reload (or a daemon restart)
//! goes entirely through the persisted recovery keys.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reco_proto::config::{Config, SessionConfig};
use reco_proto::protocol::{Algorithm, Command, Notice, PanelPosition, SessionStatus, View};
use reco_proto::store::{entries, keys, Entries, KeyValueStore};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::page::{NavigationEvent, NavigationKind, PageAdapter};
use crate::recommend::RecommendationClient;
use crate::surface::PresentationSurface;


const MSG_NO_RECOMMENDATION: &str = "Failed to get recommendation. Please try again.";
const MSG_NO_SEARCH: &str = "Could not open search results. Please try again.";
const MSG_NO_PLAYBACK: &str = "Could not start playback. Please try again.";
const MSG_INTERRUPTED: &str = "Music interrupted! Stopping recommendation process.";

/// How long shutdown waits for feedback still in flight.
const FEEDBACK_DRAIN: Duration = Duration::from_secs(5);

/// All inputs into the controller loop besides page navigation, which it
/// reads from its own subscription.
#[derive(Debug)]
pub enum SessionEvent {
    /// An intent from a panel.
    ClientCommand(Command),
    Shutdown,
}

/// The collaborators, handed over once at construction.
pub struct Collaborators {
    pub page: Arc<dyn PageAdapter>,
    pub surface: Arc<dyn PresentationSurface>,
    pub recommender: Arc<dyn RecommendationClient>,
    pub store: Arc<dyn KeyValueStore>,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub status: SessionStatus,
    pub user_id: String,
    pub algorithm: Algorithm,
    pub position: PanelPosition,
    /// Set once the post-play settle completes; cleared when a session ends.
    pub current_track_id: Option<String>,
    pub current_track_signature: Option<String>,
    pub listening_seconds: u64,
    /// Set when the end of a track starts the next cycle; held until a tick
    /// sees a track that is not about to end, so consecutive end-of-track
    /// ticks start only one cycle.
    pub is_transitioning: bool,
}

pub struct SessionController {
    session: Session,
    config: SessionConfig,
    search_marker: String,
    page: Arc<dyn PageAdapter>,
    surface: Arc<dyn PresentationSurface>,
    recommender: Arc<dyn RecommendationClient>,
    store: Arc<dyn KeyValueStore>,
    /// Polled only while Playing.
    ticker: Interval,
    /// Pending fingerprint capture after a successful play.
    settle_deadline: Option<Instant>,
    navigation: Option<broadcast::Receiver<NavigationEvent>>,
    /// Feedback submissions still in flight.
    feedback: JoinSet<()>,
}

/// `user_` followed by nine base-36 characters.
pub fn generate_user_id() -> String {
    const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("user_{}", suffix)
}

impl SessionController {
    /// Restore persisted settings and hand them to the surface.  Nothing is
    /// resumed yet; that happens when the loop starts.
    pub async fn load(config: &Config, ports: Collaborators) -> Self {
        let Collaborators {
            page,
            surface,
            recommender,
            store,
        } = ports;

        let stored = match store.load(&keys::ALL).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("session: could not read persisted state: {}", e);
                Entries::new()
            }
        };

        let user_id = match stored.get(keys::USER_ID).and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = generate_user_id();
                info!("session: new user id {}", id);
                if let Err(e) = store.save(entries([(keys::USER_ID, json!(id))])).await {
                    warn!("session: could not persist user id: {}", e);
                }
                id
            }
        };

        let algorithm = stored
            .get(keys::ALGO_TYPE)
            .and_then(Value::as_str)
            .and_then(Algorithm::from_wire)
            .unwrap_or_default();

        let position = stored
            .get(keys::SIDEBAR_POS)
            .and_then(|v| serde_json::from_value::<PanelPosition>(v.clone()).ok())
            .unwrap_or_default();

        surface.configure(&user_id, algorithm, position).await;
        // The panel always starts visible; hiding is per run.
        surface.set_visible(true).await;

        let mut ticker = tokio::time::interval(config.session.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let navigation = Some(page.navigation());

        Self {
            session: Session {
                user_id,
                algorithm,
                position,
                ..Session::default()
            },
            config: config.session.clone(),
            search_marker: config.page.search_marker.clone(),
            page,
            surface,
            recommender,
            store,
            ticker,
            settle_deadline: None,
            navigation,
            feedback: JoinSet::new(),
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until `Shutdown` or until every event sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<SessionEvent>) -> anyhow::Result<()> {
        info!("session: starting event loop");
        self.startup().await;

        loop {
            let playing = self.session.status == SessionStatus::Playing;
            let settle_at = self.settle_deadline;

            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("session: event channel closed, shutting down");
                        break;
                    }
                    Some(SessionEvent::Shutdown) => {
                        info!("session: shutdown requested");
                        break;
                    }
                    Some(SessionEvent::ClientCommand(cmd)) => {
                        info!("session: command {:?}", cmd);
                        self.handle_command(cmd).await;
                    }
                },

                nav = next_navigation(&mut self.navigation) => match nav {
                    Ok(ev) => self.handle_navigation(ev).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("session: missed {} navigation events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("session: navigation stream closed");
                        self.navigation = None;
                    }
                },

                _ = self.ticker.tick(), if playing => self.tick().await,

                _ = tokio::time::sleep_until(settle_at.unwrap_or_else(Instant::now)),
                    if settle_at.is_some() => self.finish_settle().await,

                Some(done) = self.feedback.join_next(), if !self.feedback.is_empty() => {
                    if let Err(e) = done {
                        warn!("session: feedback task failed: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    // ── inputs ────────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start => {
                if self.session.status == SessionStatus::Idle {
                    self.begin_recommendation().await;
                } else {
                    debug!("session: start ignored while {:?}", self.session.status);
                }
            }
            Command::Next => {
                if self.session.status == SessionStatus::Playing {
                    self.begin_recommendation().await;
                } else {
                    debug!("session: next ignored while {:?}", self.session.status);
                }
            }
            Command::Stop => self.stop().await,
            Command::Close => self.surface.set_visible(false).await,
            Command::TogglePanel => self.surface.toggle_visibility().await,
            Command::SetAlgorithm { algorithm } => self.set_algorithm(algorithm).await,
            Command::SetPosition { position } => self.set_position(position).await,
            Command::GetState => {
                // The socket server answers with the panel snapshot.
            }
        }
    }

    async fn handle_navigation(&mut self, event: NavigationEvent) {
        match event.kind {
            NavigationKind::SameDocument => {
                debug!("session: in-page navigation to {}", event.url);
            }
            NavigationKind::FullLoad => {
                info!("session: host page loaded {}", event.url);
                self.recover().await;
            }
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    async fn startup(&mut self) {
        let stored = self
            .load_keys(&[
                keys::AUTOPLAY_PENDING,
                keys::CURRENT_TRACK_ID,
                keys::LISTENING_TIME,
            ])
            .await;

        let pending = stored
            .get(keys::AUTOPLAY_PENDING)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let seconds = stored
            .get(keys::LISTENING_TIME)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let track = stored
            .get(keys::CURRENT_TRACK_ID)
            .and_then(Value::as_str)
            .map(str::to_string);

        // A session cut off by a previous exit.
        if !pending && seconds > 0 {
            if let Some(track) = track {
                info!(
                    "session: flushing unsent listening time ({} / {}s)",
                    track, seconds
                );
                self.submit_feedback(track, seconds);
                self.persist(entries([
                    (keys::LISTENING_TIME, json!(0)),
                    (keys::CURRENT_TRACK_ID, Value::Null),
                ]))
                .await;
            }
        }

        self.recover().await;
    }

    /// Resume an autoplay that a navigation interrupted, else settle on Idle.
    /// Never resumes a session as already playing.
    async fn recover(&mut self) {
        let pending = self
            .load_keys(&[keys::AUTOPLAY_PENDING])
            .await
            .get(keys::AUTOPLAY_PENDING)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if pending {
            info!("session: autoplay pending, resuming play");
            self.enter_loading().await;
            self.locate_and_play().await;
            return;
        }

        match self.session.status {
            SessionStatus::Playing => {
                info!("session: host player was torn down, ending session");
                self.end_session().await;
            }
            SessionStatus::Loading | SessionStatus::Idle => {
                self.set_status(SessionStatus::Idle).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.session.status == SessionStatus::Playing {
            self.persist(entries([(
                keys::LISTENING_TIME,
                json!(self.session.listening_seconds),
            )]))
            .await;
        }

        if !self.feedback.is_empty() {
            info!("session: waiting for {} feedback submission(s)", self.feedback.len());
            let drained = tokio::time::timeout(FEEDBACK_DRAIN, async {
                while self.feedback.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("session: feedback still pending after {:?}, dropping it", FEEDBACK_DRAIN);
            }
        }
        info!("session: stopped");
    }

    // ── the Loading sequence ──────────────────────────────────────────────────

    async fn begin_recommendation(&mut self) {
        self.close_listening().await;
        self.enter_loading().await;

        let rec = match self
            .recommender
            .recommend(&self.session.user_id, self.session.algorithm)
            .await
        {
            Ok(rec) => rec,
            Err(e) => {
                error!("session: recommendation failed: {}", e);
                self.abandon_loading(MSG_NO_RECOMMENDATION).await;
                return;
            }
        };
        info!(
            "session: recommended {:?} via {}",
            rec.song_title, rec.algorithm
        );

        // Written before navigating: a full reload resumes from here.
        self.persist(entries([
            (keys::AUTOPLAY_PENDING, json!(true)),
            (keys::CURRENT_TRACK_ID, json!(rec.song_title)),
        ]))
        .await;

        if let Err(e) = self.page.search(&rec.song_title).await {
            warn!("session: search failed: {}", e);
            self.abandon_loading(MSG_NO_SEARCH).await;
            return;
        }

        if let Err(e) = self
            .page
            .wait_for_url(&self.search_marker, self.config.navigation_timeout())
            .await
        {
            warn!("session: {}", e);
            self.abandon_loading(MSG_NO_SEARCH).await;
            return;
        }

        // Let the in-page router swap out the previous results.
        tokio::time::sleep(self.config.spa_settle()).await;
        self.locate_and_play().await;
    }

    async fn locate_and_play(&mut self) {
        let played = self
            .page
            .play_first_result(self.config.element_timeout())
            .await;

        // Whatever the page reported while we were busy belongs to our own
        // search, not to the user.
        self.discard_stale_navigation();

        if !played {
            self.abandon_loading(MSG_NO_PLAYBACK).await;
            return;
        }

        self.persist(entries([(keys::AUTOPLAY_PENDING, json!(false))]))
            .await;
        self.set_status(SessionStatus::Playing).await;
        self.ticker.reset();
        self.settle_deadline = Some(Instant::now() + self.config.settle_delay());
    }

    /// The now-playing badge has had time to update: fingerprint it and pick
    /// the track id back up from the recovery keys.
    async fn finish_settle(&mut self) {
        self.settle_deadline = None;
        if self.session.status != SessionStatus::Playing {
            return;
        }

        self.session.current_track_signature = self.page.current_track_signature().await;
        info!(
            "session: tracking {:?}",
            self.session.current_track_signature
        );

        if let Some(track) = self
            .load_keys(&[keys::CURRENT_TRACK_ID])
            .await
            .get(keys::CURRENT_TRACK_ID)
            .and_then(Value::as_str)
        {
            self.session.current_track_id = Some(track.to_string());
        }
    }

    async fn abandon_loading(&mut self, message: &str) {
        self.persist(entries([(keys::AUTOPLAY_PENDING, json!(false))]))
            .await;
        self.surface.notify(Notice::failure(message)).await;
        self.end_session().await;
    }

    // ── monitoring ────────────────────────────────────────────────────────────

    async fn tick(&mut self) {
        if self.session.status != SessionStatus::Playing {
            return;
        }
        // Paused, not ended.
        if !self.page.is_playing().await {
            return;
        }

        if self.settle_deadline.is_none() {
            if let Some(current) = self.page.current_track_signature().await {
                match self.session.current_track_signature.clone() {
                    Some(known) if known != current => {
                        info!(
                            "session: track changed by user ({:?} -> {:?})",
                            known, current
                        );
                        self.surface.notify(Notice::interrupted(MSG_INTERRUPTED)).await;
                        self.end_session().await;
                        return;
                    }
                    Some(_) => {}
                    None => self.session.current_track_signature = Some(current),
                }
            }
        }

        self.session.listening_seconds += 1;
        let seconds = self.session.listening_seconds;
        self.surface.update_timer(seconds).await;

        let every = self.config.checkpoint_every;
        if every > 0 && seconds % every == 0 {
            self.persist(entries([(keys::LISTENING_TIME, json!(seconds))]))
                .await;
        }

        let near_end = self
            .page
            .progress()
            .await
            .map(|p| p.is_near_end(self.config.end_threshold_secs))
            .unwrap_or(false);

        if !near_end {
            self.session.is_transitioning = false;
        } else if !self.session.is_transitioning {
            info!("session: track finished, fetching the next one");
            self.session.is_transitioning = true;
            self.begin_recommendation().await;
        }
    }

    // ── session end ───────────────────────────────────────────────────────────

    async fn stop(&mut self) {
        if self.session.status == SessionStatus::Idle {
            debug!("session: stop while idle");
            return;
        }
        info!("session: stopping");
        self.end_session().await;
    }

    /// Submit what was listened to and zero the counter.
    async fn close_listening(&mut self) {
        let seconds = std::mem::take(&mut self.session.listening_seconds);
        if seconds > 0 {
            if let Some(track) = self.session.current_track_id.clone() {
                self.submit_feedback(track, seconds);
            }
        }
        self.persist(entries([(keys::LISTENING_TIME, json!(0))]))
            .await;
        self.surface.update_timer(0).await;
    }

    async fn end_session(&mut self) {
        self.close_listening().await;
        self.session.current_track_id = None;
        self.session.current_track_signature = None;
        self.session.is_transitioning = false;
        self.settle_deadline = None;
        self.persist(entries([(keys::CURRENT_TRACK_ID, Value::Null)]))
            .await;
        self.set_status(SessionStatus::Idle).await;
    }

    /// Never delays the transition it accompanies; only shutdown waits for it.
    fn submit_feedback(&mut self, track: String, seconds: u64) {
        let client = self.recommender.clone();
        let user_id = self.session.user_id.clone();
        info!("session: feedback for {:?} ({}s)", track, seconds);
        self.feedback.spawn(async move {
            let receipt = client.send_feedback(&user_id, &track, seconds).await;
            if receipt.is_success() {
                debug!("session: feedback accepted {:?}", receipt);
            } else {
                warn!(
                    "session: feedback not recorded: {}",
                    receipt.message.unwrap_or(receipt.status)
                );
            }
        });
    }

    // ── settings ──────────────────────────────────────────────────────────────

    async fn set_algorithm(&mut self, algorithm: Algorithm) {
        info!("session: algorithm set to {}", algorithm.wire_name());
        self.session.algorithm = algorithm;
        self.persist(entries([(keys::ALGO_TYPE, json!(algorithm.wire_name()))]))
            .await;
        self.reconfigure_surface().await;
    }

    async fn set_position(&mut self, position: PanelPosition) {
        self.session.position = position;
        self.persist(entries([(keys::SIDEBAR_POS, json!(position))]))
            .await;
        self.reconfigure_surface().await;
    }

    async fn reconfigure_surface(&self) {
        self.surface
            .configure(
                &self.session.user_id,
                self.session.algorithm,
                self.session.position,
            )
            .await;
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    async fn enter_loading(&mut self) {
        self.session.current_track_id = None;
        self.session.current_track_signature = None;
        self.settle_deadline = None;
        self.set_status(SessionStatus::Loading).await;
    }

    async fn set_status(&mut self, status: SessionStatus) {
        if self.session.status != status {
            debug!("session: {:?} -> {:?}", self.session.status, status);
        }
        self.session.status = status;

        let view = match status {
            SessionStatus::Idle => View::Idle,
            SessionStatus::Loading => View::Loading {
                algorithm: self.session.algorithm,
            },
            SessionStatus::Playing => View::Playing,
        };
        self.surface.render(view).await;
        self.persist(entries([(keys::SESSION_STATUS, json!(status.as_str()))]))
            .await;
    }

    fn discard_stale_navigation(&mut self) {
        if let Some(rx) = self.navigation.as_mut() {
            *rx = rx.resubscribe();
        }
    }

    async fn load_keys(&self, wanted: &[&str]) -> Entries {
        match self.store.load(wanted).await {
            Ok(found) => found,
            Err(e) => {
                warn!("session: could not read persisted state: {}", e);
                Entries::new()
            }
        }
    }

    async fn persist(&self, values: Entries) {
        if let Err(e) = self.store.save(values).await {
            warn!("session: could not persist state: {}", e);
        }
    }
}

/// Next navigation event, or never once the stream is gone.
async fn next_navigation(
    rx: &mut Option<broadcast::Receiver<NavigationEvent>>,
) -> Result<NavigationEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
