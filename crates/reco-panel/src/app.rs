use std::io;
use std::time::Duration;

use ratatui::crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Layout, Rect},
    text::{Line, Span},
    widgets::{Block, BorderType, Clear, Paragraph},
    Frame, Terminal,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use reco_proto::protocol::{
    format_timer, Broadcast, Command, Message, NoticeKind, PanelPosition, PanelState, View,
    PROTOCOL_VERSION,
};

use crate::connection::DaemonConnection;
use crate::theme::{
    style_accent, style_border, style_default, style_key_hint, style_loading, style_muted,
    style_playing, style_secondary, C_PLAYING, C_TOAST_ERROR,
};
use crate::toast::ToastManager;

const PANEL_WIDTH: u16 = 38;
const PANEL_HEIGHT: u16 = 8;
const SPINNER_FRAMES: &[&str] = &["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"];

// ── Internal event bus ────────────────────────────────────────────────────────

enum AppMessage {
    Event(Event),
    Daemon(Message),
    /// The daemon connection ended, with the read error if there was one.
    Disconnected(Option<String>),
}

#[derive(Debug, PartialEq)]
pub enum Action {
    Send(Command),
    Quit,
}

pub struct App {
    /// Last snapshot from the daemon.  `None` until Hello arrives.
    panel: Option<PanelState>,
    connected: bool,
    toasts: ToastManager,
    last_log: Option<String>,
    spinner_frame: usize,
    should_quit: bool,
}

impl App {
    pub fn new() -> Self {
        Self {
            panel: None,
            connected: true,
            toasts: ToastManager::new(),
            last_log: None,
            spinner_frame: 0,
            should_quit: false,
        }
    }

    // ── Main run loop ─────────────────────────────────────────────────────────

    pub async fn run(mut self, connection: DaemonConnection) -> anyhow::Result<()> {
        let (mut reader, mut writer) = connection.into_split();

        debug!("run(): enabling raw mode");
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let (tx, mut rx) = mpsc::channel::<AppMessage>(256);

        // ── Background task: keyboard events ─────────────────────────────────
        // Polls so the thread notices when the UI loop has gone away.
        let event_tx = tx.clone();
        tokio::task::spawn_blocking(move || loop {
            if event_tx.is_closed() {
                break;
            }
            match event::poll(Duration::from_millis(250)) {
                Ok(true) => match event::read() {
                    Ok(ev) => {
                        if event_tx.blocking_send(AppMessage::Event(ev)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                Ok(false) => {}
                Err(_) => break,
            }
        });

        // ── Background task: daemon frames → AppMessage ──────────────────────
        let daemon_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match reader.receive_message().await {
                    Ok(Some(msg)) => {
                        if daemon_tx.send(AppMessage::Daemon(msg)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = daemon_tx.send(AppMessage::Disconnected(None)).await;
                        break;
                    }
                    Err(e) => {
                        let _ = daemon_tx
                            .send(AppMessage::Disconnected(Some(e.to_string())))
                            .await;
                        break;
                    }
                }
            }
        });
        drop(tx);

        // Toast expiry + loading spinner
        let mut ui_tick = tokio::time::interval(Duration::from_millis(100));
        ui_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut needs_redraw = true;
        loop {
            if needs_redraw {
                terminal.draw(|f| self.draw(f))?;
                needs_redraw = false;
            }

            tokio::select! {
                Some(msg) = rx.recv() => {
                    for action in self.handle_message(msg) {
                        match action {
                            Action::Send(cmd) => {
                                debug!("sending {:?}", cmd);
                                if let Err(e) = writer.send(cmd).await {
                                    warn!("Failed to send command: {}", e);
                                    self.connected = false;
                                    self.toasts.error("Lost connection to the daemon");
                                }
                            }
                            Action::Quit => self.should_quit = true,
                        }
                    }
                    needs_redraw = true;
                }
                _ = ui_tick.tick() => {
                    needs_redraw = self.on_tick();
                }
            }

            if self.should_quit {
                break;
            }
        }

        // ── Teardown ──────────────────────────────────────────────────────────
        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        Ok(())
    }

    fn on_tick(&mut self) -> bool {
        let expired = self.toasts.tick();
        let loading = matches!(
            self.panel.as_ref().map(|p| &p.view),
            Some(View::Loading { .. })
        );
        if loading {
            self.spinner_frame = (self.spinner_frame + 1) % SPINNER_FRAMES.len();
        }
        expired || loading
    }

    // ── Message handler ───────────────────────────────────────────────────────

    fn handle_message(&mut self, msg: AppMessage) -> Vec<Action> {
        match msg {
            AppMessage::Event(Event::Key(key)) => self.handle_key(key),
            AppMessage::Event(_) => Vec::new(),
            AppMessage::Daemon(msg) => {
                self.apply(msg);
                Vec::new()
            }
            AppMessage::Disconnected(reason) => {
                match reason {
                    Some(e) => warn!("Daemon connection failed: {}", e),
                    None => info!("Daemon closed the connection"),
                }
                self.connected = false;
                self.toasts.error("Daemon disconnected");
                Vec::new()
            }
        }
    }

    fn apply(&mut self, msg: Message) {
        match msg {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                panel,
                ..
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "Daemon protocol v{} differs from panel v{}",
                        protocol_version, PROTOCOL_VERSION
                    );
                    self.toasts.warning(format!(
                        "Daemon speaks protocol v{} (panel v{})",
                        protocol_version, PROTOCOL_VERSION
                    ));
                }
                self.panel = Some(panel);
            }
            Message::Broadcast(Broadcast::Panel { data }) => {
                // Drop snapshots that arrive out of order
                let stale = self.panel.as_ref().is_some_and(|p| data.rev < p.rev);
                if !stale {
                    self.panel = Some(data);
                }
            }
            Message::Broadcast(Broadcast::Notice { notice }) => match notice.kind {
                NoticeKind::Failure => self.toasts.error(notice.message),
                NoticeKind::Interrupted => self.toasts.warning(notice.message),
                NoticeKind::Info => self.toasts.info(notice.message),
            },
            Message::Broadcast(Broadcast::Log { message }) => {
                debug!("daemon: {}", message);
                self.last_log = Some(message);
            }
            Message::Command(_) => {}
        }
    }

    // ── Key handling ──────────────────────────────────────────────────────────

    fn handle_key(&mut self, key: KeyEvent) -> Vec<Action> {
        if key.kind == KeyEventKind::Release {
            return Vec::new();
        }

        // Global keys, active even while the panel is hidden
        match key.code {
            KeyCode::Char('q') if key.modifiers == KeyModifiers::NONE => {
                return vec![Action::Quit];
            }
            KeyCode::Char('c') if key.modifiers == KeyModifiers::CONTROL => {
                return vec![Action::Quit];
            }
            KeyCode::Char('t') if key.modifiers == KeyModifiers::NONE => {
                return vec![Action::Send(Command::TogglePanel)];
            }
            _ => {}
        }

        let Some(panel) = self.panel.as_ref() else {
            return Vec::new();
        };
        if !panel.visible || !self.connected {
            return Vec::new();
        }

        if key.modifiers.contains(KeyModifiers::SHIFT) {
            if let Some(position) = moved(panel.position, key.code) {
                return vec![Action::Send(Command::SetPosition { position })];
            }
        }

        let cmd = match (key.code, &panel.view) {
            (KeyCode::Enter | KeyCode::Char('s'), View::Idle) => Command::Start,
            (KeyCode::Char('n'), View::Playing) => Command::Next,
            (KeyCode::Char('x'), View::Playing | View::Loading { .. }) => Command::Stop,
            (KeyCode::Char('a'), _) => Command::SetAlgorithm {
                algorithm: panel.algorithm.next(),
            },
            (KeyCode::Char('c') | KeyCode::Esc, _) => Command::Close,
            _ => return Vec::new(),
        };
        vec![Action::Send(cmd)]
    }

    // ── Drawing ───────────────────────────────────────────────────────────────

    fn draw(&self, frame: &mut Frame) {
        let [body, footer] =
            Layout::vertical([Constraint::Min(0), Constraint::Length(1)]).areas(frame.area());

        match &self.panel {
            None => {
                let text = if self.connected {
                    "Waiting for the daemon…"
                } else {
                    "Daemon not reachable"
                };
                let y = body.y + body.height / 2;
                let line_area = Rect::new(body.x, y.min(body.bottom().saturating_sub(1)), body.width, 1);
                frame.render_widget(
                    Paragraph::new(text)
                        .style(style_secondary())
                        .alignment(Alignment::Center),
                    line_area,
                );
            }
            Some(panel) if panel.visible => self.draw_panel(frame, body, panel),
            Some(_) => {}
        }

        self.draw_footer(frame, footer);
        self.toasts.draw(frame, body);
    }

    fn draw_panel(&self, frame: &mut Frame, area: Rect, panel: &PanelState) {
        let rect = panel_rect(panel.position, area);
        if rect.width == 0 || rect.height == 0 {
            return;
        }

        let block = Block::bordered()
            .border_type(BorderType::Rounded)
            .border_style(style_border())
            .title(Span::styled(" Music Reco ", style_accent()));

        let key = |k: &'static str| Span::styled(k, style_key_hint());
        let mut lines = match &panel.view {
            View::Idle => vec![
                Line::from(vec![
                    Span::styled(" ▶ Start listening ", style_accent()),
                    key("[enter]"),
                ]),
                Line::default(),
                Line::from(vec![
                    Span::styled(" Algorithm ", style_secondary()),
                    Span::styled(panel.algorithm.label(), style_default()),
                    Span::raw(" "),
                    key("[a]"),
                ]),
                Line::from(vec![
                    Span::styled(" User      ", style_secondary()),
                    Span::styled(panel.user_id.as_str(), style_muted()),
                ]),
            ],
            View::Loading { algorithm } => vec![
                Line::from(Span::styled(
                    format!(
                        " {} Finding a track…",
                        SPINNER_FRAMES[self.spinner_frame % SPINNER_FRAMES.len()]
                    ),
                    style_loading(),
                )),
                Line::default(),
                Line::from(vec![
                    Span::styled(" via ", style_secondary()),
                    Span::styled(algorithm.label(), style_default()),
                ]),
                Line::from(vec![Span::raw(" "), key("[x] stop")]),
            ],
            View::Playing => vec![
                Line::from(vec![
                    Span::styled(" ♪ Listening  ", style_playing()),
                    Span::styled(format_timer(panel.timer_secs), style_default()),
                ]),
                Line::default(),
                Line::from(vec![
                    Span::styled(" Algorithm ", style_secondary()),
                    Span::styled(panel.algorithm.label(), style_default()),
                    Span::raw(" "),
                    key("[a]"),
                ]),
                Line::from(vec![Span::raw(" "), key("[n] next  [x] stop")]),
            ],
        };
        lines.push(Line::from(vec![
            Span::raw(" "),
            key("[c] close  [shift+arrows] move"),
        ]));

        frame.render_widget(Clear, rect);
        frame.render_widget(Paragraph::new(lines).block(block), rect);
    }

    fn draw_footer(&self, frame: &mut Frame, area: Rect) {
        let status = if self.connected {
            Span::styled(" ● connected ", ratatui::style::Style::default().fg(C_PLAYING))
        } else {
            Span::styled(" ○ disconnected ", ratatui::style::Style::default().fg(C_TOAST_ERROR))
        };
        let mut spans = vec![status];
        if self.panel.as_ref().is_some_and(|p| !p.visible) {
            spans.push(Span::styled("panel hidden · ", style_secondary()));
        }
        spans.push(Span::styled("[t] toggle  [q] quit ", style_key_hint()));
        if let Some(log) = &self.last_log {
            spans.push(Span::styled(log.as_str(), style_muted()));
        }
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Position after a Shift+Arrow press; `None` for any other key.
fn moved(position: PanelPosition, code: KeyCode) -> Option<PanelPosition> {
    let PanelPosition { top, left } = position;
    let next = match code {
        KeyCode::Up => PanelPosition {
            top: top.saturating_sub(1),
            left,
        },
        KeyCode::Down => PanelPosition {
            top: top.saturating_add(1),
            left,
        },
        KeyCode::Left => PanelPosition {
            top,
            left: left.saturating_sub(2),
        },
        KeyCode::Right => PanelPosition {
            top,
            left: left.saturating_add(2),
        },
        _ => return None,
    };
    Some(next)
}

/// Panel box at `position`, pulled back inside `area` when it would overflow.
fn panel_rect(position: PanelPosition, area: Rect) -> Rect {
    let width = PANEL_WIDTH.min(area.width);
    let height = PANEL_HEIGHT.min(area.height);
    let left = position.left.min(area.width - width);
    let top = position.top.min(area.height - height);
    Rect::new(area.x + left, area.y + top, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;
    use reco_proto::protocol::{Algorithm, Notice};

    use crate::toast::Severity;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn shift(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::SHIFT)
    }

    fn app_with(view: View) -> App {
        let mut app = App::new();
        app.apply(Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: 1,
            panel: PanelState {
                rev: 1,
                view,
                user_id: "user_k3j9x2mq7".into(),
                position: PanelPosition { top: 2, left: 4 },
                ..Default::default()
            },
        }));
        app
    }

    fn render(app: &App, width: u16, height: u16) -> String {
        let mut terminal = Terminal::new(TestBackend::new(width, height)).unwrap();
        terminal.draw(|f| app.draw(f)).unwrap();
        let buffer = terminal.backend().buffer();
        let mut text = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                text.push_str(buffer[(x, y)].symbol());
            }
            text.push('\n');
        }
        text
    }

    #[test]
    fn test_keys_map_to_commands_per_view() {
        let mut app = app_with(View::Idle);
        assert_eq!(
            app.handle_key(press(KeyCode::Enter)),
            vec![Action::Send(Command::Start)]
        );
        assert_eq!(
            app.handle_key(press(KeyCode::Char('s'))),
            vec![Action::Send(Command::Start)]
        );
        assert!(app.handle_key(press(KeyCode::Char('n'))).is_empty());
        assert!(app.handle_key(press(KeyCode::Char('x'))).is_empty());

        let mut app = app_with(View::Playing);
        assert!(app.handle_key(press(KeyCode::Enter)).is_empty());
        assert_eq!(
            app.handle_key(press(KeyCode::Char('n'))),
            vec![Action::Send(Command::Next)]
        );
        assert_eq!(
            app.handle_key(press(KeyCode::Char('x'))),
            vec![Action::Send(Command::Stop)]
        );
        assert_eq!(
            app.handle_key(press(KeyCode::Esc)),
            vec![Action::Send(Command::Close)]
        );
        assert_eq!(app.handle_key(press(KeyCode::Char('q'))), vec![Action::Quit]);
    }

    #[test]
    fn test_algorithm_key_cycles_from_current() {
        let mut app = app_with(View::Idle);
        assert_eq!(
            app.handle_key(press(KeyCode::Char('a'))),
            vec![Action::Send(Command::SetAlgorithm {
                algorithm: Algorithm::ContentBased
            })]
        );
    }

    #[test]
    fn test_shift_arrows_move_panel() {
        let mut app = app_with(View::Idle);
        assert_eq!(
            app.handle_key(shift(KeyCode::Down)),
            vec![Action::Send(Command::SetPosition {
                position: PanelPosition { top: 3, left: 4 }
            })]
        );
        assert_eq!(
            app.handle_key(shift(KeyCode::Left)),
            vec![Action::Send(Command::SetPosition {
                position: PanelPosition { top: 2, left: 2 }
            })]
        );
        // Plain arrows do nothing
        assert!(app.handle_key(press(KeyCode::Down)).is_empty());
    }

    #[test]
    fn test_hidden_panel_only_takes_global_keys() {
        let mut app = app_with(View::Idle);
        app.apply(Message::Broadcast(Broadcast::Panel {
            data: PanelState {
                rev: 2,
                visible: false,
                ..Default::default()
            },
        }));
        assert!(app.handle_key(press(KeyCode::Enter)).is_empty());
        assert_eq!(
            app.handle_key(press(KeyCode::Char('t'))),
            vec![Action::Send(Command::TogglePanel)]
        );
    }

    #[test]
    fn test_no_commands_before_hello() {
        let mut app = App::new();
        assert!(app.handle_key(press(KeyCode::Enter)).is_empty());
        assert_eq!(app.handle_key(press(KeyCode::Char('q'))), vec![Action::Quit]);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let mut app = app_with(View::Playing);
        app.apply(Message::Broadcast(Broadcast::Panel {
            data: PanelState {
                rev: 0,
                view: View::Idle,
                ..Default::default()
            },
        }));
        assert_eq!(app.panel.as_ref().map(|p| &p.view), Some(&View::Playing));
    }

    #[test]
    fn test_notices_styled_by_kind() {
        let mut app = app_with(View::Idle);
        app.apply(Message::Broadcast(Broadcast::Notice {
            notice: Notice::interrupted("Music interrupted!"),
        }));
        app.apply(Message::Broadcast(Broadcast::Notice {
            notice: Notice::failure("No recommendation"),
        }));
        assert_eq!(
            app.toasts.severities(),
            vec![Severity::Warning, Severity::Error]
        );
    }

    #[test]
    fn test_panel_rect_stays_inside_area() {
        let area = Rect::new(0, 0, 80, 24);
        let rect = panel_rect(PanelPosition { top: 100, left: 100 }, area);
        assert_eq!(rect, Rect::new(80 - PANEL_WIDTH, 24 - PANEL_HEIGHT, PANEL_WIDTH, PANEL_HEIGHT));

        let tiny = panel_rect(PanelPosition { top: 5, left: 5 }, Rect::new(0, 0, 10, 3));
        assert_eq!(tiny, Rect::new(0, 0, 10, 3));
    }

    #[test]
    fn test_draw_shows_view() {
        let app = app_with(View::Idle);
        let screen = render(&app, 80, 20);
        assert!(screen.contains("Start listening"));
        assert!(screen.contains("Collaborative"));

        let mut app = app_with(View::Playing);
        app.apply(Message::Broadcast(Broadcast::Panel {
            data: PanelState {
                rev: 5,
                view: View::Playing,
                timer_secs: 83,
                ..Default::default()
            },
        }));
        let screen = render(&app, 80, 20);
        assert!(screen.contains("01:23"));
        assert!(!screen.contains("Start listening"));
    }

    #[test]
    fn test_draw_hidden_panel() {
        let mut app = app_with(View::Idle);
        app.apply(Message::Broadcast(Broadcast::Panel {
            data: PanelState {
                rev: 2,
                visible: false,
                ..Default::default()
            },
        }));
        let screen = render(&app, 80, 20);
        assert!(!screen.contains("Music Reco"));
        assert!(screen.contains("panel hidden"));
    }
}
