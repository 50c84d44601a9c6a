use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  The panel checks this on connect and can refuse to talk to
/// an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from panel to daemon (user intents)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    Start,
    Next,
    Stop,
    /// Hide the panel for the current run.  Not persisted.
    Close,
    SetAlgorithm { algorithm: Algorithm },
    SetPosition { position: PanelPosition },
    /// Flip panel visibility.  Idempotent toggle, never queued.
    TogglePanel,
    GetState,
}

/// Messages sent from daemon to panel (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full panel snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        panel: PanelState,
    },
    Panel {
        data: PanelState,
    },
    Notice {
        notice: Notice,
    },
    Log {
        message: String,
    },
}

/// Recommendation strategy requested from the remote service.
///
/// The serialised names are the ones the recommendation service and the
/// persisted `algoType` key understand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "matriciel")]
    Collaborative,
    #[serde(rename = "content")]
    ContentBased,
    #[serde(rename = "mix")]
    Hybrid,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [
        Algorithm::Collaborative,
        Algorithm::ContentBased,
        Algorithm::Hybrid,
    ];

    /// Name used on the wire and in persisted state.
    pub fn wire_name(self) -> &'static str {
        match self {
            Algorithm::Collaborative => "matriciel",
            Algorithm::ContentBased => "content",
            Algorithm::Hybrid => "mix",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.wire_name() == name)
    }

    /// Human-readable label for the settings view.
    pub fn label(self) -> &'static str {
        match self {
            Algorithm::Collaborative => "Collaborative",
            Algorithm::ContentBased => "Content-based",
            Algorithm::Hybrid => "Hybrid",
        }
    }

    pub fn next(self) -> Self {
        match self {
            Algorithm::Collaborative => Algorithm::ContentBased,
            Algorithm::ContentBased => Algorithm::Hybrid,
            Algorithm::Hybrid => Algorithm::Collaborative,
        }
    }
}

/// Session lifecycle.  Loading is always transient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Loading,
    Playing,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Loading => "loading",
            SessionStatus::Playing => "playing",
        }
    }
}

/// The one view the panel shows at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "view")]
pub enum View {
    #[default]
    Idle,
    /// `algorithm` is a display annotation only.
    Loading { algorithm: Algorithm },
    Playing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeKind {
    /// A Loading attempt was abandoned (timeout, no recommendation).
    Failure,
    /// The user changed track outside the controller.
    Interrupted,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Failure,
            message: message.into(),
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Interrupted,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            message: message.into(),
        }
    }
}

/// Panel offsets from the top-left corner of the host surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PanelPosition {
    pub top: u16,
    pub left: u16,
}

/// Everything a freshly connected panel needs to draw itself.  `rev` is a
/// monotonically increasing counter incremented on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PanelState {
    #[serde(default)]
    pub rev: u64,
    pub view: View,
    pub timer_secs: u64,
    pub visible: bool,
    pub algorithm: Algorithm,
    pub user_id: String,
    #[serde(default)]
    pub position: PanelPosition,
}

impl Default for PanelState {
    fn default() -> Self {
        Self {
            rev: 0,
            view: View::Idle,
            timer_secs: 0,
            visible: true,
            algorithm: Algorithm::default(),
            user_id: String::new(),
            position: PanelPosition::default(),
        }
    }
}

/// `MM:SS` rendering of a listening counter.
pub fn format_timer(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Total size (header included) of the frame at the start of `data`, once
    /// its length header has arrived.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(4 + u32::from_be_bytes(header) as usize)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encode_decode() {
        let msg = Message::Command(Command::SetAlgorithm {
            algorithm: Algorithm::Hybrid,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::SetAlgorithm { algorithm }) => {
                assert_eq!(algorithm, Algorithm::Hybrid)
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_encode_decode() {
        let panel = PanelState {
            rev: 42,
            view: View::Loading {
                algorithm: Algorithm::ContentBased,
            },
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: 42,
            panel,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                rev,
                panel,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(rev, 42);
                assert_eq!(
                    panel.view,
                    View::Loading {
                        algorithm: Algorithm::ContentBased
                    }
                );
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Stop).encode().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Message::decode(&encoded[..2]).is_err());
    }

    #[test]
    fn test_frame_len_known_before_body_arrives() {
        let encoded = Message::Command(Command::Stop).encode().unwrap();
        assert_eq!(Message::frame_len(&encoded[..2]), None);
        assert_eq!(Message::frame_len(&encoded[..4]), Some(encoded.len()));

        // A complete frame with a body nobody understands still has a length.
        let body = br#"{"cmd":"Shuffle"}"#;
        let mut unknown = (body.len() as u32).to_be_bytes().to_vec();
        unknown.extend_from_slice(body);
        assert_eq!(Message::frame_len(&unknown), Some(unknown.len()));
        assert!(Message::decode(&unknown).is_err());
    }

    #[test]
    fn test_algorithm_wire_names() {
        assert_eq!(
            serde_json::to_string(&Algorithm::ContentBased).unwrap(),
            "\"content\""
        );
        assert_eq!(Algorithm::from_wire("mix"), Some(Algorithm::Hybrid));
        assert_eq!(Algorithm::from_wire("bogus"), None);
        assert_eq!(Algorithm::default(), Algorithm::Collaborative);
    }

    #[test]
    fn test_format_timer() {
        assert_eq!(format_timer(0), "00:00");
        assert_eq!(format_timer(65), "01:05");
        assert_eq!(format_timer(3600), "60:00");
    }
}
