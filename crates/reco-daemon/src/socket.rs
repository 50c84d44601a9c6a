use crate::session::SessionEvent;
use crate::surface::{BroadcastMessage, BroadcastSurface};
use reco_proto::protocol::{Broadcast, Command, Message, PROTOCOL_VERSION};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub fn start_server(
    listener: TcpListener,
    surface: Arc<BroadcastSurface>,
    event_tx: mpsc::Sender<SessionEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("TCP server listening at {}", addr);
        }

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Panel {} connected from {}", id, peer);

                    let surface = surface.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();

                    tokio::spawn(async move {
                        handle_client(stream, surface, id, evt_tx, bcast_rx).await;
                        info!("Panel {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    surface: Arc<BroadcastSurface>,
    client_id: usize,
    event_tx: mpsc::Sender<SessionEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with the panel snapshot on connect
    if let Ok(encoded) = encode_hello(&surface).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Panel {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let frame_len = match Message::frame_len(&read_buf) {
                                Some(len) if read_buf.len() >= len => len,
                                _ => break,
                            };
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(Command::GetState), consumed)) => {
                                    read_buf.drain(..consumed);
                                    if let Ok(encoded) = encode_panel(&surface).await {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Panel {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(SessionEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("SessionEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    warn!("Panel {} sent an unreadable frame, skipping it: {}", client_id, e);
                                    read_buf.drain(..frame_len);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from panel {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(BroadcastMessage::PanelUpdated) => {
                        if let Ok(encoded) = encode_panel(&surface).await {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Notice(notice)) => {
                        let broadcast = Broadcast::Notice { notice };
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            if write_half.write_all(&encoded).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        let broadcast = Broadcast::Log { message };
                        if let Ok(encoded) = Message::Broadcast(broadcast).encode() {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Panel {} missed {} broadcast messages", client_id, n);
                        if let Ok(encoded) = encode_panel(&surface).await {
                            let _ = write_half.write_all(&encoded).await;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

async fn encode_hello(surface: &BroadcastSurface) -> anyhow::Result<Vec<u8>> {
    let panel = surface.snapshot().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        rev: panel.rev,
        panel,
    })
    .encode()
}

async fn encode_panel(surface: &BroadcastSurface) -> anyhow::Result<Vec<u8>> {
    let data = surface.snapshot().await;
    Message::Broadcast(Broadcast::Panel { data }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::PresentationSurface;
    use reco_proto::protocol::{Algorithm, Notice, View};
    use std::time::Duration;

    /// Read frames until one decodes.
    async fn read_message(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Message {
        let mut tmp = [0u8; 4096];
        loop {
            if let Ok((msg, consumed)) = Message::decode(buf) {
                buf.drain(..consumed);
                return msg;
            }
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut tmp))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    async fn setup() -> (
        TcpStream,
        Arc<BroadcastSurface>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (broadcast_tx, _) = broadcast::channel(16);
        let surface = Arc::new(BroadcastSurface::new(broadcast_tx.clone()));
        let (event_tx, event_rx) = mpsc::channel(16);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        start_server(listener, surface.clone(), event_tx, broadcast_tx);

        let stream = TcpStream::connect(addr).await.unwrap();
        (stream, surface, event_rx)
    }

    #[tokio::test]
    async fn test_hello_then_commands_forwarded() {
        let (mut stream, _surface, mut event_rx) = setup().await;
        let mut buf = Vec::new();

        match read_message(&mut stream, &mut buf).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                panel,
                ..
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(panel.view, View::Idle);
            }
            other => panic!("expected Hello, got {:?}", other),
        }

        // Two commands in one write.
        let mut frames = Message::Command(Command::Start).encode().unwrap();
        frames.extend(
            Message::Command(Command::SetAlgorithm {
                algorithm: Algorithm::Hybrid,
            })
            .encode()
            .unwrap(),
        );
        stream.write_all(&frames).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(SessionEvent::ClientCommand(Command::Start))
        ));
        let second = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            second,
            Some(SessionEvent::ClientCommand(Command::SetAlgorithm {
                algorithm: Algorithm::Hybrid
            }))
        ));
    }

    #[tokio::test]
    async fn test_panel_changes_and_notices_are_relayed() {
        let (mut stream, surface, _event_rx) = setup().await;
        let mut buf = Vec::new();
        let _hello = read_message(&mut stream, &mut buf).await;

        surface.render(View::Playing).await;
        match read_message(&mut stream, &mut buf).await {
            Message::Broadcast(Broadcast::Panel { data }) => {
                assert_eq!(data.view, View::Playing);
                assert_eq!(data.rev, 1);
            }
            other => panic!("expected Panel, got {:?}", other),
        }

        surface.notify(Notice::failure("nope")).await;
        match read_message(&mut stream, &mut buf).await {
            Message::Broadcast(Broadcast::Notice { notice }) => {
                assert_eq!(notice.message, "nope")
            }
            other => panic!("expected Notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_command_skipped_and_later_ones_forwarded() {
        let (mut stream, _surface, mut event_rx) = setup().await;
        let mut buf = Vec::new();
        let _hello = read_message(&mut stream, &mut buf).await;

        let body = br#"{"cmd":"Shuffle"}"#;
        let mut frames = (body.len() as u32).to_be_bytes().to_vec();
        frames.extend_from_slice(body);
        frames.extend(Message::Command(Command::Stop).encode().unwrap());
        stream.write_all(&frames).await.unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            forwarded,
            Some(SessionEvent::ClientCommand(Command::Stop))
        ));
    }

    #[tokio::test]
    async fn test_get_state_answered_directly() {
        let (mut stream, _surface, mut event_rx) = setup().await;
        let mut buf = Vec::new();
        let _hello = read_message(&mut stream, &mut buf).await;

        let frame = Message::Command(Command::GetState).encode().unwrap();
        stream.write_all(&frame).await.unwrap();

        assert!(matches!(
            read_message(&mut stream, &mut buf).await,
            Message::Broadcast(Broadcast::Panel { .. })
        ));
        assert!(event_rx.try_recv().is_err());
    }
}
