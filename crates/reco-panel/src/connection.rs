use reco_proto::protocol::{Command, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

pub struct DaemonConnection {
    reader: FrameReader<OwnedReadHalf>,
    writer: CommandWriter<OwnedWriteHalf>,
}

impl DaemonConnection {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: CommandWriter::new(write_half),
        })
    }

    pub async fn send_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        self.writer.send(cmd).await
    }

    /// Read half goes to a background task, write half stays with the UI.
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, CommandWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

/// Decodes length-prefixed frames, buffering across reads.
pub struct FrameReader<R> {
    inner: R,
    read_buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Next complete message, or `None` once the daemon closes the connection.
    pub async fn receive_message(&mut self) -> anyhow::Result<Option<Message>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame_len) = Message::frame_len(&self.read_buffer) {
                if self.read_buffer.len() >= frame_len {
                    match Message::decode(&self.read_buffer) {
                        Ok((msg, consumed)) => {
                            self.read_buffer.drain(..consumed);
                            return Ok(Some(msg));
                        }
                        Err(e) => {
                            warn!("Skipping unreadable frame from daemon: {}", e);
                            self.read_buffer.drain(..frame_len);
                            continue;
                        }
                    }
                }
            }

            match self.inner.read(&mut buf).await {
                Ok(0) => return Ok(None),
                Ok(n) => self.read_buffer.extend_from_slice(&buf[..n]),
                Err(e) => return Err(anyhow::anyhow!("Read error: {}", e)),
            }
        }
    }
}

pub struct CommandWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, cmd: Command) -> anyhow::Result<()> {
        let encoded = Message::Command(cmd).encode()?;
        self.inner.write_all(&encoded).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reco_proto::protocol::{Broadcast, Notice, PanelState, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(client);

        let frame = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: 3,
            panel: PanelState::default(),
        })
        .encode()
        .unwrap();

        let (head, tail) = frame.split_at(5);
        let tail = tail.to_vec();
        server.write_all(head).await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            server.write_all(&tail).await.unwrap();
            server
        });

        match reader.receive_message().await.unwrap() {
            Some(Message::Broadcast(Broadcast::Hello { rev, .. })) => assert_eq!(rev, 3),
            other => panic!("expected Hello, got {:?}", other),
        }
        drop(writer.await.unwrap());
        assert!(reader.receive_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_frames_in_one_read() {
        let (mut server, client) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(client);

        let mut frames = Message::Broadcast(Broadcast::Notice {
            notice: Notice::info("one"),
        })
        .encode()
        .unwrap();
        frames.extend(
            Message::Broadcast(Broadcast::Log {
                message: "two".into(),
            })
            .encode()
            .unwrap(),
        );
        server.write_all(&frames).await.unwrap();

        assert!(matches!(
            reader.receive_message().await.unwrap(),
            Some(Message::Broadcast(Broadcast::Notice { .. }))
        ));
        assert!(matches!(
            reader.receive_message().await.unwrap(),
            Some(Message::Broadcast(Broadcast::Log { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_frame_skipped() {
        let (mut server, client) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(client);

        let body = br#"{"broadcast":"Equalizer","bands":[]}"#;
        let mut frames = (body.len() as u32).to_be_bytes().to_vec();
        frames.extend_from_slice(body);
        frames.extend(
            Message::Broadcast(Broadcast::Log {
                message: "after".into(),
            })
            .encode()
            .unwrap(),
        );
        server.write_all(&frames).await.unwrap();

        match reader.receive_message().await.unwrap() {
            Some(Message::Broadcast(Broadcast::Log { message })) => assert_eq!(message, "after"),
            other => panic!("expected Log, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_writer_frames_commands() {
        let (server, client) = tokio::io::duplex(4096);
        let mut writer = CommandWriter::new(client);
        writer.send(Command::TogglePanel).await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.receive_message().await.unwrap(),
            Some(Message::Command(Command::TogglePanel))
        ));
    }
}
