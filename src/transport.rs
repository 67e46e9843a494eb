//! Peer connections: length-prefixed JSON frames over TCP, exposed as a pair
//! of channels so sessions never touch the socket.

use crate::protocol::Frame;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Upper bound for one frame (a fetch reply carries a whole file).
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Largest file served in one fetch reply. Base64 grows the payload by 4/3,
/// the rest of the frame stays well under the remaining headroom.
pub const MAX_PAYLOAD_LEN: u64 = 368 * 1024 * 1024;

/// Frames exchanged before the peer is authenticated are tiny.
pub const HANDSHAKE_FRAME_LEN: usize = 64 * 1024;

const CHANNEL_CAPACITY: usize = 64;

/// user -> password, checked during the handshake.
pub type Credentials = HashMap<String, String>;

/// Cloneable sending half of a [`Connection`].
#[derive(Clone)]
pub struct FrameSender {
    peer: Arc<str>,
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("Connection to {} closed", self.peer))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// One bidirectional, ordered frame channel to a peer.
pub struct Connection {
    sender: FrameSender,
    incoming: mpsc::Receiver<Frame>,
}

impl Connection {
    /// Two in-process endpoints wired to each other.
    pub fn pair(a: &str, b: &str) -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let a_end = Connection {
            sender: FrameSender {
                peer: Arc::from(b),
                tx: a_tx,
            },
            incoming: a_rx,
        };
        let b_end = Connection {
            sender: FrameSender {
                peer: Arc::from(a),
                tx: b_tx,
            },
            incoming: b_rx,
        };
        (a_end, b_end)
    }

    /// Wrap a TCP stream, spawning one reader and one writer task. Both end
    /// when the socket fails or the connection is dropped.
    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);

        let reader_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Peer {reader_peer} closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read frame from {reader_peer}: {e:#}");
                        break;
                    }
                }
            }
        });

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("Failed to write frame to {writer_peer}: {e:#}");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            sender: FrameSender {
                peer: Arc::from(peer),
                tx: out_tx,
            },
            incoming: in_rx,
        }
    }

    pub fn peer(&self) -> &str {
        self.sender.peer()
    }

    pub fn split(self) -> (FrameSender, mpsc::Receiver<Frame>) {
        (self.sender, self.incoming)
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_LEN {
        bail!("Frame of {} bytes exceeds limit", bytes.len());
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    read_frame_limited(reader, MAX_FRAME_LEN).await
}

/// Like [`read_frame`], rejecting frames longer than `limit` before
/// allocating for them.
pub async fn read_frame_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("Failed to read frame length"),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > limit {
        bail!("Frame of {len} bytes exceeds limit");
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("Failed to read frame body")?;
    let frame = serde_json::from_slice(&buf).context("Failed to decode frame")?;
    Ok(Some(frame))
}

/// Open a connection and authenticate.
pub async fn connect(addr: &str, user: &str, password: &str) -> Result<Connection> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    let hello = Frame::Hello {
        user: user.to_string(),
        password: password.to_string(),
    };
    write_frame(&mut stream, &hello).await?;

    match read_frame_limited(&mut stream, HANDSHAKE_FRAME_LEN).await? {
        Some(Frame::Welcome) => Ok(Connection::from_stream(stream, addr.to_string())),
        Some(Frame::Rejected { reason }) => bail!("Peer {addr} rejected us: {reason}"),
        Some(other) => bail!("Unexpected handshake frame from {addr}: {other:?}"),
        None => bail!("Peer {addr} closed the connection during handshake"),
    }
}

/// Server half of the handshake, run on the raw stream before any frame
/// larger than [`HANDSHAKE_FRAME_LEN`] is accepted: expects `Hello` with
/// known credentials.
pub async fn authenticate<S>(stream: &mut S, users: &Credentials) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (user, password) = match read_frame_limited(stream, HANDSHAKE_FRAME_LEN).await? {
        Some(Frame::Hello { user, password }) => (user, password),
        Some(other) => bail!("Expected hello, got {other:?}"),
        None => bail!("Peer closed the connection during handshake"),
    };

    if users.get(&user) != Some(&password) {
        let rejected = Frame::Rejected {
            reason: "invalid credentials".to_string(),
        };
        write_frame(stream, &rejected).await?;
        bail!("Failed authentication as {user}");
    }

    write_frame(stream, &Frame::Welcome).await?;
    Ok(user)
}

/// Accept peers forever, handing each authenticated connection to `handler`
/// on its own task.
pub async fn accept_loop<F, Fut>(listener: TcpListener, users: Arc<Credentials>, handler: F)
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    loop {
        match listener.accept().await {
            Ok((mut stream, remote_addr)) => {
                info!("Incoming connection from {remote_addr}");
                let users = users.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    match authenticate(&mut stream, &users).await {
                        Ok(user) => {
                            info!("Peer {remote_addr} authenticated as {user}");
                            let conn = Connection::from_stream(stream, remote_addr.to_string());
                            handler(conn).await;
                        }
                        Err(e) => warn!("Handshake with {remote_addr} failed: {e:#}"),
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {e}");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
