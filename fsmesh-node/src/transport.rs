//! TCP transport: frame I/O, handshake, and the per-connection reader/dispatcher/writer pipeline.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fsmesh_core::wire::{self, LEN_SIZE};
use fsmesh_core::{Command, Handshake, PeerKey, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::mesh::{ConnectionHandle, Mesh};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a closing connection's writer may keep flushing queued frames.
pub const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of one connection, published on a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Read one length-prefixed frame. `Ok(None)` when the peer closed cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; LEN_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = wire::frame_len(header)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .context("truncated frame")?;
    Ok(Some(wire::decode_payload(&payload)?))
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = wire::encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Acceptor side: read the dialer's handshake, then answer with `ours`.
pub async fn handshake_accept(stream: &mut TcpStream, ours: Handshake) -> Result<Handshake> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let theirs = read_handshake(stream).await?;
        write_frame(stream, &ours).await?;
        Ok::<_, anyhow::Error>(theirs)
    })
    .await
    .context("handshake timed out")?
}

/// Dialer side: send `ours`, then read the acceptor's answer.
pub async fn handshake_connect(stream: &mut TcpStream, ours: Handshake) -> Result<Handshake> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        write_frame(stream, &ours).await?;
        read_handshake(stream).await
    })
    .await
    .context("handshake timed out")?
}

async fn read_handshake(stream: &mut TcpStream) -> Result<Handshake> {
    let Some(theirs) = read_frame::<_, Handshake>(stream).await? else {
        bail!("connection closed during handshake");
    };
    if theirs.protocol_version != PROTOCOL_VERSION {
        bail!(
            "unsupported protocol version {} (expected {})",
            theirs.protocol_version,
            PROTOCOL_VERSION
        );
    }
    Ok(theirs)
}

/// Run one handshaken connection until it closes. Registers it with the mesh, runs the
/// three stages, then tears down: reader and dispatcher are aborted, the writer gets
/// `WRITER_GRACE` to flush what is already queued.
pub async fn run_connection(mesh: Arc<Mesh>, stream: TcpStream, key: PeerKey, outbound: bool) {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Command>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Command>();
    let closer = Arc::new(Notify::new());

    let id = mesh.next_id();
    let handle = ConnectionHandle {
        id,
        outbound,
        tx: out_tx.clone(),
        state: state_rx,
        closer: closer.clone(),
    };
    if !mesh.register(&key, handle).await {
        debug!(peer = %key, "duplicate link dropped");
        state_tx.send_replace(ConnectionState::Closed);
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = tokio::spawn(read_loop(read_half, in_tx, key.clone()));
    let mut dispatcher = tokio::spawn(dispatch_loop(mesh.clone(), in_rx, out_tx, key.clone()));
    let mut writer = tokio::spawn(write_loop(write_half, out_rx, key.clone()));
    state_tx.send_replace(ConnectionState::Open);
    info!(peer = %key, id, "connection open");

    let writer_done = tokio::select! {
        _ = &mut reader => false,
        _ = &mut dispatcher => false,
        _ = &mut writer => true,
        _ = closer.notified() => false,
    };

    state_tx.send_replace(ConnectionState::Closing);
    reader.abort();
    dispatcher.abort();
    mesh.unregister(&key, id).await;
    if !writer_done && tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    state_tx.send_replace(ConnectionState::Closed);
    info!(peer = %key, id, "connection closed");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Command>,
    key: PeerKey,
) {
    loop {
        match read_frame::<_, Command>(&mut reader).await {
            Ok(Some(cmd)) => {
                if inbound.send(cmd).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(peer = %key, "peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %key, error = %e, "dropping connection on bad frame");
                break;
            }
        }
    }
}

async fn dispatch_loop(
    mesh: Arc<Mesh>,
    mut inbound: mpsc::UnboundedReceiver<Command>,
    reply: mpsc::UnboundedSender<Command>,
    key: PeerKey,
) {
    while let Some(cmd) = inbound.recv().await {
        if !mesh.dispatch(&key, cmd, &reply).await {
            break;
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    key: PeerKey,
) {
    while let Some(cmd) = outbound.recv().await {
        let quit = matches!(cmd, Command::Quit);
        let frame = match wire::encode_frame(&cmd) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    peer = %key,
                    kind = cmd.kind(),
                    error = %e,
                    "cannot encode command, skipped"
                );
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(peer = %key, error = %e, "write failed");
            break;
        }
        if quit {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
