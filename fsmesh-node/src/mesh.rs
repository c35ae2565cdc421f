//! Mesh manager: live connection set, listener, reconnect loop, fan-out and shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fsmesh_core::{Command, FsCore, Handshake, NodeId, OutboundAction, PeerKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::transport::{self, ConnectionState, HANDSHAKE_TIMEOUT};

/// How long shutdown waits for QUIT frames to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Registry entry for one live connection.
pub struct ConnectionHandle {
    pub id: u64,
    /// This node dialed the link.
    pub outbound: bool,
    pub tx: mpsc::UnboundedSender<Command>,
    pub state: watch::Receiver<ConnectionState>,
    pub closer: Arc<Notify>,
}

/// Shared daemon state. Lock order: `core` before `connections`, always.
pub struct Mesh {
    local: NodeId,
    core: Arc<Mutex<FsCore>>,
    connections: Mutex<HashMap<PeerKey, ConnectionHandle>>,
    next_id: AtomicU64,
    reconnect_interval: Duration,
}

impl Mesh {
    pub fn new(core: FsCore, reconnect_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            local: core.local().clone(),
            core: Arc::new(Mutex::new(core)),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reconnect_interval,
        })
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn core(&self) -> &Arc<Mutex<FsCore>> {
        &self.core
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Lifecycle state of the live connection to `key`, if any.
    pub async fn state(&self, key: &PeerKey) -> Option<ConnectionState> {
        let conns = self.connections.lock().await;
        conns.get(key).map(|h| *h.state.borrow())
    }

    /// Configured servers with a live link, sorted.
    pub async fn live_servers(&self) -> Vec<NodeId> {
        let conns = self.connections.lock().await;
        let mut out: Vec<NodeId> = conns.keys().filter_map(|k| k.server().cloned()).collect();
        out.sort();
        out
    }

    /// Serve until `shutdown` resolves, then send QUIT everywhere and let writers drain.
    pub async fn run_until<F>(self: Arc<Self>, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let reconnector = tokio::spawn(self.clone().run_reconnector());
        tokio::select! {
            _ = shutdown => info!("shutting down"),
            _ = self.clone().run_listener(listener) => {}
        }
        reconnector.abort();
        self.shutdown().await;
    }

    /// Accept loop. Accept errors are logged and the loop continues.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let mesh = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = mesh.accept(stream, addr).await {
                            debug!(%addr, error = %e, "inbound handshake failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn accept(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let theirs =
            transport::handshake_accept(&mut stream, Handshake::server(self.local.clone())).await?;
        let key = match theirs.node {
            Some(node) if self.core.lock().await.roster().is_peer(&node) => PeerKey::Server(node),
            _ => PeerKey::Client(addr),
        };
        transport::run_connection(self, stream, key, false).await;
        Ok(())
    }

    /// Every interval, dial each configured server without a live link. Runs forever.
    pub async fn run_reconnector(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.reconnect_interval);
        loop {
            ticker.tick().await;
            let pending = self.core.lock().await.roster().disconnected();
            for (node, addr) in pending {
                if self.connections.lock().await.contains_key(&PeerKey::Server(node.clone())) {
                    continue;
                }
                if let Err(e) = self.dial(node.clone(), &addr).await {
                    debug!(peer = %node, %addr, error = %e, "reconnect failed");
                }
            }
        }
    }

    async fn dial(self: &Arc<Self>, node: NodeId, addr: &str) -> Result<()> {
        let mut stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("connect timed out")?
            .with_context(|| format!("connect to {addr}"))?;
        let theirs =
            transport::handshake_connect(&mut stream, Handshake::server(self.local.clone())).await?;
        if theirs.node.as_ref() != Some(&node) {
            warn!(peer = %node, announced = ?theirs.node, "peer announced a different node id");
        }
        tokio::spawn(transport::run_connection(
            self.clone(),
            stream,
            PeerKey::Server(node),
            true,
        ));
        Ok(())
    }

    /// Add a handshaken connection to the live set. For server links this marks the peer
    /// connected and queues an FS request. Returns false if the link loses a duplicate
    /// tie-break: the link dialed by the smaller node id wins on both sides.
    pub(crate) async fn register(&self, key: &PeerKey, handle: ConnectionHandle) -> bool {
        let mut core = self.core.lock().await;
        let mut conns = self.connections.lock().await;
        if let (PeerKey::Server(peer), Some(existing)) = (key, conns.get(key)) {
            let preferred_outbound = self.local < *peer;
            if existing.outbound == preferred_outbound && handle.outbound != preferred_outbound {
                return false;
            }
            existing.closer.notify_one();
        }
        if let PeerKey::Server(peer) = key {
            core.on_peer_joined(peer);
            let _ = handle.tx.send(Command::fs_request());
        }
        conns.insert(key.clone(), handle);
        true
    }

    /// Remove the connection `id` if it is still the live one for `key`.
    pub(crate) async fn unregister(&self, key: &PeerKey, id: u64) {
        let mut core = self.core.lock().await;
        let mut conns = self.connections.lock().await;
        if conns.get(key).is_some_and(|h| h.id == id) {
            conns.remove(key);
            if let PeerKey::Server(peer) = key {
                core.on_peer_left(peer);
            }
        }
    }

    /// Run one command through the core and carry out its actions. Returns false when the
    /// connection should close.
    ///
    /// Both locks are held from before the mutation until every frame is queued. The core
    /// does blocking file and snapshot I/O, so this needs the multi-threaded runtime.
    pub(crate) async fn dispatch(
        &self,
        from: &PeerKey,
        cmd: Command,
        reply: &mpsc::UnboundedSender<Command>,
    ) -> bool {
        let mut core = self.core.lock().await;
        let conns = self.connections.lock().await;
        let actions = tokio::task::block_in_place(|| core.on_command(from, cmd));
        let mut keep_open = true;
        for action in actions {
            match action {
                OutboundAction::Reply(c) => {
                    let _ = reply.send(c);
                }
                OutboundAction::Broadcast(c) => {
                    for (key, handle) in conns.iter() {
                        if key.server().is_some_and(|n| core.roster().is_server(n)) {
                            let _ = handle.tx.send(c.clone());
                        }
                    }
                }
                OutboundAction::SendTo(node, c) => match conns.get(&PeerKey::Server(node.clone())) {
                    Some(handle) => {
                        let _ = handle.tx.send(c);
                    }
                    None => debug!(peer = %node, kind = c.kind(), "no live link, dropped"),
                },
                OutboundAction::Close => keep_open = false,
            }
        }
        keep_open
    }

    /// Send QUIT on every live connection and wait (bounded) for them to close.
    pub async fn shutdown(&self) {
        let states: Vec<watch::Receiver<ConnectionState>> = {
            let conns = self.connections.lock().await;
            for handle in conns.values() {
                let _ = handle.tx.send(Command::Quit);
            }
            conns.values().map(|h| h.state.clone()).collect()
        };
        info!(connections = states.len(), "sent QUIT to live connections");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for mut state in states {
                let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("some connections did not close in time");
        }
    }
}
