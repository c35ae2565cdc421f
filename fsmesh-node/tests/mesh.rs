use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use fsmesh_core::{
    Command, FileStore, FsCore, Handshake, MetadataTable, NodeId, PeerKey, Roster, SnapshotSink,
    ROOT_NAME,
};
use fsmesh_node::mesh::Mesh;
use fsmesh_node::transport::{handshake_connect, read_frame, write_frame, ConnectionState};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct TestNode {
    addr: SocketAddr,
    mesh: Arc<Mesh>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    dir: TempDir,
}

impl TestNode {
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = timeout(WAIT, self.task).await;
    }

    async fn table(&self) -> MetadataTable {
        self.mesh.core().lock().await.table().snapshot()
    }

    /// Bytes under the node's storage root, if written.
    fn stored(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir.path().join("files").join(path)).ok()
    }
}

async fn bind() -> Result<(TcpListener, NodeId)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let id = NodeId::from(listener.local_addr()?);
    Ok((listener, id))
}

fn start(listener: TcpListener, local: NodeId, peers: Vec<NodeId>) -> Result<TestNode> {
    let dir = tempfile::tempdir()?;
    let addr = listener.local_addr()?;
    let core = FsCore::new(
        MetadataTable::with_root(),
        Roster::new(local, peers),
        FileStore::new(dir.path().join("files")),
        SnapshotSink::new(dir.path().join("files.json")),
    );
    let mesh = Mesh::new(core, Duration::from_millis(50));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(mesh.clone().run_until(listener, async move {
        let _ = stop_rx.await;
    }));
    Ok(TestNode {
        addr,
        mesh,
        stop: Some(stop_tx),
        task,
        dir,
    })
}

async fn start_single() -> Result<TestNode> {
    let (listener, id) = bind().await?;
    start(listener, id, vec![])
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let server = handshake_connect(&mut stream, Handshake::client()).await?;
        assert!(server.node.is_some(), "server should announce its node id");
        Ok(Self { stream })
    }

    async fn send(&mut self, cmd: Command) -> Result<()> {
        write_frame(&mut self.stream, &cmd).await
    }

    async fn recv(&mut self) -> Result<Command> {
        match timeout(WAIT, read_frame::<_, Command>(&mut self.stream)).await?? {
            Some(cmd) => Ok(cmd),
            None => bail!("server closed the connection"),
        }
    }

    async fn recv_table(&mut self) -> Result<MetadataTable> {
        match self.recv().await? {
            Command::Fs {
                snapshot: Some(table),
            } => Ok(table),
            other => bail!("expected FS snapshot, got {:?}", other),
        }
    }
}

fn create(name: &str) -> Command {
    Command::Create {
        name: name.into(),
        parent: ROOT_NAME.into(),
    }
}

/// Poll `check` until it holds or WAIT elapses.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_replies_with_table() -> Result<()> {
    let node = start_single().await?;
    let mut client = Client::connect(node.addr).await?;

    client.send(create("doc.txt")).await?;
    let table = client.recv_table().await?;
    let loc = table.file_location("doc.txt")?;
    assert_eq!(loc.node, *node.mesh.local());
    assert!(loc.also.is_empty());

    client.send(Command::fs_request()).await?;
    assert_eq!(client.recv_table().await?, table);

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn give_file_unknown_is_error() -> Result<()> {
    let node = start_single().await?;
    let mut client = Client::connect(node.addr).await?;

    client
        .send(Command::GiveFile {
            name: "missing.txt".into(),
        })
        .await?;
    assert!(matches!(client.recv().await?, Command::Error { .. }));

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_then_fetch() -> Result<()> {
    let node = start_single().await?;
    let mut client = Client::connect(node.addr).await?;

    client.send(create("a.txt")).await?;
    client.recv_table().await?;
    client
        .send(Command::File {
            name: "a.txt".into(),
            content: b"hello mesh".to_vec(),
        })
        .await?;
    client
        .send(Command::GiveFile {
            name: "a.txt".into(),
        })
        .await?;
    assert_eq!(
        client.recv().await?,
        Command::File {
            name: "a.txt".into(),
            content: b"hello mesh".to_vec()
        }
    );

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_creates_get_distinct_names() -> Result<()> {
    let node = start_single().await?;
    let mut alice = Client::connect(node.addr).await?;
    let mut bob = Client::connect(node.addr).await?;

    let (a, b) = tokio::join!(alice.send(create("a.txt")), bob.send(create("a.txt")));
    a?;
    b?;
    alice.recv_table().await?;
    bob.recv_table().await?;

    let table = node.table().await;
    assert!(table.contains("a.txt"));
    assert!(table.contains("a(1).txt"));

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quit_closes_connection() -> Result<()> {
    let node = start_single().await?;
    let mut client = Client::connect(node.addr).await?;

    client.send(Command::Quit).await?;
    let closed = timeout(WAIT, read_frame::<_, Command>(&mut client.stream)).await??;
    assert!(closed.is_none());

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_protocol_version_is_dropped() -> Result<()> {
    let node = start_single().await?;
    let mut stream = TcpStream::connect(node.addr).await?;
    let hello = Handshake {
        protocol_version: 99,
        node: None,
    };
    write_frame(&mut stream, &hello).await?;
    // The acceptor checks the version before answering and hangs up.
    let closed = timeout(WAIT, async {
        loop {
            match read_frame::<_, Handshake>(&mut stream).await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    node.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_servers_link_and_propagate() -> Result<()> {
    let (la, ida) = bind().await?;
    let (lb, idb) = bind().await?;
    let a = start(la, ida.clone(), vec![idb.clone()])?;
    let b = start(lb, idb.clone(), vec![ida.clone()])?;

    let (ra, rb) = (&a, &b);
    let (rida, ridb) = (&ida, &idb);
    assert!(eventually(|| async move { ra.mesh.live_servers().await == vec![ridb.clone()] }).await);
    assert!(eventually(|| async move { rb.mesh.live_servers().await == vec![rida.clone()] }).await);
    let link = PeerKey::Server(idb.clone());
    let rlink = &link;
    assert!(
        eventually(|| async move { ra.mesh.state(rlink).await == Some(ConnectionState::Open) })
            .await
    );

    let mut client = Client::connect(a.addr).await?;
    client
        .send(Command::NewFolder {
            name: "docs".into(),
            parent: ROOT_NAME.into(),
        })
        .await?;
    client.recv_table().await?;
    client.send(create("report.txt")).await?;
    let table = client.recv_table().await?;
    let loc = table.file_location("report.txt")?;
    // Two servers: one primary, one replica.
    assert_eq!(loc.also.len(), 1);
    assert_ne!(loc.also[0], loc.node);

    let rtable = &table;
    assert!(eventually(|| async move { rb.table().await == *rtable }).await);

    a.stop().await;
    let rb = &b;
    assert!(eventually(|| async move { rb.mesh.live_servers().await.is_empty() }).await);
    b.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn versions_replicate_through_the_replica() -> Result<()> {
    let (la, ida) = bind().await?;
    let (lb, idb) = bind().await?;
    let a = start(la, ida.clone(), vec![idb.clone()])?;
    let b = start(lb, idb.clone(), vec![ida.clone()])?;

    let (ra, rb) = (&a, &b);
    let (rida, ridb) = (&ida, &idb);
    assert!(eventually(|| async move { ra.mesh.live_servers().await == vec![ridb.clone()] }).await);
    assert!(eventually(|| async move { rb.mesh.live_servers().await == vec![rida.clone()] }).await);
    // Let the duplicate-link tie-break settle so each side keeps one link.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Equal load and both live: the smaller id is primary. The client talks to the other.
    let (primary, replica) = if ida < idb { (&a, &b) } else { (&b, &a) };
    let mut client = Client::connect(replica.addr).await?;
    client.send(create("f.txt")).await?;
    let table = client.recv_table().await?;
    let loc = table.file_location("f.txt")?;
    assert_eq!(loc.node, *primary.mesh.local());
    assert_eq!(loc.also, vec![replica.mesh.local().clone()]);

    client
        .send(Command::File {
            name: "f.txt".into(),
            content: b"first".to_vec(),
        })
        .await?;
    client
        .send(Command::Update {
            name: "f.txt".into(),
        })
        .await?;
    client.recv_table().await?;
    client
        .send(Command::File {
            name: "f.txt".into(),
            content: b"second".to_vec(),
        })
        .await?;

    for node in [primary, replica] {
        assert!(
            eventually(|| async move {
                node.stored("f.txt.v0").as_deref() == Some(&b"first"[..])
                    && node.stored("f.txt.v1").as_deref() == Some(&b"second"[..])
            })
            .await,
            "both versions on {}",
            node.mesh.local()
        );
    }

    client
        .send(Command::GiveFile {
            name: "f.txt".into(),
        })
        .await?;
    assert_eq!(
        client.recv().await?,
        Command::File {
            name: "f.txt".into(),
            content: b"second".to_vec()
        }
    );

    a.stop().await;
    b.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_to_disconnected_primary() -> Result<()> {
    // The peer is configured but never started.
    let (la, ida) = bind().await?;
    let (lb, idb) = bind().await?;
    drop(lb);
    let a = start(la, ida, vec![idb.clone()])?;

    {
        let mut core = a.mesh.core().lock().await;
        let mut remote = core.table().snapshot();
        remote.create_entry(
            "far.txt",
            ROOT_NAME,
            Some(fsmesh_core::Placement {
                node: idb.clone(),
                also: vec![],
            }),
        );
        core.on_command(
            &PeerKey::Server(idb.clone()),
            Command::Fs {
                snapshot: Some(remote),
            },
        );
    }

    let mut client = Client::connect(a.addr).await?;
    client
        .send(Command::GiveFile {
            name: "far.txt".into(),
        })
        .await?;
    assert_eq!(
        client.recv().await?,
        Command::Conn {
            host: idb.host().to_string(),
            port: idb.port()
        }
    );

    a.stop().await;
    Ok(())
}
