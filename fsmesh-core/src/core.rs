//! Host-driven API: FsCore receives commands from connections, returns actions.
//!
//! The host owns sockets and queues; `FsCore` owns the table, the roster, the local file
//! store and the snapshot sink. The host keeps one `FsCore` behind a mutex and calls
//! [`FsCore::on_command`] from each connection's dispatcher, then carries out the returned
//! [`OutboundAction`]s before releasing the lock.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::identity::{NodeId, PeerKey};
use crate::integrity;
use crate::persist::SnapshotSink;
use crate::placement;
use crate::protocol::Command;
use crate::roster::Roster;
use crate::storage::{FileStore, StorageError};
use crate::table::{MergeConflict, MetadataTable, TableError};

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Queue on the connection the command came from.
    Reply(Command),
    /// Queue on every live connection to a known server.
    Broadcast(Command),
    /// Queue on the live connection to one server, if any.
    SendTo(NodeId, Command),
    /// Tear down the connection the command came from.
    Close,
}

/// Why a command was answered with `ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Merge(#[from] MergeConflict),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Main coordinator. Connections pass commands; core returns actions.
pub struct FsCore {
    table: MetadataTable,
    roster: Roster,
    store: FileStore,
    sink: SnapshotSink,
    rng: StdRng,
}

impl FsCore {
    pub fn new(table: MetadataTable, roster: Roster, store: FileStore, sink: SnapshotSink) -> Self {
        Self {
            table,
            roster,
            store,
            sink,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn local(&self) -> &NodeId {
        self.roster.local()
    }

    pub fn table(&self) -> &MetadataTable {
        &self.table
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Full table as an FS command.
    pub fn fs_snapshot(&self) -> Command {
        Command::Fs {
            snapshot: Some(self.table.snapshot()),
        }
    }

    /// A configured server now has a live link. Returns false for unknown ids.
    pub fn on_peer_joined(&mut self, node: &NodeId) -> bool {
        self.roster.set_connected(node, true)
    }

    /// The link to a configured server is gone; the reconnect loop will dial it again.
    pub fn on_peer_left(&mut self, node: &NodeId) {
        self.roster.set_connected(node, false);
    }

    /// Execute one command. Failures become an `ERROR` reply to the sender.
    pub fn on_command(&mut self, from: &PeerKey, command: Command) -> Vec<OutboundAction> {
        let kind = command.kind();
        debug!(peer = %from, kind, "dispatching command");
        let result = match command {
            Command::Create { name, parent } => self.create(&name, &parent),
            Command::Update { name } => self.update(&name),
            Command::NewFolder { name, parent } => self.new_folder(&name, &parent),
            Command::Rename { old, new } => self.rename(&old, &new),
            Command::Fs { snapshot: None } => Ok(vec![OutboundAction::Reply(self.fs_snapshot())]),
            Command::Fs {
                snapshot: Some(remote),
            } => self.merge(from, &remote),
            Command::File { name, content } => self.store_file(from, name, content),
            Command::ReplicateFile {
                name,
                version,
                path,
                content,
                digest,
            } => self.replicate(&name, version, &path, &content, &digest),
            Command::GiveFile { name } => self.give_file(name),
            Command::Quit => Ok(vec![OutboundAction::Close]),
            Command::Error { reason } => {
                warn!(peer = %from, %reason, "peer reported an error");
                Ok(vec![])
            }
            Command::Success | Command::Invalid | Command::Conn { .. } => Ok(vec![]),
        };
        match result {
            Ok(actions) => actions,
            Err(e) => {
                warn!(peer = %from, kind, error = %e, "command failed");
                vec![OutboundAction::Reply(Command::error(e))]
            }
        }
    }

    /// Persist, then broadcast the new table to servers and reply with it.
    fn commit(&mut self) -> Vec<OutboundAction> {
        self.sink.store(&self.table);
        let fs = self.fs_snapshot();
        vec![OutboundAction::Broadcast(fs.clone()), OutboundAction::Reply(fs)]
    }

    fn create(&mut self, name: &str, parent: &str) -> Result<Vec<OutboundAction>, CommandError> {
        let placement = placement::place(&self.table, &self.roster, &mut self.rng);
        let primary = placement.node.clone();
        let created = self.table.create_entry(name, parent, Some(placement));
        info!(name = %created, %primary, "file created");
        Ok(self.commit())
    }

    fn update(&mut self, name: &str) -> Result<Vec<OutboundAction>, CommandError> {
        let version = self.table.append_version(name)?.version;
        info!(%name, version, "file version appended");
        Ok(self.commit())
    }

    fn new_folder(
        &mut self,
        name: &str,
        parent: &str,
    ) -> Result<Vec<OutboundAction>, CommandError> {
        let created = self.table.create_entry(name, parent, None);
        info!(name = %created, "folder created");
        Ok(self.commit())
    }

    fn rename(&mut self, old: &str, new: &str) -> Result<Vec<OutboundAction>, CommandError> {
        self.table.rename(old, new)?;
        info!(%old, %new, "entry renamed");
        Ok(self.commit())
    }

    fn merge(
        &mut self,
        from: &PeerKey,
        remote: &MetadataTable,
    ) -> Result<Vec<OutboundAction>, CommandError> {
        match self.table.merge(remote) {
            Ok(applied) => {
                if applied > 0 {
                    debug!(peer = %from, applied, "merged peer snapshot");
                    self.sink.store(&self.table);
                }
                Ok(vec![])
            }
            Err(conflict) => {
                if conflict.applied > 0 {
                    self.sink.store(&self.table);
                }
                Err(conflict.into())
            }
        }
    }

    /// Store content for the latest version of `name`, or hand it to the primary.
    ///
    /// Content arriving from another server is always stored here: that server already
    /// resolved the primary, and forwarding again could loop between diverged tables.
    fn store_file(
        &mut self,
        from: &PeerKey,
        name: String,
        content: Vec<u8>,
    ) -> Result<Vec<OutboundAction>, CommandError> {
        let local = self.roster.local().clone();
        let primary = self.table.file_location(&name)?.node.clone();
        if primary != local && from.server().is_none() {
            if self.roster.is_live(&primary) {
                debug!(%name, %primary, "forwarding file to primary");
                return Ok(vec![OutboundAction::SendTo(
                    primary,
                    Command::File { name, content },
                )]);
            }
            self.table.promote_primary(&name, &local)?;
            self.sink.store(&self.table);
            info!(%name, unreachable = %primary, "primary unreachable, storing locally");
        }

        let location = self.table.file_location(&name)?.clone();
        let version = self.table.latest(&name).map_or(0, |r| r.version);
        self.store.write(&location.path, &content)?;
        debug!(%name, version, path = %location.path, bytes = content.len(), "file stored");

        let digest = integrity::digest(&content);
        let actions = location
            .also
            .iter()
            .filter(|n| **n != local && self.roster.is_live(n))
            .map(|n| {
                OutboundAction::SendTo(
                    n.clone(),
                    Command::ReplicateFile {
                        name: name.clone(),
                        version,
                        path: location.path.clone(),
                        content: content.clone(),
                        digest,
                    },
                )
            })
            .collect();
        Ok(actions)
    }

    /// Replica side of lazy replication. The bytes belong to `version`, which may no longer
    /// be the latest here: an UPDATE can overtake the copy of the previous version. Writes to
    /// that version's local path, or to the carried path when this node has not seen it yet.
    fn replicate(
        &mut self,
        name: &str,
        version: u64,
        path: &str,
        content: &[u8],
        digest: &[u8; 32],
    ) -> Result<Vec<OutboundAction>, CommandError> {
        if !integrity::verify(content, digest) {
            return Err(StorageError::DigestMismatch(name.to_string()).into());
        }
        let local_path = self.table.get(name).and_then(|chain| {
            usize::try_from(version)
                .ok()
                .and_then(|i| chain.records().get(i))
                .and_then(|r| r.path())
        });
        let target = local_path.unwrap_or(path).to_string();
        if target != path {
            debug!(%name, version, local = %target, carried = %path, "replica path differs");
        }
        self.store.write(&target, content)?;
        debug!(%name, version, path = %target, "replica stored");
        Ok(vec![OutboundAction::Reply(Command::Success)])
    }

    fn give_file(&self, name: String) -> Result<Vec<OutboundAction>, CommandError> {
        let location = self.table.file_location(&name)?.clone();
        let local = self.roster.local();
        let holds_here = location.node == *local
            || (location.also.contains(local) && self.store.contains(&location.path));
        if holds_here {
            let content = self.store.read(&location.path)?;
            return Ok(vec![OutboundAction::Reply(Command::File { name, content })]);
        }
        let target = self
            .table
            .find_storage_nodes(&name)?
            .into_iter()
            .find(|n| n != local && self.roster.is_live(n))
            .unwrap_or(location.node);
        Ok(vec![OutboundAction::Reply(Command::Conn {
            host: target.host().to_string(),
            port: target.port(),
        })])
    }
}
