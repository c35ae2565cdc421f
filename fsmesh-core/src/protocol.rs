//! fsmesh wire protocol: handshake and command types.

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::table::MetadataTable;

/// Current protocol version. Exchanged in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// First frame in each direction on every connection. Servers announce their node id;
/// clients send `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u8,
    pub node: Option<NodeId>,
}

impl Handshake {
    pub fn server(node: NodeId) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            node: Some(node),
        }
    }

    pub fn client() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            node: None,
        }
    }
}

/// All commands after the handshake. Encoding is bincode; framing is length-prefix (see
/// wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Create a file entry under `parent`; the server resolves name collisions.
    Create { name: String, parent: String },
    /// Append a version to an existing file; content follows in a `File`.
    Update { name: String },
    /// Without a snapshot: request the full table. With one: a peer's table to merge, or
    /// the reply to a request.
    Fs { snapshot: Option<MetadataTable> },
    /// File content for the latest version of `name`.
    File { name: String, content: Vec<u8> },
    /// Primary to replica copy of one version. `path` is the primary's storage path for it.
    ReplicateFile {
        name: String,
        version: u64,
        path: String,
        content: Vec<u8>,
        digest: [u8; 32],
    },
    /// Fetch the content of `name`.
    GiveFile { name: String },
    NewFolder { name: String, parent: String },
    Rename { old: String, new: String },
    Quit,
    Error { reason: String },
    Success,
    /// Redirect: fetch from the node at `host:port` instead.
    Conn { host: String, port: u16 },
    Invalid,
}

impl Command {
    /// Request for the peer's full table.
    pub fn fs_request() -> Self {
        Command::Fs { snapshot: None }
    }

    pub fn error(reason: impl ToString) -> Self {
        Command::Error {
            reason: reason.to_string(),
        }
    }

    /// Short kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Create { .. } => "CREATE",
            Command::Update { .. } => "UPDATE",
            Command::Fs { .. } => "FS",
            Command::File { .. } => "FILE",
            Command::ReplicateFile { .. } => "REPLICATE_FILE",
            Command::GiveFile { .. } => "GIVE_FILE",
            Command::NewFolder { .. } => "NEWFOLDER",
            Command::Rename { .. } => "RENAME",
            Command::Quit => "QUIT",
            Command::Error { .. } => "ERROR",
            Command::Success => "SUCCESS",
            Command::Conn { .. } => "CONN",
            Command::Invalid => "INVALID",
        }
    }
}
