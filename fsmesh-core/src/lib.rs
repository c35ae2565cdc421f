//! fsmesh core: replicated file metadata table, placement and the command dispatcher.
//! Host-driven: no sockets; the host passes commands and performs the returned actions.

pub mod core;
pub mod identity;
pub mod integrity;
pub mod persist;
pub mod placement;
pub mod protocol;
pub mod roster;
pub mod storage;
pub mod table;
pub mod wire;

pub use crate::core::{CommandError, FsCore, OutboundAction};
pub use identity::{NodeId, NodeIdError, PeerKey};
pub use persist::SnapshotSink;
pub use placement::Placement;
pub use protocol::{Command, Handshake, PROTOCOL_VERSION};
pub use roster::Roster;
pub use storage::{FileStore, StorageError};
pub use table::{
    EntryKind, Location, MergeConflict, MetadataTable, TableError, VersionRecord, ROOT_NAME,
};
pub use wire::{encode_frame, FrameDecodeError, FrameEncodeError};
