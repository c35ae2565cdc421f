//! Metadata table: flat namespace of append-only version chains.
//!
//! Each logical name maps to a non-empty chain of [`VersionRecord`]s whose last record is
//! authoritative. Chains only grow; the one structural change is a rename, which moves a
//! whole chain to a new key. Peers reconcile by exchanging whole tables and merging them
//! positionally (see [`MetadataTable::merge`]).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::placement::Placement;

/// Name of the entry every fresh table starts with.
pub const ROOT_NAME: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Root,
    Directory,
    File,
}

/// Where a file version's bytes live. Only `File` records carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Location {
    /// Primary storage node.
    pub node: NodeId,
    /// Replica nodes, disjoint from `node`.
    pub also: Vec<NodeId>,
    /// Storage path relative to the node's storage root.
    pub path: String,
}

impl Location {
    /// `[node] + also`.
    pub fn holders(&self) -> Vec<NodeId> {
        std::iter::once(self.node.clone())
            .chain(self.also.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionRecord {
    #[serde(rename = "Type")]
    pub kind: EntryKind,
    pub parent: Option<String>,
    pub version: u64,
    pub location: Option<Location>,
}

impl VersionRecord {
    pub fn root() -> Self {
        Self {
            kind: EntryKind::Root,
            parent: None,
            version: 0,
            location: None,
        }
    }

    pub fn directory(parent: &str) -> Self {
        Self {
            kind: EntryKind::Directory,
            parent: Some(parent.to_string()),
            version: 0,
            location: None,
        }
    }

    pub fn file(parent: &str, location: Location) -> Self {
        Self {
            kind: EntryKind::File,
            parent: Some(parent.to_string()),
            version: 0,
            location: Some(location),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.path.as_str())
    }

    /// Two records at the same chain index describe the same version. Placement (`node`,
    /// `also`) is not compared since a primary can be reassigned in place.
    pub fn corresponds(&self, other: &VersionRecord) -> bool {
        self.kind == other.kind
            && self.parent == other.parent
            && self.version == other.version
            && self.path() == other.path()
    }
}

/// Non-empty, append-only history of one name. `records[k].version == k` always holds;
/// it is checked whenever a chain is deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<VersionRecord>", into = "Vec<VersionRecord>")]
pub struct VersionChain {
    records: Vec<VersionRecord>,
}

impl VersionChain {
    /// Start a chain; the first record's version is forced to 0.
    pub fn new(mut first: VersionRecord) -> Self {
        first.version = 0;
        Self {
            records: vec![first],
        }
    }

    pub fn latest(&self) -> &VersionRecord {
        // Non-empty by construction.
        &self.records[self.records.len() - 1]
    }

    fn latest_mut(&mut self) -> &mut VersionRecord {
        let last = self.records.len() - 1;
        &mut self.records[last]
    }

    pub fn records(&self) -> &[VersionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Chains are never empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index of the first overlapping record that does not correspond, if any.
    fn first_divergence(&self, other: &VersionChain) -> Option<usize> {
        self.records
            .iter()
            .zip(other.records.iter())
            .position(|(a, b)| !a.corresponds(b))
    }

    /// Append `other`'s records beyond our length. Returns how many were appended.
    fn extend_from(&mut self, other: &VersionChain) -> usize {
        let missing = other.records.len().saturating_sub(self.records.len());
        if missing > 0 {
            self.records
                .extend_from_slice(&other.records[self.records.len()..]);
        }
        missing
    }
}

impl TryFrom<Vec<VersionRecord>> for VersionChain {
    type Error = ChainError;

    fn try_from(records: Vec<VersionRecord>) -> Result<Self, Self::Error> {
        if records.is_empty() {
            return Err(ChainError::Empty);
        }
        for (i, r) in records.iter().enumerate() {
            if r.version != i as u64 {
                return Err(ChainError::VersionGap {
                    index: i,
                    version: r.version,
                });
            }
            match (&r.kind, &r.location) {
                (EntryKind::File, None) => return Err(ChainError::MissingLocation(i)),
                (EntryKind::Root | EntryKind::Directory, Some(_)) => {
                    return Err(ChainError::UnexpectedLocation(i))
                }
                (EntryKind::File, Some(loc)) => {
                    let mut seen = BTreeSet::new();
                    if loc.also.iter().any(|n| *n == loc.node || !seen.insert(n)) {
                        return Err(ChainError::OverlappingReplicas(i));
                    }
                }
                _ => {}
            }
        }
        Ok(Self { records })
    }
}

impl From<VersionChain> for Vec<VersionRecord> {
    fn from(chain: VersionChain) -> Self {
        chain.records
    }
}

/// A chain that failed validation while being decoded.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("version chain is empty")]
    Empty,
    #[error("record {index} carries version {version}")]
    VersionGap { index: usize, version: u64 },
    #[error("file record {0} has no location")]
    MissingLocation(usize),
    #[error("non-file record {0} has a location")]
    UnexpectedLocation(usize),
    #[error("record {0} lists its primary or a duplicate among its replicas")]
    OverlappingReplicas(usize),
}

/// The full table. Cloned wholesale into FS snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataTable {
    entries: BTreeMap<String, VersionChain>,
}

impl MetadataTable {
    /// Empty table. Most callers want [`MetadataTable::with_root`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Table holding a single [`ROOT_NAME`] entry.
    pub fn with_root() -> Self {
        let mut t = Self::new();
        t.entries
            .insert(ROOT_NAME.to_string(), VersionChain::new(VersionRecord::root()));
        t
    }

    pub fn snapshot(&self) -> MetadataTable {
        self.clone()
    }

    pub fn get(&self, name: &str) -> Option<&VersionChain> {
        self.entries.get(name)
    }

    pub fn latest(&self, name: &str) -> Option<&VersionRecord> {
        self.entries.get(name).map(VersionChain::latest)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VersionChain)> {
        self.entries.iter()
    }

    /// First free name among `name`, `base(1).ext`, `base(2).ext`, ...
    pub fn resolve_name(&self, name: &str) -> String {
        if !self.entries.contains_key(name) {
            return name.to_string();
        }
        let (base, ext) = split_extension(name);
        (1u64..)
            .map(|n| match ext {
                Some(ext) => format!("{}({}).{}", base, n, ext),
                None => format!("{}({})", base, n),
            })
            .find(|candidate| !self.entries.contains_key(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    /// Insert a new chain of length 1 under a collision-free name derived from `name`.
    /// With a placement the entry is a file; without one it is a directory.
    pub fn create_entry(
        &mut self,
        name: &str,
        parent: &str,
        placement: Option<Placement>,
    ) -> String {
        let final_name = self.resolve_name(name);
        let record = match placement {
            Some(p) => {
                let path = self.fresh_path(&final_name, 0);
                VersionRecord::file(
                    parent,
                    Location {
                        node: p.node,
                        also: p.also,
                        path,
                    },
                )
            }
            None => VersionRecord::directory(parent),
        };
        self.entries
            .insert(final_name.clone(), VersionChain::new(record));
        final_name
    }

    /// Append a version to a file. Parent and placement carry over; the storage path is new.
    pub fn append_version(&mut self, name: &str) -> Result<&VersionRecord, TableError> {
        let latest = self
            .latest(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()))?;
        let location = match (&latest.kind, &latest.location) {
            (EntryKind::File, Some(loc)) => loc.clone(),
            _ => return Err(TableError::NotAFile(name.to_string())),
        };
        let parent = latest.parent.clone();
        let version = self.entries[name].len() as u64;
        let path = self.fresh_path(name, version);
        let chain = self
            .entries
            .get_mut(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()))?;
        chain.records.push(VersionRecord {
            kind: EntryKind::File,
            parent,
            version,
            location: Some(Location { path, ..location }),
        });
        Ok(chain.latest())
    }

    /// Move a whole chain to a new key. Refuses to overwrite an existing entry.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), TableError> {
        if !self.entries.contains_key(old) {
            return Err(TableError::NotFound(old.to_string()));
        }
        if old == new {
            return Ok(());
        }
        if self.entries.contains_key(new) {
            return Err(TableError::AlreadyExists(new.to_string()));
        }
        if let Some(chain) = self.entries.remove(old) {
            self.entries.insert(new.to_string(), chain);
        }
        Ok(())
    }

    /// `[node] + also` of the latest version of a file.
    pub fn find_storage_nodes(&self, name: &str) -> Result<Vec<NodeId>, TableError> {
        Ok(self.file_location(name)?.holders())
    }

    /// Latest location of a file.
    pub fn file_location(&self, name: &str) -> Result<&Location, TableError> {
        let latest = self
            .latest(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()))?;
        match (&latest.kind, &latest.location) {
            (EntryKind::File, Some(loc)) => Ok(loc),
            _ => Err(TableError::NotAFile(name.to_string())),
        }
    }

    /// Make `node` the primary of the latest version, removing it from the replicas.
    pub fn promote_primary(&mut self, name: &str, node: &NodeId) -> Result<(), TableError> {
        self.file_location(name)?;
        let chain = self
            .entries
            .get_mut(name)
            .ok_or_else(|| TableError::NotFound(name.to_string()))?;
        if let Some(loc) = chain.latest_mut().location.as_mut() {
            loc.node = node.clone();
            loc.also.retain(|n| n != node);
        }
        Ok(())
    }

    /// Positional merge of a peer's table.
    ///
    /// Missing names are inserted whole; shorter local chains get the remote's trailing
    /// records. A name whose overlapping records disagree is skipped and reported; every
    /// other name is still merged. Returns the number of records applied.
    pub fn merge(&mut self, remote: &MetadataTable) -> Result<usize, MergeConflict> {
        let mut applied = 0;
        let mut conflicts = Vec::new();
        for (name, theirs) in &remote.entries {
            match self.entries.get_mut(name) {
                None => {
                    applied += theirs.len();
                    self.entries.insert(name.clone(), theirs.clone());
                }
                Some(ours) => match ours.first_divergence(theirs) {
                    Some(index) => conflicts.push((name.clone(), index)),
                    None => applied += ours.extend_from(theirs),
                },
            }
        }
        if conflicts.is_empty() {
            Ok(applied)
        } else {
            Err(MergeConflict { conflicts, applied })
        }
    }

    /// Number of files each node holds (primary or replica) in the latest versions.
    pub fn load_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts = BTreeMap::new();
        for chain in self.entries.values() {
            if let Some(loc) = &chain.latest().location {
                for node in loc.holders() {
                    *counts.entry(node).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn path_in_use(&self, path: &str) -> bool {
        self.entries
            .values()
            .flat_map(|c| c.records.iter())
            .any(|r| r.path() == Some(path))
    }

    /// Storage path for `name` at `version`, suffixed if a renamed chain already owns it.
    fn fresh_path(&self, name: &str, version: u64) -> String {
        let base = storage_path(name, version);
        if !self.path_in_use(&base) {
            return base;
        }
        (1u64..)
            .map(|n| format!("{}.{}", base, n))
            .find(|p| !self.path_in_use(p))
            .unwrap_or(base)
    }
}

/// Storage file name for one version of `name`. Separators are flattened so the result is
/// always a single path component.
pub fn storage_path(name: &str, version: u64) -> String {
    let flat: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}.v{}", flat, version)
}

/// Split at the last dot. Dotfiles and names without a dot have no extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(i) if i > 0 && i + 1 < name.len() => (&name[..i], Some(&name[i + 1..])),
        _ => (name, None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("no entry named {0:?}")]
    NotFound(String),
    #[error("{0:?} is not a file")]
    NotAFile(String),
    #[error("an entry named {0:?} already exists")]
    AlreadyExists(String),
}

/// Names whose chains could not be aligned during a merge, with the first diverging index.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "merge conflict on {} name(s), first {:?}",
    .conflicts.len(),
    .conflicts.first().map(|c| &c.0)
)]
pub struct MergeConflict {
    pub conflicts: Vec<(String, usize)>,
    /// Records applied for the names that did merge.
    pub applied: usize,
}
