//! Placement: pick the primary node for a new file and the replicas that follow it.
//!
//! Load is counted from the latest version of every file (primary and replicas). New files
//! go to the least-loaded server, so servers that hold nothing yet are filled first.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::identity::NodeId;
use crate::roster::Roster;
use crate::table::MetadataTable;

/// Primary plus replicas chosen for a new file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node: NodeId,
    pub also: Vec<NodeId>,
}

/// Copies to keep, primary included: a majority of the known servers.
pub fn replica_target(server_count: usize) -> usize {
    server_count / 2 + 1
}

fn load(counts: &BTreeMap<NodeId, usize>, node: &NodeId) -> usize {
    counts.get(node).copied().unwrap_or(0)
}

/// Least-loaded known server. Ties prefer live servers, then the smallest id.
pub fn choose_storage_node(table: &MetadataTable, roster: &Roster) -> NodeId {
    let counts = table.load_counts();
    roster
        .servers()
        .into_iter()
        .min_by_key(|n| (load(&counts, n), !roster.is_live(n), n.clone()))
        .unwrap_or_else(|| roster.local().clone())
}

/// `replica_target - 1` servers other than `primary`, least-loaded first. Ties are broken at
/// random.
pub fn choose_replica_set<R: Rng + ?Sized>(
    table: &MetadataTable,
    roster: &Roster,
    primary: &NodeId,
    rng: &mut R,
) -> Vec<NodeId> {
    let counts = table.load_counts();
    let mut candidates: Vec<NodeId> = roster
        .servers()
        .into_iter()
        .filter(|n| n != primary)
        .collect();
    let want = (replica_target(roster.server_count()) - 1).min(candidates.len());
    candidates.shuffle(rng);
    // Stable sort keeps the shuffled order among equally loaded servers.
    candidates.sort_by_key(|n| load(&counts, n));
    candidates.truncate(want);
    candidates
}

/// Full placement decision for a new file.
pub fn place<R: Rng + ?Sized>(table: &MetadataTable, roster: &Roster, rng: &mut R) -> Placement {
    let node = choose_storage_node(table, roster);
    let also = choose_replica_set(table, roster, &node, rng);
    Placement { node, also }
}
