//! Mirror ring.
//!
//! Members are ordered by join sequence; each member's backup is its ring
//! successor and its previous is its predecessor.
//!
//! Relinking takes the admission gate exclusively. Writes that replicate to
//! a backup hold the shared side from admission until the backup has
//! acknowledged, so no write is acknowledged against a link that is being
//! changed: a write admitted before a relink completes against the old
//! backup, a write arriving during a relink waits for the new one.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{RwLock as AdmissionGate, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::messages::Member;
use super::NodeId;
use crate::error::{Error, Result};

/// Ring position of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheNode {
    pub id: NodeId,
    pub sequence: u32,
    pub backup: Option<NodeId>,
    pub previous: Option<NodeId>,
}

/// Permission to acknowledge a write; the ring cannot relink while held
pub struct WriteAdmission<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    pub backup: Option<NodeId>,
}

/// Exclusive right to change links; write admission waits while held
pub struct RelinkGuard<'a> {
    _gate: RwLockWriteGuard<'a, ()>,
    ring: &'a MirrorRing,
}

impl RelinkGuard<'_> {
    /// Add a member at `sequence`
    pub fn join(&self, id: NodeId, sequence: u32) -> Result<CacheNode> {
        let mut nodes = self.ring.nodes.write();
        if nodes.iter().any(|n| n.id == id) {
            return Err(Error::ClusterMembership(format!("{} is already a member", id)));
        }
        if nodes.iter().any(|n| n.sequence == sequence) {
            return Err(Error::ClusterMembership(format!(
                "sequence {} is already taken",
                sequence
            )));
        }
        nodes.push(CacheNode {
            id: id.clone(),
            sequence,
            backup: None,
            previous: None,
        });
        link(&mut nodes);
        self.ring.warned_single.store(false, Ordering::Relaxed);
        info!(node = %id, sequence, members = nodes.len(), "Node joined ring");
        nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| Error::Internal("joined node missing from ring".into()))
    }

    /// Remove a member (graceful leave or failure)
    pub fn leave(&self, id: &NodeId) -> Result<()> {
        let mut nodes = self.ring.nodes.write();
        let before = nodes.len();
        nodes.retain(|n| &n.id != id);
        if nodes.len() == before {
            return Err(Error::ClusterMembership(format!("{} is not a member", id)));
        }
        link(&mut nodes);
        info!(node = %id, members = nodes.len(), "Node left ring");
        Ok(())
    }

    /// Replace membership wholesale
    pub fn install(&self, members: &[Member]) {
        let mut nodes = self.ring.nodes.write();
        *nodes = members
            .iter()
            .map(|m| CacheNode {
                id: m.id.clone(),
                sequence: m.sequence,
                backup: None,
                previous: None,
            })
            .collect();
        link(&mut nodes);
        self.ring.warned_single.store(false, Ordering::Relaxed);
        debug!(members = nodes.len(), "Installed ring membership");
    }
}

pub struct MirrorRing {
    nodes: RwLock<Vec<CacheNode>>,
    admission: AdmissionGate<()>,
    warned_single: AtomicBool,
}

impl MirrorRing {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            admission: AdmissionGate::new(()),
            warned_single: AtomicBool::new(false),
        }
    }

    /// Members in ring order
    pub fn nodes(&self) -> Vec<CacheNode> {
        self.nodes.read().clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.nodes
            .read()
            .iter()
            .map(|node| Member {
                id: node.id.clone(),
                sequence: node.sequence,
            })
            .collect()
    }

    pub fn order(&self) -> Vec<NodeId> {
        self.nodes.read().iter().map(|n| n.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().iter().any(|n| &n.id == id)
    }

    pub fn node(&self, id: &NodeId) -> Option<CacheNode> {
        self.nodes.read().iter().find(|n| &n.id == id).cloned()
    }

    pub fn backup_of(&self, id: &NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.backup)
    }

    pub fn previous_of(&self, id: &NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.previous)
    }

    /// Sequence for the next joiner
    pub fn next_sequence(&self) -> u32 {
        self.nodes.read().iter().map(|n| n.sequence).max().map_or(1, |s| s + 1)
    }

    /// Admit a write from `node`, waiting out any relink in progress
    pub async fn admit_write(&self, node: &NodeId) -> WriteAdmission<'_> {
        let gate = self.admission.read().await;
        let backup = self.backup_of(node);
        if backup.is_none() && !self.warned_single.swap(true, Ordering::Relaxed) {
            info!(node = %node, "No backup in ring, acknowledging writes locally");
        }
        WriteAdmission {
            _gate: gate,
            backup,
        }
    }

    /// Take the relink side of the admission gate.
    ///
    /// New writes wait until the guard is dropped, so a caller can also
    /// finish resynchronizing a new backup before writes resume.
    pub async fn relink(&self) -> RelinkGuard<'_> {
        RelinkGuard {
            _gate: self.admission.write().await,
            ring: self,
        }
    }

    pub async fn join(&self, id: NodeId, sequence: u32) -> Result<CacheNode> {
        self.relink().await.join(id, sequence)
    }

    pub async fn leave(&self, id: &NodeId) -> Result<()> {
        self.relink().await.leave(id)
    }

    pub async fn install(&self, members: &[Member]) {
        self.relink().await.install(members)
    }

    /// One cycle through every member with consistent links
    pub fn is_single_cycle(&self) -> bool {
        let nodes = self.nodes.read();
        match nodes.len() {
            0 => true,
            1 => nodes[0].backup.is_none() && nodes[0].previous.is_none(),
            n => {
                let position = |id: &NodeId| nodes.iter().position(|x| &x.id == id);
                let mut visited = vec![false; n];
                let mut current = 0usize;
                for _ in 0..n {
                    if visited[current] {
                        return false;
                    }
                    visited[current] = true;
                    let Some(next) = nodes[current].backup.as_ref().and_then(|b| position(b))
                    else {
                        return false;
                    };
                    if nodes[next].previous.as_ref() != Some(&nodes[current].id) {
                        return false;
                    }
                    current = next;
                }
                current == 0 && visited.iter().all(|v| *v)
            }
        }
    }
}

impl Default for MirrorRing {
    fn default() -> Self {
        Self::new()
    }
}

fn link(nodes: &mut [CacheNode]) {
    nodes.sort_by_key(|n| n.sequence);
    let n = nodes.len();
    if n < 2 {
        for node in nodes.iter_mut() {
            node.backup = None;
            node.previous = None;
        }
        return;
    }
    let ids: Vec<NodeId> = nodes.iter().map(|node| node.id.clone()).collect();
    for (i, node) in nodes.iter_mut().enumerate() {
        node.backup = Some(ids[(i + 1) % n].clone());
        node.previous = Some(ids[(i + n - 1) % n].clone());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn id(name: &str) -> NodeId {
        NodeId::from(name)
    }

    #[tokio::test]
    async fn test_third_node_joins_two_node_ring() {
        let ring = MirrorRing::new();
        ring.join(id("A"), 1).await.unwrap();
        ring.join(id("B"), 2).await.unwrap();
        assert_eq!(ring.backup_of(&id("A")), Some(id("B")));
        assert_eq!(ring.backup_of(&id("B")), Some(id("A")));

        ring.join(id("C"), 3).await.unwrap();
        assert_eq!(ring.order(), vec![id("A"), id("B"), id("C")]);
        assert_eq!(ring.backup_of(&id("A")), Some(id("B")));
        assert_eq!(ring.backup_of(&id("B")), Some(id("C")));
        assert_eq!(ring.backup_of(&id("C")), Some(id("A")));
        assert_eq!(ring.previous_of(&id("A")), Some(id("C")));
        assert_eq!(ring.previous_of(&id("B")), Some(id("A")));
        assert_eq!(ring.previous_of(&id("C")), Some(id("B")));
        assert!(ring.is_single_cycle());
    }

    #[tokio::test]
    async fn test_leave_shifts_links_past_departed() {
        let ring = MirrorRing::new();
        for (i, name) in ["A", "B", "C", "D"].iter().enumerate() {
            ring.join(id(name), i as u32 + 1).await.unwrap();
        }
        ring.leave(&id("C")).await.unwrap();
        assert_eq!(ring.backup_of(&id("B")), Some(id("D")));
        assert_eq!(ring.previous_of(&id("D")), Some(id("B")));
        assert!(ring.is_single_cycle());

        ring.leave(&id("A")).await.unwrap();
        ring.leave(&id("D")).await.unwrap();
        assert_eq!(ring.backup_of(&id("B")), None);
        assert!(ring.is_single_cycle());
    }

    #[tokio::test]
    async fn test_duplicate_membership_rejected() {
        let ring = MirrorRing::new();
        ring.join(id("A"), 1).await.unwrap();
        assert!(ring.join(id("A"), 2).await.is_err());
        assert!(ring.join(id("B"), 1).await.is_err());
        assert!(ring.leave(&id("Z")).await.is_err());
        assert_eq!(ring.next_sequence(), 2);
    }

    #[tokio::test]
    async fn test_single_node_admits_without_backup() {
        let ring = MirrorRing::new();
        ring.join(id("A"), 1).await.unwrap();
        let admission = ring.admit_write(&id("A")).await;
        assert_eq!(admission.backup, None);
    }

    #[tokio::test]
    async fn test_relink_waits_for_admitted_writes() {
        let ring = Arc::new(MirrorRing::new());
        ring.join(id("A"), 1).await.unwrap();
        ring.join(id("B"), 2).await.unwrap();

        let admission = ring.admit_write(&id("A")).await;
        assert_eq!(admission.backup, Some(id("B")));

        let joiner = {
            let ring = ring.clone();
            tokio::spawn(async move { ring.join(id("C"), 3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!joiner.is_finished());
        assert_eq!(ring.len(), 2);

        drop(admission);
        joiner.await.unwrap().unwrap();
        assert_eq!(ring.backup_of(&id("B")), Some(id("C")));
    }
}
