//! Cluster transport port and the in-process network.
//!
//! The in-process network connects nodes living in one process (the node
//! binary's `--cluster-size` mode and tests). An isolated node stays
//! registered but never answers, which is how tests provoke timeouts.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::rpc::Opcode;
use super::NodeId;
use crate::error::{Error, Result};

/// One inter-node call
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub from: NodeId,
    pub opcode: Opcode,
    pub overload: u16,
    pub payload: Bytes,
}

impl RpcRequest {
    pub fn new(from: NodeId, opcode: Opcode, payload: Bytes) -> Self {
        Self {
            from,
            opcode,
            overload: 0,
            payload,
        }
    }

    pub fn with_overload(mut self, overload: u16) -> Self {
        self.overload = overload;
        self
    }
}

/// Receiving side of the transport
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: RpcRequest) -> Result<Bytes>;
}

/// Sending side of the transport
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    fn local(&self) -> &NodeId;

    /// Deliver `request` to `to`; may never complete if the peer is silent
    async fn send(&self, to: &NodeId, request: RpcRequest) -> Result<Bytes>;
}

/// Registry of in-process nodes
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: DashMap<NodeId, Arc<dyn RpcHandler>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: NodeId, handler: Arc<dyn RpcHandler>) {
        self.nodes.insert(id, handler);
    }

    pub fn unregister(&self, id: &NodeId) {
        self.nodes.remove(id);
    }

    /// Silence a node in both directions
    pub fn isolate(&self, id: &NodeId) {
        self.isolated.write().insert(id.clone());
    }

    pub fn heal(&self, id: &NodeId) {
        self.isolated.write().remove(id);
    }

    pub fn is_isolated(&self, id: &NodeId) -> bool {
        self.isolated.read().contains(id)
    }

    pub fn transport(self: &Arc<Self>, local: NodeId) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            local,
            network: self.clone(),
        })
    }
}

pub struct InMemoryTransport {
    local: NodeId,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl ClusterTransport for InMemoryTransport {
    fn local(&self) -> &NodeId {
        &self.local
    }

    async fn send(&self, to: &NodeId, request: RpcRequest) -> Result<Bytes> {
        if self.network.is_isolated(to) || self.network.is_isolated(&self.local) {
            trace!(from = %self.local, to = %to, opcode = ?request.opcode, "Dropping message");
            return futures::future::pending().await;
        }
        let handler = self
            .network
            .nodes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NodeUnreachable(to.to_string()))?;
        handler.handle(request).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, request: RpcRequest) -> Result<Bytes> {
            Ok(request.payload)
        }
    }

    #[tokio::test]
    async fn test_delivery_and_unreachable() {
        let network = InMemoryNetwork::new();
        network.register(NodeId::from("b"), Arc::new(Echo));
        let transport = network.transport(NodeId::from("a"));

        let request = RpcRequest::new(NodeId::from("a"), Opcode::Presence, Bytes::from_static(b"hi"));
        let reply = transport.send(&NodeId::from("b"), request.clone()).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"hi"));

        assert_matches!(
            transport.send(&NodeId::from("z"), request).await,
            Err(Error::NodeUnreachable(_))
        );
    }

    #[tokio::test]
    async fn test_isolated_node_never_answers() {
        let network = InMemoryNetwork::new();
        network.register(NodeId::from("b"), Arc::new(Echo));
        network.isolate(&NodeId::from("b"));
        let transport = network.transport(NodeId::from("a"));

        let request = RpcRequest::new(NodeId::from("a"), Opcode::Presence, Bytes::new());
        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            transport.send(&NodeId::from("b"), request.clone()),
        )
        .await;
        assert!(outcome.is_err());

        network.heal(&NodeId::from("b"));
        assert!(transport.send(&NodeId::from("b"), request).await.is_ok());
    }
}
