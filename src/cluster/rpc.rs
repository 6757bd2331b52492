//! Inter-node call dispatch.
//!
//! Every remotely callable operation is an entry in a table keyed by
//! `(Opcode, overload)`, built once at node start. Building fails on a
//! duplicate entry and [`RpcDispatcher::verify`] checks that a required set
//! of entries is present, so a missing handler is caught at startup instead
//! of on first use.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::warn;

use super::transport::RpcRequest;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Opcode {
    // Data path
    Get,
    Write,
    Remove,
    Lock,
    Contains,
    ReadStream,
    Count,
    Clear,
    RemoveGroup,
    KeysByTag,
    ReleaseLocks,
    // Replication
    Replicate,
    ReplicaResync,
    // Membership
    Presence,
    Join,
    Membership,
    Leave,
    StateTransfer,
    TransferComplete,
    // Queries
    QueryState,
    RegisterQuery,
    UnregisterQuery,
    Search,
    QueryNotification,
    MapReduce,
}

pub type RpcFuture = BoxFuture<'static, Result<Bytes>>;

/// Typed handler bound to a context `C`
pub type RpcHandlerFn<C> = fn(Arc<C>, RpcRequest) -> RpcFuture;

pub struct RpcTableBuilder<C> {
    table: HashMap<(Opcode, u16), RpcHandlerFn<C>>,
    duplicates: Vec<(Opcode, u16)>,
}

impl<C> RpcTableBuilder<C> {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn register(mut self, opcode: Opcode, overload: u16, handler: RpcHandlerFn<C>) -> Self {
        if self.table.insert((opcode, overload), handler).is_some() {
            self.duplicates.push((opcode, overload));
        }
        self
    }

    pub fn build(self) -> Result<RpcDispatcher<C>> {
        if !self.duplicates.is_empty() {
            return Err(Error::Internal(format!(
                "duplicate RPC handlers: {:?}",
                self.duplicates
            )));
        }
        Ok(RpcDispatcher { table: self.table })
    }
}

impl<C> Default for RpcTableBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RpcDispatcher<C> {
    table: HashMap<(Opcode, u16), RpcHandlerFn<C>>,
}

impl<C> RpcDispatcher<C> {
    pub async fn dispatch(&self, context: Arc<C>, request: RpcRequest) -> Result<Bytes> {
        let key = (request.opcode, request.overload);
        match self.table.get(&key) {
            Some(handler) => handler(context, request).await,
            None => {
                warn!(opcode = ?key.0, overload = key.1, from = %request.from, "No RPC handler");
                Err(Error::Internal(format!(
                    "no handler for {:?}/{}",
                    key.0, key.1
                )))
            }
        }
    }

    /// Registered entries, sorted
    pub fn methods(&self) -> Vec<(Opcode, u16)> {
        let mut methods: Vec<_> = self.table.keys().copied().collect();
        methods.sort();
        methods
    }

    pub fn verify(&self, required: &[(Opcode, u16)]) -> Result<()> {
        let missing: Vec<_> = required
            .iter()
            .filter(|key| !self.table.contains_key(*key))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(format!("missing RPC handlers: {:?}", missing)))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
