//! Pooled object capabilities and leases.

use std::ops::{Deref, DerefMut};

use serde::Serialize;

use super::stats::ObjectPoolStats;
use super::PoolManager;

/// Restores an object to its freshly-constructed state.
///
/// After `reset` the value must be indistinguishable from `Default::default()`.
pub trait Resettable {
    fn reset(&mut self);
}

/// A type that knows which pool of a [`PoolManager`] owns it.
pub trait PoolOwned: Resettable + Default + Send + Sync + Sized + 'static {
    const KIND: ObjectPoolKind;

    fn owning_pool(manager: &PoolManager) -> &dyn Pool<Self>;
}

/// Object pools held by a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectPoolKind {
    OperationContext,
    ResponseEnvelope,
}

impl ObjectPoolKind {
    pub const ALL: [ObjectPoolKind; 2] = [
        ObjectPoolKind::OperationContext,
        ObjectPoolKind::ResponseEnvelope,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ObjectPoolKind::OperationContext => "operation_context",
            ObjectPoolKind::ResponseEnvelope => "response_envelope",
        }
    }
}

/// Common interface of real and fake object pools
pub trait Pool<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Hand out an instance; never blocks
    fn rent(&self) -> Lease<T>;

    /// Reset and take back an instance; foreign or repeated returns are ignored
    fn give_back(&self, lease: Lease<T>);

    fn rent_many(&self, count: usize) -> Vec<Lease<T>> {
        (0..count).map(|_| self.rent()).collect()
    }

    fn give_back_many(&self, leases: Vec<Lease<T>>) {
        for lease in leases {
            self.give_back(lease);
        }
    }

    fn stats(&self) -> ObjectPoolStats;

    /// Drop pooled instances and restore initial capacity
    fn clear(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub(crate) pool_id: u64,
    pub(crate) seq: u64,
}

/// Exclusive handle on a rented object.
///
/// A lease is not `Clone`, so an instance can only be in use by one owner.
#[derive(Debug)]
pub struct Lease<T> {
    pub(crate) value: T,
    pub(crate) ticket: Option<Ticket>,
}

impl<T> Lease<T> {
    pub(crate) fn pooled(value: T, pool_id: u64, seq: u64) -> Self {
        Self {
            value,
            ticket: Some(Ticket { pool_id, seq }),
        }
    }

    /// An instance the pool does not track; returning it just drops it
    pub fn out_of_pool(value: T) -> Self {
        Self {
            value,
            ticket: None,
        }
    }

    pub fn is_out_of_pool(&self) -> bool {
        self.ticket.is_none()
    }

    /// Sequence number within the origin pool
    pub fn seq(&self) -> Option<u64> {
        self.ticket.map(|t| t.seq)
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

// =============================================================================
// Tests
// =============================================================================
