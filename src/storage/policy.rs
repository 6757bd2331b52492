//! Eviction Policies
//!
//! Selects victims when an insert would exceed capacity. Selection is all or
//! nothing: if the evictable set cannot cover the shortfall, nothing is
//! evicted and the insert fails.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::entry::Priority;
use crate::config::EvictionKind;
use crate::error::{Error, Result};

/// Eviction view of one entry
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: Arc<str>,
    pub priority: Priority,
    pub last_accessed: DateTime<Utc>,
    pub size: u64,
}

/// Victim selection strategy
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick keys freeing at least `required` bytes, aiming for `target`.
    ///
    /// Candidates already exclude locked and non-removable entries.
    fn select(
        &self,
        candidates: Vec<EvictionCandidate>,
        required: u64,
        target: u64,
    ) -> Result<Vec<Arc<str>>>;
}

/// Lowest priority first, least recently used within a priority band
#[derive(Debug, Default)]
pub struct PriorityEvictionPolicy;

impl EvictionPolicy for PriorityEvictionPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select(
        &self,
        mut candidates: Vec<EvictionCandidate>,
        required: u64,
        target: u64,
    ) -> Result<Vec<Arc<str>>> {
        candidates.retain(|c| c.priority.is_removable());

        let evictable: u64 = candidates.iter().map(|c| c.size).sum();
        if evictable < required {
            return Err(Error::NotEnoughItemsEvicted {
                required,
                evictable,
            });
        }

        candidates.sort_by(|a, b| {
            a.priority
                .effective()
                .cmp(&b.priority.effective())
                .then(a.last_accessed.cmp(&b.last_accessed))
        });

        let goal = target.max(required);
        let mut freed = 0u64;
        let mut victims = Vec::new();
        for candidate in candidates {
            if freed >= goal {
                break;
            }
            freed += candidate.size;
            victims.push(candidate.key);
        }
        Ok(victims)
    }
}

/// Never evicts; a full cache rejects writes
#[derive(Debug, Default)]
pub struct NoEvictionPolicy;

impl EvictionPolicy for NoEvictionPolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn select(
        &self,
        _candidates: Vec<EvictionCandidate>,
        required: u64,
        _target: u64,
    ) -> Result<Vec<Arc<str>>> {
        Err(Error::NotEnoughItemsEvicted {
            required,
            evictable: 0,
        })
    }
}

pub fn policy_for(kind: EvictionKind) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionKind::Priority => Box::new(PriorityEvictionPolicy),
        EvictionKind::None => Box::new(NoEvictionPolicy),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn candidate(key: &str, priority: Priority, accessed: i64, size: u64) -> EvictionCandidate {
        EvictionCandidate {
            key: Arc::from(key),
            priority,
            last_accessed: DateTime::from_timestamp(accessed, 0).unwrap(),
            size,
        }
    }

    #[test]
    fn test_lowest_priority_then_lru() {
        let policy = PriorityEvictionPolicy;
        let victims = policy
            .select(
                vec![
                    candidate("high-old", Priority::High, 1, 10),
                    candidate("low-new", Priority::Low, 9, 10),
                    candidate("low-old", Priority::Low, 2, 10),
                    candidate("normal", Priority::Default, 0, 10),
                ],
                25,
                25,
            )
            .unwrap();

        let victims: Vec<&str> = victims.iter().map(|k| k.as_ref()).collect();
        assert_eq!(victims, vec!["low-old", "low-new", "normal"]);
    }

    #[test]
    fn test_not_removable_exempt() {
        let policy = PriorityEvictionPolicy;
        let result = policy.select(
            vec![
                candidate("sentinel", Priority::NotRemovable, 0, 100),
                candidate("item", Priority::Low, 0, 10),
            ],
            50,
            50,
        );
        assert_matches!(
            result,
            Err(Error::NotEnoughItemsEvicted {
                required: 50,
                evictable: 10
            })
        );
    }

    #[test]
    fn test_target_exceeds_required() {
        let policy = PriorityEvictionPolicy;
        let victims = policy
            .select(
                vec![
                    candidate("a", Priority::Low, 0, 10),
                    candidate("b", Priority::Low, 1, 10),
                    candidate("c", Priority::Low, 2, 10),
                ],
                5,
                15,
            )
            .unwrap();
        assert_eq!(victims.len(), 2);
    }

    #[test]
    fn test_no_eviction_policy_rejects() {
        assert_matches!(
            NoEvictionPolicy.select(vec![candidate("a", Priority::Low, 0, 10)], 1, 1),
            Err(Error::NotEnoughItemsEvicted { .. })
        );
        assert_eq!(policy_for(EvictionKind::Priority).name(), "priority");
    }
}
