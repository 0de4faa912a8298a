//! Pool versions and the pool machine
//!
//! The pool machine is the client's cached view of target health. Services
//! stamp replies with their own view's version; when a reply shows the
//! client is behind, it carries the missing state transitions and the
//! client replays them with [`PoolMachine::catch_up`].

use crate::geometry::StripeLayout;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stripeio_common::{EntityId, PoolVersionId, ServiceId, TargetAddr, TargetId};
use tracing::{debug, info};

/// Health of one target as the pool machine sees it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetState {
    #[default]
    Online,
    Failed,
    Offline,
    Repairing,
    Repaired,
    Rebalancing,
}

impl TargetState {
    /// Whether IO may be served from a target in this state
    #[must_use]
    pub const fn is_serviceable(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// One state transition of a target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub target: TargetId,
    pub state: TargetState,
}

/// Version of a pool machine view
///
/// Every applied event bumps both counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FvVersion {
    pub read: u64,
    pub write: u64,
}

/// Catch-up payload attached to a reply from a service with a newer view
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FvUpdate {
    /// The service's version
    pub version: FvVersion,
    /// Events the client has not applied yet, oldest first
    pub events: Vec<PoolEvent>,
}

#[derive(Debug, Default)]
struct MachineState {
    version: FvVersion,
    states: HashMap<TargetId, TargetState>,
}

/// Cached failure vector of one pool version
#[derive(Debug, Default)]
pub struct PoolMachine {
    state: RwLock<MachineState>,
}

impl PoolMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn version(&self) -> FvVersion {
        self.state.read().version
    }

    /// Apply one state transition
    pub fn apply(&self, event: PoolEvent) {
        let mut st = self.state.write();
        st.states.insert(event.target, event.state);
        st.version.read += 1;
        st.version.write += 1;
        debug!(
            "pool machine: {} -> {:?} (version {})",
            event.target, event.state, st.version.read
        );
    }

    /// Replay events until this view matches `update.version`
    ///
    /// Returns the number of events applied. Events beyond the point where
    /// the versions agree are ignored.
    pub fn catch_up(&self, update: &FvUpdate) -> usize {
        let mut applied = 0;
        for event in &update.events {
            if self.version().read == update.version.read {
                break;
            }
            self.apply(*event);
            applied += 1;
        }
        if applied > 0 {
            info!(
                "pool machine caught up by {} events to version {}",
                applied,
                self.version().read
            );
        }
        applied
    }

    #[must_use]
    pub fn target_state(&self, target: TargetId) -> TargetState {
        self.state.read().states.get(&target).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn is_failed(&self, target: TargetId) -> bool {
        !self.target_state(target).is_serviceable()
    }

    /// Targets currently not serviceable
    #[must_use]
    pub fn failed_targets(&self) -> Vec<TargetId> {
        let st = self.state.read();
        let mut v: Vec<_> = st
            .states
            .iter()
            .filter(|(_, s)| !s.is_serviceable())
            .map(|(t, _)| *t)
            .collect();
        v.sort_unstable();
        v
    }
}

/// The set of targets objects are striped over
#[derive(Debug)]
pub struct PoolVersion {
    id: PoolVersionId,
    targets: Vec<TargetAddr>,
    tolerance: u32,
    machine: PoolMachine,
}

impl PoolVersion {
    #[must_use]
    pub fn new(id: PoolVersionId, targets: Vec<TargetAddr>, tolerance: u32) -> Self {
        Self {
            id,
            targets,
            tolerance,
            machine: PoolMachine::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> PoolVersionId {
        self.id
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.targets.len()
    }

    /// Simultaneous target failures the pool is provisioned to survive
    #[must_use]
    pub const fn tolerance(&self) -> u32 {
        self.tolerance
    }

    #[must_use]
    pub const fn machine(&self) -> &PoolMachine {
        &self.machine
    }

    #[must_use]
    pub fn targets(&self) -> &[TargetAddr] {
        &self.targets
    }

    #[must_use]
    pub fn target(&self, id: TargetId) -> Option<TargetAddr> {
        self.targets.iter().find(|t| t.target == id).copied()
    }

    /// Distinct services owning targets of this pool, in ascending order
    #[must_use]
    pub fn services(&self) -> Vec<ServiceId> {
        let mut v: Vec<_> = self.targets.iter().map(|t| t.service).collect();
        v.sort_unstable();
        v.dedup();
        v
    }

    /// Targets of the N+K units of one parity group
    ///
    /// Rendezvous hashing: every target gets a score seeded by the object
    /// and group, and the highest N+K scores win, in score order.
    #[must_use]
    pub fn group_targets(&self, layout: &StripeLayout, object: EntityId, group: u64) -> Vec<TargetAddr> {
        let seed = xxhash_rust::xxh64::xxh64(object.as_bytes(), group);
        let mut scored: Vec<(u64, TargetAddr)> = self
            .targets
            .iter()
            .map(|t| {
                let score = xxhash_rust::xxh64::xxh64(&t.target.get().to_le_bytes(), seed);
                (score, *t)
            })
            .collect();
        scored.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.target.cmp(&b.1.target)));
        scored
            .into_iter()
            .take(layout.width() as usize)
            .map(|(_, t)| t)
            .collect()
    }

    /// Target of a single unit
    #[must_use]
    pub fn unit_target(
        &self,
        layout: &StripeLayout,
        object: EntityId,
        group: u64,
        unit: u32,
    ) -> Option<TargetAddr> {
        self.group_targets(layout, object, group)
            .get(unit as usize)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use stripeio_common::LayoutId;

    fn pool(width: u32) -> PoolVersion {
        let targets = (0..width)
            .map(|i| TargetAddr {
                target: TargetId::new(i),
                service: ServiceId::new(1 + i / 2),
            })
            .collect();
        PoolVersion::new(PoolVersionId::new(1), targets, 2)
    }

    #[test]
    fn test_group_targets_distinct_and_deterministic() {
        let p = pool(10);
        let l = StripeLayout::new(LayoutId::new(1), 4096, 4, 2);
        let obj = EntityId::new();
        for g in 0..32 {
            let a = p.group_targets(&l, obj, g);
            assert_eq!(a.len(), 6);
            let unique: HashSet<_> = a.iter().map(|t| t.target).collect();
            assert_eq!(unique.len(), 6);
            assert_eq!(a, p.group_targets(&l, obj, g));
        }
    }

    #[test]
    fn test_groups_spread_over_pool() {
        let p = pool(12);
        let l = StripeLayout::new(LayoutId::new(1), 4096, 2, 1);
        let obj = EntityId::new();
        let used: HashSet<_> = (0..256)
            .flat_map(|g| p.group_targets(&l, obj, g))
            .map(|t| t.target)
            .collect();
        assert_eq!(used.len(), 12);
    }

    #[test]
    fn test_services_deduplicated() {
        assert_eq!(
            pool(6).services(),
            vec![ServiceId::new(1), ServiceId::new(2), ServiceId::new(3)]
        );
    }

    #[test]
    fn test_machine_apply_and_catch_up() {
        let m = PoolMachine::new();
        assert!(!m.is_failed(TargetId::new(3)));

        let events = vec![
            PoolEvent {
                target: TargetId::new(3),
                state: TargetState::Failed,
            },
            PoolEvent {
                target: TargetId::new(5),
                state: TargetState::Offline,
            },
            PoolEvent {
                target: TargetId::new(3),
                state: TargetState::Online,
            },
        ];
        let update = FvUpdate {
            version: FvVersion { read: 2, write: 2 },
            events,
        };
        assert_eq!(m.catch_up(&update), 2);
        assert_eq!(m.version(), FvVersion { read: 2, write: 2 });
        assert!(m.is_failed(TargetId::new(3)));
        assert_eq!(m.failed_targets(), vec![TargetId::new(3), TargetId::new(5)]);

        // already current
        assert_eq!(m.catch_up(&update), 0);
    }
}
