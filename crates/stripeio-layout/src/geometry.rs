//! Parity-group geometry
//!
//! Group `g` covers object bytes `[g*N*U, (g+1)*N*U)`. Within a group, data
//! unit `u` covers `[g*N*U + u*U, g*N*U + (u+1)*U)`. On its target a unit
//! of group `g` lives at `[g*U, (g+1)*U)`, so target-local offsets grow with
//! the group number and every target holds at most one unit per group.

use crate::pool::PoolVersion;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stripeio_common::{EntityId, Error, LayoutId, Result, TargetAddr};

/// Position of one object byte inside the striping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitPos {
    pub group: u64,
    pub unit: u32,
    /// Offset inside the unit
    pub offset: u64,
}

/// Striping geometry of a layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLayout {
    pub id: LayoutId,
    pub unit_size: u64,
    pub data_units: u32,
    pub parity_units: u32,
}

impl StripeLayout {
    #[must_use]
    pub const fn new(id: LayoutId, unit_size: u64, data_units: u32, parity_units: u32) -> Self {
        Self {
            id,
            unit_size,
            data_units,
            parity_units,
        }
    }

    /// Units per group, data and parity (N+K)
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.data_units + self.parity_units
    }

    /// Application bytes per parity group (N*U)
    #[must_use]
    pub const fn group_size(&self) -> u64 {
        self.unit_size * self.data_units as u64
    }

    #[must_use]
    pub const fn group_of(&self, offset: u64) -> u64 {
        offset / self.group_size()
    }

    /// First object offset of group `g`
    #[must_use]
    pub const fn group_start(&self, group: u64) -> u64 {
        group * self.group_size()
    }

    /// Locate an object offset
    #[must_use]
    pub const fn locate(&self, offset: u64) -> UnitPos {
        let in_group = offset % self.group_size();
        UnitPos {
            group: offset / self.group_size(),
            unit: (in_group / self.unit_size) as u32,
            offset: in_group % self.unit_size,
        }
    }

    /// Object offset of a data unit position
    #[must_use]
    pub const fn object_offset(&self, pos: UnitPos) -> u64 {
        self.group_start(pos.group) + pos.unit as u64 * self.unit_size + pos.offset
    }

    /// Offset on the target holding a unit of `group`
    #[must_use]
    pub const fn target_offset(&self, group: u64, offset_in_unit: u64) -> u64 {
        group * self.unit_size + offset_in_unit
    }

    /// Group a target-local offset belongs to
    #[must_use]
    pub const fn group_of_target_offset(&self, target_offset: u64) -> u64 {
        target_offset / self.unit_size
    }

    #[must_use]
    pub const fn is_parity(&self, unit: u32) -> bool {
        unit >= self.data_units
    }
}

/// A layout applied to one object in one pool version
///
/// This is what the IO path asks "which target holds unit u of group g".
#[derive(Clone, Debug)]
pub struct LayoutInstance {
    layout: StripeLayout,
    pool: Arc<PoolVersion>,
    object: EntityId,
}

impl LayoutInstance {
    pub fn new(layout: StripeLayout, pool: Arc<PoolVersion>, object: EntityId) -> Result<Self> {
        if pool.width() < layout.width() as usize {
            return Err(Error::invalid_argument(format!(
                "{} has {} targets, {} needs {}",
                pool.id(),
                pool.width(),
                layout.id,
                layout.width()
            )));
        }
        Ok(Self {
            layout,
            pool,
            object,
        })
    }

    #[must_use]
    pub const fn layout(&self) -> &StripeLayout {
        &self.layout
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PoolVersion> {
        &self.pool
    }

    #[must_use]
    pub const fn object(&self) -> EntityId {
        self.object
    }

    /// Targets of every unit of `group`, indexed by unit
    #[must_use]
    pub fn group_targets(&self, group: u64) -> Vec<TargetAddr> {
        self.pool.group_targets(&self.layout, self.object, group)
    }

    /// Failures one parity group can absorb
    ///
    /// Bounded both by the parity count and by the pool's provisioned
    /// tolerance.
    #[must_use]
    pub fn tolerance(&self) -> usize {
        (self.layout.parity_units as usize).min(self.pool.tolerance() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StripeLayout {
        StripeLayout::new(LayoutId::new(1), 4096, 4, 2)
    }

    #[test]
    fn test_group_math() {
        let l = layout();
        assert_eq!(l.group_size(), 16384);
        assert_eq!(l.width(), 6);
        assert_eq!(l.group_of(16383), 0);
        assert_eq!(l.group_of(16384), 1);
        assert_eq!(
            l.locate(16384 + 2 * 4096 + 100),
            UnitPos {
                group: 1,
                unit: 2,
                offset: 100
            }
        );
    }

    #[test]
    fn test_locate_round_trips_through_object_offset() {
        let l = layout();
        for off in [0, 4095, 4096, 16384 * 7 + 12288 + 4000] {
            assert_eq!(l.object_offset(l.locate(off)), off);
        }
    }

    #[test]
    fn test_target_offsets_are_group_ordered() {
        let l = layout();
        assert_eq!(l.target_offset(0, 10), 10);
        assert_eq!(l.target_offset(3, 10), 3 * 4096 + 10);
        assert_eq!(l.group_of_target_offset(3 * 4096 + 10), 3);
        assert!(l.is_parity(4));
        assert!(!l.is_parity(3));
    }
}
