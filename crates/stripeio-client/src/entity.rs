//! Entity state machine shared by objects, indices and realms
//!
//! ```text
//!   Init ──create──► Creating ──► Open
//!   Init ──open────► Opening ───► Open
//!   Open ──delete──► Deleting ──► Init
//!   Open ──close───► Closing ───► Init
//! ```
//!
//! The transient state is entered when the operation is launched. A failed
//! operation puts the entity back where it was.

use parking_lot::Mutex;
use std::fmt;
use stripeio_common::{EntityId, EntityType, Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EntityState {
    #[default]
    Init,
    Creating,
    Deleting,
    Opening,
    Open,
    Closing,
}

/// A state change an entity operation performs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: EntityState,
    pub via: EntityState,
    pub to: EntityState,
}

impl Transition {
    pub(crate) const CREATE: Self = Self::new(EntityState::Init, EntityState::Creating, EntityState::Open);
    pub(crate) const OPEN: Self = Self::new(EntityState::Init, EntityState::Opening, EntityState::Open);
    pub(crate) const DELETE: Self = Self::new(EntityState::Open, EntityState::Deleting, EntityState::Init);
    pub(crate) const CLOSE: Self = Self::new(EntityState::Open, EntityState::Closing, EntityState::Init);

    const fn new(from: EntityState, via: EntityState, to: EntityState) -> Self {
        Self { from, via, to }
    }
}

pub struct Entity {
    id: EntityId,
    kind: EntityType,
    realm: EntityId,
    state: Mutex<EntityState>,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Entity {
    #[must_use]
    pub const fn new(id: EntityId, kind: EntityType, realm: EntityId) -> Self {
        Self {
            id,
            kind,
            realm,
            state: Mutex::new(EntityState::Init),
        }
    }

    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> EntityType {
        self.kind
    }

    /// Realm the entity lives in
    #[must_use]
    pub const fn realm(&self) -> EntityId {
        self.realm
    }

    #[must_use]
    pub fn state(&self) -> EntityState {
        *self.state.lock()
    }

    /// Fail unless the entity is in `t.from`
    pub(crate) fn check(&self, t: Transition) -> Result<()> {
        let state = self.state();
        if state == t.from {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "{} is {:?}, expected {:?}",
                self.id, state, t.from
            )))
        }
    }

    /// Move from `t.from` into the transient state
    pub(crate) fn begin(&self, t: Transition) -> Result<()> {
        let mut state = self.state.lock();
        if *state != t.from {
            return Err(Error::invalid_state(format!(
                "{} is {:?}, expected {:?}",
                self.id, *state, t.from
            )));
        }
        *state = t.via;
        Ok(())
    }

    /// Leave the transient state: to `t.to` on success, back to `t.from`
    /// otherwise
    pub(crate) fn settle(&self, t: Transition, ok: bool) {
        let mut state = self.state.lock();
        debug_assert_eq!(*state, t.via);
        *state = if ok { t.to } else { t.from };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj() -> Entity {
        Entity::new(EntityId::from_parts(0, 0x10_0001), EntityType::Object, EntityId::ROOT_REALM)
    }

    #[test]
    fn test_create_then_delete() {
        let e = obj();
        e.begin(Transition::CREATE).unwrap();
        assert_eq!(e.state(), EntityState::Creating);
        e.settle(Transition::CREATE, true);
        assert_eq!(e.state(), EntityState::Open);
        e.begin(Transition::DELETE).unwrap();
        e.settle(Transition::DELETE, true);
        assert_eq!(e.state(), EntityState::Init);
    }

    #[test]
    fn test_failure_reverts() {
        let e = obj();
        e.begin(Transition::OPEN).unwrap();
        e.settle(Transition::OPEN, false);
        assert_eq!(e.state(), EntityState::Init);
    }

    #[test]
    fn test_wrong_state_rejected() {
        let e = obj();
        assert!(e.check(Transition::CLOSE).is_err());
        e.begin(Transition::CREATE).unwrap();
        let err = e.begin(Transition::CREATE).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
