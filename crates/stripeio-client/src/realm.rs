//! Realms
//!
//! A realm scopes the entities created in it. Realm operations only move
//! the realm's own state machine; nothing is sent to the services.

use crate::client::Client;
use crate::entity::{Entity, EntityState, Transition};
use crate::op::{Op, OpCode, OpFamily, OpKind, Progress};
use crate::sync::PendingTx;
use std::sync::Arc;
use stripeio_common::{EntityId, Result};
use tracing::debug;

/// Handle on a realm
#[derive(Clone, Debug)]
pub struct Realm {
    client: Client,
    entity: Arc<Entity>,
}

impl Realm {
    pub(crate) fn new(client: Client, entity: Entity) -> Self {
        Self {
            client,
            entity: Arc::new(entity),
        }
    }

    #[must_use]
    pub fn id(&self) -> EntityId {
        self.entity.id()
    }

    #[must_use]
    pub fn state(&self) -> EntityState {
        self.entity.state()
    }

    pub fn create(&self, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Create, Transition::CREATE, slot)
    }

    pub fn open(&self, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Open, Transition::OPEN, slot)
    }

    pub fn close(&self, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Close, Transition::CLOSE, slot)
    }

    fn op(&self, code: OpCode, transition: Transition, slot: Option<Op>) -> Result<Op> {
        let op = Op::claim(slot, OpFamily::Realm)?;
        self.entity.check(transition)?;
        let kind = RealmOp {
            entity: Arc::clone(&self.entity),
            transition,
        };
        op.init(
            code,
            self.entity.id(),
            OpKind::Realm(kind),
            Arc::new(PendingTx::new()),
            None,
            &self.client,
        )?;
        Ok(op)
    }
}

/// Kind-specific state of a realm operation
pub(crate) struct RealmOp {
    entity: Arc<Entity>,
    transition: Transition,
}

impl RealmOp {
    pub(crate) fn launch(&self) -> Progress {
        if let Err(e) = self.entity.begin(self.transition) {
            return Progress::Failed(e);
        }
        self.entity.settle(self.transition, true);
        debug!("realm {} is {:?}", self.entity.id(), self.entity.state());
        Progress::Executed
    }
}
