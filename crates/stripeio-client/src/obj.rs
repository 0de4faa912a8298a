//! Objects
//!
//! Namespace operations (create, delete, open) talk to the services with
//! component-object requests; IO operations go through [`crate::io`].

use crate::client::Client;
use crate::entity::{Entity, EntityState, Transition};
use crate::io::{IoCtx, IoOp, IoOpcode, IoRequest};
use crate::op::{Op, OpCode, OpFamily, OpKind, Progress};
use crate::sync::{PendingTx, record_update};
use crate::transport::{CobOp, CobReply, CobRequest, Transport};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use stripeio_common::config::MIN_BLOCK_SHIFT;
use stripeio_common::{BufVec, EntityId, Error, IndexVec, LayoutId, Result, ServiceId};
use stripeio_layout::{LayoutInstance, LayoutResolver};
use tracing::{debug, warn};

/// Per-object attributes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjAttr {
    pub block_shift: u32,
    pub layout: LayoutId,
}

/// Handle on an object
#[derive(Clone)]
pub struct Obj {
    client: Client,
    entity: Arc<Entity>,
    attr: Arc<RwLock<ObjAttr>>,
    pending: Arc<PendingTx>,
}

impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obj")
            .field("entity", &self.entity)
            .field("attr", &self.attr())
            .finish_non_exhaustive()
    }
}

impl Obj {
    pub(crate) fn new(client: Client, entity: Entity) -> Self {
        let attr = ObjAttr {
            block_shift: client.config().client.block_shift,
            layout: LayoutId::new(client.config().client.default_layout),
        };
        Self {
            client,
            entity: Arc::new(entity),
            attr: Arc::new(RwLock::new(attr)),
            pending: Arc::new(PendingTx::new()),
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

    #[must_use]
    pub fn attr(&self) -> ObjAttr {
        *self.attr.read()
    }

    /// Whether updates of this object are waiting for an fsync
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.has_pending()
    }

    /// Use a different block size for later IO operations
    pub fn set_block_shift(&self, shift: u32) -> Result<()> {
        if shift < MIN_BLOCK_SHIFT {
            return Err(Error::invalid_argument(format!(
                "block shift {shift} below {MIN_BLOCK_SHIFT}"
            )));
        }
        self.attr.write().block_shift = shift;
        Ok(())
    }

    /// Create the object on every target of the current pool version
    pub fn create(&self, slot: Option<Op>) -> Result<Op> {
        self.namei(OpCode::Create, CobOp::Create, Transition::CREATE, slot)
    }

    /// Delete the object from every target of the current pool version
    pub fn delete(&self, slot: Option<Op>) -> Result<Op> {
        self.namei(OpCode::Delete, CobOp::Delete, Transition::DELETE, slot)
    }

    /// Look the object up and adopt the layout it was created with
    pub fn open(&self, slot: Option<Op>) -> Result<Op> {
        self.namei(OpCode::Open, CobOp::Lookup, Transition::OPEN, slot)
    }

    /// Forget the open state; nothing is sent
    pub fn close(&self) -> Result<()> {
        self.entity.begin(Transition::CLOSE)?;
        self.entity.settle(Transition::CLOSE, true);
        Ok(())
    }

    fn namei(&self, code: OpCode, cob: CobOp, transition: Transition, slot: Option<Op>) -> Result<Op> {
        let op = Op::claim(slot, OpFamily::Namei)?;
        if !self.entity.id().is_app_range() {
            return Err(Error::invalid_argument(format!(
                "{} is in the reserved id range",
                self.entity.id()
            )));
        }
        self.entity.check(transition)?;
        let collab = self.client.collaborators()?;
        if cob == CobOp::Create {
            self.attr.write().layout = collab.layouts.default_layout_id();
        }
        let requests = self.cob_requests(cob, collab.layouts.as_ref())?;
        let op_ledger = Arc::new(PendingTx::new());
        let kind = NameiOp {
            client: self.client.clone(),
            transport: collab.transport,
            entity: Arc::clone(&self.entity),
            attr: Arc::clone(&self.attr),
            transition,
            requests,
            entity_ledger: Arc::clone(&self.pending),
            op_ledger: Arc::clone(&op_ledger),
        };
        op.init(
            code,
            self.entity.id(),
            OpKind::Namei(Box::new(kind)),
            op_ledger,
            Some(Arc::clone(&self.pending)),
            &self.client,
        )?;
        Ok(op)
    }

    fn cob_requests(&self, cob: CobOp, layouts: &dyn LayoutResolver) -> Result<Vec<CobRequest>> {
        let attr = self.attr();
        let object = self.entity.id();
        let pool = layouts.pool_version()?;
        let request = |service: ServiceId, target| CobRequest {
            op: cob,
            object,
            layout: attr.layout,
            service,
            target,
        };
        if cob == CobOp::Lookup {
            let layout = layouts.layout(attr.layout)?;
            let addr = pool
                .unit_target(&layout, object, 0, 0)
                .ok_or_else(|| Error::invalid_state(format!("{} has no targets", pool.id())))?;
            return Ok(vec![request(addr.service, Some(addr.target))]);
        }

        let meta = layouts
            .metadata_service()
            .ok_or_else(|| Error::invalid_state("no metadata service"))?;
        let mut requests = vec![request(meta, None)];
        requests.extend(
            pool.targets()
                .iter()
                .map(|t| request(t.service, Some(t.target))),
        );
        Ok(requests)
    }

    /// Build an IO operation on this object
    ///
    /// `data` holds the bytes to write, or the buffers a read fills; its
    /// total must equal the extents'. ALLOC and FREE take no data.
    /// Attributes are not supported: `attr` must be empty and `mask` zero.
    pub fn io_op(
        &self,
        opcode: IoOpcode,
        ext: IndexVec,
        data: BufVec,
        attr: BufVec,
        mask: u64,
        slot: Option<Op>,
    ) -> Result<Op> {
        let op = Op::claim(slot, OpFamily::Io)?;
        let collab = self.client.collaborators()?;
        let obj_attr = self.attr();
        let layout = collab.layouts.layout(obj_attr.layout)?;
        let instance = LayoutInstance::new(layout, collab.layouts.pool_version()?, self.entity.id())?;
        let op_ledger = Arc::new(PendingTx::new());
        let ctx = IoCtx {
            client: self.client.clone(),
            transport: collab.transport,
            entity_ledger: Arc::clone(&self.pending),
            op_ledger: Arc::clone(&op_ledger),
        };
        let req = IoRequest {
            opcode,
            ext,
            data,
            attr,
            mask,
            block_shift: obj_attr.block_shift,
        };
        let io = IoOp::new(req, instance, ctx)?;
        op.init(
            opcode.code(),
            self.entity.id(),
            OpKind::Io(Box::new(io)),
            op_ledger,
            Some(Arc::clone(&self.pending)),
            &self.client,
        )?;
        Ok(op)
    }

    /// Make every pending update of this object durable
    pub async fn sync(&self) -> Result<()> {
        self.client.sync_ledger(&self.pending, None).await
    }
}

/// Kind-specific state of a create, delete or open
pub(crate) struct NameiOp {
    client: Client,
    transport: Arc<dyn Transport>,
    entity: Arc<Entity>,
    attr: Arc<RwLock<ObjAttr>>,
    transition: Transition,
    requests: Vec<CobRequest>,
    entity_ledger: Arc<PendingTx>,
    op_ledger: Arc<PendingTx>,
}

type CobResult = (CobRequest, Result<CobReply>);

impl NameiOp {
    pub(crate) fn launch(&mut self, op: &Op) -> Progress {
        if let Err(e) = self.entity.begin(self.transition) {
            return Progress::Failed(e);
        }
        let mut posted = Vec::with_capacity(self.requests.len());
        for req in &self.requests {
            match self.transport.post_cob(*req) {
                Ok(ticket) => posted.push((*req, ticket)),
                Err(e) => {
                    warn!("cob {:?} to {} failed: {}", req.op, req.service, e);
                    self.entity.settle(self.transition, false);
                    return Progress::Failed(e);
                }
            }
        }

        let timeout = self.client.config().rpc.timeout();
        let op = op.clone();
        tokio::spawn(async move {
            let results: Vec<CobResult> = join_all(
                posted
                    .into_iter()
                    .map(|(req, ticket)| async move { (req, ticket.wait(timeout).await) }),
            )
            .await;
            let queued = op.post(move |op| {
                op.drive(|kind, _| match kind {
                    OpKind::Namei(n) => n.replied(results),
                    _ => Progress::Pending,
                });
            });
            if !queued {
                warn!("op {}: cob replies arrived after shutdown", op.id());
            }
        });
        Progress::Pending
    }

    fn replied(&mut self, results: Vec<CobResult>) -> Progress {
        let mut first: Option<Error> = None;
        for (req, result) in results {
            let reply = result.and_then(|r| Error::from_errno(r.rc).map_or(Ok(r), Err));
            match reply {
                Ok(reply) => {
                    if let Some(service) = self.client.service(req.service) {
                        record_update(&service, &[&self.entity_ledger, &self.op_ledger], reply.remid);
                    }
                    if req.op == CobOp::Lookup {
                        self.attr.write().layout = reply.layout;
                    }
                }
                Err(e) => {
                    debug!("cob {:?} on {} failed: {}", req.op, req.service, e);
                    first.get_or_insert(e);
                }
            }
        }
        match first {
            None => {
                self.entity.settle(self.transition, true);
                Progress::Executed
            }
            Some(e) => {
                self.entity.settle(self.transition, false);
                Progress::Failed(e)
            }
        }
    }
}
