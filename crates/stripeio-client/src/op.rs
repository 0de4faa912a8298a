//! Generic operation state machine
//!
//! ```text
//!   Uninitialised ──init──► Initialised ──launch──► Launched ──► Executed ──► Stable
//!                               │                      │            │
//!                               └──────────────────────┴────────────┴──► Failed
//! ```
//!
//! An [`Op`] is a shared handle. The application holds one, the locality
//! queue holds others while work is pending, and the transport holds one
//! per in-flight fop through its event sink. All transitions after launch
//! happen on the operation's locality; the application only observes them
//! through [`Op::wait`] or the callbacks.

use crate::client::Client;
use crate::idx::{IdxOp, IdxReply};
use crate::io::{IoOp, IoReqState, IoTrace};
use crate::locality::Locality;
use crate::obj::NameiOp;
use crate::realm::RealmOp;
use crate::sync::PendingTx;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use stripeio_common::{BufVec, EntityId, Error, Result};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// State of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpState {
    /// Storage exists but no operation is set up in it
    Uninitialised,
    Initialised,
    Launched,
    /// The result is known and visible
    Executed,
    /// The result is durable
    Stable,
    Failed,
}

impl OpState {
    const fn bit(self) -> u8 {
        1 << self as u8
    }

    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Stable | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_move_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialised, Self::Initialised)
                | (Self::Initialised, Self::Launched | Self::Failed)
                | (Self::Launched, Self::Executed | Self::Failed)
                | (Self::Executed, Self::Stable | Self::Failed)
        )
    }
}

/// Set of states [`Op::wait`] returns on
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateMask(u8);

impl StateMask {
    pub const LAUNCHED: Self = Self(OpState::Launched.bit());
    pub const EXECUTED: Self = Self(OpState::Executed.bit());
    pub const STABLE: Self = Self(OpState::Stable.bit());
    pub const FAILED: Self = Self(OpState::Failed.bit());
    /// Either terminal state
    pub const DONE: Self = Self(OpState::Stable.bit() | OpState::Failed.bit());

    #[must_use]
    pub const fn contains(self, state: OpState) -> bool {
        self.0 & state.bit() != 0
    }
}

impl BitOr for StateMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<OpState> for StateMask {
    fn from(s: OpState) -> Self {
        Self(s.bit())
    }
}

impl fmt::Debug for StateMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states = [
            OpState::Uninitialised,
            OpState::Initialised,
            OpState::Launched,
            OpState::Executed,
            OpState::Stable,
            OpState::Failed,
        ];
        f.debug_set()
            .entries(states.iter().filter(|s| self.contains(**s)))
            .finish()
    }
}

/// What an operation does
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    Create,
    Delete,
    Open,
    Close,
    Read,
    Write,
    Alloc,
    Free,
    Put,
    Get,
    Del,
    Next,
    Lookup,
    List,
}

/// Size class of an operation, used for capacity checks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpFamily {
    Io,
    Namei,
    Index,
    Realm,
}

impl OpFamily {
    /// Bytes an operation of this family needs
    pub(crate) const fn required_size(self) -> usize {
        std::mem::size_of::<OpCore>()
            + match self {
                Self::Io => std::mem::size_of::<IoOp>(),
                Self::Namei => std::mem::size_of::<NameiOp>(),
                Self::Index => std::mem::size_of::<IdxOp>(),
                Self::Realm => std::mem::size_of::<RealmOp>(),
            }
    }
}

pub type OpCallback = Box<dyn FnOnce(&Op) + Send + 'static>;

/// Completion callbacks; each runs at most once, on the locality
#[derive(Default)]
pub struct OpCallbacks {
    pub executed: Option<OpCallback>,
    pub stable: Option<OpCallback>,
    pub failed: Option<OpCallback>,
}

impl OpCallbacks {
    #[must_use]
    pub fn on_executed(mut self, f: impl FnOnce(&Op) + Send + 'static) -> Self {
        self.executed = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_stable(mut self, f: impl FnOnce(&Op) + Send + 'static) -> Self {
        self.stable = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_failed(mut self, f: impl FnOnce(&Op) + Send + 'static) -> Self {
        self.failed = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for OpCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpCallbacks")
            .field("executed", &self.executed.is_some())
            .field("stable", &self.stable.is_some())
            .field("failed", &self.failed.is_some())
            .finish()
    }
}

/// Kind-specific part of an operation
pub(crate) enum OpKind {
    Unused,
    Io(Box<IoOp>),
    Namei(Box<NameiOp>),
    Index(Box<IdxOp>),
    Realm(RealmOp),
}

impl OpKind {
    fn launch(&mut self, op: &Op) -> Progress {
        match self {
            Self::Io(io) => io.launch(op),
            Self::Namei(n) => n.launch(op),
            Self::Index(i) => i.launch(op),
            Self::Realm(r) => r.launch(),
            Self::Unused => Progress::Failed(Error::invalid_state("launch of an unused operation")),
        }
    }
}

/// What a handler decided
#[derive(Debug)]
pub(crate) enum Progress {
    Pending,
    Executed,
    Failed(Error),
}

struct Binding {
    locality: Locality,
    client: Client,
}

struct OpCore {
    code: Option<OpCode>,
    entity: Option<EntityId>,
    kind: OpKind,
    callbacks: OpCallbacks,
    linger: Option<Instant>,
    rc: Option<Error>,
    sync_rc: Option<Error>,
    /// Transactions this operation left behind
    pending: Arc<PendingTx>,
    /// Ledger of the entity, cleared along with ours by the op-level sync
    entity_ledger: Option<Arc<PendingTx>>,
}

impl OpCore {
    fn reset(&mut self) {
        self.code = None;
        self.entity = None;
        self.kind = OpKind::Unused;
        self.callbacks = OpCallbacks::default();
        self.linger = None;
        self.rc = None;
        self.sync_rc = None;
        self.pending = Arc::new(PendingTx::new());
        self.entity_ledger = None;
    }
}

struct OpInner {
    id: u64,
    capacity: usize,
    state_tx: watch::Sender<OpState>,
    core: Mutex<OpCore>,
    binding: RwLock<Option<Binding>>,
}

/// Handle on an operation
#[derive(Clone)]
pub struct Op {
    inner: Arc<OpInner>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl Op {
    /// Preallocate storage for an operation of up to `capacity` bytes
    ///
    /// Entry points accept the returned op and fail with
    /// [`Error::MessageSize`] when it is too small for them.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(OpState::Uninitialised);
        Self {
            inner: Arc::new(OpInner {
                id: NEXT_OP_ID.fetch_add(1, Ordering::SeqCst),
                capacity,
                state_tx,
                core: Mutex::new(OpCore {
                    code: None,
                    entity: None,
                    kind: OpKind::Unused,
                    callbacks: OpCallbacks::default(),
                    linger: None,
                    rc: None,
                    sync_rc: None,
                    pending: Arc::new(PendingTx::new()),
                    entity_ledger: None,
                }),
                binding: RwLock::new(None),
            }),
        }
    }

    /// Take a preallocated op or allocate one for `family`
    pub(crate) fn claim(slot: Option<Self>, family: OpFamily) -> Result<Self> {
        let required = family.required_size();
        match slot {
            None => Ok(Self::with_capacity(required)),
            Some(op) => {
                if op.capacity() < required {
                    return Err(Error::MessageSize {
                        required,
                        capacity: op.capacity(),
                    });
                }
                if op.state() != OpState::Uninitialised {
                    return Err(Error::invalid_state(format!(
                        "op {} is {:?}, expected Uninitialised",
                        op.id(),
                        op.state()
                    )));
                }
                Ok(op)
            }
        }
    }

    /// Bind the op to its entity and move it to Initialised
    pub(crate) fn init(
        &self,
        code: OpCode,
        entity: EntityId,
        kind: OpKind,
        pending: Arc<PendingTx>,
        entity_ledger: Option<Arc<PendingTx>>,
        client: &Client,
    ) -> Result<()> {
        let locality = client.locality_for(entity)?;
        let mut core = self.inner.core.lock();
        core.code = Some(code);
        core.entity = Some(entity);
        core.kind = kind;
        core.pending = pending;
        core.entity_ledger = entity_ledger;
        *self.inner.binding.write() = Some(Binding {
            locality,
            client: client.clone(),
        });
        self.move_to(OpState::Initialised);
        debug!("op {} initialised: {:?} on {}", self.id(), code, entity);
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    #[must_use]
    pub fn state(&self) -> OpState {
        *self.inner.state_tx.borrow()
    }

    #[must_use]
    pub fn code(&self) -> Option<OpCode> {
        self.inner.core.lock().code
    }

    #[must_use]
    pub fn entity(&self) -> Option<EntityId> {
        self.inner.core.lock().entity
    }

    #[must_use]
    pub fn linger(&self) -> Option<Instant> {
        self.inner.core.lock().linger
    }

    /// The operation's result: zero or the first error as a negative errno
    #[must_use]
    pub fn rc(&self) -> i32 {
        self.inner.core.lock().rc.as_ref().map_or(0, Error::errno)
    }

    /// The operation's result as a `Result`
    pub fn result(&self) -> Result<()> {
        self.inner.core.lock().rc.clone().map_or(Ok(()), Err)
    }

    /// Result of the durability round that made the op stable
    ///
    /// Sync failures never fail the operation itself; they land here.
    #[must_use]
    pub fn sync_rc(&self) -> i32 {
        self.inner.core.lock().sync_rc.as_ref().map_or(0, Error::errno)
    }

    /// Buffers of an executed read
    #[must_use]
    pub fn data(&self) -> Option<BufVec> {
        match &self.inner.core.lock().kind {
            OpKind::Io(io) => io.data(),
            _ => None,
        }
    }

    /// Where an IO operation's request machine is
    #[must_use]
    pub fn io_state(&self) -> Option<IoReqState> {
        match &self.inner.core.lock().kind {
            OpKind::Io(io) => Some(io.state()),
            _ => None,
        }
    }

    /// How an IO operation was mapped and distributed
    #[must_use]
    pub fn io_trace(&self) -> Option<IoTrace> {
        match &self.inner.core.lock().kind {
            OpKind::Io(io) => Some(io.trace().clone()),
            _ => None,
        }
    }

    /// Records and per-item results of an executed index operation
    #[must_use]
    pub fn idx_reply(&self) -> Option<IdxReply> {
        match &self.inner.core.lock().kind {
            OpKind::Index(i) => i.reply().cloned(),
            _ => None,
        }
    }

    /// Attach callbacks and a linger deadline
    pub fn setup(&self, callbacks: OpCallbacks, linger: Option<Instant>) -> Result<()> {
        let mut core = self.inner.core.lock();
        let state = self.state();
        if state != OpState::Initialised {
            return Err(Error::invalid_state(format!(
                "setup of op {} in state {:?}",
                self.id(),
                state
            )));
        }
        core.callbacks = callbacks;
        core.linger = linger;
        Ok(())
    }

    /// Launch a batch of initialised operations
    ///
    /// Returns as soon as the work is queued on each op's locality.
    pub fn launch(ops: &[Self]) -> Result<()> {
        for op in ops {
            let state = op.state();
            if state != OpState::Initialised {
                return Err(Error::invalid_state(format!(
                    "launch of op {} in state {:?}",
                    op.id(),
                    state
                )));
            }
        }
        for op in ops {
            {
                let _core = op.inner.core.lock();
                op.move_to(OpState::Launched);
            }
            let queued = op.post(|op| op.drive(|kind, op| kind.launch(op)));
            if !queued {
                op.mark_failed(Error::invalid_state("client is not running"));
            }
        }
        Ok(())
    }

    /// Wait until the op reaches a state in `mask`
    ///
    /// Gives up with [`Error::TimedOut`] at `deadline`, leaving the op
    /// running; a later wait can still observe its completion.
    pub async fn wait(&self, mask: StateMask, deadline: Option<Instant>) -> Result<OpState> {
        let mut rx = self.inner.state_tx.subscribe();
        let reached = async move {
            rx.wait_for(|s| mask.contains(*s))
                .await
                .map(|s| *s)
                .map_err(|_| Error::invalid_state("operation dropped"))
        };
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, reached)
                .await
                .map_err(|_| Error::TimedOut)?,
            None => reached.await,
        }
    }

    /// Hint that the application is waiting on this op
    ///
    /// Requests are posted eagerly, so there is nothing to hurry along.
    pub fn kick(&self) {
        debug!("op {} kicked in state {:?}", self.id(), self.state());
    }

    /// Return a finished or never-launched op to Uninitialised
    ///
    /// Capacity is kept so the op can be set up again.
    pub fn fini(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        let state = self.state();
        if !matches!(
            state,
            OpState::Uninitialised | OpState::Initialised | OpState::Stable | OpState::Failed
        ) {
            return Err(Error::invalid_state(format!(
                "fini of op {} in state {:?}",
                self.id(),
                state
            )));
        }
        core.reset();
        *self.inner.binding.write() = None;
        self.inner.state_tx.send_replace(OpState::Uninitialised);
        Ok(())
    }

    /// Release the application's handle
    ///
    /// Work still queued for the op keeps it alive until that work drains.
    pub fn free(self) {
        let state = self.state();
        if !matches!(state, OpState::Uninitialised | OpState::Stable | OpState::Failed) {
            warn!("op {} freed in state {:?}", self.id(), state);
        }
    }

    /// Queue `f` on the op's locality
    pub(crate) fn post(&self, f: impl FnOnce(&Self) + Send + 'static) -> bool {
        let binding = self.inner.binding.read();
        let Some(binding) = binding.as_ref() else {
            warn!("op {} is not bound to a locality", self.id());
            return false;
        };
        let op = self.clone();
        binding.locality.post(move || f(&op))
    }

    /// Run a handler on the kind-specific state and apply its decision
    ///
    /// Must be called on the op's locality.
    pub(crate) fn drive(&self, f: impl FnOnce(&mut OpKind, &Self) -> Progress) {
        let progress = {
            let mut core = self.inner.core.lock();
            if self.state().is_done() {
                return;
            }
            f(&mut core.kind, self)
        };
        match progress {
            Progress::Pending => {}
            Progress::Executed => self.mark_executed(),
            Progress::Failed(e) => self.mark_failed(e),
        }
    }

    fn client(&self) -> Option<Client> {
        self.inner.binding.read().as_ref().map(|b| b.client.clone())
    }

    /// Publish a new state; the caller holds the core lock
    fn move_to(&self, next: OpState) -> bool {
        let current = self.state();
        if !current.can_move_to(next) {
            warn!("op {}: illegal transition {:?} -> {:?}", self.id(), current, next);
            return false;
        }
        self.inner.state_tx.send_replace(next);
        true
    }

    fn mark_executed(&self) {
        let (callback, ledgers) = {
            let mut core = self.inner.core.lock();
            if !self.move_to(OpState::Executed) {
                return;
            }
            let ledgers = core
                .pending
                .has_pending()
                .then(|| (Arc::clone(&core.pending), core.entity_ledger.clone()));
            (core.callbacks.executed.take(), ledgers)
        };
        debug!("op {} executed", self.id());
        if let Some(cb) = callback {
            cb(self);
        }

        let client = self.client();
        match (ledgers, client) {
            (Some((ledger, entity_ledger)), Some(client)) if client.config().client.sync_on_execute => {
                let op = self.clone();
                tokio::spawn(async move {
                    let rc = client.sync_ledger(&ledger, entity_ledger).await;
                    if !op.post(move |op| op.mark_stable(rc.err())) {
                        warn!("op {} lost its locality before becoming stable", op.id());
                    }
                });
            }
            _ => self.mark_stable(None),
        }
    }

    fn mark_stable(&self, sync_rc: Option<Error>) {
        let callback = {
            let mut core = self.inner.core.lock();
            if let Some(e) = &sync_rc {
                warn!("op {}: durability sync failed: {}", self.id(), e);
            }
            core.sync_rc = sync_rc;
            if !self.move_to(OpState::Stable) {
                return;
            }
            core.callbacks.stable.take()
        };
        debug!("op {} stable", self.id());
        if let Some(cb) = callback {
            cb(self);
        }
    }

    pub(crate) fn mark_failed(&self, err: Error) {
        let callback = {
            let mut core = self.inner.core.lock();
            if self.state().is_done() {
                return;
            }
            warn!("op {} failed: {}", self.id(), err);
            core.rc.get_or_insert(err);
            if !self.move_to(OpState::Failed) {
                return;
            }
            core.callbacks.failed.take()
        };
        if let Some(cb) = callback {
            cb(self);
        }
    }
}
