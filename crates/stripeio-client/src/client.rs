//! Client context
//!
//! One [`Client`] owns everything an application instance shares: the
//! configuration, the collaborators (transport, layouts, index backend),
//! the per-service contexts and the localities operations run on.
//!
//! ```text
//!   init ──► attach ──► run ──► detach ──► fini
//!              ▲                  │
//!              └──────────────────┘
//! ```

use crate::entity::Entity;
use crate::idx::{Idx, IdxOp, IdxRequest, IndexService};
use crate::locality::Locality;
use crate::obj::Obj;
use crate::op::{Op, OpFamily, OpKind};
use crate::realm::Realm;
use crate::sync::{PendingTx, ServiceContext, SyncTarget, fsync_round};
use crate::transport::Transport;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use stripeio_common::{Config, EntityId, EntityType, Error, Result, ServiceId};
use stripeio_layout::LayoutResolver;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Lifecycle state of a client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Initialised,
    Attached,
    Running,
    Detached,
    Finalised,
}

/// External services a client is attached to
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub layouts: Arc<dyn LayoutResolver>,
    pub index: Arc<dyn IndexService>,
}

struct ClientInner {
    config: Config,
    state: Mutex<ClientState>,
    collab: RwLock<Option<Collaborators>>,
    services: DashMap<ServiceId, Arc<ServiceContext>>,
    localities: RwLock<Vec<Locality>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared handle on a client instance
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("services", &self.inner.services.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client from a validated configuration
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                state: Mutex::new(ClientState::Initialised),
                collab: RwLock::new(None),
                services: DashMap::new(),
                localities: RwLock::new(Vec::new()),
                handles: Mutex::new(Vec::new()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    fn transition(&self, from: &[ClientState], to: ClientState) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !from.contains(&state) {
            return Err(Error::invalid_state(format!(
                "client is {:?}, cannot move to {:?}",
                *state, to
            )));
        }
        *state = to;
        Ok(())
    }

    /// Connect to the cluster: remember the collaborators and set up a
    /// context for every service the layout resolver names
    pub fn attach(&self, collab: Collaborators) -> Result<()> {
        self.transition(&[ClientState::Initialised, ClientState::Detached], ClientState::Attached)?;
        self.inner.services.clear();
        for svc in collab.layouts.services() {
            self.inner
                .services
                .insert(svc.id, Arc::new(ServiceContext::new(svc.id, svc.kind)));
        }
        info!("client attached to {} services", self.inner.services.len());
        *self.inner.collab.write() = Some(collab);
        Ok(())
    }

    /// Start the localities on the current tokio runtime
    pub fn run(&self) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::invalid_state("client must run inside a tokio runtime"));
        }
        self.transition(&[ClientState::Attached], ClientState::Running)?;
        let n = self.inner.config.client.localities;
        let mut localities = Vec::with_capacity(n);
        let mut handles = self.inner.handles.lock();
        for id in 0..n {
            let (loc, handle) = Locality::spawn(id);
            localities.push(loc);
            handles.push(handle);
        }
        *self.inner.localities.write() = localities;
        info!("client running with {} localities", n);
        Ok(())
    }

    /// Stop the localities
    ///
    /// Work still queued is dropped; operations in flight never complete.
    pub fn detach(&self) -> Result<()> {
        self.transition(&[ClientState::Running, ClientState::Attached], ClientState::Detached)?;
        self.inner.localities.write().clear();
        for handle in self.inner.handles.lock().drain(..) {
            handle.abort();
        }
        *self.inner.collab.write() = None;
        info!("client detached");
        Ok(())
    }

    /// Release the client for good
    pub fn fini(self) -> Result<()> {
        self.transition(&[ClientState::Initialised, ClientState::Detached], ClientState::Finalised)?;
        self.inner.services.clear();
        debug!("client finalised");
        Ok(())
    }

    /// Locality of an entity's operations
    pub(crate) fn locality_for(&self, id: EntityId) -> Result<Locality> {
        let localities = self.inner.localities.read();
        if localities.is_empty() {
            return Err(Error::invalid_state("client is not running"));
        }
        let slot = xxhash_rust::xxh64::xxh64(id.as_bytes(), 0) % localities.len() as u64;
        Ok(localities[slot as usize].clone())
    }

    pub(crate) fn collaborators(&self) -> Result<Collaborators> {
        self.inner
            .collab
            .read()
            .clone()
            .ok_or_else(|| Error::invalid_state("client is not attached"))
    }

    /// Context of a remote service
    #[must_use]
    pub fn service(&self, id: ServiceId) -> Option<Arc<ServiceContext>> {
        self.inner.services.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Handle on an object in the root realm
    #[must_use]
    pub fn obj(&self, id: EntityId) -> Obj {
        Obj::new(self.clone(), Entity::new(id, EntityType::Object, EntityId::ROOT_REALM))
    }

    /// Handle on an index in the root realm
    #[must_use]
    pub fn idx(&self, id: EntityId) -> Idx {
        Idx::new(self.clone(), Entity::new(id, EntityType::Index, EntityId::ROOT_REALM))
    }

    #[must_use]
    pub fn realm(&self, id: EntityId) -> Realm {
        Realm::new(self.clone(), Entity::new(id, EntityType::Realm, EntityId::ROOT_REALM))
    }

    /// List up to `count` indices starting at `start`
    pub fn idx_list(&self, start: EntityId, count: usize, slot: Option<Op>) -> Result<Op> {
        let op = Op::claim(slot, OpFamily::Index)?;
        let collab = self.collaborators()?;
        let entity = Arc::new(Entity::new(EntityId::ROOT_REALM, EntityType::Realm, EntityId::ROOT_REALM));
        let kind = IdxOp::new(entity, None, IdxRequest::List { start, count }, collab.index);
        op.init(
            crate::op::OpCode::List,
            EntityId::ROOT_REALM,
            OpKind::Index(Box::new(kind)),
            Arc::new(PendingTx::new()),
            None,
            self,
        )?;
        Ok(op)
    }

    /// Make every pending transaction on IO and metadata services durable
    pub async fn sync(&self) -> Result<()> {
        let transport = self.collaborators()?.transport;
        let targets: Vec<SyncTarget> = self
            .inner
            .services
            .iter()
            .filter(|s| s.kind().is_durable() && s.max_pending().is_pending())
            .map(|s| SyncTarget {
                service: Arc::clone(s.value()),
                remid: s.max_pending(),
                ledgers: Vec::new(),
            })
            .collect();
        debug!("client sync over {} services", targets.len());
        fsync_round(transport.as_ref(), targets, self.inner.config.rpc.timeout()).await
    }

    /// Fsync round over one ledger; `extra` ledgers are cleared alongside
    pub(crate) async fn sync_ledger(
        &self,
        ledger: &Arc<PendingTx>,
        extra: Option<Arc<PendingTx>>,
    ) -> Result<()> {
        let transport = self.collaborators()?.transport;
        let extra: Vec<Arc<PendingTx>> = extra.into_iter().collect();
        let targets = SyncTarget::from_ledger(ledger, &extra, |id| self.service(id));
        fsync_round(transport.as_ref(), targets, self.inner.config.rpc.timeout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_order_enforced() {
        let client = Client::init(Config::default()).unwrap();
        assert_eq!(client.state(), ClientState::Initialised);
        assert!(client.run().is_err());
        assert!(client.detach().is_err());
        assert!(client.locality_for(EntityId::from_parts(0, 0x10_0000)).is_err());
        client.fini().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.client.localities = 0;
        assert!(Client::init(config).is_err());
    }
}
