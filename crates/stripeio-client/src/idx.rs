//! Key-value indices
//!
//! Index operations are forwarded to an [`IndexService`] backend from a
//! spawned task; the outcome is posted back to the operation's locality.
//! Record operations report one result per record in [`IdxReply::rcs`],
//! separate from the operation's own result.

use crate::client::Client;
use crate::entity::{Entity, EntityState, Transition};
use crate::op::{Op, OpCode, OpFamily, OpKind, Progress};
use crate::sync::PendingTx;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use stripeio_common::{EntityId, Error, Result};
use tracing::{debug, warn};

/// Backend serving ordered key-value indices
#[async_trait]
pub trait IndexService: Send + Sync {
    async fn create(&self, idx: EntityId) -> Result<()>;

    async fn delete(&self, idx: EntityId) -> Result<()>;

    /// Succeeds iff the index exists
    async fn lookup(&self, idx: EntityId) -> Result<()>;

    /// Up to `count` existing indices with ids `>= start`, ascending
    async fn list(&self, start: EntityId, count: usize) -> Result<Vec<EntityId>>;

    /// Insert or overwrite records; one rc per record
    async fn put(&self, idx: EntityId, records: Vec<(Bytes, Bytes)>) -> Result<Vec<i32>>;

    /// One `(rc, value)` per key; a missing key gives `-ENOENT`
    async fn get(&self, idx: EntityId, keys: Vec<Bytes>) -> Result<Vec<(i32, Option<Bytes>)>>;

    /// One rc per key; a missing key gives `-ENOENT`
    async fn del(&self, idx: EntityId, keys: Vec<Bytes>) -> Result<Vec<i32>>;

    /// Up to `count` records with keys `>= start` (from the first key when
    /// `start` is `None`), ascending
    async fn next(&self, idx: EntityId, start: Option<Bytes>, count: usize) -> Result<Vec<(Bytes, Bytes)>>;
}

/// In-process index backend
#[derive(Debug, Default)]
pub struct MemIndexService {
    indices: RwLock<BTreeMap<EntityId, BTreeMap<Bytes, Bytes>>>,
}

impl MemIndexService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(idx: EntityId) -> Error {
        Error::not_found(format!("index {idx}"))
    }
}

#[async_trait]
impl IndexService for MemIndexService {
    async fn create(&self, idx: EntityId) -> Result<()> {
        let mut indices = self.indices.write();
        if indices.contains_key(&idx) {
            return Err(Error::AlreadyExists(format!("index {idx}")));
        }
        indices.insert(idx, BTreeMap::new());
        Ok(())
    }

    async fn delete(&self, idx: EntityId) -> Result<()> {
        self.indices
            .write()
            .remove(&idx)
            .map(|_| ())
            .ok_or_else(|| Self::missing(idx))
    }

    async fn lookup(&self, idx: EntityId) -> Result<()> {
        if self.indices.read().contains_key(&idx) {
            Ok(())
        } else {
            Err(Self::missing(idx))
        }
    }

    async fn list(&self, start: EntityId, count: usize) -> Result<Vec<EntityId>> {
        Ok(self
            .indices
            .read()
            .range(start..)
            .take(count)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn put(&self, idx: EntityId, records: Vec<(Bytes, Bytes)>) -> Result<Vec<i32>> {
        let mut indices = self.indices.write();
        let index = indices.get_mut(&idx).ok_or_else(|| Self::missing(idx))?;
        Ok(records
            .into_iter()
            .map(|(k, v)| {
                index.insert(k, v);
                0
            })
            .collect())
    }

    async fn get(&self, idx: EntityId, keys: Vec<Bytes>) -> Result<Vec<(i32, Option<Bytes>)>> {
        let indices = self.indices.read();
        let index = indices.get(&idx).ok_or_else(|| Self::missing(idx))?;
        Ok(keys
            .iter()
            .map(|k| match index.get(k) {
                Some(v) => (0, Some(v.clone())),
                None => (enoent(), None),
            })
            .collect())
    }

    async fn del(&self, idx: EntityId, keys: Vec<Bytes>) -> Result<Vec<i32>> {
        let mut indices = self.indices.write();
        let index = indices.get_mut(&idx).ok_or_else(|| Self::missing(idx))?;
        Ok(keys
            .iter()
            .map(|k| if index.remove(k).is_some() { 0 } else { enoent() })
            .collect())
    }

    async fn next(&self, idx: EntityId, start: Option<Bytes>, count: usize) -> Result<Vec<(Bytes, Bytes)>> {
        let indices = self.indices.read();
        let index = indices.get(&idx).ok_or_else(|| Self::missing(idx))?;
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        Ok(index
            .range((lower, Bound::Unbounded))
            .take(count)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

fn enoent() -> i32 {
    Error::NotFound(String::new()).errno()
}

/// What an index operation asks the backend
#[derive(Clone, Debug)]
pub(crate) enum IdxRequest {
    Create,
    Delete,
    Lookup,
    List { start: EntityId, count: usize },
    Put { records: Vec<(Bytes, Bytes)> },
    Get { keys: Vec<Bytes> },
    Del { keys: Vec<Bytes> },
    Next { start: Option<Bytes>, count: usize },
}

/// Output of an executed index operation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdxReply {
    pub keys: Vec<Bytes>,
    /// Values of GET (per key) and NEXT (per record)
    pub vals: Vec<Option<Bytes>>,
    /// Per-record results of PUT, GET and DEL
    pub rcs: Vec<i32>,
    /// Result of LIST
    pub indices: Vec<EntityId>,
}

/// Kind-specific state of an index operation
pub(crate) struct IdxOp {
    entity: Arc<Entity>,
    transition: Option<Transition>,
    request: Option<IdxRequest>,
    service: Arc<dyn IndexService>,
    reply: Option<IdxReply>,
}

impl IdxOp {
    pub(crate) fn new(
        entity: Arc<Entity>,
        transition: Option<Transition>,
        request: IdxRequest,
        service: Arc<dyn IndexService>,
    ) -> Self {
        Self {
            entity,
            transition,
            request: Some(request),
            service,
            reply: None,
        }
    }

    pub(crate) const fn reply(&self) -> Option<&IdxReply> {
        self.reply.as_ref()
    }

    pub(crate) fn launch(&mut self, op: &Op) -> Progress {
        if let Some(t) = self.transition
            && let Err(e) = self.entity.begin(t)
        {
            return Progress::Failed(e);
        }
        let Some(request) = self.request.take() else {
            return Progress::Failed(Error::invalid_state("index operation launched twice"));
        };
        let service = Arc::clone(&self.service);
        let idx = self.entity.id();
        let op = op.clone();
        tokio::spawn(async move {
            let result = execute(service.as_ref(), idx, request).await;
            let queued = op.post(move |op| {
                op.drive(|kind, _| match kind {
                    OpKind::Index(i) => i.complete(result),
                    _ => Progress::Pending,
                });
            });
            if !queued {
                warn!("op {}: index reply arrived after shutdown", op.id());
            }
        });
        Progress::Pending
    }

    fn complete(&mut self, result: Result<IdxReply>) -> Progress {
        if let Some(t) = self.transition {
            self.entity.settle(t, result.is_ok());
        }
        match result {
            Ok(reply) => {
                debug!("index op on {} done, {} rcs", self.entity.id(), reply.rcs.len());
                self.reply = Some(reply);
                Progress::Executed
            }
            Err(e) => Progress::Failed(e),
        }
    }
}

async fn execute(service: &dyn IndexService, idx: EntityId, request: IdxRequest) -> Result<IdxReply> {
    let mut reply = IdxReply::default();
    match request {
        IdxRequest::Create => service.create(idx).await?,
        IdxRequest::Delete => service.delete(idx).await?,
        IdxRequest::Lookup => service.lookup(idx).await?,
        IdxRequest::List { start, count } => reply.indices = service.list(start, count).await?,
        IdxRequest::Put { records } => {
            reply.keys = records.iter().map(|(k, _)| k.clone()).collect();
            reply.rcs = service.put(idx, records).await?;
        }
        IdxRequest::Get { keys } => {
            let got = service.get(idx, keys.clone()).await?;
            reply.keys = keys;
            (reply.rcs, reply.vals) = got.into_iter().unzip();
        }
        IdxRequest::Del { keys } => {
            reply.rcs = service.del(idx, keys.clone()).await?;
            reply.keys = keys;
        }
        IdxRequest::Next { start, count } => {
            let records = service.next(idx, start, count).await?;
            (reply.keys, reply.vals) = records.into_iter().map(|(k, v)| (k, Some(v))).unzip();
        }
    }
    Ok(reply)
}

/// Handle on an index
#[derive(Clone, Debug)]
pub struct Idx {
    client: Client,
    entity: Arc<Entity>,
}

impl Idx {
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

    fn op(
        &self,
        code: OpCode,
        transition: Option<Transition>,
        request: IdxRequest,
        slot: Option<Op>,
    ) -> Result<Op> {
        let op = Op::claim(slot, OpFamily::Index)?;
        if let Some(t) = transition {
            self.entity.check(t)?;
        }
        let service = self.client.collaborators()?.index;
        let kind = IdxOp::new(Arc::clone(&self.entity), transition, request, service);
        op.init(
            code,
            self.entity.id(),
            OpKind::Index(Box::new(kind)),
            Arc::new(PendingTx::new()),
            None,
            &self.client,
        )?;
        Ok(op)
    }

    pub fn create(&self, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Create, Some(Transition::CREATE), IdxRequest::Create, slot)
    }

    pub fn delete(&self, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Delete, Some(Transition::DELETE), IdxRequest::Delete, slot)
    }

    /// Check that the index exists; opens the handle on success
    pub fn lookup(&self, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Lookup, Some(Transition::OPEN), IdxRequest::Lookup, slot)
    }

    pub fn put(&self, records: Vec<(Bytes, Bytes)>, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Put, None, IdxRequest::Put { records }, slot)
    }

    pub fn get(&self, keys: Vec<Bytes>, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Get, None, IdxRequest::Get { keys }, slot)
    }

    pub fn del(&self, keys: Vec<Bytes>, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Del, None, IdxRequest::Del { keys }, slot)
    }

    /// Up to `count` records starting at `start` (inclusive)
    pub fn next(&self, start: Option<Bytes>, count: usize, slot: Option<Op>) -> Result<Op> {
        self.op(OpCode::Next, None, IdxRequest::Next { start, count }, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> EntityId {
        EntityId::from_parts(0, 0x10_0000 + n)
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let svc = MemIndexService::new();
        svc.create(id(1)).await.unwrap();
        let err = svc.create(id(1)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        svc.lookup(id(1)).await.unwrap();
        svc.delete(id(1)).await.unwrap();
        assert!(svc.lookup(id(1)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_per_item_results() {
        let svc = MemIndexService::new();
        svc.create(id(1)).await.unwrap();
        let rcs = svc.put(id(1), vec![(b("a"), b("1")), (b("c"), b("3"))]).await.unwrap();
        assert_eq!(rcs, vec![0, 0]);

        let got = svc.get(id(1), vec![b("a"), b("b")]).await.unwrap();
        assert_eq!(got[0], (0, Some(b("1"))));
        assert_eq!(got[1].0, Error::not_found("").errno());

        let rcs = svc.del(id(1), vec![b("b"), b("c")]).await.unwrap();
        assert_eq!(rcs, vec![Error::not_found("").errno(), 0]);
    }

    #[tokio::test]
    async fn test_next_and_list_are_ordered() {
        let svc = MemIndexService::new();
        for n in [3, 1, 2] {
            svc.create(id(n)).await.unwrap();
        }
        assert_eq!(svc.list(id(2), 10).await.unwrap(), vec![id(2), id(3)]);

        let records: Vec<_> = ["d", "b", "a", "c"].iter().map(|k| (b(k), b(k))).collect();
        svc.put(id(1), records).await.unwrap();
        let next = svc.next(id(1), Some(b("b")), 2).await.unwrap();
        let keys: Vec<Bytes> = next.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b("b"), b("c")]);
        assert_eq!(svc.next(id(1), None, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_execute_fills_reply() {
        let svc = MemIndexService::new();
        svc.create(id(1)).await.unwrap();
        execute(&svc, id(1), IdxRequest::Put { records: vec![(b("k"), b("v"))] })
            .await
            .unwrap();
        let reply = execute(&svc, id(1), IdxRequest::Get { keys: vec![b("k"), b("x")] })
            .await
            .unwrap();
        assert_eq!(reply.keys, vec![b("k"), b("x")]);
        assert_eq!(reply.vals, vec![Some(b("v")), None]);
        assert_eq!(reply.rcs[0], 0);
        assert!(reply.rcs[1] < 0);
        let err = execute(&svc, id(9), IdxRequest::Get { keys: vec![b("k")] }).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
