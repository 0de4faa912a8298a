//! In-process cluster behind the [`Transport`] trait
//!
//! Every target keeps its component objects as sparse byte vectors, and every
//! service numbers its updates with increasing transaction ids. Replies are
//! delivered from spawned tasks, never from inside `post_*`, the same way a
//! network transport would deliver them.
//!
//! Faults can be injected:
//! - [`LoopbackCluster::fail_target`] makes a target refuse all IO and logs a
//!   pool event. Replies from healthy targets then carry the missing events
//!   to clients whose pool machine is behind.
//! - [`LoopbackCluster::fail_io`] makes a target answer every fop with an
//!   error code, optionally after a delay, without any pool event.
//! - [`LoopbackCluster::set_short_fsync`] confirms one transaction less than
//!   asked.
//! - [`LoopbackCluster::set_mute_fsync`] never answers fsyncs.
//! - [`LoopbackCluster::set_reply_first`] sends each read reply ahead of its
//!   bulk buffers.

use crate::transport::{
    CobOp, CobReply, CobRequest, FopKind, FsyncReply, FsyncRequest, IoEventSink, IoFopRequest,
    IoReply, ReplyTicket, Transport,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use stripeio_common::{EntityId, Error, LayoutId, Result, ServiceId, TargetId, TxRemId};
use stripeio_layout::{FvUpdate, FvVersion, PoolEvent, PoolMachine, TargetState};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ServiceTx {
    last: u64,
    committed: u64,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// Component-object data by (target, object)
    cobs: HashMap<(TargetId, EntityId), Vec<u8>>,
    /// Metadata records by object
    meta: HashMap<EntityId, LayoutId>,
    tx: HashMap<ServiceId, ServiceTx>,
    failed: HashSet<TargetId>,
    /// Targets answering IO with an errno, after a delay
    io_faults: HashMap<TargetId, (i32, Duration)>,
    /// Every pool event so far; entry `i` moves a view from version `i` to `i + 1`
    events: Vec<PoolEvent>,
}

impl ClusterState {
    fn next_tx(&mut self, service: ServiceId) -> TxRemId {
        let tx = self.tx.entry(service).or_default();
        tx.last += 1;
        TxRemId::new(tx.last, u64::from(service.get()))
    }

    fn fv_update(&self, machine: &PoolMachine, seen: FvVersion) -> Option<FvUpdate> {
        let version = machine.version();
        if seen.read >= version.read {
            return None;
        }
        let from = usize::try_from(seen.read).unwrap_or(usize::MAX);
        Some(FvUpdate {
            version,
            events: self.events.get(from..).map(<[PoolEvent]>::to_vec).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ClusterState>,
    /// The services' shared view of target health
    machine: PoolMachine,
    short_fsync: AtomicBool,
    mute_fsync: AtomicBool,
    reply_first: AtomicBool,
    io_requests: AtomicU64,
    fsync_requests: AtomicU64,
    cob_requests: AtomicU64,
}

/// Transport that serves requests from memory
///
/// Clones share one cluster, so a test can keep a handle for fault injection
/// while the client owns another.
#[derive(Clone, Debug, Default)]
pub struct LoopbackCluster {
    shared: Arc<Shared>,
}

impl LoopbackCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `target` refuse every later fop
    pub fn fail_target(&self, target: TargetId) {
        let event = PoolEvent {
            target,
            state: TargetState::Failed,
        };
        let mut st = self.shared.state.lock();
        if st.failed.insert(target) {
            st.events.push(event);
            self.shared.machine.apply(event);
            info!("loopback: {} failed", target);
        }
    }

    pub fn set_short_fsync(&self, on: bool) {
        self.shared.short_fsync.store(on, Ordering::SeqCst);
    }

    pub fn set_mute_fsync(&self, on: bool) {
        self.shared.mute_fsync.store(on, Ordering::SeqCst);
    }

    /// Answer every later fop to `target` with `rc` once `delay` has passed
    pub fn fail_io(&self, target: TargetId, rc: i32, delay: Duration) {
        self.shared.state.lock().io_faults.insert(target, (rc, delay));
    }

    pub fn set_reply_first(&self, on: bool) {
        self.shared.reply_first.store(on, Ordering::SeqCst);
    }

    #[must_use]
    pub fn io_requests(&self) -> u64 {
        self.shared.io_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn fsync_requests(&self) -> u64 {
        self.shared.fsync_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cob_requests(&self) -> u64 {
        self.shared.cob_requests.load(Ordering::SeqCst)
    }

    /// Highest transaction `service` has made durable
    #[must_use]
    pub fn committed(&self, service: ServiceId) -> u64 {
        self.shared.state.lock().tx.get(&service).map_or(0, |t| t.committed)
    }

    /// Bytes a target stores for an object, if the component object exists
    #[must_use]
    pub fn cob_data(&self, target: TargetId, object: EntityId) -> Option<Vec<u8>> {
        self.shared.state.lock().cobs.get(&(target, object)).cloned()
    }
}

impl Shared {
    /// Execute a fop and return its bulk buffers and reply
    fn io_delay(&self, target: TargetId) -> Duration {
        self.state
            .lock()
            .io_faults
            .get(&target)
            .map_or(Duration::ZERO, |&(_, delay)| delay)
    }

    fn serve_io(&self, req: &IoFopRequest) -> (Vec<Result<Bytes>>, Result<IoReply>) {
        let mut st = self.state.lock();
        if st.failed.contains(&req.target.target) {
            let err = || Error::unavailable(format!("{} is down", req.target.target));
            let bulk = req.bulk.iter().map(|_| Err(err())).collect();
            return (bulk, Err(err()));
        }
        let fv_update = st.fv_update(&self.machine, req.pool_version);
        if let Some(&(rc, _)) = st.io_faults.get(&req.target.target) {
            let err = || {
                Error::from_errno(rc)
                    .unwrap_or_else(|| Error::Io(format!("{} fault", req.target.target)))
            };
            let bulk = req.bulk.iter().map(|_| Err(err())).collect();
            return (bulk, Ok(IoReply { rc, remid: TxRemId::default(), fv_update }));
        }
        let key = (req.target.target, req.object);

        if req.kind == FopKind::Read {
            let Some(cob) = st.cobs.get(&key) else {
                let rc = Error::not_found("").errno();
                let bulk = req
                    .bulk
                    .iter()
                    .map(|_| Err(Error::not_found(format!("{}", req.object))))
                    .collect();
                return (bulk, Ok(IoReply { rc, remid: TxRemId::default(), fv_update }));
            };
            let mut segs = req.segments.iter();
            let bulk = req
                .bulk
                .iter()
                .map(|&n| {
                    let mut buf = Vec::new();
                    for s in segs.by_ref().take(n) {
                        buf.extend_from_slice(&read_range(cob, s.offset, s.len));
                    }
                    Ok(Bytes::from(buf))
                })
                .collect();
            return (bulk, Ok(IoReply { rc: 0, remid: TxRemId::default(), fv_update }));
        }

        let cob = st.cobs.entry(key).or_default();
        for (i, s) in req.segments.iter().enumerate() {
            let (Ok(off), Ok(len)) = (usize::try_from(s.offset), usize::try_from(s.len)) else {
                continue;
            };
            match req.kind {
                FopKind::Write => {
                    let data = req.payload.get(i).map_or(&[][..], |b| &b[..]);
                    write_range(cob, off, &data[..len.min(data.len())]);
                }
                FopKind::Free => {
                    if cob.len() > off {
                        let end = (off + len).min(cob.len());
                        cob[off..end].fill(0);
                    }
                }
                FopKind::Alloc => {
                    if cob.len() < off + len {
                        cob.resize(off + len, 0);
                    }
                }
                FopKind::Read => {}
            }
        }
        let remid = st.next_tx(req.target.service);
        (Vec::new(), Ok(IoReply { rc: 0, remid, fv_update }))
    }

    fn serve_cob(&self, req: CobRequest) -> CobReply {
        let mut st = self.state.lock();
        let exists = match req.target {
            Some(t) => st.cobs.contains_key(&(t, req.object)),
            None => st.meta.contains_key(&req.object),
        };
        let errno = |e: Error| CobReply {
            rc: e.errno(),
            ..CobReply::default()
        };
        match req.op {
            CobOp::Lookup if !exists => errno(Error::not_found(format!("{}", req.object))),
            CobOp::Lookup => CobReply {
                rc: 0,
                remid: TxRemId::default(),
                layout: st.meta.get(&req.object).copied().unwrap_or(req.layout),
            },
            CobOp::Create if exists => errno(Error::AlreadyExists(format!("{}", req.object))),
            CobOp::Delete if !exists => errno(Error::not_found(format!("{}", req.object))),
            CobOp::Create | CobOp::Delete => {
                let create = req.op == CobOp::Create;
                match (req.target, create) {
                    (Some(t), true) => {
                        st.cobs.insert((t, req.object), Vec::new());
                    }
                    (Some(t), false) => {
                        st.cobs.remove(&(t, req.object));
                    }
                    (None, true) => {
                        st.meta.insert(req.object, req.layout);
                    }
                    (None, false) => {
                        st.meta.remove(&req.object);
                    }
                }
                CobReply {
                    rc: 0,
                    remid: st.next_tx(req.service),
                    layout: req.layout,
                }
            }
        }
    }

    fn serve_fsync(&self, req: FsyncRequest) -> FsyncReply {
        let mut st = self.state.lock();
        let tx = st.tx.entry(req.service).or_default();
        let target = req.remid.txid.min(tx.last);
        tx.committed = tx.committed.max(target);
        let confirmed = if self.short_fsync.load(Ordering::SeqCst) {
            req.remid.txid.saturating_sub(1)
        } else {
            tx.committed
        };
        FsyncReply {
            rc: 0,
            remid: TxRemId::new(confirmed, req.remid.locality),
        }
    }
}

fn read_range(cob: &[u8], offset: u64, len: u64) -> Vec<u8> {
    let (Ok(off), Ok(len)) = (usize::try_from(offset), usize::try_from(len)) else {
        return Vec::new();
    };
    let mut out = vec![0u8; len];
    if off < cob.len() {
        let end = (off + len).min(cob.len());
        out[..end - off].copy_from_slice(&cob[off..end]);
    }
    out
}

fn write_range(cob: &mut Vec<u8>, off: usize, data: &[u8]) {
    if cob.len() < off + data.len() {
        cob.resize(off + data.len(), 0);
    }
    cob[off..off + data.len()].copy_from_slice(data);
}

impl Transport for LoopbackCluster {
    fn post_io(&self, request: IoFopRequest, sink: Arc<dyn IoEventSink>) -> Result<()> {
        self.shared.io_requests.fetch_add(1, Ordering::SeqCst);
        let cluster = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let delay = cluster.io_delay(request.target.target);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let (bulk, reply) = cluster.serve_io(&request);
            debug!("loopback: {} to {} done", request.fop, request.target.target);
            if cluster.reply_first.load(Ordering::SeqCst) {
                sink.replied(request.fop, reply);
                tokio::task::yield_now().await;
                for (i, data) in bulk.into_iter().enumerate() {
                    sink.bulk_received(request.fop, i, data);
                }
            } else {
                for (i, data) in bulk.into_iter().enumerate() {
                    sink.bulk_received(request.fop, i, data);
                }
                sink.replied(request.fop, reply);
            }
        });
        Ok(())
    }

    fn post_fsync(&self, request: FsyncRequest) -> Result<ReplyTicket<FsyncReply>> {
        self.shared.fsync_requests.fetch_add(1, Ordering::SeqCst);
        let (tx, ticket) = ReplyTicket::channel();
        if self.shared.mute_fsync.load(Ordering::SeqCst) {
            // keep the sender alive so the waiter times out
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(tx);
            });
            return Ok(ticket);
        }
        let cluster = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tx.send(Ok(cluster.serve_fsync(request)));
        });
        Ok(ticket)
    }

    fn post_cob(&self, request: CobRequest) -> Result<ReplyTicket<CobReply>> {
        self.shared.cob_requests.fetch_add(1, Ordering::SeqCst);
        let (tx, ticket) = ReplyTicket::channel();
        let cluster = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tx.send(Ok(cluster.serve_cob(request)));
        });
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FsyncMode, Segment};
    use stripeio_common::TargetAddr;

    fn addr(t: u32) -> TargetAddr {
        TargetAddr {
            target: TargetId::new(t),
            service: ServiceId::new(1),
        }
    }

    fn write_req(t: u32, obj: EntityId, off: u64, data: &[u8]) -> IoFopRequest {
        IoFopRequest {
            fop: crate::transport::FopId(1),
            kind: FopKind::Write,
            target: addr(t),
            object: obj,
            pool_version: FvVersion::default(),
            segments: vec![Segment {
                offset: off,
                len: data.len() as u64,
            }],
            payload: vec![Bytes::copy_from_slice(data)],
            bulk: Vec::new(),
        }
    }

    #[test]
    fn test_write_then_read_with_holes() {
        let c = Shared::default();
        let obj = EntityId::APP_MIN;
        let (_, reply) = c.serve_io(&write_req(0, obj, 4, b"abcd"));
        assert_eq!(reply.unwrap().remid.txid, 1);
        let (_, reply) = c.serve_io(&write_req(0, obj, 16, b"xy"));
        assert_eq!(reply.unwrap().remid.txid, 2);

        let mut read = write_req(0, obj, 0, b"");
        read.kind = FopKind::Read;
        read.payload.clear();
        read.segments = vec![Segment { offset: 2, len: 4 }, Segment { offset: 16, len: 4 }];
        read.bulk = vec![2];
        let (bulk, reply) = c.serve_io(&read);
        assert_eq!(reply.unwrap().rc, 0);
        assert_eq!(&bulk[0].as_ref().unwrap()[..], b"\0\0abxy\0\0");
    }

    #[test]
    fn test_read_of_missing_cob() {
        let c = Shared::default();
        let mut read = write_req(0, EntityId::APP_MIN, 0, b"");
        read.kind = FopKind::Read;
        read.segments = vec![Segment { offset: 0, len: 8 }];
        read.bulk = vec![1];
        let (bulk, reply) = c.serve_io(&read);
        assert!(bulk[0].is_err());
        assert_eq!(reply.unwrap().rc, Error::not_found("").errno());
    }

    #[test]
    fn test_failed_target_and_fv_update() {
        let cluster = LoopbackCluster::new();
        cluster.fail_target(TargetId::new(3));
        let c = &cluster.shared;
        let obj = EntityId::APP_MIN;
        let (_, reply) = c.serve_io(&write_req(3, obj, 0, b"z"));
        assert!(reply.unwrap_err().is_unavailable());

        let reply = c.serve_io(&write_req(1, obj, 0, b"z")).1.unwrap();
        let update = reply.fv_update.unwrap();
        assert_eq!(update.version.read, 1);
        assert_eq!(update.events[0].target, TargetId::new(3));

        let mut current = write_req(1, obj, 0, b"z");
        current.pool_version = update.version;
        assert!(c.serve_io(&current).1.unwrap().fv_update.is_none());
    }

    #[test]
    fn test_fsync_confirms() {
        let cluster = LoopbackCluster::new();
        let c = &cluster.shared;
        let obj = EntityId::APP_MIN;
        c.serve_io(&write_req(0, obj, 0, b"a"));
        c.serve_io(&write_req(0, obj, 0, b"b"));
        let req = FsyncRequest {
            service: ServiceId::new(1),
            remid: TxRemId::new(2, 1),
            mode: FsyncMode::Active,
        };
        assert_eq!(c.serve_fsync(req).remid.txid, 2);
        assert_eq!(cluster.committed(ServiceId::new(1)), 2);

        cluster.set_short_fsync(true);
        assert_eq!(c.serve_fsync(req).remid.txid, 1);
    }

    #[test]
    fn test_cob_lifecycle() {
        let c = Shared::default();
        let req = CobRequest {
            op: CobOp::Create,
            object: EntityId::APP_MIN,
            layout: LayoutId::new(7),
            service: ServiceId::new(0),
            target: None,
        };
        assert_eq!(c.serve_cob(req).rc, 0);
        assert_eq!(c.serve_cob(req).rc, Error::AlreadyExists(String::new()).errno());
        let lookup = c.serve_cob(CobRequest {
            op: CobOp::Lookup,
            ..req
        });
        assert_eq!(lookup.layout, LayoutId::new(7));
        assert_eq!(c.serve_cob(CobRequest { op: CobOp::Delete, ..req }).rc, 0);
        assert!(c.serve_cob(CobRequest { op: CobOp::Lookup, ..req }).rc < 0);
    }
}
