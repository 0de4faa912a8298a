//! Durability tracking
//!
//! Every successful update reply names the transaction (`TxRemId`) it
//! landed in. Until the service confirms that transaction is on stable
//! storage, the id stays in up to three ledgers: the object's, the
//! operation's, and the service's high-water mark. An fsync round sends one
//! request per pending (service, id) pair and clears the ledgers the
//! confirmation covers.
//!
//! ```text
//!   fire:     snapshot ──► post fsync ──► post fsync ──► (first post error stops)
//!   collect:  wait all replies ──► compare ──► clear if stored <= confirmed
//! ```

use crate::transport::{FsyncMode, FsyncReply, FsyncRequest, Transport};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stripeio_common::{Error, Result, ServiceId, ServiceKind, TxRemId};
use tracing::{debug, warn};

/// Highest not-yet-durable transaction per service
#[derive(Debug, Default)]
pub struct PendingTx {
    records: Mutex<BTreeMap<ServiceId, TxRemId>>,
}

impl PendingTx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `remid` for `service` iff it is strictly greater
    ///
    /// Returns whether the record moved.
    pub fn update(&self, service: ServiceId, remid: TxRemId) -> bool {
        let mut records = self.records.lock();
        let slot = records.entry(service).or_default();
        if remid.txid > slot.txid {
            *slot = remid;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn get(&self, service: ServiceId) -> TxRemId {
        self.records.lock().get(&service).copied().unwrap_or_default()
    }

    /// Pending records, ascending by service
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ServiceId, TxRemId)> {
        self.records
            .lock()
            .iter()
            .filter(|(_, r)| r.is_pending())
            .map(|(s, r)| (*s, *r))
            .collect()
    }

    /// Clear the record of `service` if `confirmed` covers it
    ///
    /// A record advanced past `confirmed` by a concurrent update stays.
    pub fn confirm(&self, service: ServiceId, confirmed: u64) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(&service) {
            Some(slot) if slot.is_pending() && slot.txid <= confirmed => {
                *slot = TxRemId::default();
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.records.lock().values().any(TxRemId::is_pending)
    }
}

/// Client-side context of one remote service
#[derive(Debug)]
pub struct ServiceContext {
    id: ServiceId,
    kind: ServiceKind,
    max_pending: Mutex<TxRemId>,
}

impl ServiceContext {
    #[must_use]
    pub fn new(id: ServiceId, kind: ServiceKind) -> Self {
        Self {
            id,
            kind,
            max_pending: Mutex::new(TxRemId::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ServiceId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> ServiceKind {
        self.kind
    }

    /// High-water mark of not-yet-durable transactions on this service
    #[must_use]
    pub fn max_pending(&self) -> TxRemId {
        *self.max_pending.lock()
    }

    fn update(&self, remid: TxRemId) {
        let mut slot = self.max_pending.lock();
        if remid.txid > slot.txid {
            *slot = remid;
        }
    }

    fn confirm(&self, confirmed: u64) {
        let mut slot = self.max_pending.lock();
        if slot.is_pending() && slot.txid <= confirmed {
            *slot = TxRemId::default();
        }
    }
}

/// Note that `remid` on `service` is not yet durable
pub(crate) fn record_update(service: &ServiceContext, ledgers: &[&PendingTx], remid: TxRemId) {
    if !remid.is_pending() {
        return;
    }
    for ledger in ledgers {
        ledger.update(service.id, remid);
    }
    service.update(remid);
}

/// One fsync request to make, and the ledgers its confirmation clears
pub(crate) struct SyncTarget {
    pub service: Arc<ServiceContext>,
    pub remid: TxRemId,
    pub ledgers: Vec<Arc<PendingTx>>,
}

impl SyncTarget {
    /// One target per pending record of `ledger`
    pub(crate) fn from_ledger(
        ledger: &Arc<PendingTx>,
        extra: &[Arc<PendingTx>],
        lookup: impl Fn(ServiceId) -> Option<Arc<ServiceContext>>,
    ) -> Vec<Self> {
        ledger
            .snapshot()
            .into_iter()
            .filter_map(|(id, remid)| {
                let Some(service) = lookup(id) else {
                    warn!("pending transaction on unknown service {}", id);
                    return None;
                };
                let mut ledgers = vec![Arc::clone(ledger)];
                ledgers.extend(extra.iter().cloned());
                Some(Self {
                    service,
                    remid,
                    ledgers,
                })
            })
            .collect()
    }
}

fn check_reply(reply: &FsyncReply, requested: TxRemId) -> Result<u64> {
    if let Some(e) = Error::from_errno(reply.rc) {
        return Err(e);
    }
    if reply.remid.txid < requested.txid {
        return Err(Error::InconsistentReply(format!(
            "committed transaction {} is below requested {}",
            reply.remid.txid, requested.txid
        )));
    }
    Ok(reply.remid.txid)
}

/// Run one two-phase fsync round
///
/// Returns the first error seen in either phase.
pub(crate) async fn fsync_round(
    transport: &dyn Transport,
    targets: Vec<SyncTarget>,
    timeout: Duration,
) -> Result<()> {
    let mut saved: Option<Error> = None;
    let mut sent = Vec::with_capacity(targets.len());

    for target in targets {
        let request = FsyncRequest {
            service: target.service.id(),
            remid: target.remid,
            mode: FsyncMode::Active,
        };
        match transport.post_fsync(request) {
            Ok(ticket) => sent.push((target, ticket)),
            Err(e) => {
                warn!("fsync post to {} failed: {}", target.service.id(), e);
                saved = Some(e);
                break;
            }
        }
    }

    // every reply shares one timeout window
    let replies = join_all(sent.into_iter().map(|(target, ticket)| async move {
        let result = ticket
            .wait(timeout)
            .await
            .and_then(|reply| check_reply(&reply, target.remid));
        (target, result)
    }))
    .await;

    for (target, result) in replies {
        let service = target.service.id();
        match result {
            Ok(confirmed) => {
                debug!("{} confirmed txid {}", service, confirmed);
                for ledger in &target.ledgers {
                    ledger.confirm(service, confirmed);
                }
                target.service.confirm(confirmed);
            }
            Err(e) => {
                warn!("fsync on {} failed: {}", service, e);
                saved.get_or_insert(e);
            }
        }
    }

    saved.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        CobReply, CobRequest, IoEventSink, IoFopRequest, ReplySender, ReplyTicket,
    };
    use rand::Rng;

    fn svc(n: u32) -> ServiceId {
        ServiceId::new(n)
    }

    #[test]
    fn test_update_is_monotonic() {
        let ledger = PendingTx::new();
        let mut rng = rand::thread_rng();
        let mut max = 0;
        for _ in 0..1000 {
            let txid = rng.gen_range(1..500);
            let moved = ledger.update(svc(1), TxRemId::new(txid, 0));
            assert_eq!(moved, txid > max);
            max = max.max(txid);
            assert_eq!(ledger.get(svc(1)).txid, max);
        }
    }

    #[test]
    fn test_confirm_respects_concurrent_advance() {
        let ledger = PendingTx::new();
        ledger.update(svc(1), TxRemId::new(10, 0));
        let snap = ledger.snapshot();
        assert_eq!(snap, vec![(svc(1), TxRemId::new(10, 0))]);

        // a writer moves the record on before the confirmation lands
        ledger.update(svc(1), TxRemId::new(12, 0));
        assert!(!ledger.confirm(svc(1), 10));
        assert_eq!(ledger.get(svc(1)).txid, 12);
        assert!(ledger.confirm(svc(1), 12));
        assert!(!ledger.has_pending());
        assert!(ledger.snapshot().is_empty());
    }

    #[test]
    fn test_record_update_touches_all_ledgers() {
        let ctx = ServiceContext::new(svc(3), ServiceKind::Io);
        let obj = PendingTx::new();
        let op = PendingTx::new();
        record_update(&ctx, &[&obj, &op], TxRemId::new(4, 1));
        record_update(&ctx, &[&obj, &op], TxRemId::default());
        assert_eq!(obj.get(svc(3)).txid, 4);
        assert_eq!(op.get(svc(3)).txid, 4);
        assert_eq!(ctx.max_pending().txid, 4);
    }

    /// Fsync-only transport replying with a fixed committed txid
    struct FixedFsync {
        committed: u64,
        fail_post_to: Option<ServiceId>,
        posted: Mutex<Vec<ServiceId>>,
        hold: Mutex<Vec<ReplySender<FsyncReply>>>,
        hold_replies: bool,
    }

    impl FixedFsync {
        fn new(committed: u64) -> Self {
            Self {
                committed,
                fail_post_to: None,
                posted: Mutex::new(Vec::new()),
                hold: Mutex::new(Vec::new()),
                hold_replies: false,
            }
        }
    }

    impl Transport for FixedFsync {
        fn post_io(&self, _: IoFopRequest, _: Arc<dyn IoEventSink>) -> Result<()> {
            unreachable!()
        }

        fn post_fsync(&self, request: FsyncRequest) -> Result<ReplyTicket<FsyncReply>> {
            if self.fail_post_to == Some(request.service) {
                return Err(Error::unavailable("session down"));
            }
            self.posted.lock().push(request.service);
            let (tx, ticket) = ReplyTicket::channel();
            if self.hold_replies {
                self.hold.lock().push(tx);
            } else {
                tx.send(Ok(FsyncReply {
                    rc: 0,
                    remid: TxRemId::new(self.committed, 0),
                }));
            }
            Ok(ticket)
        }

        fn post_cob(&self, _: CobRequest) -> Result<ReplyTicket<CobReply>> {
            unreachable!()
        }
    }

    fn targets(ledger: &Arc<PendingTx>, services: &[Arc<ServiceContext>]) -> Vec<SyncTarget> {
        SyncTarget::from_ledger(ledger, &[], |id| {
            services.iter().find(|s| s.id() == id).cloned()
        })
    }

    #[tokio::test]
    async fn test_round_clears_confirmed_records() {
        let services: Vec<_> = (1..=3)
            .map(|i| Arc::new(ServiceContext::new(svc(i), ServiceKind::Io)))
            .collect();
        let ledger = Arc::new(PendingTx::new());
        for s in &services {
            record_update(s, &[&ledger], TxRemId::new(5, 0));
        }

        let transport = FixedFsync::new(5);
        fsync_round(&transport, targets(&ledger, &services), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!ledger.has_pending());
        assert!(services.iter().all(|s| !s.max_pending().is_pending()));
        assert_eq!(transport.posted.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_round_rejects_short_confirmation() {
        let service = Arc::new(ServiceContext::new(svc(1), ServiceKind::Io));
        let ledger = Arc::new(PendingTx::new());
        record_update(&service, &[&ledger], TxRemId::new(8, 0));

        let transport = FixedFsync::new(7);
        let err = fsync_round(&transport, targets(&ledger, &[service]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentReply(_)));
        assert_eq!(ledger.get(svc(1)).txid, 8);
    }

    #[tokio::test]
    async fn test_post_error_stops_fire_but_drains_sent() {
        let services: Vec<_> = (1..=3)
            .map(|i| Arc::new(ServiceContext::new(svc(i), ServiceKind::Io)))
            .collect();
        let ledger = Arc::new(PendingTx::new());
        for s in &services {
            record_update(s, &[&ledger], TxRemId::new(2, 0));
        }

        let mut transport = FixedFsync::new(2);
        transport.fail_post_to = Some(svc(2));
        let err = fsync_round(&transport, targets(&ledger, &services), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        // service 1 was sent and confirmed, 2 failed, 3 never sent
        assert_eq!(*transport.posted.lock(), vec![svc(1)]);
        assert_eq!(ledger.get(svc(1)).txid, 0);
        assert_eq!(ledger.get(svc(2)).txid, 2);
        assert_eq!(ledger.get(svc(3)).txid, 2);
    }

    #[tokio::test]
    async fn test_round_times_out() {
        let service = Arc::new(ServiceContext::new(svc(1), ServiceKind::Io));
        let ledger = Arc::new(PendingTx::new());
        record_update(&service, &[&ledger], TxRemId::new(1, 0));

        let mut transport = FixedFsync::new(1);
        transport.hold_replies = true;
        let err = fsync_round(&transport, targets(&ledger, &[service]), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
        assert!(ledger.has_pending());
    }

    #[tokio::test]
    async fn test_silent_services_share_one_timeout() {
        let services: Vec<_> = (1..=6)
            .map(|i| Arc::new(ServiceContext::new(svc(i), ServiceKind::Io)))
            .collect();
        let ledger = Arc::new(PendingTx::new());
        for s in &services {
            record_update(s, &[&ledger], TxRemId::new(3, 0));
        }

        let mut transport = FixedFsync::new(3);
        transport.hold_replies = true;
        let started = std::time::Instant::now();
        let err = fsync_round(&transport, targets(&ledger, &services), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(transport.posted.lock().len(), 6);
    }
}
