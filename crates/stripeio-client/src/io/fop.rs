//! Bottom half of IO fops
//!
//! Transport threads call into [`FopSink`], which only posts the event to
//! the operation's locality. The handlers below then run there, one at a
//! time per operation.

use super::xfer::FopDone;
use super::{IoOp, Phase};
use super::join::Join;
use crate::op::{Op, OpKind, Progress};
use crate::sync::record_update;
use crate::transport::{FopId, FopKind, IoEventSink, IoReply};
use bytes::Bytes;
use stripeio_common::{Error, Result, TxRemId};
use tracing::{debug, info, warn};

/// Routes transport events of one operation's fops to its locality
pub(crate) struct FopSink {
    op: Op,
}

impl FopSink {
    pub(crate) const fn new(op: Op) -> Self {
        Self { op }
    }

    fn deliver(&self, f: impl FnOnce(&mut IoOp, &Op) -> Progress + Send + 'static) {
        let queued = self.op.post(move |op| {
            op.drive(|kind, op| match kind {
                OpKind::Io(io) => f(io, op),
                _ => Progress::Pending,
            });
        });
        if !queued {
            warn!("op {}: dropping fop event, locality is gone", self.op.id());
        }
    }
}

impl IoEventSink for FopSink {
    fn bulk_received(&self, fop: FopId, buffer: usize, data: Result<Bytes>) {
        self.deliver(move |io, op| io.bulk_received(op, fop, buffer, data));
    }

    fn replied(&self, fop: FopId, reply: Result<IoReply>) {
        self.deliver(move |io, op| io.fop_replied(op, fop, reply));
    }
}

impl IoOp {
    pub(crate) fn fop_replied(&mut self, op: &Op, fop: FopId, reply: Result<IoReply>) -> Progress {
        let (rc, remid, update) = match reply {
            Ok(r) => (Error::from_errno(r.rc), r.remid, r.fv_update),
            Err(e) => (Some(e), TxRemId::default(), None),
        };
        if let Some(update) = &update {
            let applied = self.instance.pool().machine().catch_up(update);
            debug!("{}: failure vector catch-up applied {} events", fop, applied);
        }

        let Some(done) = self.xfer.release(fop, rc) else {
            debug!("op {}: reply for released {}", op.id(), fop);
            return Progress::Pending;
        };
        match &done.rc {
            None if done.kind != FopKind::Read => {
                match self.ctx.client.service(done.target.service) {
                    Some(service) => record_update(
                        &service,
                        &[&self.ctx.entity_ledger, &self.ctx.op_ledger],
                        remid,
                    ),
                    None => warn!("{} replied from unknown {}", fop, done.target.service),
                }
            }
            None => {}
            Some(e) => self.note_failure(&done, e),
        }

        if done.join == Join::Complete {
            self.joined(op);
        }
        Progress::Pending
    }

    pub(crate) fn bulk_received(
        &mut self,
        op: &Op,
        fop: FopId,
        buffer: usize,
        data: Result<Bytes>,
    ) -> Progress {
        let Some(segs) = self.xfer.take_bulk(fop, buffer) else {
            debug!("op {}: stale bulk buffer {} of {}", op.id(), buffer, fop);
            return Progress::Pending;
        };
        let expected: u64 = segs.iter().map(|s| s.len).sum();
        match data {
            Ok(bytes) if bytes.len() as u64 == expected => {
                let mut pos = 0;
                for s in &segs {
                    let len = s.len as usize;
                    self.maps[s.map].store(&s.seg, &bytes[pos..pos + len]);
                    pos += len;
                }
            }
            Ok(bytes) => self.xfer.fail_fop(
                fop,
                Error::Io(format!(
                    "bulk buffer {} of {} carried {} bytes, expected {}",
                    buffer,
                    fop,
                    bytes.len(),
                    expected
                )),
            ),
            Err(e) => self.xfer.fail_fop(fop, e),
        }

        let (join, settled) = self.xfer.bulk_done(fop);
        if let Some(done) = settled
            && let Some(e) = &done.rc
        {
            self.note_failure(&done, e);
        }
        if join == Join::Complete {
            self.joined(op);
        }
        Progress::Pending
    }

    /// Decide whether a failed fop can be recovered by a degraded read
    ///
    /// Only plain reads qualify, and only when the target itself is down:
    /// unreachable, or failed in the pool machine after catch-up.
    fn note_failure(&mut self, done: &FopDone, err: &Error) {
        let target = done.target.target;
        let down = err.is_unavailable() || self.instance.pool().machine().is_failed(target);
        if self.phase != Phase::Read || !down {
            warn!("{:?} fop to {} failed: {}", done.kind, target, err);
            self.fatal.get_or_insert_with(|| err.clone());
            return;
        }
        if let Err(e) = self.failed.insert(target) {
            self.fatal.get_or_insert(e);
            return;
        }

        let mut maps: Vec<usize> = done.segs.iter().map(|s| s.map).collect();
        maps.dedup();
        let tolerance = self.instance.tolerance();
        for mi in maps {
            let map = &mut self.maps[mi];
            if let Some(unit) = map.unit_of_target(target) {
                map.mark_failed(unit);
            }
            if map.failed_units().len() > tolerance {
                self.fatal.get_or_insert_with(|| {
                    Error::Io(format!("group {} lost more than {} units", map.grpid(), tolerance))
                });
            }
        }
        info!("read from {} failed ({}), its groups go degraded", target, err);
    }
}
