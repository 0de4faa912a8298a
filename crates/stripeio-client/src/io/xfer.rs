//! Network transfer: target requests and fops
//!
//! ```text
//!   NwXfer ──► TargetIoreq (one per target) ──► IoFop (one per RPC)
//!                  segs: ascending target-local ranges
//! ```
//!
//! `distribute` turns map plans into per-target segment lists; `launch`
//! cuts them into fops and posts them. Everything here is owned by the IO
//! operation and only touched on its locality, except the [`FanIn`]
//! counters, which have their own lock.

use super::iomap::{PargrpIomap, PlanSeg};
use super::join::{FanIn, Join};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use stripeio_common::config::RpcConfig;
use stripeio_common::{EntityId, Error, TargetAddr, TargetId};
use stripeio_layout::{FvVersion, StripeLayout};
use tracing::{debug, warn};

use crate::transport::{FopId, FopKind, IoEventSink, IoFopRequest, Segment, Transport};

static NEXT_FOP_ID: AtomicU64 = AtomicU64::new(1);

/// One target-local range and where its bytes live in the maps
#[derive(Clone, Copy, Debug)]
pub(crate) struct TargetSeg {
    pub tgt_off: u64,
    pub len: u64,
    /// Index of the owning map
    pub map: usize,
    pub seg: PlanSeg,
    pub parity: bool,
}

#[derive(Debug)]
pub(crate) struct IoFop {
    kind: FopKind,
    segs: Range<usize>,
    /// Segment range carried by each bulk buffer
    bulk: Vec<Range<usize>>,
    bulk_done: Vec<bool>,
    replied: bool,
    /// Replied and every bulk buffer accounted
    released: bool,
    rc: Option<Error>,
}

/// Requests to one target
#[derive(Debug)]
pub(crate) struct TargetIoreq {
    addr: TargetAddr,
    segs: Vec<TargetSeg>,
    fops: BTreeMap<FopId, IoFop>,
    rc: Option<Error>,
    data_bytes: u64,
    parity_bytes: u64,
}

impl TargetIoreq {
    const fn new(addr: TargetAddr) -> Self {
        Self {
            addr,
            segs: Vec::new(),
            fops: BTreeMap::new(),
            rc: None,
            data_bytes: 0,
            parity_bytes: 0,
        }
    }

    /// Split the segment list into runs of one kind, then into fops
    fn chunks(&self, max_segs: usize) -> Vec<(Range<usize>, bool)> {
        let mut out = Vec::new();
        let mut start = 0;
        while start < self.segs.len() {
            let parity = self.segs[start].parity;
            let mut end = start;
            while end < self.segs.len() && self.segs[end].parity == parity && end - start < max_segs {
                end += 1;
            }
            out.push((start..end, parity));
            start = end;
        }
        out
    }
}

/// A fop that was just released
#[derive(Debug)]
pub(crate) struct FopDone {
    pub target: TargetAddr,
    pub kind: FopKind,
    pub segs: Vec<TargetSeg>,
    pub rc: Option<Error>,
    pub join: Join,
}

/// Per-target byte counts of a finished phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct XferBytes {
    pub data: u64,
    pub parity: u64,
}

#[derive(Debug, Default)]
pub(crate) struct NwXfer {
    targets: BTreeMap<TargetId, TargetIoreq>,
    fop_index: HashMap<FopId, TargetId>,
    fan_in: FanIn,
    rc: Option<Error>,
}

impl NwXfer {
    /// Drop the previous phase's requests; every fop must be released
    pub(crate) fn reset(&mut self) {
        debug_assert!(
            self.targets
                .values()
                .all(|t| t.fops.values().all(|f| f.released)),
            "reset with fops in flight"
        );
        self.targets.clear();
        self.fop_index.clear();
        self.fan_in.reset();
        self.rc = None;
    }

    /// Resolve each planned unit range to its target
    pub(crate) fn distribute(
        &mut self,
        layout: &StripeLayout,
        maps: &[PargrpIomap],
        plan: impl Fn(&PargrpIomap) -> Vec<PlanSeg>,
    ) {
        for (mi, map) in maps.iter().enumerate() {
            for seg in plan(map) {
                let addr = map.target(seg.unit);
                let treq = self
                    .targets
                    .entry(addr.target)
                    .or_insert_with(|| TargetIoreq::new(addr));
                let tgt_off = layout.target_offset(map.grpid(), seg.off);
                debug_assert!(treq.segs.last().is_none_or(|s| s.tgt_off + s.len <= tgt_off));
                treq.segs.push(TargetSeg {
                    tgt_off,
                    len: seg.len,
                    map: mi,
                    seg,
                    parity: layout.is_parity(seg.unit),
                });
            }
        }
    }

    /// Targets with at least one segment, ascending
    pub(crate) fn target_ids(&self) -> Vec<TargetId> {
        self.targets.keys().copied().collect()
    }

    pub(crate) fn fop_count(&self) -> usize {
        self.fop_index.len()
    }

    pub(crate) fn rc(&self) -> Option<&Error> {
        self.rc.as_ref()
    }

    pub(crate) fn bytes(&self) -> XferBytes {
        self.targets.values().fold(XferBytes::default(), |acc, t| XferBytes {
            data: acc.data + t.data_bytes,
            parity: acc.parity + t.parity_bytes,
        })
    }

    /// Cut every target's segments into fops and post them
    ///
    /// Returns [`Join::Complete`] if nothing is left in flight once the
    /// barrier is armed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn launch(
        &mut self,
        kind: FopKind,
        object: EntityId,
        pool_version: FvVersion,
        maps: &[PargrpIomap],
        rpc: &RpcConfig,
        transport: &dyn Transport,
        sink: &Arc<dyn IoEventSink>,
    ) -> Join {
        let max_segs = rpc.max_segments_per_fop.max(1);
        let per_buffer = rpc.max_segments_per_buffer.max(1);

        for treq in self.targets.values_mut() {
            for (range, parity) in treq.chunks(max_segs) {
                let id = FopId(NEXT_FOP_ID.fetch_add(1, Ordering::Relaxed));
                let segs = &treq.segs[range.clone()];

                let bulk: Vec<Range<usize>> = if kind.is_read() {
                    (range.start..range.end)
                        .step_by(per_buffer)
                        .map(|s| s..(s + per_buffer).min(range.end))
                        .collect()
                } else {
                    Vec::new()
                };
                let payload = if kind == FopKind::Write {
                    segs.iter()
                        .map(|s| Bytes::copy_from_slice(maps[s.map].stage(&s.seg)))
                        .collect()
                } else {
                    Vec::new()
                };
                let request = IoFopRequest {
                    fop: id,
                    kind,
                    target: treq.addr,
                    object,
                    pool_version,
                    segments: segs
                        .iter()
                        .map(|s| Segment {
                            offset: s.tgt_off,
                            len: s.len,
                        })
                        .collect(),
                    payload,
                    bulk: bulk.iter().map(ExactSizeIterator::len).collect(),
                };

                let nbulk = bulk.len() as u64;
                treq.fops.insert(
                    id,
                    IoFop {
                        kind,
                        segs: range,
                        bulk_done: vec![false; bulk.len()],
                        bulk,
                        replied: false,
                        released: false,
                        rc: None,
                    },
                );
                self.fop_index.insert(id, treq.addr.target);
                self.fan_in.post(nbulk);

                debug!(
                    "posting {} ({:?}, {} segments{}) to {}",
                    id,
                    kind,
                    request.segments.len(),
                    if parity { ", parity" } else { "" },
                    treq.addr.target
                );
                if let Err(e) = transport.post_io(request, Arc::clone(sink)) {
                    warn!("post of {} to {} failed: {}", id, treq.addr.target, e);
                    if let Some(fop) = treq.fops.get_mut(&id) {
                        fop.replied = true;
                        fop.released = true;
                        fop.rc = Some(e.clone());
                    }
                    self.fan_in.cancel(nbulk);
                    treq.rc.get_or_insert_with(|| e.clone());
                    self.rc.get_or_insert(e);
                }
            }
        }
        self.fan_in.arm()
    }

    fn fop_mut(&mut self, id: FopId) -> Option<(&mut TargetIoreq, FopId)> {
        let target = self.fop_index.get(&id)?;
        let treq = self.targets.get_mut(target)?;
        treq.fops.contains_key(&id).then_some((treq, id))
    }

    /// Segments of a bulk buffer that has not been accounted yet
    ///
    /// Marks the buffer done; `None` for unknown, released or repeated
    /// buffers. A fop that replied successfully keeps accepting its bulk
    /// until the last buffer is in.
    pub(crate) fn take_bulk(&mut self, id: FopId, buffer: usize) -> Option<Vec<TargetSeg>> {
        let (treq, id) = self.fop_mut(id)?;
        let fop = treq.fops.get_mut(&id)?;
        if fop.released || fop.bulk_done.get(buffer).is_none_or(|d| *d) {
            return None;
        }
        fop.bulk_done[buffer] = true;
        let range = fop.bulk[buffer].clone();
        Some(treq.segs[range].to_vec())
    }

    /// Remember a bulk failure until the fop settles
    pub(crate) fn fail_fop(&mut self, id: FopId, err: Error) {
        if let Some((treq, id)) = self.fop_mut(id)
            && let Some(fop) = treq.fops.get_mut(&id)
        {
            fop.rc.get_or_insert(err);
        }
    }

    /// Count a bulk buffer of `id` taken with [`NwXfer::take_bulk`]
    ///
    /// When the fop had already replied and this was its last buffer, the
    /// fop is released here and returned.
    pub(crate) fn bulk_done(&mut self, id: FopId) -> (Join, Option<FopDone>) {
        let settled = match self.fop_mut(id) {
            Some((treq, id))
                if treq.fops.get(&id).is_some_and(|f| {
                    f.replied && !f.released && f.bulk_done.iter().all(|d| *d)
                }) =>
            {
                Self::settle(treq, id)
            }
            _ => None,
        };
        if let Some(e) = settled.as_ref().and_then(|d| d.rc.as_ref()) {
            self.rc.get_or_insert_with(|| e.clone());
        }
        let join = self.fan_in.bulk_done();
        (join, settled.map(|done| FopDone { join, ..done }))
    }

    /// Handle a fop's reply
    ///
    /// A failed fop is released at once: its error goes into the sticky
    /// target and aggregate codes and its unreceived bulk is written off. A
    /// successful fop is released once its last bulk buffer is in, which may
    /// be now or in a later [`NwXfer::bulk_done`]. Returns `None` for a
    /// repeated or unknown reply.
    pub(crate) fn release(&mut self, id: FopId, rc: Option<Error>) -> Option<FopDone> {
        let (treq, id) = self.fop_mut(id)?;
        let fop = treq.fops.get_mut(&id)?;
        if fop.replied {
            return None;
        }
        fop.replied = true;
        if let Some(e) = rc {
            fop.rc.get_or_insert(e);
        }

        let (done, unreceived) = if fop.rc.is_some() {
            let unreceived = fop.bulk_done.iter().filter(|d| !**d).count() as u64;
            fop.bulk_done.iter_mut().for_each(|d| *d = true);
            (Self::settle(treq, id)?, unreceived)
        } else if fop.bulk_done.iter().all(|d| *d) {
            (Self::settle(treq, id)?, 0)
        } else {
            let done = FopDone {
                target: treq.addr,
                kind: fop.kind,
                segs: treq.segs[fop.segs.clone()].to_vec(),
                rc: None,
                join: Join::Pending,
            };
            (done, 0)
        };
        if let Some(e) = &done.rc {
            self.rc.get_or_insert_with(|| e.clone());
        }
        let join = self.fan_in.fop_done(unreceived);
        Some(FopDone { join, ..done })
    }

    /// Mark a fop released and fold its outcome into the target
    fn settle(treq: &mut TargetIoreq, id: FopId) -> Option<FopDone> {
        let fop = treq.fops.get_mut(&id)?;
        fop.released = true;
        let rc = fop.rc.clone();
        let kind = fop.kind;
        let segs = treq.segs[fop.segs.clone()].to_vec();
        match &rc {
            None => {
                for s in &segs {
                    if s.parity {
                        treq.parity_bytes += s.len;
                    } else {
                        treq.data_bytes += s.len;
                    }
                }
            }
            Some(e) => {
                treq.rc.get_or_insert_with(|| e.clone());
            }
        }
        Some(FopDone {
            target: treq.addr,
            kind,
            segs,
            rc,
            join: Join::Pending,
        })
    }
}
