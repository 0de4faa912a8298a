//! IO operations on objects
//!
//! ```text
//!   READ   Reading ─► ReadComplete ─► ReqComplete
//!             └─(failed targets)─► DegradedReading ─► ReadComplete ─► ReqComplete
//!   WRITE  [Reading (pre-read) ─► ReadComplete ─►] Writing ─► WriteComplete ─► ReqComplete
//!   ALLOC/FREE                                     Writing ─► WriteComplete ─► ReqComplete
//! ```
//!
//! Writes on groups with units on failed targets go out as
//! `DegradedWriting` and skip those units. Reads recover from targets that
//! fail mid-flight by re-reading every surviving unit of the affected
//! groups and reconstructing the rest.

mod fop;
pub mod iomap;
mod join;
mod xfer;

pub use iomap::{MapState, PargrpIomap, RepairType};

use crate::client::Client;
use crate::op::{Op, OpCode, OpKind, Progress};
use crate::sync::PendingTx;
use crate::transport::{FopKind, IoEventSink, Transport};
use fop::FopSink;
use iomap::Span;
use join::Join;
use std::collections::BTreeSet;
use std::sync::Arc;
use stripeio_common::config::MIN_BLOCK_SHIFT;
use stripeio_common::{BufVec, Error, Extent, IndexVec, Result, TargetId};
use stripeio_erasure::ParityCodec;
use stripeio_layout::LayoutInstance;
use tracing::{debug, info, warn};
use xfer::NwXfer;

/// What an IO operation does
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoOpcode {
    Read,
    Write,
    /// Preallocate whole parity groups around the extents
    Alloc,
    /// Deallocate the parity groups the extents fully cover
    Free,
}

impl IoOpcode {
    #[must_use]
    pub const fn code(self) -> OpCode {
        match self {
            Self::Read => OpCode::Read,
            Self::Write => OpCode::Write,
            Self::Alloc => OpCode::Alloc,
            Self::Free => OpCode::Free,
        }
    }

    const fn carries_data(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

/// State of the IO request machine inside an operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IoReqState {
    #[default]
    Uninitialised,
    Initialised,
    Reading,
    Writing,
    DegradedReading,
    DegradedWriting,
    ReadComplete,
    WriteComplete,
    ReqComplete,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Read,
    /// Reads feeding a partial-group parity update
    PreRead,
    Write,
    Punch,
    DegradedRead,
}

/// Map of one group as the operation last saw it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapTrace {
    pub group: u64,
    pub repair: RepairType,
    pub state: MapState,
}

/// One round of fops
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseTrace {
    pub state: IoReqState,
    /// Targets that got a request, ascending
    pub targets: Vec<TargetId>,
    pub fops: usize,
    pub data_bytes: u64,
    pub parity_bytes: u64,
}

/// Record of how an IO operation was mapped and distributed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoTrace {
    pub maps: Vec<MapTrace>,
    pub phases: Vec<PhaseTrace>,
    pub degraded_groups: Vec<u64>,
}

/// Targets an operation has seen fail, bounded by the pool tolerance
#[derive(Debug)]
pub(crate) struct FailedTargets {
    limit: usize,
    targets: BTreeSet<TargetId>,
}

impl FailedTargets {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            limit,
            targets: BTreeSet::new(),
        }
    }

    pub(crate) fn insert(&mut self, target: TargetId) -> Result<()> {
        self.targets.insert(target);
        if self.targets.len() > self.limit {
            return Err(Error::Io(format!(
                "{} failed targets exceed tolerance {}",
                self.targets.len(),
                self.limit
            )));
        }
        Ok(())
    }
}

/// Extent in sorted order with its position in the submitted data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SortedExtent {
    pub ext: Extent,
    pub buf_off: u64,
}

/// Check an IO request against the rules for its opcode
pub(crate) fn validate(
    opcode: IoOpcode,
    ext: &IndexVec,
    data: &BufVec,
    attr: &BufVec,
    mask: u64,
    block_shift: u32,
) -> Result<()> {
    if block_shift < MIN_BLOCK_SHIFT || block_shift >= 64 {
        return Err(Error::invalid_argument(format!("block shift {block_shift} out of range")));
    }
    if mask != 0 || !attr.is_empty() {
        return Err(Error::invalid_argument("block attributes are not supported"));
    }
    if ext.is_empty() {
        return Err(Error::invalid_argument("empty extent list"));
    }
    let bs = 1u64 << block_shift;
    for e in ext.iter() {
        if e.count == 0 || e.offset % bs != 0 || e.count % bs != 0 {
            return Err(Error::invalid_argument(format!(
                "extent [{}, +{}) is not aligned to {} byte blocks",
                e.offset, e.count, bs
            )));
        }
        if e.offset.checked_add(e.count).is_none() {
            return Err(Error::invalid_argument("extent overflows the object"));
        }
    }
    if opcode.carries_data() {
        if data.total() != ext.total() {
            return Err(Error::invalid_argument(format!(
                "data holds {} bytes, extents cover {}",
                data.total(),
                ext.total()
            )));
        }
    } else if !data.is_empty() {
        return Err(Error::invalid_argument(format!("{opcode:?} takes no data")));
    }
    Ok(())
}

/// Sort extents by offset, carrying each one's data position along
///
/// Overlapping extents are rejected.
pub(crate) fn sort_extents(ext: &IndexVec) -> Result<Vec<SortedExtent>> {
    let mut buf_off = 0;
    let mut sorted: Vec<SortedExtent> = ext
        .iter()
        .map(|e| {
            let s = SortedExtent { ext: *e, buf_off };
            buf_off += e.count;
            s
        })
        .collect();
    sorted.sort_by_key(|s| (s.ext.offset, s.ext.count));
    for w in sorted.windows(2) {
        if w[0].ext.end() > w[1].ext.offset {
            return Err(Error::invalid_argument(format!(
                "extents [{}, +{}) and [{}, +{}) overlap",
                w[0].ext.offset, w[0].ext.count, w[1].ext.offset, w[1].ext.count
            )));
        }
    }
    Ok(sorted)
}

/// Collaborators an IO operation talks to
pub(crate) struct IoCtx {
    pub client: Client,
    pub transport: Arc<dyn Transport>,
    /// Ledger of the object the operation works on
    pub entity_ledger: Arc<PendingTx>,
    /// Ledger of the operation itself
    pub op_ledger: Arc<PendingTx>,
}

/// What the application asked for
pub(crate) struct IoRequest {
    pub opcode: IoOpcode,
    pub ext: IndexVec,
    pub data: BufVec,
    pub attr: BufVec,
    pub mask: u64,
    pub block_shift: u32,
}

/// Kind-specific state of an IO operation
pub(crate) struct IoOp {
    opcode: IoOpcode,
    ctx: IoCtx,
    instance: LayoutInstance,
    codec: ParityCodec,
    /// Application buffers; filled in place by a read
    data: BufVec,
    maps: Vec<PargrpIomap>,
    xfer: NwXfer,
    state: IoReqState,
    phase: Phase,
    failed: FailedTargets,
    /// First error no recovery path can absorb
    fatal: Option<Error>,
    trace: IoTrace,
}

impl IoOp {
    /// Validate a request and build its parity-group maps
    pub(crate) fn new(req: IoRequest, instance: LayoutInstance, ctx: IoCtx) -> Result<Self> {
        validate(req.opcode, &req.ext, &req.data, &req.attr, req.mask, req.block_shift)?;
        let extents = sort_extents(&req.ext)?;
        let layout = *instance.layout();
        let codec = ParityCodec::new(
            layout.data_units as usize,
            layout.parity_units as usize,
            layout.unit_size as usize,
        )?;

        let mut maps: Vec<PargrpIomap> = Vec::new();
        match req.opcode {
            IoOpcode::Read | IoOpcode::Write => {
                for s in &extents {
                    let mut pos = s.ext.offset;
                    let mut buf_off = s.buf_off;
                    let end = s.ext.end();
                    while pos < end {
                        let p = layout.locate(pos);
                        let len = (layout.unit_size - p.offset).min(end - pos);
                        if maps.last().is_none_or(|m| m.grpid() != p.group) {
                            maps.push(PargrpIomap::new(&layout, p.group, instance.group_targets(p.group)));
                        }
                        if let Some(map) = maps.last_mut() {
                            map.add_span(Span {
                                unit: p.unit,
                                off: p.offset,
                                len,
                                buf_off,
                            });
                        }
                        pos += len;
                        buf_off += len;
                    }
                }
            }
            IoOpcode::Alloc | IoOpcode::Free => {
                let g = layout.group_size();
                let mut groups = BTreeSet::new();
                for s in &extents {
                    let range = if req.opcode == IoOpcode::Alloc {
                        s.ext.offset / g..s.ext.end().div_ceil(g)
                    } else {
                        s.ext.offset.div_ceil(g)..s.ext.end() / g
                    };
                    groups.extend(range);
                }
                maps.extend(
                    groups
                        .into_iter()
                        .map(|grp| PargrpIomap::new(&layout, grp, instance.group_targets(grp))),
                );
            }
        }

        let tolerance = instance.tolerance();
        let machine = instance.pool().machine();
        let mut failed = FailedTargets::new(tolerance);
        let write = req.opcode == IoOpcode::Write;
        let flat = if write { req.data.to_flat() } else { Vec::new() };
        for map in &mut maps {
            map.classify(write, tolerance, |t| machine.is_failed(t))?;
            for u in map.failed_units() {
                failed.insert(map.target(u).target)?;
            }
            match req.opcode {
                IoOpcode::Write => map.stage_write(&flat)?,
                IoOpcode::Read => map.stage_read()?,
                IoOpcode::Alloc | IoOpcode::Free => {}
            }
        }

        debug!(
            "{:?} on {}: {} extents, {} groups",
            req.opcode,
            instance.object(),
            extents.len(),
            maps.len()
        );
        let mut op = Self {
            opcode: req.opcode,
            ctx,
            instance,
            codec,
            data: req.data,
            maps,
            xfer: NwXfer::default(),
            state: IoReqState::Initialised,
            phase: Phase::Read,
            failed,
            fatal: None,
            trace: IoTrace::default(),
        };
        op.refresh_trace();
        Ok(op)
    }

    #[must_use]
    pub(crate) const fn state(&self) -> IoReqState {
        self.state
    }

    pub(crate) const fn trace(&self) -> &IoTrace {
        &self.trace
    }

    /// Filled buffers of a completed read
    pub(crate) fn data(&self) -> Option<BufVec> {
        (self.opcode == IoOpcode::Read && self.state == IoReqState::ReqComplete).then(|| self.data.clone())
    }

    pub(crate) fn launch(&mut self, op: &Op) -> Progress {
        let first = match self.opcode {
            IoOpcode::Read => Phase::Read,
            IoOpcode::Write
                if self
                    .maps
                    .iter()
                    .any(|m| matches!(m.repair_type(), RepairType::ReadOld | RepairType::ReadRest)) =>
            {
                Phase::PreRead
            }
            IoOpcode::Write => {
                if let Err(e) = self.compute_parity() {
                    return self.fail(e);
                }
                Phase::Write
            }
            IoOpcode::Alloc | IoOpcode::Free => Phase::Punch,
        };
        self.start(op, first)
    }

    fn compute_parity(&mut self) -> Result<()> {
        for map in &mut self.maps {
            map.compute_parity(&self.codec)?;
        }
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Progress {
        self.state = IoReqState::Failed;
        Progress::Failed(err)
    }

    fn refresh_trace(&mut self) {
        self.trace.maps = self
            .maps
            .iter()
            .map(|m| MapTrace {
                group: m.grpid(),
                repair: m.repair_type(),
                state: m.state(),
            })
            .collect();
    }

    /// Distribute and post one phase
    fn start(&mut self, op: &Op, phase: Phase) -> Progress {
        self.xfer.reset();
        self.phase = phase;
        let degraded = self.maps.iter().any(|m| m.state() == MapState::Degraded);
        self.state = match phase {
            Phase::Read | Phase::PreRead => IoReqState::Reading,
            Phase::DegradedRead => IoReqState::DegradedReading,
            Phase::Write | Phase::Punch if degraded => IoReqState::DegradedWriting,
            Phase::Write | Phase::Punch => IoReqState::Writing,
        };

        let layout = *self.instance.layout();
        match phase {
            Phase::Read => self.xfer.distribute(&layout, &self.maps, PargrpIomap::read_plan),
            Phase::PreRead => self.xfer.distribute(&layout, &self.maps, PargrpIomap::preread_plan),
            Phase::Write => self.xfer.distribute(&layout, &self.maps, PargrpIomap::write_plan),
            Phase::Punch => self.xfer.distribute(&layout, &self.maps, PargrpIomap::punch_plan),
            Phase::DegradedRead => self.xfer.distribute(&layout, &self.maps, |m| {
                if m.state() == MapState::Degraded {
                    m.degraded_plan()
                } else {
                    Vec::new()
                }
            }),
        }

        let kind = match phase {
            Phase::Read | Phase::PreRead | Phase::DegradedRead => FopKind::Read,
            Phase::Write => FopKind::Write,
            Phase::Punch if self.opcode == IoOpcode::Alloc => FopKind::Alloc,
            Phase::Punch => FopKind::Free,
        };
        let sink: Arc<dyn IoEventSink> = Arc::new(FopSink::new(op.clone()));
        let join = self.xfer.launch(
            kind,
            self.instance.object(),
            self.instance.pool().machine().version(),
            &self.maps,
            &self.ctx.client.config().rpc,
            self.ctx.transport.as_ref(),
            &sink,
        );
        self.trace.phases.push(PhaseTrace {
            state: self.state,
            targets: self.xfer.target_ids(),
            fops: self.xfer.fop_count(),
            data_bytes: 0,
            parity_bytes: 0,
        });
        debug!(
            "op {} {:?}: {} fops to {} targets",
            op.id(),
            self.state,
            self.xfer.fop_count(),
            self.xfer.target_ids().len()
        );
        if join == Join::Complete {
            self.joined(op);
        }
        Progress::Pending
    }

    /// The barrier fired: flip to the complete state and queue the handler
    fn joined(&mut self, op: &Op) {
        self.state = match self.state {
            IoReqState::Reading | IoReqState::DegradedReading => IoReqState::ReadComplete,
            _ => IoReqState::WriteComplete,
        };
        let queued = op.post(|op| {
            op.drive(|kind, op| match kind {
                OpKind::Io(io) => io.phase_complete(op),
                _ => Progress::Pending,
            });
        });
        if !queued {
            warn!("op {}: locality gone before {:?} was handled", op.id(), self.state);
        }
    }

    fn phase_complete(&mut self, op: &Op) -> Progress {
        if !matches!(self.state, IoReqState::ReadComplete | IoReqState::WriteComplete) {
            return Progress::Pending;
        }
        let bytes = self.xfer.bytes();
        if let Some(p) = self.trace.phases.last_mut() {
            p.data_bytes = bytes.data;
            p.parity_bytes = bytes.parity;
        }
        self.refresh_trace();

        if let Some(e) = self.fatal.clone() {
            return self.fail(e);
        }
        if self.phase == Phase::Read && self.maps.iter().any(|m| m.state() == MapState::Degraded) {
            return self.enter_degraded(op);
        }
        if let Some(e) = self.xfer.rc().cloned() {
            return self.fail(e);
        }

        match self.phase {
            Phase::Read => self.finish_read(),
            Phase::DegradedRead => {
                let rebuilt = self
                    .maps
                    .iter_mut()
                    .filter(|m| m.state() == MapState::Degraded)
                    .try_for_each(|m| m.reconstruct(&self.codec));
                if let Err(e) = rebuilt {
                    return self.fail(e);
                }
                self.finish_read()
            }
            Phase::PreRead => {
                if let Err(e) = self.compute_parity() {
                    return self.fail(e);
                }
                self.start(op, Phase::Write)
            }
            Phase::Write | Phase::Punch => {
                self.state = IoReqState::ReqComplete;
                Progress::Executed
            }
        }
    }

    fn enter_degraded(&mut self, op: &Op) -> Progress {
        let mut groups = Vec::new();
        let staged = self
            .maps
            .iter_mut()
            .filter(|m| m.state() == MapState::Degraded)
            .try_for_each(|m| {
                groups.push(m.grpid());
                m.stage_degraded()
            });
        if let Err(e) = staged {
            return self.fail(e);
        }
        info!(
            "op {}: degraded read of {} groups on {}",
            op.id(),
            groups.len(),
            self.instance.object()
        );
        self.trace.degraded_groups = groups;
        self.start(op, Phase::DegradedRead)
    }

    fn finish_read(&mut self) -> Progress {
        let total = self.data.total() as usize;
        let mut flat = Vec::new();
        if let Err(e) = flat.try_reserve_exact(total) {
            return self.fail(Error::OutOfMemory(format!("{total} byte read result: {e}")));
        }
        flat.resize(total, 0);
        for map in &self.maps {
            map.copy_out(&mut flat);
        }
        self.data.fill_from(&flat);
        self.state = IoReqState::ReqComplete;
        Progress::Executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn ext(v: &[(u64, u64)]) -> IndexVec {
        v.iter().copied().collect()
    }

    #[test]
    fn test_validate_alignment_and_lengths() {
        let data = BufVec::alloc(1, 8192);
        let none = BufVec::new();
        let e = ext(&[(0, 4096), (8192, 4096)]);
        validate(IoOpcode::Write, &e, &data, &none, 0, 12).unwrap();

        let unaligned = ext(&[(100, 4096)]);
        assert!(validate(IoOpcode::Write, &unaligned, &BufVec::alloc(1, 4096), &none, 0, 12).is_err());
        assert!(validate(IoOpcode::Write, &ext(&[(0, 0)]), &none, &none, 0, 12).is_err());
        assert!(validate(IoOpcode::Read, &e, &BufVec::alloc(1, 4096), &none, 0, 12).is_err());
        assert!(validate(IoOpcode::Read, &e, &data, &none, 1, 12).is_err());
        assert!(validate(IoOpcode::Read, &e, &data, &none, 0, 8).is_err());
        assert!(validate(IoOpcode::Read, &IndexVec::new(), &none, &none, 0, 12).is_err());
    }

    #[test]
    fn test_alloc_takes_no_data() {
        let none = BufVec::new();
        let e = ext(&[(0, 4096)]);
        validate(IoOpcode::Alloc, &e, &none, &none, 0, 12).unwrap();
        let err = validate(IoOpcode::Free, &e, &BufVec::alloc(1, 4096), &none, 0, 12).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_sort_keeps_data_positions() {
        let sorted = sort_extents(&ext(&[(8192, 4096), (0, 8192), (16384, 4096)])).unwrap();
        let got: Vec<(u64, u64)> = sorted.iter().map(|s| (s.ext.offset, s.buf_off)).collect();
        assert_eq!(got, vec![(0, 4096), (8192, 0), (16384, 12288)]);
    }

    #[test]
    fn test_sort_rejects_overlap() {
        assert!(sort_extents(&ext(&[(0, 8192), (4096, 4096)])).is_err());
    }

    #[test]
    fn test_sort_is_order_independent() {
        let mut rng = rand::thread_rng();
        let mut input: Vec<(u64, u64)> = (0..64).map(|i| (i * 3 * 4096, 4096 * (1 + i % 2))).collect();
        let expected: Vec<u64> = input.iter().map(|e| e.0).collect();
        for _ in 0..20 {
            input.shuffle(&mut rng);
            let sorted = sort_extents(&ext(&input)).unwrap();
            let offs: Vec<u64> = sorted.iter().map(|s| s.ext.offset).collect();
            assert_eq!(offs, expected);
            assert!(sorted.windows(2).all(|w| w[0].ext.end() < w[1].ext.offset + 1));
        }
    }

    #[test]
    fn test_failed_targets_bounded() {
        let mut f = FailedTargets::new(1);
        f.insert(TargetId::new(3)).unwrap();
        f.insert(TargetId::new(3)).unwrap();
        assert!(f.insert(TargetId::new(4)).is_err());
    }
}
