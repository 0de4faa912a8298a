//! Per parity group I/O maps
//!
//! One [`PargrpIomap`] per parity group an operation touches. A map holds
//! the requested ranges ("spans") of its data units, per-unit staging
//! buffers, and the decision how parity gets updated:
//!
//! ```text
//!   Full       every data byte is written; parity = encode(new data)
//!   ReadOld    read old bytes of the spans + all parity; parity ^= encode(old ^ new)
//!   ReadRest   read the untouched bytes of the data units; parity = encode(merged)
//! ```
//!
//! Plans list the unit ranges a phase reads or writes. The network layer
//! turns them into target segments.

use stripeio_common::{Error, Result, TargetAddr, TargetId};
use stripeio_erasure::ParityCodec;
use stripeio_layout::StripeLayout;

/// How a write updates the parity of a group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RepairType {
    /// Reads and space management leave parity alone
    #[default]
    None,
    Full,
    ReadOld,
    ReadRest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MapState {
    #[default]
    Healthy,
    /// Some unit is served by a failed target
    Degraded,
}

/// Requested range of one data unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Span {
    pub unit: u32,
    /// Offset inside the unit
    pub off: u64,
    pub len: u64,
    /// Position in the operation's flat data stream
    pub buf_off: u64,
}

/// Which staging buffer of a unit a range lands in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StageBuf {
    /// Current (or new) contents of the unit
    Data,
    /// Pre-write contents of a ReadOld span
    Old,
}

/// One unit range to transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PlanSeg {
    pub unit: u32,
    pub off: u64,
    pub len: u64,
    pub buf: StageBuf,
}

#[derive(Debug, Default)]
struct UnitBuf {
    data: Vec<u8>,
    old: Vec<u8>,
    failed: bool,
}

fn zeroed(len: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| Error::OutOfMemory(format!("{len} byte staging buffer: {e}")))?;
    v.resize(len, 0);
    Ok(v)
}

/// Parity-group I/O map
#[derive(Debug)]
pub struct PargrpIomap {
    grpid: u64,
    rtype: RepairType,
    state: MapState,
    spans: Vec<Span>,
    units: Vec<UnitBuf>,
    targets: Vec<TargetAddr>,
    unit_size: u64,
    data_units: u32,
}

impl PargrpIomap {
    pub(crate) fn new(layout: &StripeLayout, grpid: u64, targets: Vec<TargetAddr>) -> Self {
        let width = layout.width() as usize;
        debug_assert_eq!(targets.len(), width);
        Self {
            grpid,
            rtype: RepairType::None,
            state: MapState::Healthy,
            spans: Vec::new(),
            units: (0..width).map(|_| UnitBuf::default()).collect(),
            targets,
            unit_size: layout.unit_size,
            data_units: layout.data_units,
        }
    }

    #[must_use]
    pub const fn grpid(&self) -> u64 {
        self.grpid
    }

    #[must_use]
    pub const fn repair_type(&self) -> RepairType {
        self.rtype
    }

    #[must_use]
    pub const fn state(&self) -> MapState {
        self.state
    }

    /// Targets of all units, data first
    #[must_use]
    pub fn targets(&self) -> &[TargetAddr] {
        &self.targets
    }

    pub(crate) fn target(&self, unit: u32) -> TargetAddr {
        self.targets[unit as usize]
    }

    pub(crate) fn unit_of_target(&self, target: TargetId) -> Option<u32> {
        self.targets
            .iter()
            .position(|t| t.target == target)
            .map(|u| u as u32)
    }

    pub(crate) fn add_span(&mut self, span: Span) {
        debug_assert!(span.off + span.len <= self.unit_size);
        self.spans.push(span);
    }

    /// Bytes the operation writes into this group
    #[must_use]
    pub fn touched(&self) -> u64 {
        self.spans.iter().map(|s| s.len).sum()
    }

    fn width(&self) -> u32 {
        self.units.len() as u32
    }

    fn is_parity(&self, unit: u32) -> bool {
        unit >= self.data_units
    }

    fn unit_touched(&self, unit: u32) -> u64 {
        self.spans.iter().filter(|s| s.unit == unit).map(|s| s.len).sum()
    }

    pub(crate) fn mark_failed(&mut self, unit: u32) {
        let u = &mut self.units[unit as usize];
        if !u.failed {
            u.failed = true;
            self.state = MapState::Degraded;
        }
    }

    #[must_use]
    pub fn failed_units(&self) -> Vec<u32> {
        (0..self.width())
            .filter(|&u| self.units[u as usize].failed)
            .collect()
    }

    fn is_failed(&self, unit: u32) -> bool {
        self.units[unit as usize].failed
    }

    /// Mark units on failed targets and pick the parity update mode
    ///
    /// With failed targets the mode is forced to one that reads no failed
    /// unit; the choice is never revisited afterwards.
    pub(crate) fn classify(
        &mut self,
        write: bool,
        tolerance: usize,
        is_failed: impl Fn(TargetId) -> bool,
    ) -> Result<()> {
        for unit in 0..self.width() {
            if is_failed(self.targets[unit as usize].target) {
                self.mark_failed(unit);
            }
        }
        let nfailed = self.failed_units().len();
        if nfailed > tolerance {
            return Err(Error::Io(format!(
                "group {} has {} failed units, tolerance is {}",
                self.grpid, nfailed, tolerance
            )));
        }
        if !write {
            return Ok(());
        }

        let group_size = self.unit_size * u64::from(self.data_units);
        let touched = self.touched();
        if touched == group_size {
            self.rtype = RepairType::Full;
            return Ok(());
        }

        let parity = u64::from(self.width() - self.data_units);
        let read_old = touched + parity * self.unit_size;
        let read_rest = group_size - touched;

        let old_ok = (0..self.width()).all(|u| {
            !self.is_failed(u) || !(self.is_parity(u) || self.unit_touched(u) > 0)
        });
        let rest_ok = (0..self.data_units)
            .all(|u| !self.is_failed(u) || self.unit_touched(u) == self.unit_size);

        self.rtype = match (old_ok, rest_ok) {
            (true, true) if read_rest < read_old => RepairType::ReadRest,
            (true, _) => RepairType::ReadOld,
            (false, true) => RepairType::ReadRest,
            (false, false) => {
                return Err(Error::Io(format!(
                    "group {}: no parity update mode avoids failed units {:?}",
                    self.grpid,
                    self.failed_units()
                )));
            }
        };
        Ok(())
    }

    /// Allocate the staging buffers a write needs and copy in new data
    pub(crate) fn stage_write(&mut self, flat: &[u8]) -> Result<()> {
        let size = self.unit_size as usize;
        for unit in 0..self.width() {
            let needed = match self.rtype {
                RepairType::None => false,
                RepairType::ReadOld => self.is_parity(unit) || self.unit_touched(unit) > 0,
                RepairType::Full | RepairType::ReadRest => true,
            };
            if needed {
                self.units[unit as usize].data = zeroed(size)?;
            }
            if self.rtype == RepairType::ReadOld && !self.is_parity(unit) && self.unit_touched(unit) > 0 {
                self.units[unit as usize].old = zeroed(size)?;
            }
        }
        for span in &self.spans {
            let src = &flat[span.buf_off as usize..(span.buf_off + span.len) as usize];
            let dst = &mut self.units[span.unit as usize].data;
            dst[span.off as usize..(span.off + span.len) as usize].copy_from_slice(src);
        }
        Ok(())
    }

    /// Allocate full-unit staging for every unit a read touches
    pub(crate) fn stage_read(&mut self) -> Result<()> {
        let size = self.unit_size as usize;
        let mut touched: Vec<u32> = self.spans.iter().map(|s| s.unit).collect();
        touched.dedup();
        for unit in touched {
            if self.units[unit as usize].data.is_empty() {
                self.units[unit as usize].data = zeroed(size)?;
            }
        }
        Ok(())
    }

    /// Allocate staging for every surviving unit before a degraded re-read
    pub(crate) fn stage_degraded(&mut self) -> Result<()> {
        let size = self.unit_size as usize;
        for u in &mut self.units {
            if u.data.is_empty() {
                u.data = zeroed(size)?;
            }
        }
        Ok(())
    }

    /// Ranges of a plain read; units on failed targets are left out
    pub(crate) fn read_plan(&self) -> Vec<PlanSeg> {
        self.spans
            .iter()
            .filter(|s| !self.is_failed(s.unit))
            .map(|s| PlanSeg {
                unit: s.unit,
                off: s.off,
                len: s.len,
                buf: StageBuf::Data,
            })
            .collect()
    }

    /// Ranges read before a partial write
    pub(crate) fn preread_plan(&self) -> Vec<PlanSeg> {
        let mut plan = Vec::new();
        match self.rtype {
            RepairType::ReadOld => {
                for s in &self.spans {
                    plan.push(PlanSeg {
                        unit: s.unit,
                        off: s.off,
                        len: s.len,
                        buf: StageBuf::Old,
                    });
                }
                for unit in self.data_units..self.width() {
                    plan.push(self.whole(unit));
                }
            }
            RepairType::ReadRest => {
                for unit in 0..self.data_units {
                    let mut pos = 0;
                    for s in self.spans.iter().filter(|s| s.unit == unit) {
                        if s.off > pos {
                            plan.push(PlanSeg {
                                unit,
                                off: pos,
                                len: s.off - pos,
                                buf: StageBuf::Data,
                            });
                        }
                        pos = s.off + s.len;
                    }
                    if pos < self.unit_size {
                        plan.push(PlanSeg {
                            unit,
                            off: pos,
                            len: self.unit_size - pos,
                            buf: StageBuf::Data,
                        });
                    }
                }
            }
            RepairType::None | RepairType::Full => {}
        }
        plan.sort_by_key(|p| (p.unit, p.off));
        plan
    }

    /// Ranges written: the new data and every parity unit in full
    ///
    /// Units on failed targets are skipped.
    pub(crate) fn write_plan(&self) -> Vec<PlanSeg> {
        let mut plan: Vec<PlanSeg> = self
            .spans
            .iter()
            .filter(|s| !self.is_failed(s.unit))
            .map(|s| PlanSeg {
                unit: s.unit,
                off: s.off,
                len: s.len,
                buf: StageBuf::Data,
            })
            .collect();
        for unit in self.data_units..self.width() {
            if !self.is_failed(unit) {
                plan.push(self.whole(unit));
            }
        }
        plan
    }

    /// Every surviving unit in full
    pub(crate) fn degraded_plan(&self) -> Vec<PlanSeg> {
        (0..self.width())
            .filter(|&u| !self.is_failed(u))
            .map(|u| self.whole(u))
            .collect()
    }

    /// Whole units for ALLOC/FREE; failed targets are skipped
    pub(crate) fn punch_plan(&self) -> Vec<PlanSeg> {
        self.degraded_plan()
    }

    const fn whole(&self, unit: u32) -> PlanSeg {
        PlanSeg {
            unit,
            off: 0,
            len: self.unit_size,
            buf: StageBuf::Data,
        }
    }

    /// Staging bytes of one unit range
    pub(crate) fn stage(&self, seg: &PlanSeg) -> &[u8] {
        let u = &self.units[seg.unit as usize];
        let buf = match seg.buf {
            StageBuf::Data => &u.data,
            StageBuf::Old => &u.old,
        };
        &buf[seg.off as usize..(seg.off + seg.len) as usize]
    }

    /// Store received bytes of one unit range
    pub(crate) fn store(&mut self, seg: &PlanSeg, bytes: &[u8]) {
        let u = &mut self.units[seg.unit as usize];
        let buf = match seg.buf {
            StageBuf::Data => &mut u.data,
            StageBuf::Old => &mut u.old,
        };
        buf[seg.off as usize..(seg.off + seg.len) as usize].copy_from_slice(bytes);
    }

    /// Compute new parity once all pre-read data is staged
    pub(crate) fn compute_parity(&mut self, codec: &ParityCodec) -> Result<()> {
        let n = self.data_units as usize;
        match self.rtype {
            RepairType::None => Ok(()),
            RepairType::Full | RepairType::ReadRest => {
                let data: Vec<&[u8]> = self.units[..n].iter().map(|u| u.data.as_slice()).collect();
                let parity = codec.encode(&data)?;
                for (u, p) in self.units[n..].iter_mut().zip(parity) {
                    u.data = p;
                }
                Ok(())
            }
            RepairType::ReadOld => {
                let size = self.unit_size as usize;
                let mut deltas = vec![Vec::new(); n];
                for (unit, delta) in deltas.iter_mut().enumerate() {
                    *delta = zeroed(size)?;
                    let u = &self.units[unit];
                    for s in self.spans.iter().filter(|s| s.unit as usize == unit) {
                        let r = s.off as usize..(s.off + s.len) as usize;
                        delta[r.clone()].copy_from_slice(&u.old[r.clone()]);
                        stripeio_erasure::xor_into(&mut delta[r.clone()], &u.data[r]);
                    }
                }
                let delta_refs: Vec<&[u8]> = deltas.iter().map(Vec::as_slice).collect();
                let mut parity: Vec<Vec<u8>> = self.units[n..]
                    .iter_mut()
                    .map(|u| std::mem::take(&mut u.data))
                    .collect();
                let applied = codec.apply_delta(&mut parity, &delta_refs);
                for (u, p) in self.units[n..].iter_mut().zip(parity) {
                    u.data = p;
                }
                applied.map_err(Into::into)
            }
        }
    }

    /// Rebuild failed units from the surviving ones
    pub(crate) fn reconstruct(&mut self, codec: &ParityCodec) -> Result<()> {
        let mut units: Vec<Option<Vec<u8>>> = self
            .units
            .iter_mut()
            .map(|u| (!u.failed).then(|| std::mem::take(&mut u.data)))
            .collect();
        codec.reconstruct(&mut units)?;
        for (u, rebuilt) in self.units.iter_mut().zip(units) {
            u.data = rebuilt.unwrap_or_default();
        }
        Ok(())
    }

    /// Copy the spans out of staging into the operation's flat buffer
    pub(crate) fn copy_out(&self, flat: &mut [u8]) {
        for s in &self.spans {
            let src = &self.units[s.unit as usize].data[s.off as usize..(s.off + s.len) as usize];
            flat[s.buf_off as usize..(s.buf_off + s.len) as usize].copy_from_slice(src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use stripeio_common::{LayoutId, ServiceId};

    const U: u64 = 1024;

    fn layout() -> StripeLayout {
        StripeLayout::new(LayoutId::new(1), U, 4, 2)
    }

    fn map() -> PargrpIomap {
        let targets = (0..6)
            .map(|i| TargetAddr {
                target: TargetId::new(i),
                service: ServiceId::new(1 + i),
            })
            .collect();
        PargrpIomap::new(&layout(), 0, targets)
    }

    fn span(unit: u32, off: u64, len: u64, buf_off: u64) -> Span {
        Span {
            unit,
            off,
            len,
            buf_off,
        }
    }

    #[test]
    fn test_full_stripe_is_full() {
        let mut m = map();
        for u in 0..4 {
            m.add_span(span(u, 0, U, u64::from(u) * U));
        }
        m.classify(true, 2, |_| false).unwrap();
        assert_eq!(m.repair_type(), RepairType::Full);
        assert!(m.preread_plan().is_empty());
        assert_eq!(m.write_plan().len(), 6);
    }

    #[test]
    fn test_small_write_reads_old() {
        // ro = 512 + 2U, rr = 4U - 512: read-old is cheaper
        let mut m = map();
        m.add_span(span(1, 0, 512, 0));
        m.classify(true, 2, |_| false).unwrap();
        assert_eq!(m.repair_type(), RepairType::ReadOld);
        let plan = m.preread_plan();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].buf, StageBuf::Old);
        assert!(plan[1..].iter().all(|p| p.len == U && p.unit >= 4));
    }

    #[test]
    fn test_large_write_reads_rest() {
        // three full units: ro = 3U + 2U, rr = U
        let mut m = map();
        for u in 0..3 {
            m.add_span(span(u, 0, U, u64::from(u) * U));
        }
        m.classify(true, 2, |_| false).unwrap();
        assert_eq!(m.repair_type(), RepairType::ReadRest);
        let plan = m.preread_plan();
        assert_eq!(
            plan,
            vec![PlanSeg {
                unit: 3,
                off: 0,
                len: U,
                buf: StageBuf::Data
            }]
        );
    }

    #[test]
    fn test_failed_parity_forces_read_rest() {
        let mut m = map();
        m.add_span(span(1, 0, 512, 0));
        m.classify(true, 2, |t| t == TargetId::new(5)).unwrap();
        assert_eq!(m.repair_type(), RepairType::ReadRest);
        assert_eq!(m.state(), MapState::Degraded);
        assert!(m.write_plan().iter().all(|p| p.unit != 5));
    }

    #[test]
    fn test_no_feasible_mode() {
        // unit 1 half-written and failed: read-old needs its old bytes,
        // read-rest needs its other half
        let mut m = map();
        m.add_span(span(1, 0, 512, 0));
        let err = m.classify(true, 2, |t| t == TargetId::new(1)).unwrap_err();
        assert_eq!(err.errno(), Error::Io(String::new()).errno());
    }

    #[test]
    fn test_too_many_failures() {
        let mut m = map();
        m.add_span(span(0, 0, 512, 0));
        assert!(m.classify(false, 2, |t| t.get() < 3).is_err());
    }

    #[test]
    fn test_read_old_parity_matches_full_encode() {
        let codec = ParityCodec::new(4, 2, U as usize).unwrap();
        let mut rng = rand::thread_rng();
        let mut old: Vec<Vec<u8>> = (0..4)
            .map(|_| {
                let mut v = vec![0u8; U as usize];
                rng.fill_bytes(&mut v);
                v
            })
            .collect();
        let refs: Vec<&[u8]> = old.iter().map(Vec::as_slice).collect();
        let old_parity = codec.encode(&refs).unwrap();

        let mut new = vec![0u8; 256];
        rng.fill_bytes(&mut new);

        let mut m = map();
        m.add_span(span(2, 100, 256, 0));
        m.classify(true, 2, |_| false).unwrap();
        assert_eq!(m.repair_type(), RepairType::ReadOld);
        m.stage_write(&new).unwrap();
        for p in m.preread_plan() {
            let bytes = if p.unit < 4 {
                old[p.unit as usize][p.off as usize..(p.off + p.len) as usize].to_vec()
            } else {
                old_parity[p.unit as usize - 4].clone()
            };
            m.store(&p, &bytes);
        }
        m.compute_parity(&codec).unwrap();

        old[2][100..356].copy_from_slice(&new);
        let refs: Vec<&[u8]> = old.iter().map(Vec::as_slice).collect();
        let expected = codec.encode(&refs).unwrap();
        for (i, p) in expected.iter().enumerate() {
            let seg = m.whole(4 + i as u32);
            assert_eq!(m.stage(&seg), p.as_slice());
        }
    }

    #[test]
    fn test_reconstruct_restores_failed_data() {
        let codec = ParityCodec::new(4, 2, U as usize).unwrap();
        let mut rng = rand::thread_rng();
        let data: Vec<Vec<u8>> = (0..4)
            .map(|_| {
                let mut v = vec![0u8; U as usize];
                rng.fill_bytes(&mut v);
                v
            })
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let parity = codec.encode(&refs).unwrap();

        let mut m = map();
        m.add_span(span(1, 0, U, 0));
        m.classify(false, 2, |_| false).unwrap();
        m.mark_failed(1);
        m.stage_degraded().unwrap();
        for p in m.degraded_plan() {
            let src = if p.unit < 4 {
                &data[p.unit as usize]
            } else {
                &parity[p.unit as usize - 4]
            };
            m.store(&p, src);
        }
        m.reconstruct(&codec).unwrap();
        let mut out = vec![0u8; U as usize];
        m.copy_out(&mut out);
        assert_eq!(out, data[1]);
    }
}
