//! Fan-in barrier of a network transfer
//!
//! Counts fops posted but not replied (`iofop_nr`) and read bulk buffers
//! posted but not received (`rdbulk_nr`). The barrier completes exactly
//! once: the first time both counts are zero after it has been armed. It
//! has its own lock, separate from the operation state, so transport-side
//! bookkeeping never waits on a handler.

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Counters {
    iofop_nr: u64,
    rdbulk_nr: u64,
    armed: bool,
    fired: bool,
}

impl Counters {
    fn check(&mut self) -> Join {
        if self.armed && !self.fired && self.iofop_nr == 0 && self.rdbulk_nr == 0 {
            self.fired = true;
            Join::Complete
        } else {
            Join::Pending
        }
    }
}

/// Outcome of a barrier update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Join {
    Pending,
    /// This update was the one that completed the barrier
    Complete,
}

#[derive(Debug, Default)]
pub(crate) struct FanIn {
    inner: Mutex<Counters>,
}

impl FanIn {
    /// Account a fop about to be posted, with its read bulk buffers
    pub(crate) fn post(&self, bulk: u64) {
        let mut c = self.inner.lock();
        debug_assert!(!c.fired, "post after completion");
        c.iofop_nr += 1;
        c.rdbulk_nr += bulk;
    }

    /// Undo [`FanIn::post`] for a fop the transport refused
    pub(crate) fn cancel(&self, bulk: u64) -> Join {
        let mut c = self.inner.lock();
        c.iofop_nr -= 1;
        c.rdbulk_nr -= bulk;
        c.check()
    }

    /// A fop was replied to
    ///
    /// `unreceived` bulk buffers of a failed read fop will never arrive and
    /// are written off here.
    pub(crate) fn fop_done(&self, unreceived: u64) -> Join {
        let mut c = self.inner.lock();
        debug_assert!(c.iofop_nr > 0, "reply without a posted fop");
        c.iofop_nr = c.iofop_nr.saturating_sub(1);
        c.rdbulk_nr = c.rdbulk_nr.saturating_sub(unreceived);
        c.check()
    }

    /// One read bulk buffer completed
    pub(crate) fn bulk_done(&self) -> Join {
        let mut c = self.inner.lock();
        if !c.fired && c.rdbulk_nr > 0 {
            c.rdbulk_nr -= 1;
        }
        c.check()
    }

    /// All fops of the phase are posted; completion may fire from now on
    pub(crate) fn arm(&self) -> Join {
        let mut c = self.inner.lock();
        c.armed = true;
        c.check()
    }

    /// Start a new phase
    pub(crate) fn reset(&self) {
        *self.inner.lock() = Counters::default();
    }

    /// `(iofop_nr, rdbulk_nr)`
    pub(crate) fn outstanding(&self) -> (u64, u64) {
        let c = self.inner.lock();
        (c.iofop_nr, c.rdbulk_nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fires_only_when_armed() {
        let f = FanIn::default();
        f.post(0);
        assert_eq!(f.fop_done(0), Join::Pending);
        assert_eq!(f.arm(), Join::Complete);
        assert_eq!(f.arm(), Join::Pending);
    }

    #[test]
    fn test_waits_for_bulk_after_reply() {
        let f = FanIn::default();
        f.post(2);
        assert_eq!(f.arm(), Join::Pending);
        assert_eq!(f.bulk_done(), Join::Pending);
        assert_eq!(f.fop_done(0), Join::Pending);
        assert_eq!(f.outstanding(), (0, 1));
        assert_eq!(f.bulk_done(), Join::Complete);
        // late duplicates change nothing
        assert_eq!(f.bulk_done(), Join::Pending);
        assert_eq!(f.outstanding(), (0, 0));
    }

    #[test]
    fn test_failed_fop_writes_off_bulk() {
        let f = FanIn::default();
        f.post(3);
        f.post(1);
        f.arm();
        assert_eq!(f.bulk_done(), Join::Pending);
        assert_eq!(f.fop_done(2), Join::Pending);
        assert_eq!(f.cancel(1), Join::Complete);
    }

    #[test]
    fn test_reset_starts_new_phase() {
        let f = FanIn::default();
        f.arm();
        f.reset();
        f.post(0);
        assert_eq!(f.arm(), Join::Pending);
        assert_eq!(f.fop_done(0), Join::Complete);
    }

    #[test]
    fn test_concurrent_completion_fires_once() {
        const TARGETS: u64 = 8;
        const FOPS: u64 = 64;
        const BULK: u64 = 3;

        let f = Arc::new(FanIn::default());
        for _ in 0..TARGETS * FOPS {
            f.post(BULK);
        }
        f.arm();

        let fired = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..TARGETS)
            .map(|_| {
                let f = Arc::clone(&f);
                let fired = Arc::clone(&fired);
                std::thread::spawn(move || {
                    for _ in 0..FOPS {
                        for _ in 0..BULK {
                            if f.bulk_done() == Join::Complete {
                                fired.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        if f.fop_done(0) == Join::Complete {
                            fired.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(f.outstanding(), (0, 0));
    }
}
