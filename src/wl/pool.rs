//! In-memory PEB bookkeeping: the registry, the four erase-counter
//! orderings and the protection queue.
//!
//! Every known PEB has exactly one [`PebEntry`] here, and the entry is in
//! exactly one place at any time, tracked by its [`Location`] tag. Sets are
//! ordered by `(ec, pnum)`; the `pnum` tiebreaker makes keys unique, so the
//! same PEB can never appear twice. All operations are pure in-memory and
//! infallible apart from lookups.

use std::collections::BTreeSet;

use crate::Error;

/// The four ordered multisets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetKind {
    Free,
    Used,
    Scrub,
    Erroneous,
}

/// Where a PEB entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    Free,
    Used,
    Scrub,
    Erroneous,
    /// Parked in protection-queue slot `.0`.
    Protected(usize),
    /// Source of the in-flight move.
    MoveFrom,
    /// Target of the in-flight move.
    MoveTo,
    /// Owned by a pending or executing erase work.
    ErasePending,
    /// Pinned by the on-flash attach index; not movable by us.
    Fastmap,
    /// In transition between owners. Never observable outside the WL lock.
    Detached,
}

impl Location {
    fn set_kind(self) -> Option<SetKind> {
        match self {
            Location::Free => Some(SetKind::Free),
            Location::Used => Some(SetKind::Used),
            Location::Scrub => Some(SetKind::Scrub),
            Location::Erroneous => Some(SetKind::Erroneous),
            _ => None,
        }
    }
}

/// Per-PEB record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PebEntry {
    pub pnum: u32,
    pub ec: u64,
    #[cfg(feature = "read-counter")]
    pub rc: u64,
    pub location: Location,
}

pub(crate) struct PebPool {
    entries: Vec<Option<PebEntry>>,
    free: BTreeSet<(u64, u32)>,
    used: BTreeSet<(u64, u32)>,
    scrub: BTreeSet<(u64, u32)>,
    erroneous: BTreeSet<(u64, u32)>,
    pq: Vec<Vec<u32>>,
    pq_head: usize,
    free_count: usize,
    erroneous_count: usize,
    pub max_ec: u64,
}

impl PebPool {
    pub fn new(peb_count: usize, prot_queue_len: usize) -> Self {
        Self {
            entries: vec![None; peb_count],
            free: BTreeSet::new(),
            used: BTreeSet::new(),
            scrub: BTreeSet::new(),
            erroneous: BTreeSet::new(),
            pq: vec![Vec::new(); prot_queue_len],
            pq_head: 0,
            free_count: 0,
            erroneous_count: 0,
            max_ec: 0,
        }
    }

    fn set(&self, kind: SetKind) -> &BTreeSet<(u64, u32)> {
        match kind {
            SetKind::Free => &self.free,
            SetKind::Used => &self.used,
            SetKind::Scrub => &self.scrub,
            SetKind::Erroneous => &self.erroneous,
        }
    }

    fn set_mut(&mut self, kind: SetKind) -> &mut BTreeSet<(u64, u32)> {
        match kind {
            SetKind::Free => &mut self.free,
            SetKind::Used => &mut self.used,
            SetKind::Scrub => &mut self.scrub,
            SetKind::Erroneous => &mut self.erroneous,
        }
    }

    pub fn entry(&self, pnum: u32) -> Option<&PebEntry> {
        self.entries.get(pnum as usize)?.as_ref()
    }

    fn entry_mut(&mut self, pnum: u32) -> Option<&mut PebEntry> {
        self.entries.get_mut(pnum as usize)?.as_mut()
    }

    pub fn location(&self, pnum: u32) -> Option<Location> {
        self.entry(pnum).map(|e| e.location)
    }

    pub fn ec(&self, pnum: u32) -> Option<u64> {
        self.entry(pnum).map(|e| e.ec)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PebEntry> {
        self.entries.iter().flatten()
    }

    pub fn free_count(&self) -> usize {
        debug_assert_eq!(self.free_count, self.free.len());
        self.free_count
    }

    pub fn erroneous_count(&self) -> usize {
        debug_assert_eq!(self.erroneous_count, self.erroneous.len());
        self.erroneous_count
    }

    pub fn is_empty(&self, kind: SetKind) -> bool {
        self.set(kind).is_empty()
    }

    /// Register a new entry discovered at attach (or created for a move
    /// target). The entry lands directly in `location`.
    pub fn attach(&mut self, pnum: u32, ec: u64, location: Location) -> Result<(), Error> {
        let slot = self
            .entries
            .get_mut(pnum as usize)
            .ok_or(Error::OutOfRange)?;
        if slot.is_some() {
            return Err(Error::Invariant);
        }
        *slot = Some(PebEntry {
            pnum,
            ec,
            #[cfg(feature = "read-counter")]
            rc: 0,
            location: Location::Detached,
        });
        if ec > self.max_ec {
            self.max_ec = ec;
        }
        match location {
            Location::Detached => Ok(()),
            Location::Protected(_) => {
                self.place_protected(pnum);
                Ok(())
            }
            loc => match loc.set_kind() {
                Some(kind) => {
                    self.place_set(pnum, kind);
                    Ok(())
                }
                None => {
                    self.mark(pnum, loc);
                    Ok(())
                }
            },
        }
    }

    /// Remove an entry from whatever currently contains it. The entry stays
    /// registered, tagged `Detached`.
    pub fn detach(&mut self, pnum: u32) -> Result<(), Error> {
        let entry = *self.entry(pnum).ok_or(Error::NotFound)?;
        match entry.location {
            Location::Detached => return Err(Error::Invariant),
            Location::Protected(slot) => {
                self.pq[slot].retain(|&p| p != pnum);
            }
            loc => {
                if let Some(kind) = loc.set_kind() {
                    let removed = self.set_mut(kind).remove(&(entry.ec, pnum));
                    debug_assert!(removed);
                    match kind {
                        SetKind::Free => self.free_count -= 1,
                        SetKind::Erroneous => self.erroneous_count -= 1,
                        _ => {}
                    }
                }
            }
        }
        self.entry_mut(pnum).unwrap().location = Location::Detached;
        Ok(())
    }

    /// Insert a detached entry into one of the ordered sets.
    pub fn place_set(&mut self, pnum: u32, kind: SetKind) {
        let entry = *self.entry(pnum).expect("placing unknown PEB");
        assert_eq!(entry.location, Location::Detached);
        let inserted = self.set_mut(kind).insert((entry.ec, pnum));
        debug_assert!(inserted);
        match kind {
            SetKind::Free => self.free_count += 1,
            SetKind::Erroneous => self.erroneous_count += 1,
            _ => {}
        }
        self.entry_mut(pnum).unwrap().location = match kind {
            SetKind::Free => Location::Free,
            SetKind::Used => Location::Used,
            SetKind::Scrub => Location::Scrub,
            SetKind::Erroneous => Location::Erroneous,
        };
    }

    /// Park a detached entry in the protection queue, in the slot right
    /// behind the head so it waits a full cycle before becoming movable.
    pub fn place_protected(&mut self, pnum: u32) {
        let entry = *self.entry(pnum).expect("protecting unknown PEB");
        assert_eq!(entry.location, Location::Detached);
        let tail = (self.pq_head + self.pq.len() - 1) % self.pq.len();
        self.pq[tail].push(pnum);
        self.entry_mut(pnum).unwrap().location = Location::Protected(tail);
        log::debug!("added PEB {} EC {} to the protection queue", pnum, entry.ec);
    }

    /// Tag a detached entry with a non-structural owner.
    pub fn mark(&mut self, pnum: u32, location: Location) {
        debug_assert!(matches!(
            location,
            Location::MoveFrom | Location::MoveTo | Location::ErasePending | Location::Fastmap
        ));
        let entry = self.entry_mut(pnum).expect("marking unknown PEB");
        assert_eq!(entry.location, Location::Detached);
        entry.location = location;
    }

    /// Drop an entry from the registry entirely. Used when a PEB goes bad or
    /// at shutdown; the entry must not be inside a structure.
    pub fn destroy(&mut self, pnum: u32) -> Result<(), Error> {
        match self.location(pnum) {
            None => return Err(Error::NotFound),
            Some(Location::Detached) => {}
            Some(_) => self.detach(pnum)?,
        }
        self.entries[pnum as usize] = None;
        Ok(())
    }

    /// Update the erase counter of an entry that is currently outside every
    /// ordered set (set keys are immutable while inserted).
    pub fn set_ec(&mut self, pnum: u32, ec: u64) {
        let entry = self.entry_mut(pnum).expect("unknown PEB");
        debug_assert!(entry.location.set_kind().is_none());
        entry.ec = ec;
        #[cfg(feature = "read-counter")]
        {
            entry.rc = 0;
        }
        if ec > self.max_ec {
            self.max_ec = ec;
        }
    }

    #[cfg(feature = "read-counter")]
    pub fn note_read(&mut self, pnum: u32) {
        if let Some(entry) = self.entry_mut(pnum) {
            entry.rc += 1;
        }
    }

    /// Smallest `(ec, pnum)` of a set.
    pub fn first(&self, kind: SetKind) -> Option<(u64, u32)> {
        self.set(kind).first().copied()
    }

    /// Largest `(ec, pnum)` of a set.
    pub fn last(&self, kind: SetKind) -> Option<(u64, u32)> {
        self.set(kind).last().copied()
    }

    /// The entry with the largest erase counter strictly below
    /// `min_ec + diff`. When `hold_anchor` is set and the best candidate
    /// could serve as a fastmap anchor, the second-best is preferred so the
    /// anchor PEB stays available.
    pub fn find_closest(
        &self,
        kind: SetKind,
        diff: u64,
        hold_anchor: bool,
        fm_max_start: u32,
    ) -> Option<(u64, u32)> {
        let set = self.set(kind);
        let &(min_ec, _) = set.first()?;
        let max = min_ec.saturating_add(diff);
        let mut below = set.range(..(max, u32::MIN)).rev();
        let best = below.next().copied()?;
        if hold_anchor && best.1 < fm_max_start {
            if let Some(&second) = below.next() {
                return Some(second);
            }
        }
        Some(best)
    }

    /// A medium-wear free entry for handing out: the middle of the free set
    /// when its spread is small, otherwise the entry closest to
    /// `min + free_max_diff/2`.
    pub fn find_mean_free(
        &self,
        free_max_diff: u64,
        hold_anchor: bool,
        fm_max_start: u32,
    ) -> Option<(u64, u32)> {
        let first = self.first(SetKind::Free)?;
        let last = self.last(SetKind::Free)?;
        if last.0 - first.0 < free_max_diff {
            let mid = *self.free.iter().nth(self.free.len() / 2)?;
            if hold_anchor && mid.1 < fm_max_start {
                return self
                    .free
                    .iter()
                    .rev()
                    .find(|&&(_, pnum)| pnum >= fm_max_start)
                    .copied()
                    .or(Some(mid));
            }
            Some(mid)
        } else {
            self.find_closest(SetKind::Free, free_max_diff / 2, hold_anchor, fm_max_start)
        }
    }

    /// Whether the free set still holds a PEB usable as a fastmap anchor.
    pub fn has_anchor_free(&self, fm_max_start: u32) -> bool {
        self.free.iter().any(|&(_, pnum)| pnum < fm_max_start)
    }

    /// The lowest-numbered used PEB inside the anchor range.
    pub fn lowest_used_in_anchor(&self, fm_max_start: u32) -> Option<(u64, u32)> {
        self.used
            .iter()
            .filter(|&&(_, pnum)| pnum < fm_max_start)
            .min_by_key(|&&(_, pnum)| pnum)
            .copied()
    }

    /// One global erase cycle has finished: release the PEBs whose
    /// protection expired into `used`, then advance the head.
    pub fn prot_advance(&mut self) {
        let head = self.pq_head;
        let expired = std::mem::take(&mut self.pq[head]);
        for pnum in expired {
            let entry = self.entry_mut(pnum).expect("protected PEB vanished");
            debug_assert_eq!(entry.location, Location::Protected(head));
            entry.location = Location::Detached;
            log::debug!("PEB {pnum} protection over, move to used");
            self.place_set(pnum, SetKind::Used);
        }
        self.pq_head = (head + 1) % self.pq.len();
    }
}
