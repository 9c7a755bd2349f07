//! The wear-leveling core.
//!
//! From this module's perspective all physical eraseblocks are either free
//! or in use. Free PEBs are handed out through [`UbiWl::get_peb`]; used PEBs
//! come back through [`UbiWl::put_peb`] and are erased asynchronously by the
//! background worker. Wear-leveling moves the contents of low-erase-counter
//! used PEBs onto high-erase-counter free PEBs, and scrubbing reuses the
//! same machinery to rewrite PEBs that developed bit-flips.
//!
//! Freshly handed-out PEBs park in a protection queue for a number of global
//! erase cycles before the wear-leveling worker may move them: the user is
//! probably still filling them, and may well put them back right away.
//!
//! Locking: all bookkeeping lives under one mutex (`state`), taken briefly
//! and never across I/O. A move holds `move_mutex` for its whole duration so
//! that putters of the PEB under move can wait on it. The single PEB-sized
//! scratch buffer has its own lock, and `fm_eba_sem` is read-held whenever
//! picking a free PEB must pair atomically with an EBA update.

mod pool;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::conso::LebDesc;
use crate::eba::{Eba, Fastmap, LebCopyError, SqnumSource, Volumes};
use crate::io::{FlashIo, IoError, VidRead};
use crate::work::{Work, WorkEngine, WorkKind};
use crate::{Config, Error};

pub(crate) use pool::{Location, PebPool, SetKind};

/// One PEB as reported by the attach scan.
#[derive(Debug, Clone, Copy)]
pub struct PebScan {
    pub pnum: u32,
    pub ec: u64,
}

/// A PEB holding data, as reported by the attach scan.
#[derive(Debug, Clone, Copy)]
pub struct UsedPebScan {
    pub pnum: u32,
    pub ec: u64,
    /// Bit-flips were seen while scanning; schedule for scrubbing.
    pub scrub: bool,
    /// The PEB hosts several LEBs packed together.
    pub consolidated: bool,
}

/// One mapped LEB, as reported by the attach scan. `peb_pos` is the LEB's
/// slot within its (possibly consolidated) host PEB.
#[derive(Debug, Clone, Copy)]
pub struct LebScan {
    pub vol_id: u32,
    pub lnum: u32,
    pub pnum: u32,
    pub peb_pos: usize,
}

/// Everything the attach scan learned that the wear-leveling core needs.
#[derive(Debug, Clone, Default)]
pub struct AttachInfo {
    pub max_ec: u64,
    pub avail_pebs: usize,
    pub beb_rsvd_pebs: usize,
    pub bad_peb_count: usize,
    pub erase: Vec<PebScan>,
    pub free: Vec<PebScan>,
    pub used: Vec<UsedPebScan>,
    pub lebs: Vec<LebScan>,
    pub fastmap: Vec<PebScan>,
}

/// Outcome of [`UbiWl::bitflip_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitflipStatus {
    /// No bit-flips were found.
    Clean,
    /// The PEB has been queued for scrubbing (or erasure, if it was free).
    Scrubbing,
}

/// Per-PEB statistics. `rc` is `None` unless the `read-counter` feature is
/// enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PebStats {
    pub pnum: u32,
    pub ec: u64,
    pub rc: Option<u64>,
}

/// A free PEB handed out by [`UbiWl::get_peb`].
///
/// Holds the fastmap-EBA read lock until dropped, so the caller's EBA update
/// pairs atomically with the pick.
pub struct PebClaim<'a> {
    pnum: u32,
    _fm: RwLockReadGuard<'a, ()>,
}

impl PebClaim<'_> {
    pub fn pnum(&self) -> u32 {
        self.pnum
    }
}

pub(crate) struct WlState {
    pub pool: PebPool,
    pub move_from: Option<u32>,
    pub move_to: Option<u32>,
    pub move_to_put: bool,
    pub wl_scheduled: bool,
    pub conso_scheduled: bool,
    pub avail_pebs: usize,
    pub rsvd_pebs: usize,
    pub beb_rsvd_pebs: usize,
    pub bad_peb_count: usize,
    pub good_peb_count: usize,
}

impl WlState {
    pub fn enough_free(&self, min_limit: usize) -> bool {
        self.pool.free_count() > min_limit
    }
}

#[derive(Default)]
struct CancelMove {
    protect: bool,
    erroneous: bool,
    torture: bool,
}

enum MoveResult {
    Moved,
    Cancel(CancelMove),
    Fatal(Error),
}

/// The wear-leveling engine of one device.
pub struct UbiWl {
    pub(crate) cfg: Config,
    pub(crate) io: Arc<dyn FlashIo>,
    pub(crate) eba: Arc<dyn Eba>,
    pub(crate) volumes: Arc<dyn Volumes>,
    pub(crate) seq: Arc<dyn SqnumSource>,
    pub(crate) fastmap: Option<Arc<dyn Fastmap>>,
    pub(crate) state: Mutex<WlState>,
    pub(crate) engine: WorkEngine,
    /// Held for the whole duration of a move, I/O included.
    move_mutex: Mutex<()>,
    /// The single PEB-sized scratch buffer.
    pub(crate) peb_buf: Mutex<Vec<u8>>,
    /// `pnum -> LEB slots` for PEBs hosting packed LEBs. Slot `None` means
    /// that LEB has been invalidated.
    pub(crate) conso: Mutex<HashMap<u32, Vec<Option<LebDesc>>>>,
    /// FIFO of fully-written single-host LEBs, candidates for packing.
    pub(crate) full: Mutex<VecDeque<LebDesc>>,
    /// Read-held while "pick a free PEB" must pair with "update EBA".
    fm_eba_sem: RwLock<()>,
    pub(crate) conso_threshold: usize,
    ro_mode: AtomicBool,
    bgt: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UbiWl {
    /// Build the engine from the attach scan, reserve PEBs, schedule the
    /// initial erases and wear-leveling, and start the background thread.
    pub fn init(
        cfg: Config,
        attach: AttachInfo,
        io: Arc<dyn FlashIo>,
        eba: Arc<dyn Eba>,
        volumes: Arc<dyn Volumes>,
        seq: Arc<dyn SqnumSource>,
        fastmap: Option<Arc<dyn Fastmap>>,
    ) -> Result<Arc<Self>, Error> {
        cfg.validate()?;

        let mut pool = PebPool::new(cfg.peb_count as usize, cfg.prot_queue_len);
        pool.max_ec = attach.max_ec;
        let mut conso = HashMap::new();
        let mut erase_list = Vec::new();
        let mut found = 0usize;

        for peb in &attach.erase {
            pool.attach(peb.pnum, peb.ec, Location::ErasePending)?;
            erase_list.push(peb.pnum);
            found += 1;
        }
        for peb in &attach.free {
            pool.attach(peb.pnum, peb.ec, Location::Free)?;
            found += 1;
        }
        for peb in &attach.used {
            let loc = if peb.scrub {
                Location::Scrub
            } else {
                Location::Used
            };
            log::debug!("add PEB {} EC {} from the attach scan", peb.pnum, peb.ec);
            pool.attach(peb.pnum, peb.ec, loc)?;
            if peb.consolidated && cfg.lebs_per_cpeb > 1 {
                conso.insert(peb.pnum, vec![None; cfg.lebs_per_cpeb]);
            }
            found += 1;
        }
        for leb in &attach.lebs {
            if let Some(slots) = conso.get_mut(&leb.pnum) {
                let slot = slots.get_mut(leb.peb_pos).ok_or(Error::Invariant)?;
                *slot = Some(LebDesc {
                    vol_id: leb.vol_id,
                    lnum: leb.lnum,
                });
            }
        }
        for peb in &attach.fastmap {
            pool.attach(peb.pnum, peb.ec, Location::Fastmap)?;
            found += 1;
        }
        log::debug!("found {found} PEBs");

        let mut avail = attach.avail_pebs;
        let mut rsvd = 0usize;
        let mut reserved = cfg.reserved_pebs;
        if let Some(fm) = &fastmap {
            fm.init(&mut reserved);
        }
        if cfg.lebs_per_cpeb > 1 {
            reserved += cfg.conso_reserved_pebs;
        }
        if avail < reserved {
            log::error!("not enough physical eraseblocks ({avail}, need {reserved})");
            return Err(Error::NoSpace);
        }
        avail -= reserved;
        rsvd += reserved;
        let conso_threshold = std::cmp::max((avail + rsvd) / 3, cfg.lebs_per_cpeb);

        let dev = Arc::new(Self {
            io,
            eba,
            volumes,
            seq,
            fastmap,
            state: Mutex::new(WlState {
                pool,
                move_from: None,
                move_to: None,
                move_to_put: false,
                wl_scheduled: false,
                conso_scheduled: false,
                avail_pebs: avail,
                rsvd_pebs: rsvd,
                beb_rsvd_pebs: attach.beb_rsvd_pebs,
                bad_peb_count: attach.bad_peb_count,
                good_peb_count: found,
            }),
            engine: WorkEngine::new(),
            move_mutex: Mutex::new(()),
            peb_buf: Mutex::new(vec![0u8; cfg.peb_size]),
            conso: Mutex::new(conso),
            full: Mutex::new(VecDeque::new()),
            fm_eba_sem: RwLock::new(()),
            conso_threshold,
            ro_mode: AtomicBool::new(false),
            bgt: Mutex::new(None),
            cfg,
        });

        for pnum in erase_list {
            dev.schedule_erase(pnum, false);
        }
        dev.ensure_wl()?;

        let worker = Arc::clone(&dev);
        let handle = thread::Builder::new()
            .name("ubi_bgt".into())
            .spawn(move || worker.worker_loop())
            .map_err(|_| Error::Io(IoError::NoMem))?;
        *dev.bgt.lock() = Some(handle);

        Ok(dev)
    }

    /// Shut the engine down: stop the background thread and drain every
    /// pending work, completing each with `error` (or success if `None`).
    pub fn close(&self, error: Option<Error>) {
        log::debug!("close the wear-leveling engine");
        if let Some(fm) = &self.fastmap {
            fm.close();
        }
        self.engine.disable();
        self.engine.stop();
        if let Some(handle) = self.bgt.lock().take() {
            let _ = handle.join();
        }
        self.shutdown_works(error);
        self.full.lock().clear();
        self.conso.lock().clear();
    }

    fn shutdown_works(&self, error: Option<Error>) {
        for wrk in self.engine.drain() {
            let _ = self.run_work(&wrk.kind, true);
            wrk.complete(match &error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            });
        }
    }

    fn worker_loop(self: Arc<Self>) {
        log::info!("background thread started");
        let mut failures = 0u32;
        while let Some(wrk) = self.engine.next(&self.ro_mode) {
            let res = self.run_work(&wrk.kind, false);
            let failed = res.is_err();
            if let Err(err) = &res {
                log::error!("work failed with error {err}");
            }
            self.engine.finish(&wrk, res);
            if failed {
                failures += 1;
                if failures > self.cfg.work_max_failures {
                    log::error!("{failures} consecutive failures, switching to read-only mode");
                    self.shutdown_works(Some(Error::ReadOnly));
                    self.set_ro();
                    self.engine.disable();
                }
            } else {
                failures = 0;
            }
        }
        log::debug!("background thread exiting");
    }

    fn run_work(&self, kind: &WorkKind, shutdown: bool) -> Result<(), Error> {
        match *kind {
            WorkKind::Erase { pnum, torture } => {
                if shutdown {
                    log::debug!("cancel erasure of PEB {pnum}");
                    let _ = self.state.lock().pool.destroy(pnum);
                    Ok(())
                } else {
                    self.do_sync_erase(pnum, torture)
                }
            }
            WorkKind::WearLevel { anchor } => {
                if shutdown {
                    Ok(())
                } else {
                    self.wear_leveling_worker(anchor)
                }
            }
            WorkKind::Consolidate => {
                if shutdown {
                    Ok(())
                } else {
                    self.consolidation_worker()
                }
            }
        }
    }

    pub(crate) fn schedule_work(&self, wrk: Arc<Work>) {
        if let Err(wrk) = self.engine.schedule(wrk) {
            // Engine already closed: run the shutdown cleanup ourselves and
            // fail any waiter.
            let _ = self.run_work(&wrk.kind, true);
            wrk.complete(Err(Error::ReadOnly));
        }
    }

    /// Queue an erase of a detached PEB entry.
    pub(crate) fn schedule_erase(&self, pnum: u32, torture: bool) {
        assert!(
            !self.has_live_conso(pnum),
            "erasing PEB {pnum} which still hosts live packed LEBs"
        );
        {
            let mut st = self.state.lock();
            match st.pool.location(pnum) {
                Some(Location::Detached) => st.pool.mark(pnum, Location::ErasePending),
                Some(Location::ErasePending) => {}
                loc => panic!("PEB {pnum} in {loc:?} cannot be queued for erase"),
            }
        }
        log::debug!("schedule erasure of PEB {pnum}, torture {torture}");
        self.schedule_work(Work::new(WorkKind::Erase { pnum, torture }));
    }

    /// Erase one PEB, write its new EC header and return it to the free
    /// pool; on media failure mark it bad and draw from the reserve.
    fn do_sync_erase(&self, pnum: u32, torture: bool) -> Result<(), Error> {
        assert!(
            !self.has_live_conso(pnum),
            "erasing PEB {pnum} which still hosts live packed LEBs"
        );
        match self.sync_erase(pnum, torture) {
            Ok(()) => {
                {
                    let mut st = self.state.lock();
                    st.pool.detach(pnum)?;
                    st.pool.place_set(pnum, SetKind::Free);
                }
                // One more erase cycle has happened; age the protection
                // queue and re-check the wear-leveling trigger.
                self.state.lock().pool.prot_advance();
                self.ensure_wl()
            }
            Err(err) => self.erase_failed(pnum, err),
        }
    }

    fn sync_erase(&self, pnum: u32, torture: bool) -> Result<(), Error> {
        let ec = self.state.lock().pool.ec(pnum).ok_or(Error::NotFound)?;
        log::debug!("erase PEB {pnum}, old EC {ec}");
        if self.cfg.extra_checks {
            self.self_check_ec(pnum, ec)?;
        }
        let cycles = self.io.sync_erase(pnum, torture)?;
        let ec = ec + cycles;
        if ec > self.cfg.max_erase_counter {
            log::error!("erase counter overflow at PEB {pnum}, EC {ec}");
            return Err(Error::EcOverflow);
        }
        self.io.write_ec_hdr(pnum, &self.cfg.ec_header(ec))?;
        log::debug!("erased PEB {pnum}, new EC {ec}");
        self.state.lock().pool.set_ec(pnum, ec);
        Ok(())
    }

    fn self_check_ec(&self, pnum: u32, ec: u64) -> Result<(), Error> {
        match self.io.read_ec_hdr(pnum) {
            Ok(Some(hdr)) if hdr.ec != ec && hdr.ec.saturating_sub(ec) > 1 => {
                log::error!(
                    "self-check failed for PEB {pnum}: read EC is {}, should be {ec}",
                    hdr.ec
                );
                Err(Error::Invariant)
            }
            // The header does not have to exist, and a read failure here is
            // not this path's problem.
            _ => Ok(()),
        }
    }

    fn erase_failed(&self, pnum: u32, err: Error) -> Result<(), Error> {
        log::warn!("failed to erase PEB {pnum}: {err}");
        if let Error::Io(io_err) = err {
            if io_err.is_transient() {
                self.schedule_erase(pnum, true);
                return Err(err);
            }
            if io_err == IoError::Io {
                let _ = self.state.lock().pool.destroy(pnum);
                if !self.cfg.bad_allowed {
                    log::error!("bad physical eraseblock {pnum} detected");
                    self.set_ro();
                    return Err(err);
                }
                return self.mark_peb_bad(pnum, err);
            }
        }
        // Scheduling this PEB for erasure again would fail the same way.
        let _ = self.state.lock().pool.destroy(pnum);
        self.set_ro();
        Err(err)
    }

    fn mark_peb_bad(&self, pnum: u32, err: Error) -> Result<(), Error> {
        let mut available_consumed = false;
        {
            let mut st = self.state.lock();
            if st.beb_rsvd_pebs == 0 {
                if st.avail_pebs == 0 {
                    drop(st);
                    log::error!("no reserved/available physical eraseblocks");
                    self.set_ro();
                    return Err(err);
                }
                st.avail_pebs -= 1;
                available_consumed = true;
            }
        }
        log::info!("mark PEB {pnum} as bad");
        if let Err(io_err) = self.io.mark_bad(pnum) {
            if available_consumed {
                self.state.lock().avail_pebs += 1;
            }
            self.set_ro();
            return Err(Error::Io(io_err));
        }
        let mut st = self.state.lock();
        if st.beb_rsvd_pebs > 0 {
            if available_consumed {
                // The reserve grew since we last checked.
                st.avail_pebs += 1;
                available_consumed = false;
            }
            st.beb_rsvd_pebs -= 1;
        }
        st.bad_peb_count += 1;
        st.good_peb_count -= 1;
        if available_consumed {
            log::warn!("no PEBs in the reserved pool, used an available PEB");
        } else if st.beb_rsvd_pebs > 0 {
            log::info!("{} PEBs left in the reserve", st.beb_rsvd_pebs);
        } else {
            log::warn!("last PEB from the reserve was used");
        }
        Ok(())
    }

    /// Schedule one wear-leveling pass if it is needed and none is pending:
    /// either the scrub set is non-empty, or the erase-counter spread
    /// between the most worn free PEB (within bounds) and the least worn
    /// used PEB exceeds the threshold.
    pub fn ensure_wl(&self) -> Result<(), Error> {
        {
            let mut st = self.state.lock();
            if st.wl_scheduled {
                return Ok(());
            }
            if st.pool.is_empty(SetKind::Scrub) {
                if st.pool.is_empty(SetKind::Used) || st.pool.is_empty(SetKind::Free) {
                    return Ok(());
                }
                let (used_ec, _) = st.pool.first(SetKind::Used).ok_or(Error::Invariant)?;
                let Some((free_ec, _)) = st.pool.find_closest(
                    SetKind::Free,
                    self.cfg.free_max_diff(),
                    self.hold_anchor(),
                    self.cfg.fm_max_start,
                ) else {
                    return Ok(());
                };
                if free_ec.saturating_sub(used_ec) < self.cfg.wl_threshold {
                    return Ok(());
                }
                log::debug!("schedule wear-leveling");
            } else {
                log::debug!("schedule scrubbing");
            }
            st.wl_scheduled = true;
        }
        self.schedule_work(Work::new(WorkKind::WearLevel { anchor: false }));
        Ok(())
    }

    fn hold_anchor(&self) -> bool {
        self.fastmap.is_some()
    }

    /// Take a suitable move target out of the free set, leaving headroom
    /// for consolidation.
    fn take_peb_for_wl(&self, st: &mut WlState) -> Option<(u64, u32)> {
        if st.pool.free_count() <= self.cfg.conso_reserved_pebs {
            return None;
        }
        let e = st.pool.find_closest(
            SetKind::Free,
            self.cfg.free_max_diff(),
            self.hold_anchor(),
            self.cfg.fm_max_start,
        )?;
        st.pool.detach(e.1).ok()?;
        Some(e)
    }

    /// One wear-leveling pass: pick source and target, copy through the EBA
    /// layer, and sort both PEBs into their new homes. Every copy outcome,
    /// success or not, leaves both PEBs accounted for.
    fn wear_leveling_worker(&self, anchor: bool) -> Result<(), Error> {
        let _move_guard = self.move_mutex.lock();
        let mut scrubbing = false;

        let (e1, e2) = {
            let mut st = self.state.lock();
            assert!(st.move_from.is_none() && st.move_to.is_none());
            assert!(!st.move_to_put);

            if st.pool.is_empty(SetKind::Free)
                || (st.pool.is_empty(SetKind::Used) && st.pool.is_empty(SetKind::Scrub))
            {
                // Free PEBs are all waiting to be erased, or used PEBs are
                // all under protection. The trigger fires again later.
                log::debug!(
                    "cancel WL, a pool is empty: free {}, used {}",
                    st.pool.is_empty(SetKind::Free),
                    st.pool.is_empty(SetKind::Used)
                );
                st.wl_scheduled = false;
                return Ok(());
            }

            let need_anchor = self.fastmap.is_some()
                && (anchor || !st.pool.has_anchor_free(self.cfg.fm_max_start));

            let (e1, e2);
            if need_anchor {
                // Produce a free PEB inside the anchor range for the
                // on-flash index.
                let Some(src) = st.pool.lowest_used_in_anchor(self.cfg.fm_max_start) else {
                    st.wl_scheduled = false;
                    return Ok(());
                };
                let Some(dst) = self.take_peb_for_wl(&mut st) else {
                    st.wl_scheduled = false;
                    return Ok(());
                };
                st.pool.detach(src.1)?;
                log::debug!("anchor-move PEB {} to PEB {}", src.1, dst.1);
                (e1, e2) = (src, dst);
            } else if st.pool.is_empty(SetKind::Scrub) {
                let src = st.pool.first(SetKind::Used).ok_or(Error::Invariant)?;
                let Some(dst) = self.take_peb_for_wl(&mut st) else {
                    st.wl_scheduled = false;
                    return Ok(());
                };
                if dst.0.saturating_sub(src.0) < self.cfg.wl_threshold {
                    log::debug!("no WL needed: min used EC {}, max free EC {}", src.0, dst.0);
                    st.pool.place_set(dst.1, SetKind::Free);
                    st.wl_scheduled = false;
                    return Ok(());
                }
                st.pool.detach(src.1)?;
                log::debug!(
                    "move PEB {} EC {} to PEB {} EC {}",
                    src.1,
                    src.0,
                    dst.1,
                    dst.0
                );
                (e1, e2) = (src, dst);
            } else {
                scrubbing = true;
                let src = st.pool.first(SetKind::Scrub).ok_or(Error::Invariant)?;
                let Some(dst) = self.take_peb_for_wl(&mut st) else {
                    st.wl_scheduled = false;
                    return Ok(());
                };
                st.pool.detach(src.1)?;
                log::debug!("scrub PEB {} to PEB {}", src.1, dst.1);
                (e1, e2) = (src, dst);
            }
            st.pool.mark(e1.1, Location::MoveFrom);
            st.pool.mark(e2.1, Location::MoveTo);
            st.move_from = Some(e1.1);
            st.move_to = Some(e2.1);
            (e1, e2)
        };

        match self.execute_move(e1.1, e2.1, &mut scrubbing) {
            MoveResult::Moved => {
                if scrubbing {
                    log::info!("scrubbed PEB {}, data moved to PEB {}", e1.1, e2.1);
                }
                {
                    // A packed source carries its LEB slots over to the
                    // target; the source is about to be erased.
                    let mut conso = self.conso.lock();
                    if let Some(slots) = conso.remove(&e1.1) {
                        conso.insert(e2.1, slots);
                    }
                }
                let erase_target = {
                    let mut st = self.state.lock();
                    let erase_target = st.move_to_put;
                    st.pool.detach(e2.1)?;
                    if erase_target {
                        // The target was put while we were moving; it is
                        // not needed anymore.
                        st.pool.mark(e2.1, Location::ErasePending);
                    } else {
                        st.pool.place_set(e2.1, SetKind::Used);
                    }
                    st.pool.detach(e1.1)?;
                    st.pool.mark(e1.1, Location::ErasePending);
                    st.move_from = None;
                    st.move_to = None;
                    st.move_to_put = false;
                    st.wl_scheduled = false;
                    erase_target
                };
                if let Err(err) = self.do_sync_erase(e1.1, false) {
                    if erase_target {
                        let _ = self.state.lock().pool.destroy(e2.1);
                    }
                    self.set_ro();
                    return Err(err);
                }
                if erase_target {
                    log::debug!("PEB {} was put meanwhile, erase", e2.1);
                    if let Err(err) = self.do_sync_erase(e2.1, false) {
                        self.set_ro();
                        return Err(err);
                    }
                }
                log::debug!("done");
                Ok(())
            }
            MoveResult::Cancel(cancel) => {
                log::debug!("cancel moving PEB {} to PEB {}", e1.1, e2.1);
                let mut fatal = None;
                {
                    let mut st = self.state.lock();
                    if cancel.erroneous
                        && st.pool.erroneous_count() > self.cfg.max_erroneous
                    {
                        log::error!(
                            "too many erroneous eraseblocks ({})",
                            st.pool.erroneous_count()
                        );
                        fatal = Some(Error::TooManyErroneous);
                    } else {
                        assert!(!st.move_to_put);
                        st.pool.detach(e1.1)?;
                        if cancel.protect {
                            st.pool.place_protected(e1.1);
                        } else if cancel.erroneous {
                            st.pool.place_set(e1.1, SetKind::Erroneous);
                        } else if scrubbing {
                            st.pool.place_set(e1.1, SetKind::Scrub);
                        } else {
                            st.pool.place_set(e1.1, SetKind::Used);
                        }
                        st.pool.detach(e2.1)?;
                        st.pool.mark(e2.1, Location::ErasePending);
                        st.move_from = None;
                        st.move_to = None;
                        st.wl_scheduled = false;
                    }
                }
                if let Some(err) = fatal {
                    return self.move_fatal(e1.1, e2.1, err);
                }
                // The target is erased on every cancel outcome; its content
                // is not trusted.
                if let Err(err) = self.do_sync_erase(e2.1, cancel.torture) {
                    self.set_ro();
                    return Err(err);
                }
                Ok(())
            }
            MoveResult::Fatal(err) => self.move_fatal(e1.1, e2.1, err),
        }
    }

    fn move_fatal(&self, src: u32, dst: u32, err: Error) -> Result<(), Error> {
        log::error!("error {err} while moving PEB {src} to PEB {dst}");
        {
            let mut st = self.state.lock();
            st.move_from = None;
            st.move_to = None;
            st.move_to_put = false;
            st.wl_scheduled = false;
            let _ = st.pool.destroy(src);
            let _ = st.pool.destroy(dst);
        }
        self.set_ro();
        Err(err)
    }

    fn execute_move(&self, src: u32, dst: u32, scrubbing: &mut bool) -> MoveResult {
        // We do not yet know which LEB(s) the source hosts; read the volume
        // identifier header(s) first. The source cannot be unmapped under
        // us: put_peb waits on the move for PEBs being moved.
        let vids = match self.io.read_vid_hdrs(src, self.cfg.lebs_per_cpeb) {
            Ok(VidRead::Valid { vids, .. }) if !vids.is_empty() => vids,
            Ok(VidRead::Valid { .. }) | Ok(VidRead::Empty { bitflips: false }) => {
                // The owner was handed this PEB but has not written the VID
                // header yet. Park it under protection; the header is
                // presumably about to arrive.
                log::debug!("PEB {src} has no VID header");
                return MoveResult::Cancel(CancelMove {
                    protect: true,
                    ..Default::default()
                });
            }
            Ok(VidRead::Empty { bitflips: true }) => {
                log::debug!("PEB {src} has no VID header but has bit-flips");
                *scrubbing = true;
                return MoveResult::Cancel(CancelMove::default());
            }
            Err(err) => {
                log::error!("error {err} while reading VID header from PEB {src}");
                return MoveResult::Fatal(Error::Io(err));
            }
        };

        let res = if self.has_live_conso(src) {
            self.eba.copy_lebs(src, dst, &vids)
        } else {
            self.eba.copy_leb(src, dst, &vids[0])
        };
        match res {
            Ok(()) => MoveResult::Moved,
            Err(LebCopyError::CancelRace) => {
                // The volume is being deleted or the PEB was put meanwhile.
                // Keep it from being picked again right away.
                MoveResult::Cancel(CancelMove {
                    protect: true,
                    ..Default::default()
                })
            }
            Err(LebCopyError::Retry) => {
                *scrubbing = true;
                MoveResult::Cancel(CancelMove::default())
            }
            Err(
                LebCopyError::TargetBitflips
                | LebCopyError::TargetWrErr
                | LebCopyError::TargetRdErr,
            ) => MoveResult::Cancel(CancelMove {
                torture: true,
                ..Default::default()
            }),
            Err(LebCopyError::SourceRdErr) => MoveResult::Cancel(CancelMove {
                erroneous: true,
                ..Default::default()
            }),
            Err(LebCopyError::Io(err)) => MoveResult::Fatal(Error::Io(err)),
        }
    }

    /// Hand out a free PEB.
    ///
    /// `min_limit` is the free-pool floor the caller requires; when the pool
    /// is at or below it (and the caller is not itself producing free PEBs),
    /// pending works are consolidated and joined until the pool refills or
    /// no progress is possible.
    pub fn get_peb(&self, producing: bool, min_limit: usize) -> Result<PebClaim<'_>, Error> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        loop {
            let fm_guard = self.fm_eba_sem.read();
            {
                let mut st = self.state.lock();
                if st.enough_free(min_limit) {
                    let Some(e) = st.pool.find_mean_free(
                        self.cfg.free_max_diff(),
                        self.hold_anchor(),
                        self.cfg.fm_max_start,
                    ) else {
                        log::error!("no free eraseblocks");
                        return Err(Error::NoSpace);
                    };
                    st.pool.detach(e.1)?;
                    st.pool.place_protected(e.1);
                    drop(st);
                    self.check_all_ff(e.1)?;
                    log::debug!("handing out PEB {} EC {}", e.1, e.0);
                    return Ok(PebClaim {
                        pnum: e.1,
                        _fm: fm_guard,
                    });
                }
                if producing {
                    log::error!("no free eraseblocks in producing case");
                    return Err(Error::NoSpace);
                }
            }
            drop(fm_guard);
            self.produce_free_peb(min_limit)?;
        }
    }

    /// Make free PEBs by consolidating and synchronously joining pending
    /// works, until the floor is met or nothing can make progress.
    fn produce_free_peb(&self, min_limit: usize) -> Result<(), Error> {
        while !self.state.lock().enough_free(min_limit) {
            self.schedule_consolidation();
            log::debug!("do one work synchronously");
            if !self.engine.join_one() {
                // A work may have finished before we tried to join.
                if self.state.lock().enough_free(min_limit) {
                    break;
                }
                log::error!("unable to produce free eraseblocks");
                return Err(Error::NoSpace);
            }
        }
        Ok(())
    }

    /// A PEB handed out must be all 0xFF past the VID header area.
    ///
    /// Uses its own buffer: callers (consolidation in particular) may
    /// already hold the shared PEB buffer.
    fn check_all_ff(&self, pnum: u32) -> Result<(), Error> {
        let offset = self.cfg.vid_hdr_offset;
        let len = self.cfg.peb_size - offset;
        let mut buf = vec![0u8; len];
        self.io.read(&mut buf[..len], pnum, offset)?;
        if buf[..len].iter().all(|&b| b == 0xFF) {
            Ok(())
        } else {
            log::error!("new PEB {pnum} does not contain all 0xFF bytes");
            Err(Error::Invariant)
        }
    }

    /// Return a PEB to the engine; it will be erased in the background. Set
    /// `torture` if an I/O error occurred on it and the media should be
    /// stress-tested before reuse.
    pub fn put_peb(&self, pnum: u32, mut torture: bool) -> Result<(), Error> {
        log::debug!("put PEB {pnum}");
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if pnum >= self.cfg.peb_count {
            return Err(Error::OutOfRange);
        }
        assert!(
            !self.has_live_conso(pnum),
            "PEB {pnum} with live packed LEBs must be released through invalidate_leb"
        );
        loop {
            let mut st = self.state.lock();
            if st.move_from == Some(pnum) {
                // The wear-leveling worker owns this PEB right now. Wait
                // for the move to finish and look again.
                drop(st);
                log::debug!("PEB {pnum} is being moved, wait");
                drop(self.move_mutex.lock());
                continue;
            }
            if st.move_to == Some(pnum) {
                // Data was just moved here and the EBA already re-mapped,
                // but the worker has not filed the PEB yet. Tell it the PEB
                // is unwanted.
                log::debug!("PEB {pnum} is the target of data moving");
                assert!(!st.move_to_put);
                st.move_to_put = true;
                return Ok(());
            }
            match st.pool.location(pnum) {
                Some(Location::Used | Location::Scrub | Location::Protected(_)) => {
                    st.pool.detach(pnum)?;
                }
                Some(Location::Erroneous) => {
                    st.pool.detach(pnum)?;
                    torture = true;
                }
                _ => {
                    log::error!("PEB {pnum} not found");
                    drop(st);
                    self.set_ro();
                    return Err(Error::NotFound);
                }
            }
            drop(st);
            self.schedule_erase(pnum, torture);
            return Ok(());
        }
    }

    /// The PEB had bit-flips; relocate its data elsewhere in the
    /// background.
    pub fn scrub_peb(&self, pnum: u32) -> Result<(), Error> {
        log::info!("schedule PEB {pnum} for scrubbing");
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if pnum >= self.cfg.peb_count {
            return Err(Error::OutOfRange);
        }
        loop {
            let mut st = self.state.lock();
            if st.move_from == Some(pnum) {
                // Being moved already, which rewrites it anyway.
                return Ok(());
            }
            if st.move_to == Some(pnum) {
                // Freshly written move target, not filed into a set yet.
                // Let the worker finish first.
                drop(st);
                thread::yield_now();
                continue;
            }
            match st.pool.location(pnum) {
                None => return Err(Error::NotFound),
                Some(Location::Scrub | Location::Erroneous | Location::ErasePending) => {
                    return Ok(())
                }
                Some(Location::Used | Location::Protected(_)) => {
                    st.pool.detach(pnum)?;
                }
                Some(Location::Free) => {
                    // Nothing to relocate; erase it right away.
                    st.pool.detach(pnum)?;
                    drop(st);
                    self.schedule_erase(pnum, false);
                    return Ok(());
                }
                Some(_) => return Err(Error::Busy),
            }
            st.pool.place_set(pnum, SetKind::Scrub);
            drop(st);
            // Scrubbing is technically the same as wear-leveling.
            return self.ensure_wl();
        }
    }

    /// Read the whole PEB looking for bit-flips (or skip the read when
    /// `force_scrub`), and queue it for scrubbing if any were found.
    pub fn bitflip_check(&self, pnum: u32, force_scrub: bool) -> Result<BitflipStatus, Error> {
        if pnum >= self.cfg.peb_count {
            return Err(Error::OutOfRange);
        }
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }

        // Pause background work, otherwise the erase worker can retire the
        // entry under us while we inspect it.
        self.engine.suspend();
        let res = self.bitflip_check_suspended(pnum, force_scrub);
        self.engine.resume();

        if res == Err(Error::Again) {
            // The PEB is pinned by the on-flash attach index. Ask for the
            // index to be rewritten so the PEB gets released, and have the
            // caller retry.
            if let Some(fm) = &self.fastmap {
                fm.update();
            }
        }
        res
    }

    fn bitflip_check_suspended(
        &self,
        pnum: u32,
        force_scrub: bool,
    ) -> Result<BitflipStatus, Error> {
        {
            let st = self.state.lock();
            if st.pool.location(pnum).is_none() {
                return Err(Error::NotFound);
            }
            self.scrub_possible(&st, pnum)?;
        }

        let flips = if force_scrub {
            true
        } else {
            let mut buf = self.peb_buf.lock();
            let len = self.cfg.peb_size;
            match self.io.raw_read(&mut buf[..len], pnum, 0) {
                Ok(flips) => flips,
                Err(err) => {
                    // A hard read failure is not a bit-flip; other paths
                    // handle it.
                    log::warn!("cannot read PEB {pnum} for bit-flip check: {err}");
                    false
                }
            }
        };
        if !flips {
            return Ok(BitflipStatus::Clean);
        }

        let mut st = self.state.lock();
        self.scrub_possible(&st, pnum)?;
        match st.pool.location(pnum) {
            Some(Location::Used | Location::Protected(_)) => {
                st.pool.detach(pnum)?;
                st.pool.place_set(pnum, SetKind::Scrub);
                drop(st);
                self.ensure_wl()?;
            }
            Some(Location::Free) => {
                // Empty PEB, nothing to relocate: erase it right away.
                st.pool.detach(pnum)?;
                drop(st);
                self.schedule_erase(pnum, !force_scrub);
            }
            Some(Location::Fastmap) => return Err(Error::Again),
            _ => return Err(Error::Busy),
        }
        Ok(BitflipStatus::Scrubbing)
    }

    fn scrub_possible(&self, st: &WlState, pnum: u32) -> Result<(), Error> {
        if st.move_from == Some(pnum) || st.move_to == Some(pnum) {
            return Err(Error::Busy);
        }
        match st.pool.location(pnum) {
            Some(Location::Scrub | Location::Erroneous | Location::ErasePending) => {
                Err(Error::Busy)
            }
            _ => Ok(()),
        }
    }

    /// Block until every pending work has completed.
    pub fn flush_work(&self) -> Result<(), Error> {
        log::debug!("flush ({} pending works)", self.engine.pending());
        self.engine.flush()
    }

    pub(crate) fn set_ro(&self) {
        if !self.ro_mode.swap(true, Ordering::SeqCst) {
            log::warn!("switched to read-only mode");
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.ro_mode.load(Ordering::SeqCst)
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().pool.free_count()
    }

    pub fn erroneous_count(&self) -> usize {
        self.state.lock().pool.erroneous_count()
    }

    pub fn max_ec(&self) -> u64 {
        self.state.lock().pool.max_ec
    }

    pub fn avail_pebs(&self) -> usize {
        self.state.lock().avail_pebs
    }

    pub fn reserved_pebs(&self) -> usize {
        self.state.lock().rsvd_pebs
    }

    pub fn beb_reserve(&self) -> usize {
        self.state.lock().beb_rsvd_pebs
    }

    pub fn bad_peb_count(&self) -> usize {
        self.state.lock().bad_peb_count
    }

    pub fn good_peb_count(&self) -> usize {
        self.state.lock().good_peb_count
    }

    /// Per-PEB statistics for one PEB, or for every known PEB.
    pub fn peb_stats(&self, pnum: Option<u32>) -> Result<Vec<PebStats>, Error> {
        fn stats_of(e: &pool::PebEntry) -> PebStats {
            #[cfg(feature = "read-counter")]
            let rc = Some(e.rc);
            #[cfg(not(feature = "read-counter"))]
            let rc = None;
            PebStats {
                pnum: e.pnum,
                ec: e.ec,
                rc,
            }
        }

        let st = self.state.lock();
        match pnum {
            Some(pnum) => {
                if pnum >= self.cfg.peb_count {
                    return Err(Error::OutOfRange);
                }
                Ok(st.pool.entry(pnum).map(stats_of).into_iter().collect())
            }
            None => Ok(st.pool.entries().map(stats_of).collect()),
        }
    }

    /// Count one read against the PEB's read counter.
    #[cfg(feature = "read-counter")]
    pub fn note_read(&self, pnum: u32) {
        self.state.lock().pool.note_read(pnum);
    }

    #[cfg(test)]
    pub(crate) fn test_location(&self, pnum: u32) -> Option<Location> {
        self.state.lock().pool.location(pnum)
    }

    #[cfg(test)]
    pub(crate) fn test_wl_scheduled(&self) -> bool {
        self.state.lock().wl_scheduled
    }

    #[cfg(test)]
    pub(crate) fn test_pending_works(&self) -> usize {
        self.engine.pending()
    }
}

#[cfg(test)]
mod tests;
