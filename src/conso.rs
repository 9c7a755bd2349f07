//! LEB consolidation for MLC-style media.
//!
//! When one PEB can host several LEBs (`lebs_per_cpeb > 1`), fully-written
//! LEBs that sit alone in their host PEB waste most of it. This module
//! tracks those "full" LEBs in a FIFO and, when the free pool runs low,
//! packs `lebs_per_cpeb` of them into one fresh PEB: their data is read
//! into the scratch buffer, stamped with fresh VID headers, written out
//! together, and the EBA is swapped over atomically. Sources that end up
//! hosting nothing are erased.
//!
//! The `consolidated` map records which LEBs live inside each packed PEB.
//! [`UbiWl::invalidate_leb`] keeps it in sync as the EBA unmaps LEBs, and a
//! packed PEB becomes erasable only once every slot has been invalidated.

use std::sync::Arc;

use crate::eba::{TryLock, Volume};
use crate::headers::{Vid, VolType, UBI_CRC};
use crate::io::VidRead;
use crate::wl::UbiWl;
use crate::work::{Work, WorkKind};
use crate::Error;

/// Identity of one logical eraseblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LebDesc {
    pub vol_id: u32,
    pub lnum: u32,
}

fn put_back(dev: &UbiWl, picked: Vec<(LebDesc, Arc<dyn Volume>)>) {
    for (desc, _) in picked {
        dev.full.lock().push_back(desc);
        dev.eba.leb_write_unlock(desc.vol_id, desc.lnum);
    }
}

impl UbiWl {
    /// Number of tracked full LEBs.
    pub fn full_count(&self) -> usize {
        self.full.lock().len()
    }

    /// The EBA layer reports that `vol_id:lnum` is now fully written and its
    /// host PEB contains only that LEB.
    pub fn add_full_leb(&self, vol_id: u32, lnum: u32) {
        // Full LEBs are only tracked when consolidation can happen at all.
        if self.cfg.lebs_per_cpeb < 2 {
            return;
        }
        let desc = LebDesc { vol_id, lnum };
        let mut full = self.full.lock();
        debug_assert!(!full.contains(&desc));
        full.push_back(desc);
    }

    /// Forget a tracked full LEB. Returns whether it was tracked.
    pub fn remove_full_leb(&self, vol_id: u32, lnum: u32) -> bool {
        let desc = LebDesc { vol_id, lnum };
        let mut full = self.full.lock();
        match full.iter().position(|d| *d == desc) {
            Some(idx) => {
                full.remove(idx);
                true
            }
            None => false,
        }
    }

    /// The LEB slots of a packed PEB (`None` = already invalidated), or
    /// `None` if the PEB hosts at most one LEB.
    pub fn consolidated(&self, pnum: u32) -> Option<Vec<Option<LebDesc>>> {
        self.conso.lock().get(&pnum).cloned()
    }

    pub(crate) fn has_live_conso(&self, pnum: u32) -> bool {
        self.conso.lock().contains_key(&pnum)
    }

    /// The EBA layer unmapped `vol_id:lnum`, previously hosted by `pnum`.
    /// Returns whether the PEB no longer holds any live LEB and may be
    /// erased.
    pub fn invalidate_leb(&self, pnum: u32, vol_id: u32, lnum: u32) -> bool {
        if self.cfg.lebs_per_cpeb < 2 {
            return true;
        }
        // One lock brackets the whole mark-then-decide sequence, so two
        // racing invalidations cannot both see the same survivor count.
        let mut conso = self.conso.lock();
        let Some(slots) = conso.get_mut(&pnum) else {
            drop(conso);
            self.remove_full_leb(vol_id, lnum);
            return true;
        };

        let target = LebDesc { vol_id, lnum };
        let mut pos = None;
        let mut remaining = 0;
        for (i, slot) in slots.iter_mut().enumerate() {
            match slot {
                Some(desc) if *desc == target => {
                    *slot = None;
                    pos = Some(i);
                }
                Some(_) => remaining += 1,
                None => {}
            }
        }

        if pos.is_none() {
            // Already invalidated by an earlier call.
            return remaining == 0;
        }

        if remaining == slots.len() - 1 {
            // First LEB of a freshly packed PEB to die: the survivors are
            // now each the sole interesting content of this PEB, making
            // them consolidation candidates in their own right.
            let survivors: Vec<LebDesc> = slots.iter().flatten().copied().collect();
            drop(conso);
            for desc in survivors {
                self.add_full_leb(desc.vol_id, desc.lnum);
            }
            false
        } else {
            let empty = remaining == 0;
            if empty {
                conso.remove(&pnum);
            }
            drop(conso);
            self.remove_full_leb(vol_id, lnum);
            empty
        }
    }

    fn consolidation_possible(&self) -> bool {
        if self.cfg.lebs_per_cpeb < 2 {
            return false;
        }
        if self.full.lock().len() < self.cfg.lebs_per_cpeb {
            return false;
        }
        // Do not even try without enough free PEBs.
        if self.state.lock().pool.free_count() < self.cfg.conso_reserved_pebs {
            return false;
        }
        true
    }

    pub(crate) fn consolidation_needed(&self) -> bool {
        if !self.consolidation_possible() {
            return false;
        }
        let st = self.state.lock();
        st.pool.free_count().saturating_sub(st.beb_rsvd_pebs) <= self.conso_threshold
    }

    /// Queue one consolidation cycle if it could do anything.
    pub fn schedule_consolidation(&self) {
        if self.consolidation_possible() {
            self.conso_schedule();
        }
    }

    fn conso_schedule(&self) {
        {
            let mut st = self.state.lock();
            if st.conso_scheduled {
                return;
            }
            st.conso_scheduled = true;
        }
        self.schedule_work(Work::new(WorkKind::Consolidate));
    }

    /// Run one consolidation cycle synchronously.
    pub fn consolidate_sync(&self) -> Result<(), Error> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let wrk = Work::new(WorkKind::Consolidate);
        self.schedule_work(Arc::clone(&wrk));
        wrk.wait()
    }

    pub(crate) fn consolidation_worker(&self) -> Result<(), Error> {
        let res = self.consolidate_lebs();
        self.state.lock().conso_scheduled = false;
        if self.consolidation_needed() {
            self.conso_schedule();
        }
        res
    }

    fn consolidate_lebs(&self) -> Result<(), Error> {
        if !self.consolidation_needed() {
            return Ok(());
        }
        let Some(picked) = self.find_consolidable_lebs()? else {
            // Not enough unlocked candidates right now.
            return Ok(());
        };

        match self.pack_full_lebs(&picked) {
            Ok(orphans) => {
                for (desc, _) in &picked {
                    self.eba.leb_write_unlock(desc.vol_id, desc.lnum);
                }
                for opnum in orphans {
                    // Only release sources nothing references anymore.
                    if let Err(err) = self.put_peb(opnum, false) {
                        log::warn!("cannot release PEB {opnum} after consolidation: {err}");
                    }
                }
                Ok(())
            }
            Err((fresh_peb, err)) => {
                // Nothing was swapped, the sources stay authoritative: put
                // the candidates back, release the fresh PEB, drop the
                // locks.
                for (desc, _) in &picked {
                    self.add_full_leb(desc.vol_id, desc.lnum);
                }
                if let Some(pnum) = fresh_peb {
                    if let Err(put_err) = self.put_peb(pnum, false) {
                        log::warn!("cannot release unused PEB {pnum}: {put_err}");
                    }
                }
                for (desc, _) in &picked {
                    self.eba.leb_write_unlock(desc.vol_id, desc.lnum);
                }
                match err {
                    Error::Again => Ok(()),
                    err => Err(err),
                }
            }
        }
    }

    /// Lock `lebs_per_cpeb` distinct full LEBs from the head of the FIFO,
    /// rotating contended entries to the tail, bounded by the FIFO length.
    /// Returns `None` when not enough candidates could be gathered.
    #[allow(clippy::type_complexity)]
    fn find_consolidable_lebs(
        &self,
    ) -> Result<Option<Vec<(LebDesc, Arc<dyn Volume>)>>, Error> {
        let n = self.cfg.lebs_per_cpeb;
        let mut max_retries = self.full.lock().len();
        if max_retries < n {
            return Ok(None);
        }

        let mut picked: Vec<(LebDesc, Arc<dyn Volume>)> = Vec::with_capacity(n);
        while picked.len() < n {
            let cand = self.full.lock().front().copied();
            let Some(cand) = cand else {
                put_back(self, picked);
                return Ok(None);
            };

            match self.eba.leb_write_trylock(cand.vol_id, cand.lnum) {
                Ok(TryLock::Acquired) => {}
                Ok(TryLock::Busy) => {
                    // A writer holds it; rotate it to the tail and try the
                    // next candidate.
                    let mut full = self.full.lock();
                    if full.front() == Some(&cand) {
                        if let Some(head) = full.pop_front() {
                            full.push_back(head);
                        }
                    }
                    drop(full);
                    max_retries -= 1;
                    if max_retries == 0 {
                        put_back(self, picked);
                        return Ok(None);
                    }
                    continue;
                }
                Err(err) => {
                    put_back(self, picked);
                    return Err(err);
                }
            }

            // Re-check under the lock: the LEB may have been unmapped while
            // we were taking its write lock.
            let confirmed = {
                let mut full = self.full.lock();
                if full.front() == Some(&cand) {
                    full.pop_front();
                    true
                } else {
                    false
                }
            };
            if !confirmed {
                self.eba.leb_write_unlock(cand.vol_id, cand.lnum);
                continue;
            }

            match self.volumes.get(cand.vol_id) {
                Some(vol) => picked.push((cand, vol)),
                None => {
                    // The volume vanished under us; this LEB is gone for
                    // good.
                    self.eba.leb_write_unlock(cand.vol_id, cand.lnum);
                }
            }
        }

        Ok(Some(picked))
    }

    /// Read every picked LEB into the scratch buffer, write the pack to a
    /// fresh PEB and swap the EBA over. Returns the orphaned source PEBs.
    /// On error, returns the fresh PEB (if one was taken) for the caller to
    /// release; no EBA state has been modified.
    fn pack_full_lebs(
        &self,
        picked: &[(LebDesc, Arc<dyn Volume>)],
    ) -> Result<Vec<u32>, (Option<u32>, Error)> {
        let n = self.cfg.lebs_per_cpeb;
        let leb_start = self.cfg.leb_start;
        let leb_size = self.cfg.leb_size();

        let mut buf = self.peb_buf.lock();
        let claim = self.get_peb(true, 0).map_err(|err| (None, err))?;
        let new_pnum = claim.pnum();
        let fail = |err: Error| (Some(new_pnum), err);

        buf.fill(0);
        let mut vids = Vec::with_capacity(n);
        let mut opnums = Vec::with_capacity(n);
        let mut offset = leb_start;
        for (desc, vol) in picked {
            let Some(spnum) = vol.leb_to_peb(desc.lnum) else {
                // We hold the write lock, so the mapping cannot go away.
                log::error!(
                    "LEB {}:{} vanished during consolidation",
                    desc.vol_id,
                    desc.lnum
                );
                return Err(fail(Error::Again));
            };
            let lpos = self.leb_pos(spnum, desc);
            opnums.push(spnum);

            let data = &mut buf[offset..offset + leb_size];
            let read_res = if self.has_live_conso(spnum) {
                self.io
                    .raw_read(data, spnum, leb_start + lpos * leb_size)
            } else {
                self.io.read(data, spnum, leb_start)
            };
            // Correctable bit-flips are fine, the data is valid.
            if let Err(err) = read_res {
                return Err(fail(err.into()));
            }

            let (data_size, used_ebs) = match vol.vol_type() {
                VolType::Dynamic => (leb_size - vol.data_pad() as usize, 0),
                VolType::Static => {
                    // Static LEBs keep their original payload size; fetch it
                    // from the source VID header.
                    let src_vids = match self.io.read_vid_hdrs(spnum, n) {
                        Ok(VidRead::Valid { vids, .. }) => vids,
                        Ok(VidRead::Empty { .. }) => {
                            return Err(fail(Error::Invariant));
                        }
                        Err(err) => return Err(fail(err.into())),
                    };
                    let Some(src) = src_vids.get(lpos) else {
                        return Err(fail(Error::Invariant));
                    };
                    (src.data_size as usize, vol.used_ebs())
                }
            };
            let data_crc = UBI_CRC.checksum(&buf[offset..offset + data_size]);
            vids.push(Vid {
                vol_type: vol.vol_type(),
                copy_flag: true,
                compat: vol.compat(),
                vol_id: desc.vol_id,
                lnum: desc.lnum,
                data_size: data_size as u32,
                used_ebs,
                data_pad: vol.data_pad(),
                data_crc,
                sqnum: self.seq.next_sqnum(),
            });
            offset += leb_size;
        }
        // The rest of the buffer stays zeroed: some MLC chips want the
        // whole block programmed to retain data reliably.

        if let Err(err) = self.io.write_vid_hdrs(new_pnum, &vids) {
            log::warn!("failed to write VID headers to PEB {new_pnum}");
            return Err(fail(err.into()));
        }
        if let Err(err) = self.io.raw_write(new_pnum, leb_start, &buf[leb_start..]) {
            log::warn!("failed to write data to PEB {new_pnum}");
            return Err(fail(err.into()));
        }

        // The pack is on flash; swap the EBA over and retire the sources.
        let mut orphans = Vec::new();
        for (i, (desc, vol)) in picked.iter().enumerate() {
            vol.remap_leb(desc.lnum, new_pnum);
            if self.invalidate_leb(opnums[i], desc.vol_id, desc.lnum) {
                orphans.push(opnums[i]);
            }
        }
        self.conso
            .lock()
            .insert(new_pnum, picked.iter().map(|(desc, _)| Some(*desc)).collect());

        log::debug!("consolidated {n} LEBs into PEB {new_pnum}");
        Ok(orphans)
    }

    /// Slot of `desc` within its (possibly packed) host PEB.
    fn leb_pos(&self, spnum: u32, desc: &LebDesc) -> usize {
        let conso = self.conso.lock();
        match conso.get(&spnum) {
            None => 0,
            Some(slots) => {
                let pos = slots.iter().position(|slot| *slot == Some(*desc));
                debug_assert!(pos.is_some());
                pos.unwrap_or(0)
            }
        }
    }
}
