//! Simulated collaborators, for testing the engine without hardware.
//!
//! [`SimFlash`] is an in-memory NAND-like PEB array with the usual flash
//! semantics: erasing fills a PEB with 0xFF, programming may only flip bits
//! over erased bytes, and bad blocks stay bad. Fault injection knobs cover
//! the failure taxonomy the engine has to handle. [`StubEba`],
//! [`StubVolumes`], [`StubSqnum`] and [`StubFastmap`] are scriptable stand-
//! ins for the external layers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::eba::{Eba, Fastmap, LebCopyError, SqnumSource, TryLock, Volume, Volumes};
use crate::headers::{Ec, Vid, VolType, UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE};
use crate::io::{FlashIo, IoError, VidRead};
use crate::{Config, Error};

struct SimPeb {
    data: Vec<u8>,
    bad: bool,
}

/// A simulated in-memory flash device.
pub struct SimFlash {
    peb_size: usize,
    vid_hdr_offset: usize,
    leb_start: usize,
    image_seq: u32,
    pebs: Mutex<Vec<SimPeb>>,
    /// Single-shot erase failures, keyed by PEB.
    fail_erase: Mutex<HashMap<u32, IoError>>,
    /// PEBs whose reads report correctable bit-flips until erased.
    read_flips: Mutex<HashSet<u32>>,
}

impl SimFlash {
    pub fn new(cfg: &Config) -> Arc<Self> {
        let pebs = (0..cfg.peb_count)
            .map(|_| SimPeb {
                data: vec![0xFF; cfg.peb_size],
                bad: false,
            })
            .collect();
        Arc::new(Self {
            peb_size: cfg.peb_size,
            vid_hdr_offset: cfg.vid_hdr_offset,
            leb_start: cfg.leb_start,
            image_seq: cfg.image_seq,
            pebs: Mutex::new(pebs),
            fail_erase: Mutex::new(HashMap::new()),
            read_flips: Mutex::new(HashSet::new()),
        })
    }

    /// Write an EC header, as a freshly formatted PEB would carry.
    pub fn format_peb(&self, pnum: u32, ec: u64) {
        let hdr = Ec {
            ec,
            vid_hdr_offset: self.vid_hdr_offset as u32,
            data_offset: self.leb_start as u32,
            image_seq: self.image_seq,
        };
        self.write_ec_hdr(pnum, &hdr).expect("format failed");
    }

    /// Stage VID header(s) on a PEB.
    pub fn program_vid(&self, pnum: u32, vids: &[Vid]) {
        self.write_vid_hdrs(pnum, vids).expect("programming failed");
    }

    /// Stage LEB payload bytes, `offset` relative to the data area.
    pub fn program_data(&self, pnum: u32, offset: usize, bytes: &[u8]) {
        self.raw_write(pnum, self.leb_start + offset, bytes)
            .expect("programming failed");
    }

    /// Make the next erase of `pnum` fail with `err`.
    pub fn inject_erase_error(&self, pnum: u32, err: IoError) {
        self.fail_erase.lock().insert(pnum, err);
    }

    /// Make reads of `pnum` report correctable bit-flips until it is
    /// erased.
    pub fn inject_read_flips(&self, pnum: u32) {
        self.read_flips.lock().insert(pnum);
    }

    pub fn is_bad(&self, pnum: u32) -> bool {
        self.pebs.lock()[pnum as usize].bad
    }

    /// The erase counter currently on flash, if a valid header is there.
    pub fn ec_of(&self, pnum: u32) -> Option<u64> {
        self.read_ec_hdr(pnum).ok().flatten().map(|hdr| hdr.ec)
    }

    /// Raw bytes of a PEB.
    pub fn content(&self, pnum: u32, offset: usize, len: usize) -> Vec<u8> {
        self.pebs.lock()[pnum as usize].data[offset..offset + len].to_vec()
    }

    fn write_bytes(&self, pnum: u32, offset: usize, bytes: &[u8]) -> Result<(), IoError> {
        let mut pebs = self.pebs.lock();
        let peb = pebs.get_mut(pnum as usize).ok_or(IoError::Corrupted)?;
        if peb.bad {
            return Err(IoError::Io);
        }
        let end = offset + bytes.len();
        let target = peb.data.get_mut(offset..end).ok_or(IoError::Corrupted)?;
        // NAND programming can only clear bits of erased bytes.
        if !target.iter().all(|&b| b == 0xFF) {
            return Err(IoError::Io);
        }
        target.copy_from_slice(bytes);
        Ok(())
    }

    fn read_bytes(&self, pnum: u32, offset: usize, buf: &mut [u8]) -> Result<bool, IoError> {
        let pebs = self.pebs.lock();
        let peb = pebs.get(pnum as usize).ok_or(IoError::Corrupted)?;
        if peb.bad {
            return Err(IoError::Io);
        }
        let end = offset + buf.len();
        let src = peb.data.get(offset..end).ok_or(IoError::Corrupted)?;
        buf.copy_from_slice(src);
        Ok(self.read_flips.lock().contains(&pnum))
    }
}

impl FlashIo for SimFlash {
    fn sync_erase(&self, pnum: u32, _torture: bool) -> Result<u64, IoError> {
        if let Some(err) = self.fail_erase.lock().remove(&pnum) {
            return Err(err);
        }
        let mut pebs = self.pebs.lock();
        let peb = pebs.get_mut(pnum as usize).ok_or(IoError::Corrupted)?;
        if peb.bad {
            return Err(IoError::Io);
        }
        peb.data.fill(0xFF);
        self.read_flips.lock().remove(&pnum);
        Ok(1)
    }

    fn read(&self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<bool, IoError> {
        self.read_bytes(pnum, offset, buf)
    }

    fn raw_read(&self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<bool, IoError> {
        self.read_bytes(pnum, offset, buf)
    }

    fn raw_write(&self, pnum: u32, offset: usize, buf: &[u8]) -> Result<(), IoError> {
        self.write_bytes(pnum, offset, buf)
    }

    fn read_ec_hdr(&self, pnum: u32) -> Result<Option<Ec>, IoError> {
        let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
        self.read_bytes(pnum, 0, &mut buf)?;
        Ok(Ec::decode(&buf))
    }

    fn write_ec_hdr(&self, pnum: u32, ec: &Ec) -> Result<(), IoError> {
        let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
        ec.encode(&mut buf).map_err(|_| IoError::Corrupted)?;
        self.write_bytes(pnum, 0, &buf)
    }

    fn read_vid_hdrs(&self, pnum: u32, max: usize) -> Result<VidRead, IoError> {
        let bitflips = self.read_flips.lock().contains(&pnum);
        let mut area = vec![0u8; max * UBI_VID_HDR_SIZE];
        self.read_bytes(pnum, self.vid_hdr_offset, &mut area)?;

        let mut vids = Vec::new();
        for chunk in area.chunks_exact(UBI_VID_HDR_SIZE) {
            match Vid::decode(chunk) {
                Some(vid) => vids.push(vid),
                None => break,
            }
        }
        if vids.is_empty() {
            if area.iter().all(|&b| b == 0xFF) {
                return Ok(VidRead::Empty { bitflips });
            }
            return Err(IoError::Corrupted);
        }
        Ok(VidRead::Valid { vids, bitflips })
    }

    fn write_vid_hdrs(&self, pnum: u32, vids: &[Vid]) -> Result<(), IoError> {
        let mut buf = vec![0u8; vids.len() * UBI_VID_HDR_SIZE];
        for (vid, chunk) in vids.iter().zip(buf.chunks_exact_mut(UBI_VID_HDR_SIZE)) {
            vid.encode(chunk).map_err(|_| IoError::Corrupted)?;
        }
        self.write_bytes(pnum, self.vid_hdr_offset, &buf)
    }

    fn mark_bad(&self, pnum: u32) -> Result<(), IoError> {
        let mut pebs = self.pebs.lock();
        let peb = pebs.get_mut(pnum as usize).ok_or(IoError::Corrupted)?;
        peb.bad = true;
        peb.data.fill(0);
        Ok(())
    }
}

/// One volume backed by a plain map.
pub struct StubVolume {
    vol_id: u32,
    vol_type: VolType,
    data_pad: u32,
    used_ebs: u32,
    compat: u8,
    eba: Mutex<HashMap<u32, u32>>,
}

impl StubVolume {
    pub fn new(vol_id: u32, vol_type: VolType) -> Arc<Self> {
        Self::with_layout(vol_id, vol_type, 0, 0)
    }

    pub fn with_layout(vol_id: u32, vol_type: VolType, data_pad: u32, used_ebs: u32) -> Arc<Self> {
        Arc::new(Self {
            vol_id,
            vol_type,
            data_pad,
            used_ebs,
            compat: 0,
            eba: Mutex::new(HashMap::new()),
        })
    }

    pub fn vol_id(&self) -> u32 {
        self.vol_id
    }

    pub fn map_leb(&self, lnum: u32, pnum: u32) {
        self.eba.lock().insert(lnum, pnum);
    }

    pub fn unmap_leb(&self, lnum: u32) {
        self.eba.lock().remove(&lnum);
    }

    pub fn mapping(&self, lnum: u32) -> Option<u32> {
        self.eba.lock().get(&lnum).copied()
    }
}

impl Volume for StubVolume {
    fn vol_type(&self) -> VolType {
        self.vol_type
    }
    fn used_ebs(&self) -> u32 {
        self.used_ebs
    }
    fn data_pad(&self) -> u32 {
        self.data_pad
    }
    fn compat(&self) -> u8 {
        self.compat
    }
    fn leb_to_peb(&self, lnum: u32) -> Option<u32> {
        self.mapping(lnum)
    }
    fn remap_leb(&self, lnum: u32, pnum: u32) {
        self.map_leb(lnum, pnum);
    }
}

/// Volume registry.
#[derive(Default)]
pub struct StubVolumes {
    vols: Mutex<HashMap<u32, Arc<StubVolume>>>,
}

impl StubVolumes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, vol: Arc<StubVolume>) {
        self.vols.lock().insert(vol.vol_id(), vol);
    }

    pub fn remove(&self, vol_id: u32) {
        self.vols.lock().remove(&vol_id);
    }

    fn get_stub(&self, vol_id: u32) -> Option<Arc<StubVolume>> {
        self.vols.lock().get(&vol_id).cloned()
    }
}

impl Volumes for StubVolumes {
    fn get(&self, vol_id: u32) -> Option<Arc<dyn Volume>> {
        self.get_stub(vol_id).map(|vol| vol as Arc<dyn Volume>)
    }
}

type CopyHook = Box<dyn Fn(u32, u32) + Send + Sync>;

/// A scriptable EBA layer. Copies succeed (and re-map the moved LEBs in the
/// attached [`StubVolumes`]) unless a result was scripted.
pub struct StubEba {
    vols: Arc<StubVolumes>,
    script: Mutex<VecDeque<Result<(), LebCopyError>>>,
    copies: Mutex<Vec<(u32, u32, usize)>>,
    locks: Mutex<HashSet<(u32, u32)>>,
    hook: Mutex<Option<CopyHook>>,
}

impl StubEba {
    pub fn new(vols: Arc<StubVolumes>) -> Arc<Self> {
        Arc::new(Self {
            vols,
            script: Mutex::new(VecDeque::new()),
            copies: Mutex::new(Vec::new()),
            locks: Mutex::new(HashSet::new()),
            hook: Mutex::new(None),
        })
    }

    /// Queue the outcome of the next copy call.
    pub fn script_copy_result(&self, res: Result<(), LebCopyError>) {
        self.script.lock().push_back(res);
    }

    /// Run `hook(src, dst)` at the start of every copy, before the scripted
    /// outcome is applied.
    pub fn set_copy_hook(&self, hook: impl Fn(u32, u32) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// `(src, dst, leb_count)` of every successful copy.
    pub fn copies(&self) -> Vec<(u32, u32, usize)> {
        self.copies.lock().clone()
    }

    /// Pre-contend a LEB write lock.
    pub fn lock_leb(&self, vol_id: u32, lnum: u32) {
        self.locks.lock().insert((vol_id, lnum));
    }

    pub fn unlock_leb(&self, vol_id: u32, lnum: u32) {
        self.locks.lock().remove(&(vol_id, lnum));
    }

    fn do_copy(&self, src: u32, dst: u32, vids: &[Vid]) -> Result<(), LebCopyError> {
        if let Some(hook) = &*self.hook.lock() {
            hook(src, dst);
        }
        if let Some(res) = self.script.lock().pop_front() {
            res?;
        }
        self.copies.lock().push((src, dst, vids.len()));
        for vid in vids {
            if let Some(vol) = self.vols.get_stub(vid.vol_id) {
                vol.remap_leb(vid.lnum, dst);
            }
        }
        Ok(())
    }
}

impl Eba for StubEba {
    fn copy_leb(&self, src: u32, dst: u32, vid: &Vid) -> Result<(), LebCopyError> {
        self.do_copy(src, dst, std::slice::from_ref(vid))
    }

    fn copy_lebs(&self, src: u32, dst: u32, vids: &[Vid]) -> Result<(), LebCopyError> {
        self.do_copy(src, dst, vids)
    }

    fn leb_write_trylock(&self, vol_id: u32, lnum: u32) -> Result<TryLock, Error> {
        let mut locks = self.locks.lock();
        if locks.contains(&(vol_id, lnum)) {
            Ok(TryLock::Busy)
        } else {
            locks.insert((vol_id, lnum));
            Ok(TryLock::Acquired)
        }
    }

    fn leb_write_unlock(&self, vol_id: u32, lnum: u32) {
        self.locks.lock().remove(&(vol_id, lnum));
    }
}

/// Monotonic sequence-number source.
pub struct StubSqnum(AtomicU64);

impl StubSqnum {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(0)))
    }
}

impl SqnumSource for StubSqnum {
    fn next_sqnum(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Records fastmap interaction points.
pub struct StubFastmap {
    extra_reserve: usize,
    updates: AtomicUsize,
}

impl StubFastmap {
    pub fn new(extra_reserve: usize) -> Arc<Self> {
        Arc::new(Self {
            extra_reserve,
            updates: AtomicUsize::new(0),
        })
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }
}

impl Fastmap for StubFastmap {
    fn init(&self, reserved_pebs: &mut usize) {
        *reserved_pebs += self.extra_reserve;
    }

    fn close(&self) {}

    fn update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}
