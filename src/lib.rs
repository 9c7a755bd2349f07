//! Wear-leveling and consolidation engine for NAND-style erase-block devices.
//!
//! This crate virtualizes a finite pool of physical eraseblocks (PEBs), each
//! with a bounded erase budget, into a stable pool of logical eraseblocks
//! (LEBs) with uniform wear. It owns the in-memory PEB bookkeeping (erase
//! counters, the free/used/scrub/erroneous orderings, the protection queue),
//! a single background worker that drains asynchronous erase, wear-leveling
//! and consolidation works, and the policy deciding when data has to move.
//!
//! The flash transport, the LEB-to-PEB association table ("EBA") and the
//! volume metadata are collaborators, reached through the [`FlashIo`],
//! [`Eba`], [`Volumes`] and [`SqnumSource`] traits. [`sim`] provides
//! in-memory implementations of all of them for testing.
//!
//! Lifecycle: build a [`Config`], run an attach scan into an [`AttachInfo`],
//! call [`UbiWl::init`], and keep the returned `Arc` around. The engine must
//! be shut down explicitly with [`UbiWl::close`]; dropping the `Arc` alone
//! leaves the background thread running.

mod conso;
mod eba;
mod headers;
mod io;
pub mod sim;
mod wl;
mod work;

pub use conso::LebDesc;
pub use eba::{Eba, Fastmap, LebCopyError, SqnumSource, TryLock, Volume, Volumes};
pub use headers::{Ec, Vid, VolType, UBI_EC_HDR_SIZE, UBI_VID_HDR_SIZE};
pub use io::{FlashIo, IoError, VidRead};
pub use wl::{
    AttachInfo, BitflipStatus, LebScan, PebClaim, PebScan, PebStats, UbiWl, UsedPebScan,
};

/// Largest representable erase counter. The on-flash format stores 64 bits
/// but other implementations treat the counter as a signed 32-bit value, so
/// exceeding this is refused rather than written out.
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// How many global erase cycles a freshly handed-out PEB stays protected
/// from wear-leveling movement.
pub const UBI_PROT_QUEUE_LEN: usize = 10;

/// Consecutive background-work failures after which the device is switched
/// to read-only mode.
pub const WORK_MAX_FAILURES: u32 = 32;

/// Errors surfaced by the engine.
///
/// `Clone` so that a single shutdown error can be fanned out to every
/// outstanding waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("device is in read-only mode")]
    ReadOnly,
    #[error("no free eraseblocks")]
    NoSpace,
    #[error("eraseblock not known to the wear-leveling engine")]
    NotFound,
    #[error("eraseblock number out of range")]
    OutOfRange,
    #[error("eraseblock is busy")]
    Busy,
    #[error("operation cannot be done now, try again")]
    Again,
    #[error("erase counter overflow")]
    EcOverflow,
    #[error("too many erroneous eraseblocks")]
    TooManyErroneous,
    #[error("flash I/O failed: {0}")]
    Io(#[from] IoError),
    #[error("internal state violation")]
    Invariant,
}

/// Static description of the device geometry and the engine's tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total number of physical eraseblocks the transport exposes.
    pub peb_count: u32,
    /// Size of one PEB in bytes.
    pub peb_size: usize,
    /// Byte offset of the VID header area within a PEB.
    pub vid_hdr_offset: usize,
    /// Byte offset where LEB data starts within a PEB.
    pub leb_start: usize,
    /// How many LEBs one PEB can host (1 on SLC-style media, >1 on MLC).
    pub lebs_per_cpeb: usize,
    /// Image sequence number stamped into every EC header we write.
    pub image_seq: u32,
    /// Erase-counter spread that triggers wear-leveling.
    pub wl_threshold: u64,
    /// PEBs claimed by the engine itself at attach time.
    pub reserved_pebs: usize,
    /// Free-pool floor kept so that consolidation always has headroom.
    pub conso_reserved_pebs: usize,
    /// Erasing beyond this counter fails instead of wrapping.
    pub max_erase_counter: u64,
    /// See [`WORK_MAX_FAILURES`].
    pub work_max_failures: u32,
    /// See [`UBI_PROT_QUEUE_LEN`].
    pub prot_queue_len: usize,
    /// Largest PEB number usable as a fastmap anchor.
    pub fm_max_start: u32,
    /// Erroneous-PEB ceiling before the engine gives up.
    pub max_erroneous: usize,
    /// Whether the media supports marking blocks bad.
    pub bad_allowed: bool,
    /// Enable the slower on-flash self-checks (EC re-read before erase).
    pub extra_checks: bool,
}

impl Config {
    /// Build a configuration from the device geometry, with every tunable at
    /// its default.
    pub fn new(
        peb_count: u32,
        peb_size: usize,
        vid_hdr_offset: usize,
        leb_start: usize,
        lebs_per_cpeb: usize,
    ) -> Self {
        Self {
            peb_count,
            peb_size,
            vid_hdr_offset,
            leb_start,
            lebs_per_cpeb,
            image_seq: 0,
            wl_threshold: 4096,
            reserved_pebs: 1,
            conso_reserved_pebs: 2,
            max_erase_counter: UBI_MAX_ERASECOUNTER,
            work_max_failures: WORK_MAX_FAILURES,
            prot_queue_len: UBI_PROT_QUEUE_LEN,
            fm_max_start: 64,
            max_erroneous: std::cmp::max(peb_count as usize / 10, 1),
            bad_allowed: true,
            extra_checks: false,
        }
    }

    /// Usable data bytes of one LEB hosted by a PEB.
    pub fn leb_size(&self) -> usize {
        (self.peb_size - self.leb_start) / self.lebs_per_cpeb
    }

    /// Largest EC distance from the free-set minimum a wear-leveling target
    /// may have.
    pub fn free_max_diff(&self) -> u64 {
        2 * self.wl_threshold
    }

    pub(crate) fn ec_header(&self, ec: u64) -> Ec {
        Ec {
            ec,
            vid_hdr_offset: self.vid_hdr_offset as u32,
            data_offset: self.leb_start as u32,
            image_seq: self.image_seq,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        let vid_area = self.lebs_per_cpeb * UBI_VID_HDR_SIZE;
        if self.peb_count == 0
            || self.lebs_per_cpeb == 0
            || self.prot_queue_len == 0
            || self.vid_hdr_offset < UBI_EC_HDR_SIZE
            || self.leb_start < self.vid_hdr_offset + vid_area
            || self.peb_size <= self.leb_start
            || self.leb_size() == 0
        {
            return Err(Error::Invariant);
        }
        Ok(())
    }
}
