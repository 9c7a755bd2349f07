//! Seams toward the eraseblock-association (EBA) and volume layers.
//!
//! The wear-leveling core knows nothing about LEB contents; when data has to
//! move it hands the job to [`Eba::copy_leb`], and when consolidation packs
//! several LEBs it resolves their volumes through [`Volumes`]. These traits
//! mirror exactly the calls the core makes, nothing more.

use std::sync::Arc;

use crate::headers::{Vid, VolType};
use crate::{Error, IoError};

/// Why an EBA copy did not complete. Everything except `Io` is a policy
/// outcome the wear-leveling worker knows how to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LebCopyError {
    /// The LEB vanished under us (volume deleted, or the PEB was put while
    /// we were preparing). The source must not be picked again soon.
    #[error("copy cancelled by a concurrent unmap or volume removal")]
    CancelRace,
    /// The copy should simply be retried later, after scrubbing the source.
    #[error("copy must be retried")]
    Retry,
    /// The freshly written target read back with bit-flips.
    #[error("bit-flips on the copy target")]
    TargetBitflips,
    /// Writing the target failed.
    #[error("write error on the copy target")]
    TargetWrErr,
    /// Verifying the target failed.
    #[error("read error on the copy target")]
    TargetRdErr,
    /// The source could not be read. The source PEB is quarantined.
    #[error("read error on the copy source")]
    SourceRdErr,
    /// Transport failure outside the policy taxonomy; fatal for the device.
    #[error("copy failed: {0}")]
    Io(#[from] IoError),
}

/// Result of a non-blocking LEB write-lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLock {
    Acquired,
    Busy,
}

/// The eraseblock-association layer.
pub trait Eba: Send + Sync {
    /// Copy the single LEB described by `vid` from PEB `src` to PEB `dst`,
    /// updating the association table on success.
    fn copy_leb(&self, src: u32, dst: u32, vid: &Vid) -> Result<(), LebCopyError>;

    /// Copy all LEBs of a consolidated PEB from `src` to `dst`.
    fn copy_lebs(&self, src: u32, dst: u32, vids: &[Vid]) -> Result<(), LebCopyError>;

    /// Try to take the write lock of one LEB without blocking.
    fn leb_write_trylock(&self, vol_id: u32, lnum: u32) -> Result<TryLock, Error>;

    /// Release a write lock taken with [`Eba::leb_write_trylock`].
    fn leb_write_unlock(&self, vol_id: u32, lnum: u32);
}

/// Volume metadata lookup.
pub trait Volumes: Send + Sync {
    /// Resolve a volume by ID. `None` when the volume no longer exists.
    fn get(&self, vol_id: u32) -> Option<Arc<dyn Volume>>;
}

/// One volume, as much of it as the consolidation path needs.
pub trait Volume: Send + Sync {
    fn vol_type(&self) -> VolType;
    fn used_ebs(&self) -> u32;
    fn data_pad(&self) -> u32;
    fn compat(&self) -> u8;

    /// Current PEB backing `lnum`, or `None` if unmapped.
    fn leb_to_peb(&self, lnum: u32) -> Option<u32>;

    /// Point `lnum` at a new PEB.
    fn remap_leb(&self, lnum: u32, pnum: u32);
}

/// Source of globally unique, monotonic sequence numbers for VID headers.
pub trait SqnumSource: Send + Sync {
    fn next_sqnum(&self) -> u64;
}

/// Interaction points with the on-flash attach-time index. The index itself
/// is maintained elsewhere; the engine only reports events to it.
pub trait Fastmap: Send + Sync {
    /// Called once at attach; may grow the engine's PEB reservation.
    fn init(&self, reserved_pebs: &mut usize);

    /// Called at detach.
    fn close(&self);

    /// Ask for the on-flash index to be rewritten, releasing PEBs it pins.
    fn update(&self);
}
