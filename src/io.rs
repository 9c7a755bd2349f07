//! The flash transport seam.
//!
//! The engine never touches flash directly; everything goes through
//! [`FlashIo`], a synchronous PEB-granular API. Reads come in two flavors:
//! `read` goes through ECC and may report corrected bit-flips, `raw_read`
//! bypasses it. Writes are raw page programs; header writes serialize and
//! CRC the header for the caller.

use crate::headers::{Ec, Vid};

/// Transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// The operation was interrupted; retrying it is expected to succeed.
    #[error("operation interrupted")]
    Interrupted,
    /// The transport is temporarily out of resources.
    #[error("temporarily out of resources")]
    NoMem,
    /// The transport asked for the operation to be retried later.
    #[error("transport asked to retry")]
    Again,
    /// The target is busy.
    #[error("target busy")]
    Busy,
    /// Hard media error. Erase failures with this code lead to the PEB being
    /// marked bad.
    #[error("hard I/O error")]
    Io,
    /// The data read back is not valid (bad magic, bad CRC) and not erased.
    #[error("corrupted on-flash data")]
    Corrupted,
}

impl IoError {
    /// Whether re-running the failed operation makes sense.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            IoError::Interrupted | IoError::NoMem | IoError::Again | IoError::Busy
        )
    }
}

/// Outcome of reading the VID header area of a PEB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VidRead {
    /// One or more valid headers. `bitflips` is set when ECC had to correct
    /// the read, meaning the PEB wants scrubbing.
    Valid { vids: Vec<Vid>, bitflips: bool },
    /// The header area is still erased; nothing was ever written there.
    Empty { bitflips: bool },
}

/// Blocking byte/PEB I/O over the raw erase-block device.
pub trait FlashIo: Send + Sync {
    /// Erase a PEB, optionally torturing it (write-pattern/erase cycles
    /// until the block reads back stable). Returns how many erase cycles
    /// were spent, so the caller can advance the erase counter.
    fn sync_erase(&self, pnum: u32, torture: bool) -> Result<u64, IoError>;

    /// ECC-checked read of `buf.len()` bytes. Returns whether correctable
    /// bit-flips were seen.
    fn read(&self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<bool, IoError>;

    /// Read bypassing the ECC layer. Returns whether bit-flips were seen.
    fn raw_read(&self, buf: &mut [u8], pnum: u32, offset: usize) -> Result<bool, IoError>;

    /// Program `buf.len()` bytes at `offset`.
    fn raw_write(&self, pnum: u32, offset: usize, buf: &[u8]) -> Result<(), IoError>;

    /// Read back the erase-counter header, or `None` if the PEB does not
    /// carry a valid one.
    fn read_ec_hdr(&self, pnum: u32) -> Result<Option<Ec>, IoError>;

    /// Serialize and program an erase-counter header.
    fn write_ec_hdr(&self, pnum: u32, ec: &Ec) -> Result<(), IoError>;

    /// Read up to `max` VID headers from the header area.
    fn read_vid_hdrs(&self, pnum: u32, max: usize) -> Result<VidRead, IoError>;

    /// Serialize and program `vids.len()` contiguous VID headers.
    fn write_vid_hdrs(&self, pnum: u32, vids: &[Vid]) -> Result<(), IoError>;

    /// Permanently mark a PEB bad. The engine never touches it again.
    fn mark_bad(&self, pnum: u32) -> Result<(), IoError>;
}
