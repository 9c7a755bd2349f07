//! On-flash EC and VID header codec.
//!
//! The engine only ever round-trips two structures through flash: the
//! erase-counter header it rewrites after every erase, and the volume
//! identifier header(s) it reads before a move and writes when packing
//! LEBs. [`Ec`] and [`Vid`] carry exactly the fields those paths touch;
//! the raw big-endian layouts come from the `income` crate and are
//! (de)serialized with `deku`. Every header is covered by a trailing
//! CRC-32 over the rest of its 64 bytes, checked on decode and stamped on
//! encode.

use crc::{Crc, CRC_32_JAMCRC};
use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

/// CRC-32 variant used by every UBI on-flash structure.
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// Serialized size of an erase-counter header.
pub const UBI_EC_HDR_SIZE: usize = 64;
/// Serialized size of a volume-identifier header.
pub const UBI_VID_HDR_SIZE: usize = 64;

/// The header CRC field sits in the last four bytes of either header.
fn crc_matches(bytes: &[u8], size: usize, expect: u32) -> bool {
    bytes
        .get(..size - 4)
        .is_some_and(|body| UBI_CRC.checksum(body) == expect)
}

/// Stamp the CRC over a freshly serialized header.
fn seal(bytes: &mut [u8]) {
    let body = bytes.len() - 4;
    let crc = UBI_CRC.checksum(&bytes[..body]);
    bytes[body..].copy_from_slice(&crc.to_be_bytes());
}

fn write_out(bytes: &[u8], out: &mut [u8]) -> anyhow::Result<()> {
    let out = out
        .get_mut(..bytes.len())
        .ok_or(anyhow::anyhow!("output buffer smaller than a header"))?;
    out.copy_from_slice(bytes);
    Ok(())
}

/// UBI volume types.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for
    /// whole-volume updates
    Static,
}

impl VolType {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Dynamic),
            2 => Some(Self::Static),
            _ => None,
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            Self::Dynamic => 1,
            Self::Static => 2,
        }
    }
}

/// The erase-counter header, reduced to the fields the engine maintains.
///
/// Written right after every successful erase; the geometry fields let an
/// attaching implementation cross-check the device layout.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Parse from a byte slice, verifying magic, version and CRC. `None`
    /// means "no valid EC header here", which callers treat as an empty or
    /// corrupted block.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, raw) = EcHdr::from_bytes((bytes, 0)).ok()?;
        if &raw.magic[..] != UBI_EC_HDR_MAGIC || raw.version != UBI_VERSION {
            return None;
        }
        if !crc_matches(bytes, UBI_EC_HDR_SIZE, raw.hdr_crc) {
            return None;
        }
        Some(Self {
            ec: raw.ec,
            vid_hdr_offset: raw.vid_hdr_offset,
            data_offset: raw.data_offset,
            image_seq: raw.image_seq,
        })
    }

    /// Serialize into the start of `out`, CRC included.
    pub fn encode(&self, out: &mut [u8]) -> anyhow::Result<()> {
        let raw = EcHdr {
            magic: UBI_EC_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            ec: self.ec,
            vid_hdr_offset: self.vid_hdr_offset,
            data_offset: self.data_offset,
            image_seq: self.image_seq,

            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
        };
        let mut bytes = raw.to_bytes()?;
        seal(&mut bytes);
        write_out(&bytes, out)
    }
}

/// A volume-identifier header.
///
/// The wear-leveling worker reads these to learn which LEB(s) a PEB hosts
/// before moving it; the consolidation path writes a fresh one per packed
/// LEB.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling
    /// or consolidation purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how the volume should be
    /// handled by implementations that do not know it.
    pub compat: u8,

    /// The ID of the volume this LEB belongs to.
    pub vol_id: u32,

    /// The offset of the LEB within its volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at
    /// the same time as the VID header, which are thus included in
    /// `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is
    /// `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the LEB, to cut it down to a
    /// multiple of the requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for
    /// resolving `vol_id:lnum` collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Parse from a byte slice, verifying magic, version, CRC and the
    /// volume type.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, raw) = VidHdr::from_bytes((bytes, 0)).ok()?;
        if &raw.magic[..] != UBI_VID_HDR_MAGIC || raw.version != UBI_VERSION {
            return None;
        }
        if !crc_matches(bytes, UBI_VID_HDR_SIZE, raw.hdr_crc) {
            return None;
        }
        Some(Self {
            vol_type: VolType::from_raw(raw.vol_type)?,
            copy_flag: raw.copy_flag != 0,
            compat: raw.compat,
            vol_id: raw.vol_id,
            lnum: raw.lnum,
            data_size: raw.data_size,
            used_ebs: raw.used_ebs,
            data_pad: raw.data_pad,
            data_crc: raw.data_crc,
            sqnum: raw.sqnum,
        })
    }

    /// Serialize into the start of `out`, CRC included.
    pub fn encode(&self, out: &mut [u8]) -> anyhow::Result<()> {
        let raw = VidHdr {
            magic: UBI_VID_HDR_MAGIC.try_into().unwrap(),
            version: UBI_VERSION,

            vol_type: self.vol_type.to_raw(),
            copy_flag: self.copy_flag.into(),
            compat: self.compat,
            vol_id: self.vol_id,
            lnum: self.lnum,
            data_size: self.data_size,
            used_ebs: self.used_ebs,
            data_pad: self.data_pad,
            data_crc: self.data_crc,
            sqnum: self.sqnum,

            hdr_crc: 0,
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };
        let mut bytes = raw.to_bytes()?;
        seal(&mut bytes);
        write_out(&bytes, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() -> anyhow::Result<()> {
        let ec = Ec {
            ec: 42,
            vid_hdr_offset: 64,
            data_offset: 512,
            image_seq: 7,
        };
        let vid = Vid {
            vol_type: VolType::Static,
            copy_flag: true,
            vol_id: 3,
            lnum: 9,
            data_size: 100,
            used_ebs: 4,
            sqnum: 12345,
            ..Default::default()
        };

        let mut buf = vec![0u8; 1024];

        ec.encode(&mut buf)?;
        assert_eq!(Ec::decode(&buf), Some(ec));

        vid.encode(&mut buf)?;
        assert_eq!(Vid::decode(&buf), Some(vid));

        Ok(())
    }

    #[test]
    fn test_reject_bad_crc() -> anyhow::Result<()> {
        let ec = Ec {
            ec: 42,
            ..Default::default()
        };
        let mut buf = vec![0u8; UBI_EC_HDR_SIZE];
        ec.encode(&mut buf)?;
        buf[8] ^= 0x01;
        assert_eq!(Ec::decode(&buf), None);
        Ok(())
    }

    #[test]
    fn test_reject_wrong_magic() -> anyhow::Result<()> {
        let mut buf = vec![0u8; UBI_VID_HDR_SIZE];
        Vid::default().encode(&mut buf)?;
        // An EC header is not a VID header, magic differs.
        assert_eq!(Ec::decode(&buf), None);
        Ok(())
    }

    #[test]
    fn test_erased_area_is_no_header() {
        let buf = vec![0xFFu8; UBI_EC_HDR_SIZE];
        assert_eq!(Ec::decode(&buf), None);
        assert_eq!(Vid::decode(&buf), None);
    }
}
