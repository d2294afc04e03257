//! Read, verify, create and unseal LUKS (Linux Unified Key Setup) volume
//! headers, versions 1 and 2.
//!
//! [`read_headers`] classifies a device and returns its decoded header;
//! [`v1::Header::check`] and [`v2::BinHeader::check`] unseal the payload
//! with a password and hand back a sector-addressed decryption stream;
//! [`encrypt_v1`] and [`encrypt_v2`] build fresh volumes.
//!
//! You'll probably want to compile in release mode most of the time, or
//! else the key derivation that happens on every unseal will take quite a
//! long time.

/// Recover information that was split antiforensically.
pub mod af;
/// The AES-XTS sector codec and the stateful payload stream.
pub mod cipher;
/// Creation of new volumes.
pub mod create;
/// Custom error types.
pub mod error;
/// The digest algorithms named by headers.
pub mod hash;
/// Password-based key derivation and host calibration.
pub mod kdf;
/// Helper utilities
mod utils;
/// The LUKS1 header model.
pub mod v1;
/// The LUKS2 header model.
pub mod v2;

use std::io::{ErrorKind, Read, Seek, SeekFrom};

pub use cipher::{CryptoStream, Encryption, MasterKey, SecretMasterKey, Unsealed};
pub use create::{encrypt_v1, encrypt_v1_with, encrypt_v2, encrypt_v2_with, CreateParams};
pub use error::{EncodeError, LuksError, ParseError};
pub use hash::HashAlg;

use crate::v2::Magic;

pub const MAGIC_1ST: &[u8] = b"LUKS\xba\xbe";
pub const MAGIC_2ND: &[u8] = b"SKUL\xba\xbe";
pub const MAGIC_LEN: usize = 6;
pub const UUID_LEN: usize = 40;
pub const LABEL_LEN: usize = 48;
pub const SALT_LEN: usize = 64;
pub const CSUM_ALG_LEN: usize = 32;
pub const CSUM_LEN: usize = 64;

/// Length of the LUKS1 binary header.
pub const V1_HEADER_LEN: usize = 592;
pub const V1_SECTOR_SIZE: usize = 512;
pub const V1_NUM_KEYS: usize = 8;
pub const V1_DIGEST_SIZE: usize = 20;
pub const V1_SALT_SIZE: usize = 32;
pub const V1_STRIPES: u32 = 4_000;
pub const V1_ALIGN_KEYSLOTS: usize = 4_096;

/// Length of one LUKS2 binary header.
pub const V2_BIN_HEADER_LEN: usize = 4_096;
pub const V2_SECTOR_SIZE: usize = 4_096;
pub const V2_STRIPES: usize = 4_000;
pub const V2_ALIGN_KEYSLOTS: usize = 4_096;

/// Header sizes (binary header plus JSON area) newly created volumes may
/// use, smallest first.
pub(crate) const HEADER_SIZE_BUCKETS: &[u64] = &[
    0x8000, 0x10000, 0x20000, 0x40000, 0x80000, 0x100000, 0x200000, 0x400000,
];

/// Header sizes accepted when parsing; other tools also emit 16 KiB
/// headers.
pub(crate) const ACCEPTED_HEADER_SIZES: &[u64] = &[
    0x4000, 0x8000, 0x10000, 0x20000, 0x40000, 0x80000, 0x100000, 0x200000, 0x400000,
];

/// The decoded header of a volume, either format.
#[derive(Debug)]
pub enum VolumeHeader {
    V1(v1::Header),
    V2 {
        bin: v2::BinHeader,
        json: v2::JsonHeader,
    },
}

/// Reads and classifies the header at the start of a device.
///
/// A version 2 device carries two independent header copies; both are
/// checksum-verified and the one with the greater sequence number wins
/// (the primary on a tie). If only one copy verifies it is used; if
/// neither does, the device is reported corrupt. The secondary copy is
/// located through the primary's size field when possible, otherwise by
/// probing every valid header size.
pub fn read_headers<R: Read + Seek>(device: &mut R) -> Result<VolumeHeader, LuksError> {
    device.seek(SeekFrom::Start(0))?;
    let mut probe = [0; V1_HEADER_LEN];
    device.read_exact(&mut probe).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => LuksError::HeaderTruncated,
        _ => LuksError::Io(e),
    })?;

    if &probe[..MAGIC_LEN] != MAGIC_1ST {
        return Err(ParseError::InvalidHeaderMagic.into());
    }
    let version = u16::from_be_bytes([probe[6], probe[7]]);
    match version {
        1 => Ok(VolumeHeader::V1(v1::Header::parse(&probe)?)),
        2 => {
            let primary = v2::load_copy(device, 0, Magic::First);

            // candidate locations for the secondary copy: what the primary
            // declares, then every other plausible offset
            let declared = u64::from_be_bytes(probe[8..16].try_into().expect("eight bytes"));
            let mut candidates = Vec::with_capacity(ACCEPTED_HEADER_SIZES.len() + 1);
            if ACCEPTED_HEADER_SIZES.contains(&declared) {
                candidates.push(declared);
            }
            candidates.extend(
                ACCEPTED_HEADER_SIZES
                    .iter()
                    .copied()
                    .filter(|s| *s != declared),
            );
            let mut secondary = None;
            for offset in candidates {
                if let Ok(copy) = v2::load_copy(device, offset, Magic::Second) {
                    secondary = Some(copy);
                    break;
                }
            }

            match (primary, secondary) {
                (Ok(p), Some(s)) => {
                    let (bin, json) = if s.0.seqid > p.0.seqid { s } else { p };
                    Ok(VolumeHeader::V2 { bin, json })
                }
                (Ok((bin, json)), None) => Ok(VolumeHeader::V2 { bin, json }),
                (Err(_), Some((bin, json))) => Ok(VolumeHeader::V2 { bin, json }),
                (Err(e), None) => Err(e),
            }
        }
        v => Err(ParseError::InvalidHeaderVersion(v).into()),
    }
}
