//! The fixed 592-byte LUKS1 header with its eight key slots.

use core::convert::TryFrom;
use core::fmt::{self, Display};
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use bincode::{Decode, Encode};
use secrecy::Secret;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::{self, CryptoStream, Encryption, MasterKey, Unsealed};
use crate::error::{EncodeError, LuksError, ParseError};
use crate::hash::HashAlg;
use crate::kdf;
use crate::utils::{ascii_cstr_to_str, str_to_ascii_array, Bytes};
use crate::{MAGIC_1ST, MAGIC_LEN, V1_DIGEST_SIZE, V1_HEADER_LEN, V1_NUM_KEYS, V1_SECTOR_SIZE};

/// Tag marking a key slot that holds wrapped key material.
pub const SLOT_ACTIVE: u32 = 0x00AC_71F3;
/// Tag marking an empty key slot.
pub const SLOT_DISABLED: u32 = 0x0000_DEAD;

/// One key slot of the 592-byte header, as stored on disk.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct KeySlotRaw {
    /// `SLOT_ACTIVE` or `SLOT_DISABLED`
    pub active: u32,
    /// PBKDF2 iteration count for the slot password
    pub iterations: u32,
    /// PBKDF2 salt for the slot password
    pub salt: [u8; 32],
    /// start of the striped key material, in 512-byte sectors
    pub key_material_offset: u32,
    /// number of anti-forensic stripes
    pub stripes: u32,
}

/// The LUKS1 binary header as described
/// [here](https://gitlab.com/cryptsetup/cryptsetup/wikis/Specification).
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct HeaderRaw {
    /// must be `MAGIC_1ST`
    pub magic: [u8; MAGIC_LEN],
    /// Version 1
    pub version: u16,
    /// cipher name, e.g. "aes"
    pub cipher_name: [u8; 32],
    /// cipher mode, e.g. "xts-plain64"
    pub cipher_mode: [u8; 32],
    /// hash used by PBKDF2 and the anti-forensic splitter, e.g. "sha256"
    pub hash_spec: [u8; 32],
    /// start of the payload, in 512-byte sectors
    pub payload_offset: u32,
    /// master key length in bytes
    pub key_bytes: u32,
    /// PBKDF2 digest of the master key
    pub mk_digest: [u8; 20],
    pub mk_digest_salt: [u8; 32],
    pub mk_digest_iter: u32,
    /// UUID of device
    pub uuid: [u8; 40],
    pub key_slots: [KeySlotRaw; V1_NUM_KEYS],
}

impl HeaderRaw {
    /// Attempt to read a LUKS1 header from a slice.
    ///
    /// Note: a LUKS1 header is always exactly 592 bytes long.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ParseError> {
        let options = bincode::config::legacy()
            .with_big_endian()
            .with_fixed_int_encoding();
        let h: Self = bincode::decode_from_slice(slice, options)?.0;
        Ok(h)
    }

    pub fn write_slice(&self, slice: &mut [u8]) -> Result<(), bincode::error::EncodeError> {
        let options = bincode::config::legacy()
            .with_big_endian()
            .with_fixed_int_encoding();
        bincode::encode_into_slice(self, slice, options).map(|_| ())
    }
}

/// A key slot in its decoded form.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySlot {
    pub active: bool,
    pub iterations: u32,
    pub salt: [u8; 32],
    /// start of the striped key material, in 512-byte sectors
    pub key_material_offset: u32,
    pub stripes: u32,
}

impl KeySlot {
    fn from_raw(slot: usize, raw: &KeySlotRaw) -> Result<Self, ParseError> {
        let active = match raw.active {
            SLOT_ACTIVE => true,
            SLOT_DISABLED => false,
            tag => return Err(ParseError::InvalidSlotTag { slot, tag }),
        };
        Ok(Self {
            active,
            iterations: raw.iterations,
            salt: raw.salt,
            key_material_offset: raw.key_material_offset,
            stripes: raw.stripes,
        })
    }

    fn to_raw(&self) -> KeySlotRaw {
        KeySlotRaw {
            active: if self.active {
                SLOT_ACTIVE
            } else {
                SLOT_DISABLED
            },
            iterations: self.iterations,
            salt: self.salt,
            key_material_offset: self.key_material_offset,
            stripes: self.stripes,
        }
    }
}

/// The LUKS1 header in its decoded form.
#[derive(Debug, Clone)]
pub struct Header {
    pub cipher: Encryption,
    pub hash_spec: HashAlg,
    /// start of the payload, in 512-byte sectors
    pub payload_offset: u32,
    /// master key length in bytes
    pub key_bytes: u32,
    pub mk_digest: [u8; 20],
    pub mk_digest_salt: [u8; 32],
    pub mk_digest_iter: u32,
    pub uuid: String,
    pub key_slots: [KeySlot; V1_NUM_KEYS],
}

impl TryFrom<&HeaderRaw> for Header {
    type Error = ParseError;
    fn try_from(h: &HeaderRaw) -> Result<Self, Self::Error> {
        if h.magic != MAGIC_1ST {
            return Err(ParseError::InvalidHeaderMagic);
        }
        if h.version != 1 {
            return Err(ParseError::InvalidHeaderVersion(h.version));
        }
        let cipher_name = ascii_cstr_to_str("Header.cipher_name", &h.cipher_name)?;
        let cipher_mode = ascii_cstr_to_str("Header.cipher_mode", &h.cipher_mode)?;
        let hash_spec = ascii_cstr_to_str("Header.hash_spec", &h.hash_spec)?;
        let uuid = ascii_cstr_to_str("Header.uuid", &h.uuid)?;
        if uuid.is_empty() {
            return Err(ParseError::MissingUuid);
        }
        if (h.payload_offset as u64) * (V1_SECTOR_SIZE as u64) < V1_HEADER_LEN as u64 {
            return Err(ParseError::PayloadOverlapsHeader(h.payload_offset as u64));
        }

        let mut key_slots = Vec::with_capacity(V1_NUM_KEYS);
        for (slot, raw) in h.key_slots.iter().enumerate() {
            let ks = KeySlot::from_raw(slot, raw)?;
            // active slots must keep their material below the payload
            if ks.active {
                let end = ks.key_material_offset as u64 * V1_SECTOR_SIZE as u64
                    + h.key_bytes as u64 * ks.stripes as u64;
                if end > h.payload_offset as u64 * V1_SECTOR_SIZE as u64 {
                    return Err(ParseError::KeySlotOutOfBounds { slot });
                }
            }
            key_slots.push(ks);
        }
        let key_slots: [KeySlot; V1_NUM_KEYS] = key_slots.try_into().expect("eight key slots");

        Ok(Self {
            cipher: Encryption::from_name_and_mode(cipher_name, cipher_mode),
            hash_spec: HashAlg::from_name(hash_spec),
            payload_offset: h.payload_offset,
            key_bytes: h.key_bytes,
            mk_digest: h.mk_digest,
            mk_digest_salt: h.mk_digest_salt,
            mk_digest_iter: h.mk_digest_iter,
            uuid: uuid.to_string(),
            key_slots,
        })
    }
}

impl TryFrom<&Header> for HeaderRaw {
    type Error = EncodeError;
    fn try_from(h: &Header) -> Result<Self, Self::Error> {
        let (cipher_name, cipher_mode) = h.cipher.name_and_mode();
        let mut magic = [0; MAGIC_LEN];
        magic.copy_from_slice(MAGIC_1ST);
        let mut key_slots = Vec::with_capacity(V1_NUM_KEYS);
        for ks in &h.key_slots {
            key_slots.push(ks.to_raw());
        }
        Ok(Self {
            magic,
            version: 1,
            cipher_name: str_to_ascii_array("Header.cipher_name", cipher_name)?,
            cipher_mode: str_to_ascii_array("Header.cipher_mode", cipher_mode)?,
            hash_spec: str_to_ascii_array("Header.hash_spec", h.hash_spec.name())?,
            payload_offset: h.payload_offset,
            key_bytes: h.key_bytes,
            mk_digest: h.mk_digest,
            mk_digest_salt: h.mk_digest_salt,
            mk_digest_iter: h.mk_digest_iter,
            uuid: str_to_ascii_array("Header.uuid", &h.uuid)?,
            key_slots: key_slots.try_into().expect("eight key slots"),
        })
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Luks1 Header:")?;
        writeln!(f, "\tversion: 1")?;
        writeln!(f, "\tcipher: {}", self.cipher.name())?;
        writeln!(f, "\thash_spec: {}", self.hash_spec)?;
        writeln!(f, "\tpayload_offset: {} sectors", self.payload_offset)?;
        writeln!(f, "\tkey_bytes: {}", self.key_bytes)?;
        writeln!(f, "\tmk_digest: {:?}", &Bytes(&self.mk_digest))?;
        writeln!(f, "\tmk_digest_iter: {}", self.mk_digest_iter)?;
        writeln!(f, "\tuuid: {}", self.uuid)?;
        for (i, ks) in self.key_slots.iter().enumerate() {
            if ks.active {
                writeln!(
                    f,
                    "\tslot {}: active, {} iterations, material at sector {}, {} stripes",
                    i, ks.iterations, ks.key_material_offset, ks.stripes
                )?;
            } else {
                writeln!(f, "\tslot {}: disabled", i)?;
            }
        }
        Ok(())
    }
}

impl Header {
    /// Parses the first 592 bytes of a device.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw = HeaderRaw::from_slice(bytes)?;
        Self::try_from(&raw)
    }

    /// Rebuilds the 592-byte on-disk image of this header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let raw = HeaderRaw::try_from(self)?;
        let mut bytes = vec![0; V1_HEADER_LEN];
        raw.write_slice(&mut bytes)?;
        Ok(bytes)
    }

    /// Returns true iff key slot `slot` holds wrapped key material.
    pub fn check_slot_active(&self, slot: usize) -> bool {
        slot < V1_NUM_KEYS && self.key_slots[slot].active
    }

    /// Tries `password` against every active key slot. On success returns a
    /// payload decryption stream along with the payload extent. A failure to
    /// unwrap an individual slot only skips that slot; the search ends with
    /// [`WrongPassword`](LuksError::WrongPassword) when no slot matches, or
    /// [`NoPasswords`](LuksError::NoPasswords) when none was active.
    pub fn check<R: Read + Seek>(
        &self,
        password: &[u8],
        device: &mut R,
    ) -> Result<Unsealed, LuksError> {
        let device_size = device.seek(SeekFrom::End(0))?;
        let hash = &self.hash_spec;
        // fail early on a digest we cannot compute at all
        hash.digest_size()?;

        let mut active_slots = 0;
        for (slot, ks) in self.key_slots.iter().enumerate() {
            if !ks.active {
                continue;
            }
            active_slots += 1;

            let pwd_key = kdf::derive_pbkdf2(
                hash,
                password,
                &ks.salt,
                ks.iterations,
                self.key_bytes as usize,
            )?;

            let mut striped = vec![0; self.key_bytes as usize * ks.stripes as usize];
            read_key_material(
                device,
                ks.key_material_offset as u64 * V1_SECTOR_SIZE as u64,
                &mut striped,
                slot,
            )?;

            let split_key = match cipher::decrypt_sectors(
                &self.cipher,
                &pwd_key,
                0,
                V1_SECTOR_SIZE,
                &striped,
            ) {
                Ok(k) => Zeroizing::new(k),
                Err(e) => {
                    warn!(slot, error = %e, "could not decrypt key material, skipping slot");
                    continue;
                }
            };
            let mut mk_candidate =
                match hash.af_merge(&split_key, self.key_bytes as usize, ks.stripes as usize) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(slot, error = %e, "could not merge key material, skipping slot");
                        continue;
                    }
                };

            let mut candidate_digest = [0; V1_DIGEST_SIZE];
            hash.pbkdf2(
                &mk_candidate,
                &self.mk_digest_salt,
                self.mk_digest_iter,
                &mut candidate_digest,
            )?;

            if bool::from(candidate_digest.ct_eq(&self.mk_digest)) {
                let payload_offset = self.payload_offset as u64 * V1_SECTOR_SIZE as u64;
                let stream = CryptoStream::new(
                    Secret::new(MasterKey::new(mk_candidate)),
                    self.cipher.clone(),
                    V1_SECTOR_SIZE as u32,
                    0,
                );
                return Ok(Unsealed {
                    stream,
                    payload_offset,
                    payload_size: device_size.saturating_sub(payload_offset),
                });
            }
            mk_candidate.zeroize();
        }

        if active_slots == 0 {
            Err(LuksError::NoPasswords)
        } else {
            Err(LuksError::WrongPassword)
        }
    }
}

fn read_key_material<R: Read + Seek>(
    device: &mut R,
    offset: u64,
    buf: &mut [u8],
    slot: usize,
) -> Result<(), LuksError> {
    device.seek(SeekFrom::Start(offset))?;
    device.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => LuksError::SlotTruncated { slot },
        _ => LuksError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        let mut key_slots = Vec::new();
        for i in 0..V1_NUM_KEYS {
            key_slots.push(KeySlot {
                active: i == 0,
                iterations: 1_000,
                salt: [i as u8; 32],
                key_material_offset: 8,
                stripes: 4_000,
            });
        }
        Header {
            cipher: Encryption::AesXtsPlain64,
            hash_spec: HashAlg::Sha256,
            payload_offset: 1_024,
            key_bytes: 64,
            mk_digest: [0xd1; 20],
            mk_digest_salt: [0xd5; 32],
            mk_digest_iter: 4_000,
            uuid: "e0a4d0a9-5f31-4b05-a7cd-54fb3e6e2e3f".to_string(),
            key_slots: key_slots.try_into().unwrap(),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), V1_HEADER_LEN);
        let parsed = Header::parse(&bytes).unwrap();
        assert_eq!(parsed.cipher, header.cipher);
        assert_eq!(parsed.hash_spec, header.hash_spec);
        assert_eq!(parsed.payload_offset, header.payload_offset);
        assert_eq!(parsed.uuid, header.uuid);
        assert_eq!(parsed.key_slots, header.key_slots);
        assert!(parsed.check_slot_active(0));
        assert!(!parsed.check_slot_active(1));
    }

    #[test]
    fn test_invalid_slot_tag() {
        let header = sample_header();
        let mut bytes = header.to_bytes().unwrap();
        // first slot tag lives at offset 208
        bytes[208..212].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        assert!(matches!(
            Header::parse(&bytes),
            Err(ParseError::InvalidSlotTag { slot: 0, .. })
        ));
    }

    #[test]
    fn test_slot_bounds() {
        let mut header = sample_header();
        // material for an active slot must end before the payload
        header.key_slots[0].key_material_offset = header.payload_offset - 1;
        let bytes = header.to_bytes().unwrap();
        assert!(matches!(
            Header::parse(&bytes),
            Err(ParseError::KeySlotOutOfBounds { slot: 0 })
        ));
    }
}
