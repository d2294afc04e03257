//! The LUKS2 on-disk metadata: two 4096-byte binary headers, each followed
//! by a JSON area describing keyslots, digests, segments and tokens.

use core::convert::TryFrom;
use core::fmt::{self, Display};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use bincode::{Decode, Encode};
use digest::Output;
use secrecy::Secret;
use serde::{
    de::{self, Deserializer},
    Deserialize, Serialize, Serializer,
};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::{self, CryptoStream, Encryption, MasterKey, Unsealed};
use crate::error::{EncodeError, LuksError, ParseError};
use crate::hash::HashAlg;
use crate::kdf;
use crate::utils::{ascii_cstr_to_str, ascii_cstr_to_string, str_to_ascii_array, Bytes};
use crate::{
    CSUM_ALG_LEN, CSUM_LEN, LABEL_LEN, MAGIC_1ST, MAGIC_2ND, MAGIC_LEN, SALT_LEN, UUID_LEN,
    V1_SECTOR_SIZE, V2_BIN_HEADER_LEN, V2_SECTOR_SIZE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Magic {
    First,
    Second,
}

impl Magic {
    pub fn to_byte_array(&self) -> [u8; MAGIC_LEN] {
        let mut array = [0; MAGIC_LEN];
        array.copy_from_slice(match self {
            Self::First => MAGIC_1ST,
            Self::Second => MAGIC_2ND,
        });
        array
    }
    pub fn from_byte_array(s: &[u8; MAGIC_LEN]) -> Option<Self> {
        if s == MAGIC_1ST {
            Some(Self::First)
        } else if s == MAGIC_2ND {
            Some(Self::Second)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum Checksum {
    Sha256(Output<Sha256>),
}

impl Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256(csum) => write!(f, "sha256:{:?}", &Bytes(csum.as_slice())),
        }
    }
}

impl Checksum {
    /// A zeroed checksum, used before the real one can be computed.
    pub fn zeroed() -> Self {
        Self::Sha256(Output::<Sha256>::default())
    }

    pub fn to_byte_arrays(&self) -> ([u8; CSUM_ALG_LEN], [u8; CSUM_LEN]) {
        let (s_csum_alg, s_csum) = match self {
            Self::Sha256(csum) => (&b"sha256\0"[..], csum.as_slice()),
        };
        let mut csum_alg = [0; CSUM_ALG_LEN];
        let mut csum = [0; CSUM_LEN];
        csum_alg[..s_csum_alg.len()].copy_from_slice(s_csum_alg);
        csum[..s_csum.len()].copy_from_slice(s_csum);
        (csum_alg, csum)
    }
    pub fn from_byte_arrays(csum_alg: &[u8; CSUM_ALG_LEN], csum: &[u8; CSUM_LEN]) -> Option<Self> {
        if csum_alg.starts_with(b"sha256\0") {
            Some(Self::Sha256(*Output::<Sha256>::from_slice(&csum[..32])))
        } else {
            None
        }
    }
}

/// A LUKS2 binary header as described
/// [here](https://gitlab.com/cryptsetup/LUKS2-docs/blob/master/luks2_doc_wip.pdf).
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct BinHeaderRaw {
    /// must be `MAGIC_1ST` or `MAGIC_2ND`
    pub magic: [u8; MAGIC_LEN],
    /// Version 2
    pub version: u16,
    /// header size plus JSON area in bytes
    pub hdr_size: u64,
    /// sequence ID, increased on update
    pub seqid: u64,
    /// ASCII label or empty
    pub label: [u8; LABEL_LEN],
    /// checksum algorithm, "sha256"
    pub csum_alg: [u8; CSUM_ALG_LEN],
    /// salt, unique for every header
    pub salt: [u8; SALT_LEN],
    /// UUID of device
    pub uuid: [u8; UUID_LEN],
    /// owner subsystem label or empty
    pub subsystem: [u8; LABEL_LEN],
    /// offset from device start in bytes
    pub hdr_offset: u64,
    // must be zeroed
    _padding: [u8; 184],
    /// header checksum
    pub csum: [u8; CSUM_LEN],
    // Padding, must be zeroed
    _padding4096: [u8; 7 * 512],
}

impl BinHeaderRaw {
    /// Attempt to read a LUKS2 binary header from a slice.
    ///
    /// Note: a LUKS2 binary header is always exactly 4096 bytes long.
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

/// A LUKS2 binary header in its decoded form.
#[derive(Debug, Clone)]
pub struct BinHeader {
    pub magic: Magic,
    /// header size plus JSON area in bytes
    pub hdr_size: u64,
    /// sequence ID, increased on update
    pub seqid: u64,
    /// ASCII label or empty
    pub label: Option<String>,
    pub checksum: Checksum,
    /// salt, unique for every header
    pub salt: [u8; SALT_LEN],
    /// UUID of device
    pub uuid: String,
    /// owner subsystem label or empty
    pub subsystem: Option<String>,
    /// offset from device start in bytes
    pub hdr_offset: u64,
}

impl Display for BinHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Luks2 BinHeader:")?;
        writeln!(f, "\tlocation: {:?}", self.magic)?;
        writeln!(f, "\tversion: 2")?;
        writeln!(f, "\thdr_size: {}", self.hdr_size)?;
        writeln!(f, "\tseqid: {}", self.seqid)?;
        writeln!(f, "\tlabel: {:?}", self.label)?;
        writeln!(f, "\tchecksum: {}", self.checksum)?;
        writeln!(f, "\tsalt: {:?}", &Bytes(&self.salt))?;
        writeln!(f, "\tuuid: {}", self.uuid)?;
        writeln!(f, "\tsubsystem: {:?}", self.subsystem)?;
        writeln!(f, "\thdr_offset: 0x{:016x}", self.hdr_offset)?;
        Ok(())
    }
}

impl TryFrom<&BinHeader> for BinHeaderRaw {
    type Error = EncodeError;
    fn try_from(h: &BinHeader) -> Result<Self, Self::Error> {
        fn opt_string_to_str(s: &Option<String>) -> &str {
            s.as_ref().map(|s| s.as_str()).unwrap_or("")
        }
        let (csum_alg, csum) = h.checksum.to_byte_arrays();
        Ok(Self {
            magic: h.magic.to_byte_array(),
            version: 2,
            hdr_size: h.hdr_size,
            seqid: h.seqid,
            label: str_to_ascii_array("BinHeader.label", opt_string_to_str(&h.label))?,
            csum_alg,
            salt: h.salt,
            uuid: str_to_ascii_array("BinHeader.uuid", &h.uuid)?,
            subsystem: str_to_ascii_array("BinHeader.subsystem", opt_string_to_str(&h.subsystem))?,
            hdr_offset: h.hdr_offset,
            _padding: [0; 184],
            csum,
            _padding4096: [0; 7 * 512],
        })
    }
}

impl TryFrom<&BinHeaderRaw> for BinHeader {
    type Error = ParseError;
    fn try_from(h: &BinHeaderRaw) -> Result<Self, Self::Error> {
        // check header version
        if h.version != 2 {
            return Err(ParseError::InvalidHeaderVersion(h.version));
        }
        Ok(Self {
            magic: Magic::from_byte_array(&h.magic).ok_or(ParseError::InvalidHeaderMagic)?,
            hdr_size: h.hdr_size,
            seqid: h.seqid,
            label: ascii_cstr_to_string("BinHeader.label", &h.label)?,
            checksum: Checksum::from_byte_arrays(&h.csum_alg, &h.csum)
                .ok_or(ParseError::UnsupportedChecksumAlgorithm(h.csum_alg))?,
            salt: h.salt,
            uuid: ascii_cstr_to_string("BinHeader.uuid", &h.uuid)?
                .ok_or(ParseError::MissingUuid)?,
            subsystem: ascii_cstr_to_string("BinHeader.subsystem", &h.subsystem)?,
            hdr_offset: h.hdr_offset,
        })
    }
}

impl BinHeader {
    /// Parses one 4096-byte binary header.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw = BinHeaderRaw::from_slice(bytes)?;
        Self::try_from(&raw)
    }

    /// Rebuilds the 4096-byte on-disk image of this header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let raw = BinHeaderRaw::try_from(self)?;
        let mut bytes = vec![0; V2_BIN_HEADER_LEN];
        raw.write_slice(&mut bytes)?;
        Ok(bytes)
    }

    fn calculate_checksum_generic<H: digest::Digest>(
        &self,
        json_area: &[u8],
    ) -> Result<Output<H>, EncodeError> {
        let mut raw = BinHeaderRaw::try_from(self)?;
        raw.csum = [0; CSUM_LEN];
        let mut bytes = vec![0; V2_BIN_HEADER_LEN];
        raw.write_slice(&mut bytes)?;

        let mut hasher = H::new();
        hasher.update(&bytes);
        hasher.update(json_area);
        Ok(hasher.finalize())
    }

    /// Computes the checksum of this header over its own bytes (with a
    /// zeroed checksum field) followed by the complete zero-padded JSON
    /// area.
    pub fn compute_checksum(&self, json_area: &[u8]) -> Result<Checksum, EncodeError> {
        match self.checksum {
            Checksum::Sha256(_) => Ok(Checksum::Sha256(
                self.calculate_checksum_generic::<Sha256>(json_area)?,
            )),
        }
    }

    /// Verifies the stored checksum against the complete JSON area.
    pub fn verify_checksum(&self, json_area: &[u8]) -> Result<(), LuksError> {
        match self.checksum {
            Checksum::Sha256(ref stored) => {
                let calculated = self.calculate_checksum_generic::<Sha256>(json_area)?;
                if &calculated != stored {
                    let (mut c, mut s) = ([0; CSUM_LEN], [0; CSUM_LEN]);
                    c[..calculated.len()].copy_from_slice(&calculated);
                    s[..stored.len()].copy_from_slice(stored);
                    return Err(ParseError::InvalidChecksum {
                        calculated: c,
                        found: s,
                    }
                    .into());
                }
                Ok(())
            }
        }
    }

    /// Tries `password` against every applicable keyslot of every pbkdf2
    /// digest in the JSON metadata. On success returns a payload stream
    /// seeded with the segment's starting tweak, plus the payload extent.
    pub fn check<R: Read + Seek>(
        &self,
        password: &[u8],
        device: &mut R,
        json: &JsonHeader,
    ) -> Result<Unsealed, LuksError> {
        let device_size = device.seek(SeekFrom::End(0))?;

        // highest priority first, stable in slot order below that
        let mut order: Vec<usize> = (0..json.keyslots.len()).collect();
        order.sort_by_key(|&i| core::cmp::Reverse(json.keyslots[i].priority.unwrap_or_default()));

        let mut found_digests = 0;
        let mut applicable_slots = 0;
        for digest in &json.digests {
            let DigestTypeData::Pbkdf2 {
                hash: digest_hash,
                iterations: digest_iterations,
            } = &digest.type_data;
            found_digests += 1;

            // the first crypt segment assigned to the digest carries the
            // payload geometry
            let mut target = None;
            for idx in &digest.segments {
                let Some(segment) = json.segments.get(idx.0) else {
                    continue;
                };
                let SegmentTypeData::Crypt {
                    iv_tweak,
                    encryption,
                    sector_size,
                    ..
                } = &segment.type_data;
                let payload_size = match &segment.size {
                    SegmentSize::Dynamic => device_size.saturating_sub(segment.offset),
                    SegmentSize::Fixed(s) => *s,
                };
                target = Some((
                    segment.offset,
                    payload_size,
                    *iv_tweak,
                    encryption.clone(),
                    sector_size.clone(),
                ));
                break;
            }
            let Some((payload_offset, payload_size, iv_tweak, encryption, sector_size)) = target
            else {
                continue;
            };

            for &slot in &order {
                let keyslot = &json.keyslots[slot];
                if keyslot.priority == Some(Priority::Ignore) {
                    continue;
                }
                if !digest.keyslots.is_empty() && !digest.keyslots.contains(&Index(slot)) {
                    continue;
                }
                let KeyslotTypeData::Luks2 {
                    kdf: keyslot_kdf,
                    af:
                        Af::Luks1 {
                            stripes: af_stripes,
                            hash: af_hash,
                        },
                } = &keyslot.type_data;
                let AreaTypeData::Raw {
                    encryption: area_encryption,
                    key_size: area_key_size,
                } = &keyslot.area.type_data;

                if area_key_size * V2_SECTOR_SIZE < keyslot.key_size * af_stripes.as_usize() {
                    return Err(LuksError::SlotCorrupt {
                        slot,
                        reason: format!(
                            "key data area is too small ({} < {})",
                            area_key_size * V2_SECTOR_SIZE,
                            keyslot.key_size * af_stripes.as_usize()
                        ),
                    });
                }

                let pwd_key = match &keyslot_kdf.type_data {
                    KdfTypeData::Pbkdf2 { hash, iterations } => kdf::derive_pbkdf2(
                        hash,
                        password,
                        &keyslot_kdf.salt,
                        *iterations,
                        keyslot.key_size,
                    )?,
                    KdfTypeData::Argon2i { time, memory, cpus } => kdf::derive_argon2(
                        argon2::Algorithm::Argon2i,
                        password,
                        &keyslot_kdf.salt,
                        *time,
                        *memory,
                        *cpus,
                        keyslot.key_size,
                    )?,
                    KdfTypeData::Argon2id { time, memory, cpus } => kdf::derive_argon2(
                        argon2::Algorithm::Argon2id,
                        password,
                        &keyslot_kdf.salt,
                        *time,
                        *memory,
                        *cpus,
                        keyslot.key_size,
                    )?,
                    KdfTypeData::Unknown => {
                        debug!(slot, "skipping keyslot with unknown kdf type");
                        continue;
                    }
                };

                let mut striped = vec![0; keyslot.key_size * af_stripes.as_usize()];
                read_key_material(device, keyslot.area.offset, &mut striped, slot)?;

                let split_key = match cipher::decrypt_sectors(
                    area_encryption,
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
                    match af_hash.af_merge(&split_key, keyslot.key_size, af_stripes.as_usize()) {
                        Ok(k) => k,
                        Err(e) => {
                            warn!(slot, error = %e, "could not merge key material, skipping slot");
                            continue;
                        }
                    };
                // only a slot that produced a candidate counts as applicable
                applicable_slots += 1;

                let mut candidate_digest = vec![0; digest.digest.len()];
                digest_hash.pbkdf2(
                    &mk_candidate,
                    &digest.salt,
                    *digest_iterations,
                    &mut candidate_digest,
                )?;

                if bool::from(candidate_digest.ct_eq(&digest.digest)) {
                    let stream = CryptoStream::new(
                        Secret::new(MasterKey::new(mk_candidate)),
                        encryption.clone(),
                        sector_size.as_u64() as u32,
                        iv_tweak,
                    );
                    return Ok(Unsealed {
                        stream,
                        payload_offset,
                        payload_size,
                    });
                }
                mk_candidate.zeroize();
            }
        }

        if found_digests == 0 {
            Err(LuksError::NoDigests)
        } else if applicable_slots == 0 {
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

/// Reads one of the two header copies: the 4096-byte binary header at
/// `offset` plus its JSON area, verifying magic, placement and checksum.
pub(crate) fn load_copy<R: Read + Seek>(
    device: &mut R,
    offset: u64,
    expected_magic: Magic,
) -> Result<(BinHeader, JsonHeader), LuksError> {
    device.seek(SeekFrom::Start(offset))?;
    let mut bin_bytes = vec![0; V2_BIN_HEADER_LEN];
    device.read_exact(&mut bin_bytes).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => LuksError::HeaderTruncated,
        _ => LuksError::Io(e),
    })?;
    let bin = BinHeader::parse(&bin_bytes)?;
    if bin.magic != expected_magic {
        return Err(ParseError::InvalidHeaderMagic.into());
    }
    if !crate::ACCEPTED_HEADER_SIZES.contains(&bin.hdr_size) {
        return Err(ParseError::InvalidHeaderSize(bin.hdr_size).into());
    }
    if bin.hdr_offset != offset {
        return Err(ParseError::HeaderOffsetMismatch {
            expected: offset,
            found: bin.hdr_offset,
        }
        .into());
    }

    let mut json_area = vec![0; bin.hdr_size as usize - V2_BIN_HEADER_LEN];
    device
        .read_exact(&mut json_area)
        .map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => LuksError::HeaderTruncated,
            _ => LuksError::Io(e),
        })?;
    bin.verify_checksum(&json_area)?;

    let json_str = ascii_cstr_to_str("json_area", &json_area)?;
    let json = JsonHeader::from_slice(json_str.as_bytes())?;
    let json_size = bin.hdr_size - V2_BIN_HEADER_LEN as u64;
    if json.config.json_size != json_size {
        return Err(ParseError::JsonSizeMismatch {
            header: json_size,
            config: json.config.json_size,
        }
        .into());
    }
    Ok((bin, json))
}

pub(crate) mod bytes_base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::decode(&s).map_err(de::Error::custom)
    }
}

pub(crate) mod type_str {
    use core::fmt::Display;
    use core::str::FromStr;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: ToString>(v: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    // taken from https://github.com/serde-rs/json/issues/317#issuecomment-300251188
    pub fn deserialize<'de, T: FromStr, D>(deserializer: D) -> Result<T, D::Error>
    where
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        T::from_str(&s).map_err(de::Error::custom)
    }
}

pub(crate) mod list {
    use std::collections::BTreeMap;
    use serde::{de, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, T: Serialize>(
        list: &[T],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(list.len()))?;
        for (i, elem) in list.iter().enumerate() {
            map.serialize_entry(&i.to_string(), elem)?;
        }
        map.end()
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<T>, D::Error> {
        let mut map = BTreeMap::<String, T>::deserialize(deserializer)?;
        let mut list = Vec::with_capacity(map.len());
        for i in 0..map.len() {
            let elem = map.remove(&i.to_string()).ok_or_else(|| {
                de::Error::custom(format!("missing key \"{i}\" from JSON object list"))
            })?;
            list.push(elem);
        }
        Ok(list)
    }
}

/// Only the `raw` type is currently used.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum AreaTypeData {
    Raw {
        /// The area encryption algorithm, in dm-crypt notation (e. g. "aes-xts-plain64").
        encryption: Encryption,
        /// The area encryption key size, in bytes.
        key_size: usize,
    },
}

/// Information on the allocated area in the binary keyslots area of a
/// [`Keyslot`].
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Area {
    #[serde(flatten)]
    pub type_data: AreaTypeData,
    /// The offset from the device start to the beginning of the binary area in bytes.
    #[serde(with = "type_str")]
    pub offset: u64,
    /// The area size in bytes.
    #[serde(with = "type_str")]
    pub size: u64,
}

/// The stripe count of the anti-forensic splitter; for historical reasons
/// only the value 4000 is in use.
#[derive(Debug, Clone, PartialEq)]
pub struct Stripes {}

impl Stripes {
    pub fn as_usize(&self) -> usize {
        4_000
    }
}

impl Serialize for Stripes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_usize() as u16)
    }
}

impl<'de> Deserialize<'de> for Stripes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Stripes, D::Error> {
        match u16::deserialize(deserializer)? {
            4_000 => Ok(Stripes {}),
            v => Err(de::Error::custom(ParseError::InvalidStripes(v))),
        }
    }
}

/// An anti-forensic splitter of a [`Keyslot`]. See
/// [the LUKS1 spec](https://gitlab.com/cryptsetup/cryptsetup/wikis/Specification)
/// for more information.
///
/// Only the `luks1` type compatible with LUKS1 is currently used.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Af {
    Luks1 {
        /// The number of stripes, for historical reasons only the 4000 value is supported.
        stripes: Stripes,
        /// The hash algorithm used.
        hash: HashAlg,
    },
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum KdfTypeData {
    Pbkdf2 {
        /// The hash algorithm for the PBKDF.
        hash: HashAlg,
        /// The PBKDF2 iterations count.
        iterations: u32,
    },
    Argon2i {
        /// The time cost (in fact the iterations).
        time: u32,
        /// The memory cost in kilobytes. If not available, the keyslot cannot be unlocked.
        memory: u32,
        /// The required number of threads (CPU cores number cost). If not available, unlocking
        /// will be slower.
        cpus: u32,
    },
    Argon2id {
        /// The time cost (in fact the iterations).
        time: u32,
        /// The memory cost in kilobytes. If not available, the keyslot cannot be unlocked.
        memory: u32,
        /// The required number of threads (CPU cores number cost). If not available, unlocking
        /// will be slower.
        cpus: u32,
    },
    /// A KDF this implementation does not know; the keyslot is skipped when
    /// unsealing.
    #[serde(other)]
    Unknown,
}

/// Stores information on the PBKDF type and parameters of a [`Keyslot`].
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Kdf {
    #[serde(flatten)]
    pub type_data: KdfTypeData,
    /// The salt for the PBKDF in base64 (binary data).
    #[serde(with = "bytes_base64")]
    pub salt: Vec<u8>,
}

/// The priority of a [`Keyslot`].
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub enum Priority {
    /// The slot should be used only if explicitly stated.
    Ignore,
    /// Normal priority keyslot.
    #[default]
    Normal,
    /// Tried before normal priority keyslots.
    High,
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Self::Ignore => 0,
            Self::Normal => 1,
            Self::High => 2,
        })
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Priority, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Self::Ignore),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            p => Err(de::Error::custom(ParseError::InvalidPriority(p))),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
// enum variant names must match the JSON values exactly, which are lowercase, so no CamelCase names
#[serde(rename_all = "snake_case")]
pub enum KeyslotTypeData {
    Luks2 {
        /// The PBKDF type and parameters used.
        kdf: Kdf,
        /// The anti-forensic splitter.
        af: Af,
    },
}

/// A keyslot contains information about stored keys – areas, where binary
/// keyslot data are located, encryption and anti-forensic function used,
/// password-based key derivation function (PBKDF) and related parameters.
///
/// Only the `luks2` type is currently used.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Keyslot {
    #[serde(flatten)]
    pub type_data: KeyslotTypeData,
    /// The size of the key stored in the slot, in bytes.
    pub key_size: usize,
    /// The allocated area in the binary keyslots area.
    pub area: Area,
    /// The keyslot priority (optional).
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// The size of a [`Segment`].
#[derive(Clone, Debug, PartialEq)]
pub enum SegmentSize {
    /// Signals that the size of the underlying device should be used (dynamic resize).
    Dynamic,
    /// The size in bytes.
    Fixed(u64),
}

impl Serialize for SegmentSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Dynamic => serializer.serialize_str("dynamic"),
            Self::Fixed(n) => serializer.serialize_str(&n.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for SegmentSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<SegmentSize, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "dynamic" => Ok(Self::Dynamic),
            s => Ok(Self::Fixed(s.parse().map_err(de::Error::custom)?)),
        }
    }
}

/// The LUKS2 user data integrity protection type, an experimental feature
/// which is unsupported in this implementation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Integrity {}

impl<'de> Deserialize<'de> for Integrity {
    fn deserialize<D: Deserializer<'de>>(_deserializer: D) -> Result<Integrity, D::Error> {
        Err(de::Error::custom("crypt.integrity is unsupported"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SectorSize {
    B512,
    B1024,
    B2048,
    B4096,
}

impl SectorSize {
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::B512 => 512,
            Self::B1024 => 1024,
            Self::B2048 => 2048,
            Self::B4096 => 4096,
        }
    }
}

impl Serialize for SectorSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u64() as u16)
    }
}

impl<'de> Deserialize<'de> for SectorSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<SectorSize, D::Error> {
        match u16::deserialize(deserializer)? {
            512 => Ok(Self::B512),
            1024 => Ok(Self::B1024),
            2048 => Ok(Self::B2048),
            4096 => Ok(Self::B4096),
            s => Err(de::Error::custom(ParseError::InvalidSectorSize(s))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum SegmentTypeData {
    Crypt {
        /// The starting offset for the Initialization Vector, in sectors.
        #[serde(with = "type_str")]
        iv_tweak: u64,
        /// The segment encryption algorithm in dm-crypt notation (e. g. "aes-xts-plain64").
        encryption: Encryption,
        /// The sector size for the segment (512, 1024, 2048, or 4096 bytes).
        sector_size: SectorSize,
        /// The LUKS2 user data integrity protection type (optional, unsupported).
        #[serde(default)]
        #[serde(skip_serializing_if = "Option::is_none")]
        integrity: Option<Integrity>,
    },
}

/// A segment contains a definition of an encrypted area on the disk
/// containing user data (in LUKS1 mentioned as the user data payload). For a
/// normal LUKS device, there is only one data segment present.
///
/// Only the `crypt` type is currently used.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
pub struct Segment {
    #[serde(flatten)]
    pub type_data: SegmentTypeData,
    /// The offset from the device start to the beginning of the segment in bytes.
    #[serde(with = "type_str")]
    pub offset: u64,
    /// The segment size, see [`SegmentSize`].
    pub size: SegmentSize,
    /// An array of strings marking the segment with additional information (optional).
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

/// A keyslot or segment number, stored in JSON as a decimal string.
#[derive(Debug, Clone, PartialOrd, Eq, Ord, Deserialize, PartialEq, Serialize)]
pub struct Index(#[serde(with = "type_str")] pub usize);

#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DigestTypeData {
    Pbkdf2 {
        /// The hash algorithm used by PBKDF2.
        hash: HashAlg,
        /// The PBKDF2 iterations count.
        iterations: u32,
    },
}

/// A digest is used to verify that a key decrypted from a keyslot is
/// correct. Digests are assigned to keyslots and segments. If it is not
/// assigned to a segment, then it is a digest for an unbound key. Every
/// keyslot must have one assigned digest.
///
/// Only the `pbkdf2` type compatible with LUKS1 is used.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Digest {
    #[serde(flatten)]
    pub type_data: DigestTypeData,
    /// A list of keyslot numbers that are assigned to the digest.
    pub keyslots: Vec<Index>,
    /// A list of segment numbers that are assigned to the digest.
    pub segments: Vec<Index>,
    /// The binary salt for the digest, in base64.
    #[serde(with = "bytes_base64")]
    pub salt: Vec<u8>,
    /// The binary digest data, in base64.
    #[serde(with = "bytes_base64")]
    pub digest: Vec<u8>,
}

#[derive(Debug, PartialEq, Serialize)]
pub enum Requirement {}

impl<'de> Deserialize<'de> for Requirement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Requirement, D::Error> {
        let s = String::deserialize(deserializer)?;
        Err(de::Error::custom(format!(
            "unsupported requirement \"{s}\""
        )))
    }
}

/// Global attributes for the LUKS device.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// The JSON area size in bytes. Must match the binary header.
    #[serde(with = "type_str")]
    pub json_size: u64,
    /// The binary keyslot area size in bytes. Must be aligned to 4096 bytes.
    #[serde(with = "type_str")]
    pub keyslots_size: u64,
    /// An optional list of persistent flags for the device.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
    /// An optional list of additional required features for the LUKS device.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<Requirement>>,
}

/// A token is an object that can describe how to get a passphrase to unlock
/// a particular keyslot. It can also contain additional user-defined JSON
/// metadata. No token types are implemented; this is only included for
/// parsing compatibility.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Token {
    #[serde(rename = "type")]
    pub token_type: String,
    pub keyslots: Vec<Index>,
    #[serde(flatten)]
    pub type_data: BTreeMap<String, serde_json::Value>,
}

/// JSON metadata for the device as described
/// [here](https://gitlab.com/cryptsetup/LUKS2-docs/blob/master/luks2_doc_wip.pdf).
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct JsonHeader {
    /// Objects describing encrypted keys storage areas.
    #[serde(with = "list")]
    pub keyslots: Vec<Keyslot>,
    /// Tokens can optionally include additional metadata. Only included for parsing compatibility.
    #[serde(with = "list")]
    pub tokens: Vec<Token>,
    /// Segments describe areas on disk that contain user encrypted data.
    #[serde(with = "list")]
    pub segments: Vec<Segment>,
    /// Digests are used to verify that keys decrypted from keyslots are correct. Uses the keys
    /// of keyslots and segments to reference them.
    #[serde(with = "list")]
    pub digests: Vec<Digest>,
    /// Persistent header configuration attributes.
    pub config: Config,
}

impl Display for JsonHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Luks2 JsonHeader: {}",
            serde_json::to_string_pretty(&self).expect("valid json serialization")
        )
    }
}

impl JsonHeader {
    /// Attempt to read a LUKS2 JSON area from a slice. The slice must contain
    /// exactly the JSON data and nothing more.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ParseError> {
        let j: Self = serde_json::from_slice(slice)?;

        // check that keyslots size is aligned to 4096
        if (j.config.keyslots_size % 4096) != 0 {
            return Err(ParseError::KeyslotNotAligned);
        }

        // check that all segments/keyslots references are valid
        for digest in &j.digests {
            for keyslot_idx in &digest.keyslots {
                if keyslot_idx.0 >= j.keyslots.len() {
                    return Err(ParseError::InvalidKeyslotReference(keyslot_idx.0));
                }
            }
            for segment_idx in &digest.segments {
                if segment_idx.0 >= j.segments.len() {
                    return Err(ParseError::InvalidSegmentReference(segment_idx.0));
                }
            }
        }

        Ok(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> JsonHeader {
        JsonHeader {
            keyslots: vec![Keyslot {
                type_data: KeyslotTypeData::Luks2 {
                    kdf: Kdf {
                        type_data: KdfTypeData::Argon2i {
                            time: 1,
                            memory: 64,
                            cpus: 4,
                        },
                        salt: vec![0x11; 32],
                    },
                    af: Af::Luks1 {
                        stripes: Stripes {},
                        hash: HashAlg::Sha256,
                    },
                },
                key_size: 64,
                area: Area {
                    type_data: AreaTypeData::Raw {
                        encryption: Encryption::AesXtsPlain64,
                        key_size: 64,
                    },
                    offset: 0x10000,
                    size: 256_000,
                },
                priority: Some(Priority::Normal),
            }],
            tokens: vec![],
            segments: vec![Segment {
                type_data: SegmentTypeData::Crypt {
                    iv_tweak: 0,
                    encryption: Encryption::AesXtsPlain64,
                    sector_size: SectorSize::B4096,
                    integrity: None,
                },
                offset: 16_580_608,
                size: SegmentSize::Dynamic,
                flags: vec![],
            }],
            digests: vec![Digest {
                type_data: DigestTypeData::Pbkdf2 {
                    hash: HashAlg::Sha256,
                    iterations: 1_000,
                },
                keyslots: vec![Index(0)],
                segments: vec![Index(0)],
                salt: vec![0x22; 32],
                digest: vec![0x33; 32],
            }],
            config: Config {
                json_size: 28_672,
                keyslots_size: 16_515_072,
                flags: None,
                requirements: None,
            },
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let json = sample_json();
        let encoded = serde_json::to_string(&json).unwrap();
        let decoded = JsonHeader::from_slice(encoded.as_bytes()).unwrap();
        assert_eq!(json, decoded);
    }

    #[test]
    fn test_json_wire_format() {
        let json = sample_json();
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&json).unwrap()).unwrap();
        assert_eq!(v["keyslots"]["0"]["type"], "luks2");
        assert_eq!(v["keyslots"]["0"]["kdf"]["type"], "argon2i");
        assert_eq!(v["keyslots"]["0"]["af"]["type"], "luks1");
        assert_eq!(v["keyslots"]["0"]["af"]["stripes"], 4000);
        assert_eq!(v["keyslots"]["0"]["area"]["type"], "raw");
        assert_eq!(v["keyslots"]["0"]["area"]["offset"], "65536");
        assert_eq!(v["keyslots"]["0"]["priority"], 1);
        assert_eq!(v["segments"]["0"]["type"], "crypt");
        assert_eq!(v["segments"]["0"]["size"], "dynamic");
        assert_eq!(v["segments"]["0"]["iv_tweak"], "0");
        assert_eq!(v["segments"]["0"]["sector_size"], 4096);
        assert_eq!(v["digests"]["0"]["type"], "pbkdf2");
        assert_eq!(v["digests"]["0"]["segments"][0], "0");
        assert_eq!(v["config"]["json_size"], "28672");
        assert_eq!(v["tokens"], serde_json::json!({}));
    }

    #[test]
    fn test_unknown_kdf_is_parsed() {
        let mut v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&sample_json()).unwrap()).unwrap();
        v["keyslots"]["0"]["kdf"]["type"] = "scrypt".into();
        let decoded = JsonHeader::from_slice(v.to_string().as_bytes()).unwrap();
        let KeyslotTypeData::Luks2 { kdf, .. } = &decoded.keyslots[0].type_data;
        assert_eq!(kdf.type_data, KdfTypeData::Unknown);
    }

    #[test]
    fn test_dangling_reference() {
        let mut json = sample_json();
        json.digests[0].keyslots.push(Index(7));
        let encoded = serde_json::to_string(&json).unwrap();
        assert!(matches!(
            JsonHeader::from_slice(encoded.as_bytes()),
            Err(ParseError::InvalidKeyslotReference(7))
        ));
    }

    #[test]
    fn test_bin_header_roundtrip() {
        let header = BinHeader {
            magic: Magic::First,
            hdr_size: 0x8000,
            seqid: 3,
            label: None,
            checksum: Checksum::zeroed(),
            salt: [0x44; SALT_LEN],
            uuid: "e0a4d0a9-5f31-4b05-a7cd-54fb3e6e2e3f".to_string(),
            subsystem: None,
            hdr_offset: 0,
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), V2_BIN_HEADER_LEN);
        let parsed = BinHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.hdr_size, 0x8000);
        assert_eq!(parsed.seqid, 3);
        assert_eq!(parsed.uuid, header.uuid);
        assert_eq!(parsed.magic, Magic::First);
    }

    #[test]
    fn test_checksum_covers_json_area() {
        let mut header = BinHeader {
            magic: Magic::First,
            hdr_size: 0x8000,
            seqid: 1,
            label: None,
            checksum: Checksum::zeroed(),
            salt: [0x55; SALT_LEN],
            uuid: "e0a4d0a9-5f31-4b05-a7cd-54fb3e6e2e3f".to_string(),
            subsystem: None,
            hdr_offset: 0,
        };
        let mut json_area = vec![0u8; 0x8000 - V2_BIN_HEADER_LEN];
        json_area[..2].copy_from_slice(b"{}");
        header.checksum = header.compute_checksum(&json_area).unwrap();
        header.verify_checksum(&json_area).unwrap();

        json_area[100] ^= 0x01;
        assert!(header.verify_checksum(&json_area).is_err());
    }
}
