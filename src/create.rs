//! Creation of new LUKS1 and LUKS2 volumes: builds the complete header
//! byte image and hands back a payload encryption stream carrying the fresh
//! master key.

use core::cmp::max;

use rand::prelude::*;
use secrecy::Secret;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cipher::{self, CryptoStream, Encryption, MasterKey};
use crate::error::LuksError;
use crate::hash::HashAlg;
use crate::kdf;
use crate::utils::round_up;
use crate::v1;
use crate::v2::{
    Af, Area, AreaTypeData, BinHeader, Checksum, Config, Digest, DigestTypeData, Index, JsonHeader,
    Kdf, KdfTypeData, Keyslot, KeyslotTypeData, Magic, Priority, SectorSize, Segment, SegmentSize,
    SegmentTypeData, Stripes,
};
use crate::{
    HEADER_SIZE_BUCKETS, SALT_LEN, V1_ALIGN_KEYSLOTS, V1_DIGEST_SIZE, V1_HEADER_LEN, V1_NUM_KEYS,
    V1_SALT_SIZE, V1_SECTOR_SIZE, V1_STRIPES, V2_ALIGN_KEYSLOTS, V2_BIN_HEADER_LEN, V2_SECTOR_SIZE,
    V2_STRIPES,
};

/// Master keys are always 512 bits, giving AES-256 in XTS mode.
const MASTER_KEY_LEN: usize = 64;

/// Argon2 costs fixed by the format; only the memory cost is tuned.
const ARGON2_TIME_COST: u32 = 1;
const ARGON2_THREADS: u32 = 4;

/// KDF cost parameters for creating a volume. The defaults measure the host
/// (taking roughly a second per derivation); tests and batch jobs inject
/// fixed values instead.
#[derive(Debug, Clone)]
pub struct CreateParams {
    /// PBKDF2 iteration count for V1 key slots and the V2 master-key digest.
    pub pbkdf2_iterations: Option<u32>,
    /// Argon2i memory cost in KiB for V2 key slots.
    pub argon2_memory_kib: Option<u32>,
    /// Payload sector size for V2 volumes.
    pub sector_size: SectorSize,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: None,
            argon2_memory_kib: None,
            sector_size: SectorSize::B4096,
        }
    }
}

/// Creates a LUKS1 volume unlockable by each of `passwords` (between 1 and
/// 8). Returns the header image, to be written at offset 0, and the
/// encryption stream for the payload that follows it.
pub fn encrypt_v1(passwords: &[&str]) -> Result<(Vec<u8>, CryptoStream), LuksError> {
    encrypt_v1_with(passwords, &CreateParams::default())
}

pub fn encrypt_v1_with(
    passwords: &[&str],
    params: &CreateParams,
) -> Result<(Vec<u8>, CryptoStream), LuksError> {
    if passwords.is_empty() {
        return Err(LuksError::NoPasswords);
    }
    if passwords.len() > V1_NUM_KEYS {
        return Err(LuksError::TooManyPasswords {
            requested: passwords.len(),
            available: V1_NUM_KEYS,
        });
    }

    let mut rng = StdRng::try_from_os_rng().map_err(|_| LuksError::Random)?;
    let hash = HashAlg::Sha256;

    let mut mk_digest_salt = [0; V1_SALT_SIZE];
    rng.fill_bytes(&mut mk_digest_salt);
    let mut mkey = vec![0; MASTER_KEY_LEN];
    rng.fill_bytes(&mut mkey);

    let mut mk_digest = [0; V1_DIGEST_SIZE];
    hash.pbkdf2(&mkey, &mk_digest_salt, V1_STRIPES, &mut mk_digest)?;

    let iterations = match params.pbkdf2_iterations {
        Some(n) => n,
        None => kdf::pbkdf2_cost(&mk_digest_salt, MASTER_KEY_LEN, &hash)?,
    };

    // slots are laid out back to back, each starting on an aligned boundary
    // right after the 592-byte header
    let mut header_len = round_up(V1_HEADER_LEN, V1_ALIGN_KEYSLOTS);
    let mut key_slots = Vec::with_capacity(V1_NUM_KEYS);
    let mut materials: Vec<(usize, Vec<u8>)> = Vec::new();
    for i in 0..V1_NUM_KEYS {
        let mut slot_salt = [0; V1_SALT_SIZE];
        rng.fill_bytes(&mut slot_salt);
        let active = i < passwords.len();
        key_slots.push(v1::KeySlot {
            active,
            iterations,
            salt: slot_salt,
            key_material_offset: (header_len / V1_SECTOR_SIZE) as u32,
            stripes: V1_STRIPES,
        });
        if active {
            let split = Zeroizing::new(hash.af_split(&mkey, V1_STRIPES as usize)?);
            let pwd_key = kdf::derive_pbkdf2(
                &hash,
                passwords[i].as_bytes(),
                &slot_salt,
                iterations,
                MASTER_KEY_LEN,
            )?;
            let striped = cipher::encrypt_sectors(
                &Encryption::AesXtsPlain64,
                &pwd_key,
                0,
                V1_SECTOR_SIZE,
                &split,
            )?;
            materials.push((header_len, striped));
        }
        header_len += MASTER_KEY_LEN * V1_STRIPES as usize;
        header_len = round_up(header_len, V1_ALIGN_KEYSLOTS);
    }
    header_len = round_up(header_len, V1_SECTOR_SIZE);

    let header = v1::Header {
        cipher: Encryption::AesXtsPlain64,
        hash_spec: hash,
        payload_offset: (header_len / V1_SECTOR_SIZE) as u32,
        key_bytes: MASTER_KEY_LEN as u32,
        mk_digest,
        mk_digest_salt,
        mk_digest_iter: V1_STRIPES,
        uuid: Uuid::new_v4().to_string(),
        key_slots: key_slots.try_into().expect("eight key slots"),
    };

    let mut image = vec![0; header_len];
    image[..V1_HEADER_LEN].copy_from_slice(&header.to_bytes()?);
    for (offset, striped) in &materials {
        image[*offset..*offset + striped.len()].copy_from_slice(striped);
    }

    let stream = CryptoStream::new(
        Secret::new(MasterKey::new(mkey)),
        Encryption::AesXtsPlain64,
        V1_SECTOR_SIZE as u32,
        0,
    );
    Ok((image, stream))
}

/// Creates a LUKS2 volume unlockable by each of `passwords` (at least one).
/// Returns the header image, to be written at offset 0, and the encryption
/// stream for the payload that follows it.
pub fn encrypt_v2(passwords: &[&str]) -> Result<(Vec<u8>, CryptoStream), LuksError> {
    encrypt_v2_with(passwords, &CreateParams::default())
}

pub fn encrypt_v2_with(
    passwords: &[&str],
    params: &CreateParams,
) -> Result<(Vec<u8>, CryptoStream), LuksError> {
    if passwords.is_empty() {
        return Err(LuksError::NoPasswords);
    }

    let mut rng = StdRng::try_from_os_rng().map_err(|_| LuksError::Random)?;
    let hash = HashAlg::Sha256;

    let mut h_salt1 = [0; SALT_LEN];
    let mut h_salt2 = [0; SALT_LEN];
    let mut mkey_salt = [0; V1_SALT_SIZE];
    rng.fill_bytes(&mut h_salt1);
    rng.fill_bytes(&mut h_salt2);
    rng.fill_bytes(&mut mkey_salt);
    let mut mkey = vec![0; MASTER_KEY_LEN];
    rng.fill_bytes(&mut mkey);

    let iterations = match params.pbkdf2_iterations {
        Some(n) => n,
        None => kdf::pbkdf2_cost(&mkey_salt, MASTER_KEY_LEN, &hash)?,
    };
    let memory_cost = match params.argon2_memory_kib {
        Some(n) => n,
        None => kdf::argon2_memory_cost(&mkey_salt, MASTER_KEY_LEN, ARGON2_TIME_COST, ARGON2_THREADS)?,
    };

    let mut mk_digest = vec![0; hash.digest_size()?];
    hash.pbkdf2(&mkey, &mkey_salt, iterations, &mut mk_digest)?;

    // wrap the master key once per password
    let mut keyslots = Vec::with_capacity(passwords.len());
    let mut materials = Vec::with_capacity(passwords.len());
    let mut digest_keyslots = Vec::with_capacity(passwords.len());
    for (i, password) in passwords.iter().enumerate() {
        let mut slot_salt = [0; V1_SALT_SIZE];
        rng.fill_bytes(&mut slot_salt);
        let pwd_key = kdf::derive_argon2(
            argon2::Algorithm::Argon2i,
            password.as_bytes(),
            &slot_salt,
            ARGON2_TIME_COST,
            memory_cost,
            ARGON2_THREADS,
            MASTER_KEY_LEN,
        )?;
        let split = Zeroizing::new(hash.af_split(&mkey, V2_STRIPES)?);
        let striped = cipher::encrypt_sectors(
            &Encryption::AesXtsPlain64,
            &pwd_key,
            0,
            V1_SECTOR_SIZE,
            &split,
        )?;
        keyslots.push(Keyslot {
            type_data: KeyslotTypeData::Luks2 {
                kdf: Kdf {
                    type_data: KdfTypeData::Argon2i {
                        time: ARGON2_TIME_COST,
                        memory: memory_cost,
                        cpus: ARGON2_THREADS,
                    },
                    salt: slot_salt.to_vec(),
                },
                af: Af::Luks1 {
                    stripes: Stripes {},
                    hash: hash.clone(),
                },
            },
            key_size: MASTER_KEY_LEN,
            area: Area {
                type_data: AreaTypeData::Raw {
                    encryption: Encryption::AesXtsPlain64,
                    key_size: MASTER_KEY_LEN,
                },
                // fixed up by the layout loop below
                offset: 0,
                size: striped.len() as u64,
            },
            priority: Some(Priority::Normal),
        });
        materials.push(striped);
        digest_keyslots.push(Index(i));
    }

    let uuid = Uuid::new_v4().to_string();
    let mut h1 = BinHeader {
        magic: Magic::First,
        hdr_size: 0,
        seqid: 1,
        label: None,
        checksum: Checksum::zeroed(),
        salt: h_salt1,
        uuid: uuid.clone(),
        subsystem: None,
        hdr_offset: 0,
    };
    let mut h2 = BinHeader {
        magic: Magic::Second,
        hdr_size: 0,
        seqid: 1,
        label: None,
        checksum: Checksum::zeroed(),
        salt: h_salt2,
        uuid,
        subsystem: None,
        hdr_offset: 0,
    };

    let mut json = JsonHeader {
        keyslots,
        tokens: vec![],
        segments: vec![Segment {
            type_data: SegmentTypeData::Crypt {
                iv_tweak: 0,
                encryption: Encryption::AesXtsPlain64,
                sector_size: params.sector_size.clone(),
                integrity: None,
            },
            // fixed up by the layout loop below
            offset: 0,
            size: SegmentSize::Dynamic,
            flags: vec![],
        }],
        digests: vec![Digest {
            type_data: DigestTypeData::Pbkdf2 {
                hash: hash.clone(),
                iterations,
            },
            keyslots: digest_keyslots,
            segments: vec![Index(0)],
            salt: mkey_salt.to_vec(),
            digest: mk_digest,
        }],
        config: Config {
            json_size: 0,
            keyslots_size: 0,
            flags: None,
            requirements: None,
        },
    };

    // Iterate the layout until nothing shifts anymore: the serialized JSON
    // length decides the header size, the header size moves the keyslot
    // area, the keyslot area moves the segment, and every move changes the
    // serialized JSON again. Each quantity only ever grows within a small
    // set of aligned sizes, so this settles within a few rounds.
    let stride = round_up(MASTER_KEY_LEN * V2_STRIPES, V2_ALIGN_KEYSLOTS) as u64;
    let reserved_slots = max(passwords.len(), 64) as u64;
    let mut rounds = 0;
    let (encoded, header_size, segment_offset) = loop {
        rounds += 1;
        if rounds > 32 {
            return Err(LuksError::LayoutDiverged);
        }
        let encoded = serde_json::to_vec(&json)?;
        let header_size = round_header_size(V2_BIN_HEADER_LEN + encoded.len() + 1)? as u64;
        let mut changed = false;

        if json.config.json_size != header_size - V2_BIN_HEADER_LEN as u64 {
            json.config.json_size = header_size - V2_BIN_HEADER_LEN as u64;
            changed = true;
        }
        if h1.hdr_size != header_size {
            h1.hdr_size = header_size;
            h2.hdr_size = header_size;
            h1.hdr_offset = 0;
            h2.hdr_offset = header_size;
            changed = true;
        }
        let keyslots_offset = 2 * header_size;
        for (i, keyslot) in json.keyslots.iter_mut().enumerate() {
            let offset = keyslots_offset + stride * i as u64;
            if keyslot.area.offset != offset {
                keyslot.area.offset = offset;
                changed = true;
            }
        }
        let keyslots_size = stride * reserved_slots;
        if json.config.keyslots_size != keyslots_size {
            json.config.keyslots_size = keyslots_size;
            changed = true;
        }
        let segment_offset = round_up((keyslots_offset + keyslots_size) as usize, V2_SECTOR_SIZE);
        if json.segments[0].offset != segment_offset as u64 {
            json.segments[0].offset = segment_offset as u64;
            changed = true;
        }

        if !changed {
            break (encoded, header_size as usize, segment_offset);
        }
    };

    // each header is checksummed over its own bytes plus the padded JSON area
    let mut json_area = vec![0; header_size - V2_BIN_HEADER_LEN];
    json_area[..encoded.len()].copy_from_slice(&encoded);
    h1.checksum = h1.compute_checksum(&json_area)?;
    h2.checksum = h2.compute_checksum(&json_area)?;

    let mut image = vec![0; segment_offset];
    image[..V2_BIN_HEADER_LEN].copy_from_slice(&h1.to_bytes()?);
    image[V2_BIN_HEADER_LEN..V2_BIN_HEADER_LEN + json_area.len()].copy_from_slice(&json_area);
    image[header_size..header_size + V2_BIN_HEADER_LEN].copy_from_slice(&h2.to_bytes()?);
    image[header_size + V2_BIN_HEADER_LEN..2 * header_size].copy_from_slice(&json_area);
    for (i, striped) in materials.iter().enumerate() {
        let offset = json.keyslots[i].area.offset as usize;
        image[offset..offset + striped.len()].copy_from_slice(striped);
    }

    let stream = CryptoStream::new(
        Secret::new(MasterKey::new(mkey)),
        Encryption::AesXtsPlain64,
        params.sector_size.as_u64() as u32,
        0,
    );
    Ok((image, stream))
}

/// Rounds a raw metadata size up to the smallest header size bucket that
/// still leaves room for a terminating zero byte.
fn round_header_size(size: usize) -> Result<usize, LuksError> {
    HEADER_SIZE_BUCKETS
        .iter()
        .map(|b| *b as usize)
        .find(|b| size < *b)
        .ok_or(LuksError::MetadataOverflow(size))
}
