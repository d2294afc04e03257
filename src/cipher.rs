//! Sector-addressed AES-XTS for the payload segment and for the striped key
//! material held in the slot areas. XTS keys are split in half: 32 bytes
//! select AES-128, 64 bytes AES-256. The per-sector tweak is the plain64
//! little-endian sector number, offset by the stream's starting tweak.

use aes::{cipher::KeyInit, Aes128, Aes256};
use secrecy::{CloneableSecret, DebugSecret, ExposeSecret, Secret, Zeroize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use xts_mode::{get_tweak_default, Xts128};

use crate::error::LuksError;

/// A cipher/mode pair in dm-crypt notation. Only `aes-xts-plain64` can
/// actually be processed; other names are preserved for error reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum Encryption {
    AesXtsPlain64,
    Unknown(String),
}

impl Encryption {
    pub fn from_name(name: &str) -> Self {
        match name {
            "aes-xts-plain64" => Self::AesXtsPlain64,
            _ => Self::Unknown(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::AesXtsPlain64 => "aes-xts-plain64",
            Self::Unknown(s) => s.as_str(),
        }
    }

    /// Builds the dm-crypt name from the split cipher name and mode fields
    /// of a version 1 header.
    pub(crate) fn from_name_and_mode(name: &str, mode: &str) -> Self {
        Self::from_name(&format!("{name}-{mode}"))
    }

    /// Splits the dm-crypt name back into the version 1 header fields.
    pub(crate) fn name_and_mode(&self) -> (&str, &str) {
        match self {
            Self::AesXtsPlain64 => ("aes", "xts-plain64"),
            Self::Unknown(s) => match s.split_once('-') {
                Some((name, mode)) => (name, mode),
                None => (s.as_str(), ""),
            },
        }
    }
}

impl Serialize for Encryption {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Encryption {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Encryption, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Encryption::from_name(&s))
    }
}

fn xts_apply(
    encryption: &Encryption,
    key: &[u8],
    iv_tweak: u64,
    sector_size: usize,
    buf: &mut [u8],
    decrypt: bool,
) -> Result<(), LuksError> {
    if let Encryption::Unknown(name) = encryption {
        return Err(LuksError::UnsupportedCipher(name.clone()));
    }
    // XTS operates on whole sectors of at least one AES block
    if sector_size == 0 || sector_size % 16 != 0 || buf.len() % sector_size != 0 {
        return Err(LuksError::UnalignedCiphertext {
            len: buf.len(),
            sector_size,
        });
    }
    match key.len() {
        32 => {
            let key1 = Aes128::new_from_slice(&key[..16]).unwrap();
            let key2 = Aes128::new_from_slice(&key[16..]).unwrap();
            let xts = Xts128::<Aes128>::new(key1, key2);
            if decrypt {
                xts.decrypt_area(buf, sector_size, iv_tweak as u128, get_tweak_default);
            } else {
                xts.encrypt_area(buf, sector_size, iv_tweak as u128, get_tweak_default);
            }
        }
        64 => {
            let key1 = Aes256::new_from_slice(&key[..32]).unwrap();
            let key2 = Aes256::new_from_slice(&key[32..]).unwrap();
            let xts = Xts128::<Aes256>::new(key1, key2);
            if decrypt {
                xts.decrypt_area(buf, sector_size, iv_tweak as u128, get_tweak_default);
            } else {
                xts.encrypt_area(buf, sector_size, iv_tweak as u128, get_tweak_default);
            }
        }
        n => return Err(LuksError::UnsupportedKeySize(n)),
    }
    Ok(())
}

/// Encrypts sector-aligned plaintext; sector `i` of the input uses tweak
/// `iv_tweak + i`.
pub fn encrypt_sectors(
    encryption: &Encryption,
    key: &[u8],
    iv_tweak: u64,
    sector_size: usize,
    plaintext: &[u8],
) -> Result<Vec<u8>, LuksError> {
    let mut buf = plaintext.to_vec();
    xts_apply(encryption, key, iv_tweak, sector_size, &mut buf, false)?;
    Ok(buf)
}

/// Inverse of [`encrypt_sectors`].
pub fn decrypt_sectors(
    encryption: &Encryption,
    key: &[u8],
    iv_tweak: u64,
    sector_size: usize,
    ciphertext: &[u8],
) -> Result<Vec<u8>, LuksError> {
    let mut buf = ciphertext.to_vec();
    xts_apply(encryption, key, iv_tweak, sector_size, &mut buf, true)?;
    Ok(buf)
}

#[derive(Clone)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub(crate) fn new(key: Vec<u8>) -> Self {
        Self(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Zeroize for MasterKey {
    fn zeroize(&mut self) {
        self.0.zeroize()
    }
}

impl DebugSecret for MasterKey {}

impl CloneableSecret for MasterKey {}

/// The volume master key, wiped when the last reference drops.
pub type SecretMasterKey = Secret<MasterKey>;

/// A stateful sector cipher over the payload region. Successive calls must
/// cover contiguous sector-aligned data; the tweak counter advances by the
/// number of sectors processed. Not safe under concurrent calls.
pub struct CryptoStream {
    key: SecretMasterKey,
    encryption: Encryption,
    sector_size: u32,
    iv_tweak: u64,
}

impl CryptoStream {
    pub(crate) fn new(
        key: SecretMasterKey,
        encryption: Encryption,
        sector_size: u32,
        iv_tweak: u64,
    ) -> Self {
        Self {
            key,
            encryption,
            sector_size,
            iv_tweak,
        }
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// The tweak, in sectors, that the next call will start from.
    pub fn iv_tweak(&self) -> u64 {
        self.iv_tweak
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, LuksError> {
        let out = encrypt_sectors(
            &self.encryption,
            self.key.expose_secret().as_bytes(),
            self.iv_tweak,
            self.sector_size as usize,
            plaintext,
        )?;
        self.iv_tweak += (plaintext.len() / self.sector_size as usize) as u64;
        Ok(out)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, LuksError> {
        let out = decrypt_sectors(
            &self.encryption,
            self.key.expose_secret().as_bytes(),
            self.iv_tweak,
            self.sector_size as usize,
            ciphertext,
        )?;
        self.iv_tweak += (ciphertext.len() / self.sector_size as usize) as u64;
        Ok(out)
    }
}

/// The result of unsealing a volume with a password: a payload cipher
/// stream plus the byte extent of the payload region.
pub struct Unsealed {
    pub stream: CryptoStream,
    pub payload_offset: u64,
    pub payload_size: u64,
}
