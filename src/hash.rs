use core::fmt::{self, Display};

use hmac::Hmac;
use pbkdf2::pbkdf2;
use ripemd::Ripemd160;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::af;
use crate::error::LuksError;

/// The hash algorithms the on-disk format may name, in the `hash_spec`
/// field of a LUKS1 header and in the kdf/af/digest objects of LUKS2 JSON
/// metadata. Unrecognized names are kept verbatim so they can be reported;
/// any attempt to actually use one fails with
/// [`UnsupportedDigest`](LuksError::UnsupportedDigest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Ripemd160,
    Unknown(String),
}

impl HashAlg {
    pub fn from_name(name: &str) -> Self {
        match name {
            "sha1" => Self::Sha1,
            "sha224" => Self::Sha224,
            "sha256" => Self::Sha256,
            "sha384" => Self::Sha384,
            "sha512" => Self::Sha512,
            "ripemd160" => Self::Ripemd160,
            _ => Self::Unknown(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
            Self::Ripemd160 => "ripemd160",
            Self::Unknown(s) => s.as_str(),
        }
    }

    /// Output size of the digest in bytes.
    pub fn digest_size(&self) -> Result<usize, LuksError> {
        match self {
            Self::Sha1 | Self::Ripemd160 => Ok(20),
            Self::Sha224 => Ok(28),
            Self::Sha256 => Ok(32),
            Self::Sha384 => Ok(48),
            Self::Sha512 => Ok(64),
            Self::Unknown(name) => Err(LuksError::UnsupportedDigest(name.clone())),
        }
    }

    /// PBKDF2-HMAC over this hash, filling `out` completely.
    pub fn pbkdf2(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out: &mut [u8],
    ) -> Result<(), LuksError> {
        match self {
            Self::Sha1 => pbkdf2::<Hmac<Sha1>>(password, salt, iterations, out),
            Self::Sha224 => pbkdf2::<Hmac<Sha224>>(password, salt, iterations, out),
            Self::Sha256 => pbkdf2::<Hmac<Sha256>>(password, salt, iterations, out),
            Self::Sha384 => pbkdf2::<Hmac<Sha384>>(password, salt, iterations, out),
            Self::Sha512 => pbkdf2::<Hmac<Sha512>>(password, salt, iterations, out),
            Self::Ripemd160 => pbkdf2::<Hmac<Ripemd160>>(password, salt, iterations, out),
            Self::Unknown(name) => return Err(LuksError::UnsupportedDigest(name.clone())),
        }
        Ok(())
    }

    /// Anti-forensically splits `key` into `stripes` diffused stripes.
    pub fn af_split(&self, key: &[u8], stripes: usize) -> Result<Vec<u8>, LuksError> {
        match self {
            Self::Sha1 => af::split::<Sha1>(key, stripes),
            Self::Sha224 => af::split::<Sha224>(key, stripes),
            Self::Sha256 => af::split::<Sha256>(key, stripes),
            Self::Sha384 => af::split::<Sha384>(key, stripes),
            Self::Sha512 => af::split::<Sha512>(key, stripes),
            Self::Ripemd160 => af::split::<Ripemd160>(key, stripes),
            Self::Unknown(name) => Err(LuksError::UnsupportedDigest(name.clone())),
        }
    }

    /// Merges `stripes` stripes of `block_size` bytes back into the key.
    pub fn af_merge(
        &self,
        striped: &[u8],
        block_size: usize,
        stripes: usize,
    ) -> Result<Vec<u8>, LuksError> {
        match self {
            Self::Sha1 => af::merge::<Sha1>(striped, block_size, stripes),
            Self::Sha224 => af::merge::<Sha224>(striped, block_size, stripes),
            Self::Sha256 => af::merge::<Sha256>(striped, block_size, stripes),
            Self::Sha384 => af::merge::<Sha384>(striped, block_size, stripes),
            Self::Sha512 => af::merge::<Sha512>(striped, block_size, stripes),
            Self::Ripemd160 => af::merge::<Ripemd160>(striped, block_size, stripes),
            Self::Unknown(name) => Err(LuksError::UnsupportedDigest(name.clone())),
        }
    }
}

impl Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for HashAlg {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for HashAlg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<HashAlg, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(HashAlg::from_name(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        for name in ["sha1", "sha224", "sha256", "sha384", "sha512", "ripemd160"] {
            let alg = HashAlg::from_name(name);
            assert!(!matches!(alg, HashAlg::Unknown(_)));
            assert_eq!(alg.name(), name);
        }
        assert_eq!(
            HashAlg::from_name("whirlpool"),
            HashAlg::Unknown("whirlpool".to_string())
        );
    }

    #[test]
    fn test_unknown_digest_is_rejected() {
        let alg = HashAlg::from_name("whirlpool");
        let mut out = [0u8; 20];
        assert!(matches!(
            alg.pbkdf2(b"password", b"salt", 1000, &mut out),
            Err(LuksError::UnsupportedDigest(_))
        ));
        assert!(alg.digest_size().is_err());
    }

    #[test]
    fn test_pbkdf2_sha256_vector() {
        // RFC 7914 appendix B test vector for PBKDF2-HMAC-SHA-256
        let mut out = [0u8; 64];
        HashAlg::Sha256
            .pbkdf2(b"passwd", b"salt", 1, &mut out)
            .unwrap();
        assert_eq!(
            &out[..8],
            &[0x55, 0xac, 0x04, 0x6e, 0x56, 0xe3, 0x08, 0x9f]
        );
    }
}
