use crate::utils::{ByteStr, Bytes};
use crate::{CSUM_ALG_LEN, CSUM_LEN};
use thiserror::Error;

/// Enum for errors arising while encoding headers to their on-disk form.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("String in {ctx} is not ascii")]
    StringNotAscii { ctx: &'static str },

    #[error("String in {ctx} must be shorter than {n} bytes")]
    StringTooLong { ctx: &'static str, n: usize },

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::error::EncodeError),
}

/// Enum for structural errors arising during parsing. Anything in here means
/// the on-disk metadata itself is damaged or not LUKS at all.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Deserialization error: {0}")]
    Bincode(#[from] bincode::error::DecodeError),

    #[error("JSON deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid magic value in header: must be \"LUKS\\xba\\xbe\" or \"SKUL\\xba\\xbe\"")]
    InvalidHeaderMagic,

    #[error("Invalid header version: only versions 1 and 2 are supported, found {0}")]
    InvalidHeaderVersion(u16),

    #[error("Invalid binary header size 0x{0:x}")]
    InvalidHeaderSize(u64),

    #[error("Header offset field disagrees with location: expected {expected}, found {found}")]
    HeaderOffsetMismatch { expected: u64, found: u64 },

    #[error("Invalid checksum: calculated={:?}, found={:?}", &Bytes(.calculated), &Bytes(.found))]
    InvalidChecksum {
        calculated: [u8; CSUM_LEN],
        found: [u8; CSUM_LEN],
    },

    #[error("Unsupported checksum algorithm {}", &ByteStr(.0))]
    UnsupportedChecksumAlgorithm([u8; CSUM_ALG_LEN]),

    #[error("Invalid tag 0x{tag:08x} on key slot {slot}: must be active or disabled")]
    InvalidSlotTag { slot: usize, tag: u32 },

    #[error("Key material of slot {slot} extends past the payload offset")]
    KeySlotOutOfBounds { slot: usize },

    #[error("Payload offset {0} lies inside the header")]
    PayloadOverlapsHeader(u64),

    #[error(
        "Invalid stripes value in JSON: stripes value of the antiforensic splitter must be \
	4000, found {0}"
    )]
    InvalidStripes(u16),

    #[error("Invalid sector size in JSON: must be 512, 1024, 2048 or 4096, found {0}")]
    InvalidSectorSize(u16),

    #[error("Invalid priority in JSON: must be 0, 1 or 2, found {0}")]
    InvalidPriority(u8),

    #[error("Invalid keyslot area size in JSON: must be aligned to 4096 bytes")]
    KeyslotNotAligned,

    #[error("Invalid reference in JSON: nonexistent keyslot {0}")]
    InvalidKeyslotReference(usize),

    #[error("Invalid reference in JSON: nonexistent segment {0}")]
    InvalidSegmentReference(usize),

    #[error("JSON area size {config} in config disagrees with binary header size {header}")]
    JsonSizeMismatch { header: u64, config: u64 },

    #[error("Missing null character in C-string {0}")]
    NoNullInCStr(&'static str),

    #[error("Invalid utf8 encoding in C-string {0}: {1}")]
    InvalidUtf8InCStr(&'static str, core::str::Utf8Error),

    #[error("String in {ctx} is not ascii")]
    StringNotAscii { ctx: &'static str },

    #[error("Missing UUID in binary header")]
    MissingUuid,
}

/// Top-level error type for reading, unsealing and creating volumes.
#[derive(Debug, Error)]
pub enum LuksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header corrupt: {0}")]
    HeaderCorrupt(#[from] ParseError),

    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Header truncated: device ends inside the header area")]
    HeaderTruncated,

    #[error("Short read in key material of slot {slot}")]
    SlotTruncated { slot: usize },

    #[error("Key slot {slot} is corrupt: {reason}")]
    SlotCorrupt { slot: usize, reason: String },

    #[error("Unsupported cipher {0:?}")]
    UnsupportedCipher(String),

    #[error("Unsupported digest algorithm {0:?}")]
    UnsupportedDigest(String),

    #[error("Unsupported key derivation function {0:?}")]
    UnsupportedKdf(String),

    #[error("Invalid key length: {0}. Valid lengths are 32 for AES-128-XTS or 64 for AES-256-XTS")]
    UnsupportedKeySize(usize),

    #[error("No passwords set on volume")]
    NoPasswords,

    #[error("No usable password-verification digests set on volume")]
    NoDigests,

    #[error("Decryption error: incorrect password")]
    WrongPassword,

    #[error("Buffer of {len} bytes is not a whole number of {sector_size}-byte sectors")]
    UnalignedCiphertext { len: usize, sector_size: usize },

    #[error("Striped key material of {len} bytes does not hold {stripes} stripes of {block_size} bytes")]
    CorruptStriping {
        len: usize,
        block_size: usize,
        stripes: usize,
    },

    #[error("Could not obtain random data from the operating system")]
    Random,

    #[error("Attempted to use {requested} passwords, only {available} possible")]
    TooManyPasswords { requested: usize, available: usize },

    #[error("Could not apply key derivation function: {0}")]
    Argon2(#[from] argon2::Error),

    #[error("JSON metadata of {0} bytes does not fit the largest header size")]
    MetadataOverflow(usize),

    #[error("Internal error: header layout did not converge")]
    LayoutDiverged,
}
