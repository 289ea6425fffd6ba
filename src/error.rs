use std::io;
use thiserror::Error;

/// Enum for errors arising during parsing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Deserialization error: {0}")]
    BincodeError(#[from] bincode::error::DecodeError),

    #[error("Invalid magic value in header: magic identifier not found")]
    InvalidHeaderMagic,

    #[error("Invalid magic value in secondary header: must be \"SKUL\\xba\\xbe\"")]
    InvalidSecondaryHeaderMagic,

    #[error("Invalid header version: only versions 1 and 2 are supported, found {0}")]
    InvalidHeaderVersion(u16),

    #[error("JSON deserialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Invalid sector size in JSON: must be 512, 1024, 2048 or 4096, found {0}")]
    InvalidSectorSize(u32),

    #[error("Invalid keyslot size in JSON: must be aligned to 4096 bytes")]
    KeyslotNotAligned,

    #[error("Invalid reference in JSON: a nonexistent keyslot or segment was referenced")]
    InvalidReference,

    #[error("Header size {0} is too small to contain JSON metadata")]
    HeaderTooSmall(u64),

    #[error("Header size {0} is too large")]
    HeaderTooLarge(u64),

    #[error("JSON area size mismatch: header has room for {available} bytes, config declares {declared}")]
    JsonSizeMismatch { available: u64, declared: u64 },

    #[error("Invalid header checksum: calculated {calculated}, found {found}")]
    InvalidChecksum { calculated: String, found: String },

    #[error("Invalid key slot state marker {0:#010x}")]
    InvalidKeySlotState(u32),
}

/// Enum for errors arising while creating or unlocking a volume.
#[derive(Debug, Error)]
pub enum LuksError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Parsing error: {0}")]
    ParseError(#[from] self::ParseError),

    #[error("Serialization error: {0}")]
    EncodeError(#[from] bincode::error::EncodeError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("decryption error: incorrect password")]
    InvalidPassword,

    #[error("no passwords set on LUKS1 volume")]
    NoPasswordsV1,

    #[error("no passwords set on LUKS2 volume for digest \"{0}\"")]
    NoPasswordsForDigest(u32),

    #[error("no usable password-verification digests set on LUKS2 volume")]
    NoUsableDigests,

    #[error("at least one password is required")]
    NoPasswordGiven,

    #[error("attempted to use {given} passwords, only {max} possible")]
    TooManyPasswords { given: usize, max: usize },

    #[error("invalid cipher \"{0}\"")]
    InvalidCipherSpec(String),

    #[error("unsupported cipher {0}")]
    UnsupportedCipher(String),

    #[error("unsupported cipher mode {0}")]
    UnsupportedCipherMode(String),

    #[error("unsupported digest algorithm \"{0}\"")]
    UnsupportedHash(String),

    #[error("invalid sector size {0}")]
    InvalidSectorSize(usize),

    #[error("invalid key length {len} for {cipher}")]
    InvalidKeyLength { cipher: String, len: usize },

    #[error("{cipher} needs a 128-bit block cipher for XTS mode")]
    UnsupportedXtsCipher { cipher: String },

    #[error("data length {len} is not a multiple of the {block_size}-byte cipher block size")]
    UnalignedData { len: usize, block_size: usize },

    #[error("expected {expected} af bytes, got {found}")]
    AfLengthMismatch { expected: usize, found: usize },

    #[error("{field} value of {len} bytes does not fit in {max} bytes")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("magic {0:?} not acceptable for this header")]
    InvalidMagic(Vec<u8>),

    #[error("version {0} not acceptable for this header")]
    InvalidVersion(u16),

    #[error("invalid key slot number {0} (must be 0..7)")]
    KeySlotOutOfRange(usize),

    #[error("key slot \"{id}\" is corrupt: {reason}")]
    CorruptKeyslot { id: u32, reason: String },

    #[error("Could not read random data: {0}")]
    RandomError(#[from] rand::Error),

    #[error("Could not apply hash function: {0}")]
    HashError(#[from] argon2::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LuksError> for io::Error {
    fn from(e: LuksError) -> Self {
        match e {
            LuksError::IoError(e) => e,
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}
