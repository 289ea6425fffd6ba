//! This crate creates and unlocks LUKS1 and LUKS2 encrypted volumes without device-mapper.
//!
//! [`encrypt_v1`] and [`encrypt_v2`] produce a complete header (key slots included) plus a
//! [`CipherStream`] that encrypts the payload following it. [`read_headers`] parses the headers of
//! an existing volume, and [`LuksHeaders::decrypt`] checks a password against its key slots and
//! returns a stream that decrypts the payload. [`EncryptWriter`] and [`DecryptReader`] adapt those
//! streams to [`std::io::Write`] and [`std::io::Read`].
//!
//! ```no_run
//! use luksy::{encrypt_v2, read_headers, EncryptWriter, ReadOptions};
//! use std::io::{Cursor, Write};
//!
//! # fn main() -> Result<(), luksy::LuksError> {
//! let volume = encrypt_v2(&["password"], "aes-xts-plain64", 4096)?;
//! let mut image = volume.header.clone();
//! let mut writer = EncryptWriter::new(volume.stream, Vec::new(), volume.sector_size);
//! writer.write_all(b"secret data")?;
//! image.extend(writer.finish()?);
//!
//! let mut device = Cursor::new(image);
//! let headers = read_headers(&mut device, &ReadOptions::default())?;
//! let _unlocked = headers.decrypt(b"password", &mut device)?;
//! # Ok(())
//! # }
//! ```

pub mod af;
pub mod cipher;
mod decrypt;
mod encrypt;
pub mod error;
pub mod hash;
pub mod json;
pub mod kdf;
mod read;
pub mod stream;
pub mod v1;
pub mod v2;

pub use decrypt::UnlockedVolume;
pub use encrypt::{encrypt_v1, encrypt_v1_with, encrypt_v2, encrypt_v2_with, FormattedVolume};
pub use error::{LuksError, ParseError};
pub use json::LuksJson;
pub use kdf::{Argon2Options, PbkdfOptions};
pub use read::{read_headers, LuksHeaders, ReadOptions};
pub use stream::{CipherStream, DecryptReader, EncryptWriter, SectorTransform};
pub use v1::{V1Header, V1KeySlot};
pub use v2::{MagicKind, V2Header};

use rand::{rngs::OsRng, RngCore};

/// Magic value of a LUKS1 header.
pub const V1_MAGIC: [u8; 6] = *b"LUKS\xba\xbe";
/// Magic value of the primary LUKS2 header, shared with LUKS1 so tools can detect either.
pub const V2_MAGIC_1: [u8; 6] = V1_MAGIC;
/// Magic value of the secondary LUKS2 header.
pub const V2_MAGIC_2: [u8; 6] = *b"SKUL\xba\xbe";

/// Sector size of LUKS1 payloads and the unit of LUKS1 header offsets.
pub const V1_SECTOR_SIZE: usize = 512;
/// Alignment of LUKS1 key material areas.
pub const V1_ALIGN_KEYSLOTS: usize = 4096;
/// Anti-forensic stripes per LUKS1 key slot.
pub const V1_STRIPES: u32 = 4000;
/// Number of LUKS1 key slots.
pub const V1_NUM_KEYS: usize = 8;
/// Length of the LUKS1 master key digest.
pub const V1_DIGEST_SIZE: usize = 20;
/// Length of LUKS1 salts.
pub const V1_SALT_SIZE: usize = 32;

/// Size of the binary part of a LUKS2 header and the default LUKS2 payload sector size.
pub const V2_SECTOR_SIZE: usize = 4096;
/// Alignment of LUKS2 key slot areas.
pub const V2_ALIGN_KEYSLOTS: usize = 4096;
/// Anti-forensic stripes per LUKS2 key slot.
pub const V2_STRIPES: u32 = 4000;
/// Largest supported LUKS2 header (binary header plus JSON area).
pub const V2_MAX_HEADER_SIZE: u64 = 0x400000;

pub(crate) fn round_up_to_multiple(i: u64, factor: u64) -> u64 {
	if factor < 1 {
		return i;
	}
	i + (factor - i % factor) % factor
}

pub(crate) fn round_down_to_multiple(i: usize, factor: usize) -> usize {
	if factor < 1 {
		return i;
	}
	i - i % factor
}

pub(crate) fn random_bytes(len: usize) -> Result<Vec<u8>, LuksError> {
	let mut bytes = vec![0; len];
	OsRng.try_fill_bytes(&mut bytes)?;
	Ok(bytes)
}

// strips the zero padding after a JSON area or fixed-width string
pub(crate) fn trim_nul(bytes: &[u8]) -> &[u8] {
	let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
	&bytes[..end]
}

pub(crate) fn padded_string(bytes: &[u8]) -> String {
	String::from_utf8_lossy(trim_nul(bytes)).into_owned()
}

pub(crate) fn set_padded(field: &'static str, dst: &mut [u8], src: &[u8]) -> Result<(), LuksError> {
	if src.len() > dst.len() {
		return Err(LuksError::FieldTooLong { field, len: src.len(), max: dst.len() });
	}
	dst[..src.len()].copy_from_slice(src);
	dst[src.len()..].iter_mut().for_each(|b| *b = 0);
	Ok(())
}

pub(crate) fn bytes_to_str<'a>(empty_text: &'static str, bytes: &'a [u8]) -> &'a str {
	let bytes = trim_nul(bytes);
	if bytes.is_empty() {
		empty_text
	} else {
		match std::str::from_utf8(bytes) {
			Ok(s) => s,
			Err(_) => "<decoding error>"
		}
	}
}

pub(crate) fn bytes_to_hex_string(bytes: &[u8]) -> String {
	let mut s = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		s += format!("{:02x}", b).as_str()
	}
	s
}

pub(crate) fn magic_to_string(magic: &[u8; 6]) -> String {
	let mut s = String::from_utf8_lossy(&magic[..4]).to_string();
	s += format!("\\x{:x}\\x{:x}", magic[4], magic[5]).as_str();
	s
}
