use crate::error::LuksError;
use digest::Digest;
use hmac::Hmac;
use pbkdf2::pbkdf2;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::{
	fmt::{self, Display},
	str::FromStr
};

/// A hash algorithm as named in LUKS headers ("sha256", "sha1", ...).
///
/// Used for PBKDF2, the anti-forensic splitter, ESSIV key derivation and
/// LUKS2 header checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hash {
	Sha1,
	Sha256,
	Sha512,
	Ripemd160
}

impl Hash {
	/// The name used for this hash in headers and cipher modes.
	pub fn name(&self) -> &'static str {
		match self {
			Self::Sha1 => "sha1",
			Self::Sha256 => "sha256",
			Self::Sha512 => "sha512",
			Self::Ripemd160 => "ripemd160"
		}
	}

	/// Digest size in bytes.
	pub fn output_size(&self) -> usize {
		match self {
			Self::Sha1 => <Sha1 as Digest>::output_size(),
			Self::Sha256 => <Sha256 as Digest>::output_size(),
			Self::Sha512 => <Sha512 as Digest>::output_size(),
			Self::Ripemd160 => <Ripemd160 as Digest>::output_size()
		}
	}

	/// Hashes the concatenation of `parts`.
	pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
		fn digest_all<H: Digest>(parts: &[&[u8]]) -> Vec<u8> {
			let mut h = H::new();
			for part in parts {
				h.update(part);
			}
			h.finalize().to_vec()
		}

		match self {
			Self::Sha1 => digest_all::<Sha1>(parts),
			Self::Sha256 => digest_all::<Sha256>(parts),
			Self::Sha512 => digest_all::<Sha512>(parts),
			Self::Ripemd160 => digest_all::<Ripemd160>(parts)
		}
	}

	/// PBKDF2 with HMAC over this hash, filling all of `out`.
	pub fn pbkdf2(&self, password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
		match self {
			Self::Sha1 => pbkdf2::<Hmac<Sha1>>(password, salt, rounds, out),
			Self::Sha256 => pbkdf2::<Hmac<Sha256>>(password, salt, rounds, out),
			Self::Sha512 => pbkdf2::<Hmac<Sha512>>(password, salt, rounds, out),
			Self::Ripemd160 => pbkdf2::<Hmac<Ripemd160>>(password, salt, rounds, out)
		}
	}

	/// Convenience wrapper around [`Hash::pbkdf2`] returning `len` bytes.
	pub fn pbkdf2_vec(&self, password: &[u8], salt: &[u8], rounds: u32, len: usize) -> Vec<u8> {
		let mut out = vec![0; len];
		self.pbkdf2(password, salt, rounds, &mut out);
		out
	}
}

impl FromStr for Hash {
	type Err = LuksError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"sha1" => Ok(Self::Sha1),
			"sha256" => Ok(Self::Sha256),
			"sha512" => Ok(Self::Sha512),
			"ripemd160" => Ok(Self::Ripemd160),
			_ => Err(LuksError::UnsupportedHash(s.to_string()))
		}
	}
}

impl Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}
