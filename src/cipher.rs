//! Sector-oriented block cipher engine.
//!
//! Data is processed in sectors; each sector gets an IV (or XTS tweak) derived from its number the
//! way dm-crypt does it, so output is interchangeable with `cryptsetup`-managed devices.

use crate::{error::LuksError, hash::Hash, V1_SECTOR_SIZE};
use aes::{Aes128, Aes192, Aes256};
use cast5::Cast5;
use cipher::{
	generic_array::GenericArray, BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt,
	BlockEncryptMut, InnerIvInit, KeyInit
};
use serpent::Serpent;
use std::{
	fmt::{self, Display},
	str::FromStr
};
use twofish::Twofish;
use xts_mode::{get_tweak_default, Xts128};

/// Block ciphers usable for key slots and payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherName {
	Aes,
	Twofish,
	Cast5,
	Serpent
}

impl CipherName {
	/// The native block size of the cipher in bytes.
	pub fn block_size(&self) -> usize {
		match self {
			Self::Cast5 => 8,
			_ => 16
		}
	}

	/// The longest key the cipher accepts.
	pub fn max_key_size(&self) -> usize {
		match self {
			Self::Cast5 => 16,
			_ => 32
		}
	}
}

impl FromStr for CipherName {
	type Err = LuksError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"aes" => Ok(Self::Aes),
			"twofish" => Ok(Self::Twofish),
			"cast5" => Ok(Self::Cast5),
			"serpent" => Ok(Self::Serpent),
			_ => Err(LuksError::UnsupportedCipher(s.to_string()))
		}
	}
}

impl Display for CipherName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Aes => "aes",
			Self::Twofish => "twofish",
			Self::Cast5 => "cast5",
			Self::Serpent => "serpent"
		})
	}
}

/// Chaining mode plus IV generator, in dm-crypt notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
	/// `ecb`, no IV.
	Ecb,
	/// `cbc-plain`, IV is the low 32 bits of the sector number.
	CbcPlain,
	/// `cbc-plain64`, IV is the 64-bit sector number.
	CbcPlain64,
	/// `cbc-essiv:<hash>`, IV is the sector number encrypted with a key derived from the volume key.
	CbcEssiv(Hash),
	/// `xts-plain`, tweak is the low 32 bits of the sector number.
	XtsPlain,
	/// `xts-plain64`, tweak is the 64-bit sector number.
	XtsPlain64
}

impl CipherMode {
	pub fn is_xts(&self) -> bool {
		matches!(self, Self::XtsPlain | Self::XtsPlain64)
	}
}

impl FromStr for CipherMode {
	type Err = LuksError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ecb" => Ok(Self::Ecb),
			"cbc-plain" => Ok(Self::CbcPlain),
			"cbc-plain64" => Ok(Self::CbcPlain64),
			"xts-plain" => Ok(Self::XtsPlain),
			"xts-plain64" => Ok(Self::XtsPlain64),
			_ => match s.strip_prefix("cbc-essiv:") {
				Some(hash) => Ok(Self::CbcEssiv(hash.parse()?)),
				None => Err(LuksError::UnsupportedCipherMode(s.to_string()))
			}
		}
	}
}

impl Display for CipherMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ecb => f.write_str("ecb"),
			Self::CbcPlain => f.write_str("cbc-plain"),
			Self::CbcPlain64 => f.write_str("cbc-plain64"),
			Self::CbcEssiv(hash) => write!(f, "cbc-essiv:{}", hash),
			Self::XtsPlain => f.write_str("xts-plain"),
			Self::XtsPlain64 => f.write_str("xts-plain64")
		}
	}
}

/// A cipher suite such as "aes-xts-plain64": the cipher name up to the first '-', the mode after.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherSpec {
	pub name: CipherName,
	pub mode: CipherMode
}

impl CipherSpec {
	pub fn new(name: CipherName, mode: CipherMode) -> Self {
		Self { name, mode }
	}

	/// Parses the name and mode as stored separately in a LUKS1 header.
	pub fn from_parts(name: &str, mode: &str) -> Result<Self, LuksError> {
		Ok(Self { name: name.parse()?, mode: mode.parse()? })
	}

	/// Size of a freshly generated volume key for this suite. XTS needs two keys.
	pub fn default_key_size(&self) -> usize {
		let size = self.name.max_key_size();
		if self.mode.is_xts() {
			size * 2
		} else {
			size
		}
	}
}

impl Default for CipherSpec {
	fn default() -> Self {
		Self { name: CipherName::Aes, mode: CipherMode::XtsPlain64 }
	}
}

impl FromStr for CipherSpec {
	type Err = LuksError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.split_once('-') {
			Some((name, mode)) => Self::from_parts(name, mode),
			None => Err(LuksError::InvalidCipherSpec(s.to_string()))
		}
	}
}

impl Display for CipherSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.name, self.mode)
	}
}

/// Whether a transform encrypts or decrypts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	Encrypt,
	Decrypt
}

enum AnyCipher {
	Aes128(Aes128),
	Aes192(Aes192),
	Aes256(Aes256),
	Twofish(Twofish),
	Cast5(Cast5),
	Serpent(Serpent)
}

macro_rules! with_cipher {
	($cipher:expr, $c:ident => $body:expr) => {
		match $cipher {
			AnyCipher::Aes128($c) => $body,
			AnyCipher::Aes192($c) => $body,
			AnyCipher::Aes256($c) => $body,
			AnyCipher::Twofish($c) => $body,
			AnyCipher::Cast5($c) => $body,
			AnyCipher::Serpent($c) => $body
		}
	};
}

fn invalid_key(name: CipherName, len: usize) -> LuksError {
	LuksError::InvalidKeyLength { cipher: name.to_string(), len }
}

impl AnyCipher {
	fn new(name: CipherName, key: &[u8]) -> Result<Self, LuksError> {
		let invalid = |_| invalid_key(name, key.len());
		Ok(match name {
			CipherName::Aes => match key.len() {
				16 => Self::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
				24 => Self::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
				32 => Self::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
				len => return Err(invalid_key(name, len))
			},
			CipherName::Twofish => Self::Twofish(Twofish::new_from_slice(key).map_err(invalid)?),
			CipherName::Cast5 => Self::Cast5(Cast5::new_from_slice(key).map_err(invalid)?),
			CipherName::Serpent => Self::Serpent(Serpent::new_from_slice(key).map_err(invalid)?)
		})
	}

	// `block` must be exactly one cipher block long
	fn encrypt_block(&self, block: &mut [u8]) {
		with_cipher!(self, c => c.encrypt_block(GenericArray::from_mut_slice(block)))
	}
}

fn ecb<C: BlockEncrypt + BlockDecrypt>(cipher: &C, data: &mut [u8], direction: Direction) {
	for block in data.chunks_exact_mut(C::block_size()) {
		let block = GenericArray::from_mut_slice(block);
		match direction {
			Direction::Encrypt => cipher.encrypt_block(block),
			Direction::Decrypt => cipher.decrypt_block(block)
		}
	}
}

fn cbc<C>(cipher: &C, iv: &[u8], sector: &mut [u8], direction: Direction) -> Result<(), LuksError>
where
	C: BlockCipher + BlockEncrypt + BlockDecrypt + Clone
{
	let bad_iv = |_| LuksError::Internal(format!("cbc iv of {} bytes", iv.len()));
	match direction {
		Direction::Encrypt => {
			let mut mode = cbc::Encryptor::<C>::inner_iv_slice_init(cipher.clone(), iv).map_err(bad_iv)?;
			for block in sector.chunks_exact_mut(C::block_size()) {
				mode.encrypt_block_mut(GenericArray::from_mut_slice(block));
			}
		}
		Direction::Decrypt => {
			let mut mode = cbc::Decryptor::<C>::inner_iv_slice_init(cipher.clone(), iv).map_err(bad_iv)?;
			for block in sector.chunks_exact_mut(C::block_size()) {
				mode.decrypt_block_mut(GenericArray::from_mut_slice(block));
			}
		}
	}
	Ok(())
}

enum XtsCipher {
	Aes128(Xts128<Aes128>),
	Aes192(Xts128<Aes192>),
	Aes256(Xts128<Aes256>),
	Twofish(Xts128<Twofish>),
	Serpent(Xts128<Serpent>)
}

impl XtsCipher {
	fn new(name: CipherName, key: &[u8]) -> Result<Self, LuksError> {
		if key.len() % 2 != 0 {
			return Err(invalid_key(name, key.len()));
		}
		let (k1, k2) = key.split_at(key.len() / 2);

		fn pair<C: KeyInit + BlockCipher + BlockEncrypt + BlockDecrypt>(
			name: CipherName, key_len: usize, k1: &[u8], k2: &[u8]
		) -> Result<Xts128<C>, LuksError> {
			let c1 = C::new_from_slice(k1).map_err(|_| invalid_key(name, key_len))?;
			let c2 = C::new_from_slice(k2).map_err(|_| invalid_key(name, key_len))?;
			Ok(Xts128::new(c1, c2))
		}

		Ok(match name {
			CipherName::Aes => match k1.len() {
				16 => Self::Aes128(pair(name, key.len(), k1, k2)?),
				24 => Self::Aes192(pair(name, key.len(), k1, k2)?),
				32 => Self::Aes256(pair(name, key.len(), k1, k2)?),
				_ => return Err(invalid_key(name, key.len()))
			},
			CipherName::Twofish => Self::Twofish(pair(name, key.len(), k1, k2)?),
			CipherName::Serpent => Self::Serpent(pair(name, key.len(), k1, k2)?),
			CipherName::Cast5 => return Err(LuksError::UnsupportedXtsCipher { cipher: name.to_string() })
		})
	}

	fn process(&self, sector: &mut [u8], sector_number: u64, direction: Direction) {
		let tweak = get_tweak_default(sector_number as u128);
		macro_rules! run {
			($xts:expr) => {
				match direction {
					Direction::Encrypt => $xts.encrypt_sector(sector, tweak),
					Direction::Decrypt => $xts.decrypt_sector(sector, tweak)
				}
			};
		}
		match self {
			Self::Aes128(xts) => run!(xts),
			Self::Aes192(xts) => run!(xts),
			Self::Aes256(xts) => run!(xts),
			Self::Twofish(xts) => run!(xts),
			Self::Serpent(xts) => run!(xts)
		}
	}
}

/// Validates a sector size, substituting 512 for 0.
pub fn check_sector_size(sector_size: usize) -> Result<usize, LuksError> {
	match sector_size {
		0 => Ok(V1_SECTOR_SIZE),
		512 | 1024 | 2048 | 4096 => Ok(sector_size),
		_ => Err(LuksError::InvalidSectorSize(sector_size))
	}
}

/// Encrypts or decrypts `data` in place, sector by sector.
///
/// The first sector is numbered `iv_tweak`. With `bulk` set, sector numbers are scaled by
/// `sector_size / 512` because dm-crypt counts IVs in 512-byte units unless `iv_large_sectors` is
/// in effect. `data` must be a multiple of the cipher block size; the last sector may be short.
pub fn transform(
	spec: &CipherSpec, direction: Direction, iv_tweak: u64, key: &[u8], data: &mut [u8],
	sector_size: usize, bulk: bool
) -> Result<(), LuksError> {
	let sector_size = check_sector_size(sector_size)?;
	let block_size = spec.name.block_size();
	if data.len() % block_size != 0 {
		return Err(LuksError::UnalignedData { len: data.len(), block_size });
	}
	let scale = if bulk { (sector_size / V1_SECTOR_SIZE) as u64 } else { 1 };
	let sector_number = |index: usize| (index as u64).wrapping_add(iv_tweak).wrapping_mul(scale);

	match spec.mode {
		CipherMode::Ecb => {
			let cipher = AnyCipher::new(spec.name, key)?;
			with_cipher!(&cipher, c => ecb(c, data, direction));
		}
		CipherMode::CbcPlain | CipherMode::CbcPlain64 | CipherMode::CbcEssiv(_) => {
			let cipher = AnyCipher::new(spec.name, key)?;
			let essiv = match spec.mode {
				CipherMode::CbcEssiv(hash) => Some(AnyCipher::new(spec.name, &hash.digest(&[key]))?),
				_ => None
			};
			let mut iv = vec![0; block_size];
			for (index, sector) in data.chunks_mut(sector_size).enumerate() {
				let number = sector_number(index);
				iv.iter_mut().for_each(|b| *b = 0);
				match (spec.mode, &essiv) {
					(CipherMode::CbcPlain, _) => iv[..4].copy_from_slice(&(number as u32).to_le_bytes()),
					(_, Some(essiv)) => {
						iv[..8].copy_from_slice(&number.to_le_bytes());
						essiv.encrypt_block(&mut iv);
					}
					_ => iv[..8].copy_from_slice(&number.to_le_bytes())
				}
				with_cipher!(&cipher, c => cbc(c, &iv, sector, direction))?;
			}
		}
		CipherMode::XtsPlain | CipherMode::XtsPlain64 => {
			let xts = XtsCipher::new(spec.name, key)?;
			for (index, sector) in data.chunks_mut(sector_size).enumerate() {
				let mut number = sector_number(index);
				if spec.mode == CipherMode::XtsPlain {
					number &= 0xffff_ffff;
				}
				xts.process(sector, number, direction);
			}
		}
	}

	Ok(())
}

/// [`transform`] in the encrypting direction.
pub fn encrypt_sectors(
	spec: &CipherSpec, iv_tweak: u64, key: &[u8], data: &mut [u8], sector_size: usize, bulk: bool
) -> Result<(), LuksError> {
	transform(spec, Direction::Encrypt, iv_tweak, key, data, sector_size, bulk)
}

/// [`transform`] in the decrypting direction.
pub fn decrypt_sectors(
	spec: &CipherSpec, iv_tweak: u64, key: &[u8], data: &mut [u8], sector_size: usize, bulk: bool
) -> Result<(), LuksError> {
	transform(spec, Direction::Decrypt, iv_tweak, key, data, sector_size, bulk)
}

#[cfg(test)]
mod tests {
	use super::*;

	const SPECS: [&str; 23] = [
		"aes-ecb", "aes-cbc-plain", "aes-cbc-plain64", "aes-cbc-essiv:sha256", "aes-xts-plain",
		"aes-xts-plain64", "twofish-ecb", "twofish-cbc-plain", "twofish-cbc-plain64",
		"twofish-cbc-essiv:sha256", "twofish-xts-plain", "twofish-xts-plain64", "serpent-ecb",
		"serpent-cbc-plain", "serpent-cbc-plain64", "serpent-cbc-essiv:sha256", "serpent-cbc-essiv:sha1",
		"serpent-cbc-essiv:ripemd160", "serpent-xts-plain", "serpent-xts-plain64", "cast5-ecb",
		"cast5-cbc-plain", "cast5-cbc-plain64"
	];

	fn plaintext(len: usize) -> Vec<u8> {
		let mut state = 0x2545f491u32;
		(0..len)
			.map(|_| {
				state ^= state << 13;
				state ^= state >> 17;
				state ^= state << 5;
				state as u8
			})
			.collect()
	}

	fn key_for(spec: &CipherSpec) -> Vec<u8> {
		(0..spec.default_key_size()).map(|i| i as u8).collect()
	}

	#[test]
	fn parse_and_display() {
		for s in SPECS {
			assert_eq!(s.parse::<CipherSpec>().unwrap().to_string(), s);
		}
		assert_eq!(CipherSpec::default().to_string(), "aes-xts-plain64");
		assert!(matches!("aes".parse::<CipherSpec>(), Err(LuksError::InvalidCipherSpec(_))));
		assert!(matches!("des-ecb".parse::<CipherSpec>(), Err(LuksError::UnsupportedCipher(_))));
		assert!(matches!("aes-ctr-plain".parse::<CipherSpec>(), Err(LuksError::UnsupportedCipherMode(_))));
		assert!(matches!("aes-cbc-essiv:md5".parse::<CipherSpec>(), Err(LuksError::UnsupportedHash(_))));
	}

	#[test]
	fn key_sizes() {
		assert_eq!("aes-xts-plain64".parse::<CipherSpec>().unwrap().default_key_size(), 64);
		assert_eq!("aes-cbc-essiv:sha256".parse::<CipherSpec>().unwrap().default_key_size(), 32);
		assert_eq!("cast5-cbc-plain".parse::<CipherSpec>().unwrap().default_key_size(), 16);
	}

	#[test]
	fn round_trip_all_modes() {
		for s in SPECS {
			let spec: CipherSpec = s.parse().unwrap();
			let key = key_for(&spec);
			for sector_size in [512, 1024, 2048, 4096] {
				for iv_tweak in [0, 1, 0xffff_fffe, u64::MAX - 1] {
					let original = plaintext(sector_size * 3);
					let mut data = original.clone();
					encrypt_sectors(&spec, iv_tweak, &key, &mut data, sector_size, true).unwrap();
					assert_ne!(data, original, "{} did not change the data", s);
					decrypt_sectors(&spec, iv_tweak, &key, &mut data, sector_size, true).unwrap();
					assert_eq!(data, original, "{} sector size {} tweak {}", s, sector_size, iv_tweak);
				}
			}
		}
	}

	#[test]
	fn sectors_are_independent() {
		let spec: CipherSpec = "aes-xts-plain64".parse().unwrap();
		let key = key_for(&spec);
		let original = plaintext(4 * 512);

		let mut whole = original.clone();
		encrypt_sectors(&spec, 10, &key, &mut whole, 512, true).unwrap();

		let mut tail = original[2 * 512..].to_vec();
		encrypt_sectors(&spec, 12, &key, &mut tail, 512, true).unwrap();
		assert_eq!(&whole[2 * 512..], &tail[..]);
	}

	#[test]
	fn xts_plain_wraps_at_32_bits() {
		let plain: CipherSpec = "aes-xts-plain".parse().unwrap();
		let plain64: CipherSpec = "aes-xts-plain64".parse().unwrap();
		let key = key_for(&plain);
		let original = plaintext(512);

		let mut wrapped = original.clone();
		encrypt_sectors(&plain, 0x1_0000_0005, &key, &mut wrapped, 512, false).unwrap();
		let mut low = original.clone();
		encrypt_sectors(&plain64, 5, &key, &mut low, 512, false).unwrap();
		assert_eq!(wrapped, low);

		let mut high = original.clone();
		encrypt_sectors(&plain64, 0x1_0000_0005, &key, &mut high, 512, false).unwrap();
		assert_ne!(high, low);
	}

	#[test]
	fn bulk_scales_sector_numbers() {
		let spec: CipherSpec = "aes-cbc-plain64".parse().unwrap();
		let key = key_for(&spec);
		let original = plaintext(4096);

		// with 4096-byte sectors, sector 1 uses IV 8 in bulk mode
		let mut bulk = original.clone();
		encrypt_sectors(&spec, 1, &key, &mut bulk, 4096, true).unwrap();
		let mut unscaled = original.clone();
		encrypt_sectors(&spec, 8, &key, &mut unscaled, 4096, false).unwrap();
		assert_eq!(bulk, unscaled);
	}

	#[test]
	fn essiv_iv_is_encrypted_sector_number() {
		let spec: CipherSpec = "aes-cbc-essiv:sha256".parse().unwrap();
		let key = key_for(&spec);
		let original = plaintext(512);

		let mut iv = [0u8; 16];
		iv[..8].copy_from_slice(&3u64.to_le_bytes());
		let essiv = Aes256::new_from_slice(&Hash::Sha256.digest(&[key.as_slice()])).unwrap();
		essiv.encrypt_block(GenericArray::from_mut_slice(&mut iv));

		let mut expected = original.clone();
		let cipher = Aes256::new_from_slice(&key).unwrap();
		cbc(&cipher, &iv, &mut expected, Direction::Encrypt).unwrap();

		let mut data = original;
		encrypt_sectors(&spec, 3, &key, &mut data, 512, false).unwrap();
		assert_eq!(data, expected);
	}

	#[test]
	fn essiv_with_short_digests() {
		// serpent takes 16 to 32 byte keys, so 20-byte digests make valid ESSIV keys
		for hash in [Hash::Sha1, Hash::Ripemd160] {
			let spec = CipherSpec::new(CipherName::Serpent, CipherMode::CbcEssiv(hash));
			let key = key_for(&spec);
			let original = plaintext(1024);

			let essiv_key = hash.digest(&[key.as_slice()]);
			assert_eq!(essiv_key.len(), 20);
			let essiv = Serpent::new_from_slice(&essiv_key).unwrap();
			let cipher = Serpent::new_from_slice(&key).unwrap();
			let mut expected = original.clone();
			for (number, sector) in expected.chunks_mut(512).enumerate() {
				let mut iv = [0u8; 16];
				iv[..8].copy_from_slice(&(number as u64 + 7).to_le_bytes());
				essiv.encrypt_block(GenericArray::from_mut_slice(&mut iv));
				cbc(&cipher, &iv, sector, Direction::Encrypt).unwrap();
			}

			let mut data = original.clone();
			encrypt_sectors(&spec, 7, &key, &mut data, 512, false).unwrap();
			assert_eq!(data, expected, "{}", hash);
			decrypt_sectors(&spec, 7, &key, &mut data, 512, false).unwrap();
			assert_eq!(data, original, "{}", hash);
		}

		// AES has no 20-byte key size
		let spec: CipherSpec = "aes-cbc-essiv:sha1".parse().unwrap();
		let key = key_for(&spec);
		let mut data = plaintext(512);
		assert!(matches!(
			encrypt_sectors(&spec, 0, &key, &mut data, 512, false),
			Err(LuksError::InvalidKeyLength { len: 20, .. })
		));
	}

	#[test]
	fn rejects_bad_input() {
		let spec: CipherSpec = "aes-xts-plain64".parse().unwrap();
		let key = key_for(&spec);
		let mut data = vec![0; 512];
		assert!(matches!(
			encrypt_sectors(&spec, 0, &key, &mut data, 768, true),
			Err(LuksError::InvalidSectorSize(768))
		));
		assert!(matches!(
			encrypt_sectors(&spec, 0, &key[..63], &mut data, 512, true),
			Err(LuksError::InvalidKeyLength { .. })
		));
		let mut odd = vec![0; 100];
		assert!(matches!(
			encrypt_sectors(&spec, 0, &key, &mut odd, 512, true),
			Err(LuksError::UnalignedData { len: 100, block_size: 16 })
		));
		let cast: CipherSpec = "cast5-xts-plain64".parse().unwrap();
		assert!(matches!(
			encrypt_sectors(&cast, 0, &[0; 32], &mut data, 512, true),
			Err(LuksError::UnsupportedXtsCipher { .. })
		));
	}

	#[test]
	fn zero_sector_size_means_512() {
		let spec: CipherSpec = "aes-cbc-plain64".parse().unwrap();
		let key = key_for(&spec);
		let original = plaintext(1024);
		let mut a = original.clone();
		let mut b = original;
		encrypt_sectors(&spec, 0, &key, &mut a, 0, true).unwrap();
		encrypt_sectors(&spec, 0, &key, &mut b, 512, true).unwrap();
		assert_eq!(a, b);
	}
}
