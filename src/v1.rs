//! The fixed 592-byte LUKS1 header.
//!
//! See the [LUKS1 on-disk format](https://gitlab.com/cryptsetup/cryptsetup/wikis/Specification).
//! All integers are big-endian; strings are zero-padded to their field width.

use crate::{
	bytes_to_hex_string, bytes_to_str, error::{LuksError, ParseError}, magic_to_string, padded_string,
	set_padded, V1_DIGEST_SIZE, V1_MAGIC, V1_NUM_KEYS, V1_SALT_SIZE
};
use bincode::{Decode, Encode};
use std::fmt::{self, Display};

/// Encoded size of [`V1Header`].
pub const V1_HEADER_SIZE: usize = 592;

/// Marker of a key slot holding key material.
pub const KEY_ENABLED: u32 = 0x00ac71f3;
/// Marker of an unused key slot.
pub const KEY_DISABLED: u32 = 0x0000dead;

pub(crate) fn bincode_config() -> impl bincode::config::Config {
	bincode::config::legacy().with_big_endian().with_fixed_int_encoding()
}

/// One of the eight key slots of a [`V1Header`].
#[derive(Clone, Copy, Debug, Decode, Encode, PartialEq, Eq)]
pub struct V1KeySlot {
	active: u32,
	iterations: u32,
	salt: [u8; V1_SALT_SIZE],
	key_material_offset: u32,
	stripes: u32
}

impl Default for V1KeySlot {
	fn default() -> Self {
		Self { active: KEY_DISABLED, iterations: 0, salt: [0; V1_SALT_SIZE], key_material_offset: 0, stripes: 0 }
	}
}

impl V1KeySlot {
	/// Whether the slot is in use. Any marker besides the two defined ones is an error.
	pub fn active(&self) -> Result<bool, ParseError> {
		match self.active {
			KEY_ENABLED => Ok(true),
			KEY_DISABLED => Ok(false),
			marker => Err(ParseError::InvalidKeySlotState(marker))
		}
	}

	pub fn set_active(&mut self, active: bool) {
		self.active = if active { KEY_ENABLED } else { KEY_DISABLED };
	}

	/// PBKDF2 iterations for the password.
	pub fn iterations(&self) -> u32 {
		self.iterations
	}

	pub fn set_iterations(&mut self, iterations: u32) {
		self.iterations = iterations;
	}

	pub fn salt(&self) -> &[u8] {
		&self.salt
	}

	pub fn set_salt(&mut self, salt: &[u8]) -> Result<(), LuksError> {
		set_padded("key slot salt", &mut self.salt, salt)
	}

	/// Start of the key material, in 512-byte sectors.
	pub fn key_material_offset(&self) -> u32 {
		self.key_material_offset
	}

	pub fn set_key_material_offset(&mut self, offset: u32) {
		self.key_material_offset = offset;
	}

	/// Anti-forensic stripes of the key material.
	pub fn stripes(&self) -> u32 {
		self.stripes
	}

	pub fn set_stripes(&mut self, stripes: u32) {
		self.stripes = stripes;
	}
}

/// A LUKS1 header.
#[derive(Clone, Debug, Decode, Encode, PartialEq, Eq)]
pub struct V1Header {
	magic: [u8; 6],
	version: u16,
	cipher_name: [u8; 32],
	cipher_mode: [u8; 32],
	hash_spec: [u8; 32],
	payload_offset: u32,
	key_bytes: u32,
	mk_digest: [u8; V1_DIGEST_SIZE],
	mk_digest_salt: [u8; V1_SALT_SIZE],
	mk_digest_iter: u32,
	uuid: [u8; 40],
	key_slots: [V1KeySlot; V1_NUM_KEYS]
}

impl Default for V1Header {
	fn default() -> Self {
		Self {
			magic: V1_MAGIC,
			version: 1,
			cipher_name: [0; 32],
			cipher_mode: [0; 32],
			hash_spec: [0; 32],
			payload_offset: 0,
			key_bytes: 0,
			mk_digest: [0; V1_DIGEST_SIZE],
			mk_digest_salt: [0; V1_SALT_SIZE],
			mk_digest_iter: 0,
			uuid: [0; 40],
			key_slots: [V1KeySlot::default(); V1_NUM_KEYS]
		}
	}
}

impl V1Header {
	/// Decodes a header from the first [`V1_HEADER_SIZE`] bytes of `bytes`.
	///
	/// Magic and version are not checked here; see [`crate::read_headers`].
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
		let (h, _) = bincode::decode_from_slice(bytes, bincode_config())?;
		Ok(h)
	}

	/// Encodes the header into its [`V1_HEADER_SIZE`]-byte on-disk form.
	pub fn to_bytes(&self) -> Result<Vec<u8>, LuksError> {
		Ok(bincode::encode_to_vec(self, bincode_config())?)
	}

	pub fn magic(&self) -> &[u8; 6] {
		&self.magic
	}

	pub fn set_magic(&mut self, magic: &[u8]) -> Result<(), LuksError> {
		if magic != V1_MAGIC {
			return Err(LuksError::InvalidMagic(magic.to_vec()));
		}
		self.magic = V1_MAGIC;
		Ok(())
	}

	pub fn version(&self) -> u16 {
		self.version
	}

	pub fn set_version(&mut self, version: u16) -> Result<(), LuksError> {
		if version != 1 {
			return Err(LuksError::InvalidVersion(version));
		}
		self.version = version;
		Ok(())
	}

	/// Cipher name, e.g. "aes".
	pub fn cipher_name(&self) -> String {
		padded_string(&self.cipher_name)
	}

	pub fn set_cipher_name(&mut self, name: &str) -> Result<(), LuksError> {
		set_padded("cipher name", &mut self.cipher_name, name.as_bytes())
	}

	/// Cipher mode, e.g. "xts-plain64".
	pub fn cipher_mode(&self) -> String {
		padded_string(&self.cipher_mode)
	}

	pub fn set_cipher_mode(&mut self, mode: &str) -> Result<(), LuksError> {
		set_padded("cipher mode", &mut self.cipher_mode, mode.as_bytes())
	}

	/// Hash used for PBKDF2 and the anti-forensic splitter, e.g. "sha256".
	pub fn hash_spec(&self) -> String {
		padded_string(&self.hash_spec)
	}

	pub fn set_hash_spec(&mut self, hash: &str) -> Result<(), LuksError> {
		set_padded("hash spec", &mut self.hash_spec, hash.as_bytes())
	}

	/// Start of the payload, in 512-byte sectors.
	pub fn payload_offset(&self) -> u32 {
		self.payload_offset
	}

	pub fn set_payload_offset(&mut self, offset: u32) {
		self.payload_offset = offset;
	}

	/// Length of the master key.
	pub fn key_bytes(&self) -> u32 {
		self.key_bytes
	}

	pub fn set_key_bytes(&mut self, key_bytes: u32) {
		self.key_bytes = key_bytes;
	}

	pub fn mk_digest(&self) -> &[u8] {
		&self.mk_digest
	}

	pub fn set_mk_digest(&mut self, digest: &[u8]) -> Result<(), LuksError> {
		set_padded("master key digest", &mut self.mk_digest, digest)
	}

	pub fn mk_digest_salt(&self) -> &[u8] {
		&self.mk_digest_salt
	}

	pub fn set_mk_digest_salt(&mut self, salt: &[u8]) -> Result<(), LuksError> {
		set_padded("master key digest salt", &mut self.mk_digest_salt, salt)
	}

	pub fn mk_digest_iter(&self) -> u32 {
		self.mk_digest_iter
	}

	pub fn set_mk_digest_iter(&mut self, iterations: u32) {
		self.mk_digest_iter = iterations;
	}

	pub fn uuid(&self) -> String {
		padded_string(&self.uuid)
	}

	pub fn set_uuid(&mut self, uuid: &str) -> Result<(), LuksError> {
		set_padded("uuid", &mut self.uuid, uuid.as_bytes())
	}

	/// Key slot `index`, which must be below [`V1_NUM_KEYS`].
	pub fn key_slot(&self, index: usize) -> Result<&V1KeySlot, LuksError> {
		self.key_slots.get(index).ok_or(LuksError::KeySlotOutOfRange(index))
	}

	pub fn set_key_slot(&mut self, index: usize, slot: V1KeySlot) -> Result<(), LuksError> {
		let dst = self.key_slots.get_mut(index).ok_or(LuksError::KeySlotOutOfRange(index))?;
		*dst = slot;
		Ok(())
	}

	pub fn key_slots(&self) -> &[V1KeySlot] {
		&self.key_slots
	}
}

impl Display for V1Header {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "V1Header {{\n\
			\tmagic: {},\n\
			\tversion: {},\n\
			\tcipher name: {},\n\
			\tcipher mode: {},\n\
			\thash spec: {},\n\
			\tpayload offset: {},\n\
			\tkey bytes: {},\n\
			\tmaster key digest: {},\n\
			\tmaster key digest salt: {},\n\
			\tmaster key digest iterations: {},\n\
			\tuuid: {},\n",
			magic_to_string(&self.magic), self.version,
			bytes_to_str("<no cipher name>", &self.cipher_name),
			bytes_to_str("<no cipher mode>", &self.cipher_mode),
			bytes_to_str("<no hash spec>", &self.hash_spec),
			self.payload_offset, self.key_bytes,
			bytes_to_hex_string(&self.mk_digest), bytes_to_hex_string(&self.mk_digest_salt),
			self.mk_digest_iter, bytes_to_str("<no uuid>", &self.uuid)
		)?;
		for (i, slot) in self.key_slots.iter().enumerate() {
			let state = match slot.active() {
				Ok(true) => "enabled".to_string(),
				Ok(false) => "disabled".to_string(),
				Err(_) => format!("invalid marker {:#010x}", slot.active)
			};
			writeln!(f, "\tkey slot {}: {}, iterations: {}, salt: {}, key material offset: {}, stripes: {}",
				i, state, slot.iterations, bytes_to_hex_string(&slot.salt), slot.key_material_offset,
				slot.stripes
			)?;
		}
		write!(f, "}}")
	}
}
