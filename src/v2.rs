use crate::{
	bytes_to_hex_string, bytes_to_str, error::{LuksError, ParseError}, hash::Hash, magic_to_string,
	padded_string, set_padded, v1::bincode_config, V2_MAGIC_1, V2_MAGIC_2, V2_SECTOR_SIZE
};
use bincode::{Decode, Encode};
use std::fmt::{self, Debug, Display};

/// Offset of the checksum field inside the binary header.
pub const CHECKSUM_OFFSET: usize = 448;

/// Which of the two redundant LUKS2 header copies a header is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MagicKind {
	/// The copy at offset 0, with the same magic as LUKS1.
	Primary,
	/// The copy following the primary header and JSON area.
	Secondary
}

impl MagicKind {
	pub fn magic(&self) -> [u8; 6] {
		match self {
			Self::Primary => V2_MAGIC_1,
			Self::Secondary => V2_MAGIC_2
		}
	}
}

/// A LUKS2 binary header as described
/// [here](https://gitlab.com/cryptsetup/LUKS2-docs/blob/master/luks2_doc_wip.pdf).
///
/// Always exactly 4096 bytes long; the JSON area follows it directly.
#[derive(Clone, Decode, Encode, PartialEq, Eq)]
pub struct V2Header {
	// must be "LUKS\xba\xbe" or "SKUL\xba\xbe"
	magic: [u8; 6],
	version: u16,
	// header size plus JSON area in bytes
	hdr_size: u64,
	// sequence ID, increased on update
	seqid: u64,
	label: [u8; 48],
	csum_alg: [u8; 32],
	// unique for every header
	salt: [u8; 64],
	uuid: [u8; 40],
	subsystem: [u8; 48],
	// offset from device start in bytes
	hdr_offset: u64,
	// must be zeroed
	_padding: [u8; 184],
	csum: [u8; 64],
	// Padding, must be zeroed
	_padding4096: [u8; 7 * 512]
}

impl V2Header {
	/// A zeroed header of the given copy with magic and version set.
	pub fn new(kind: MagicKind) -> Self {
		Self {
			magic: kind.magic(),
			version: 2,
			hdr_size: 0,
			seqid: 0,
			label: [0; 48],
			csum_alg: [0; 32],
			salt: [0; 64],
			uuid: [0; 40],
			subsystem: [0; 48],
			hdr_offset: 0,
			_padding: [0; 184],
			csum: [0; 64],
			_padding4096: [0; 7 * 512]
		}
	}

	/// Decodes a header from the first 4096 bytes of `bytes`.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
		let (h, _) = bincode::decode_from_slice(bytes, bincode_config())?;
		Ok(h)
	}

	/// Encodes the header into its 4096-byte on-disk form.
	pub fn to_bytes(&self) -> Result<Vec<u8>, LuksError> {
		Ok(bincode::encode_to_vec(self, bincode_config())?)
	}

	pub fn magic(&self) -> &[u8; 6] {
		&self.magic
	}

	/// Which copy the magic identifies, if either.
	pub fn kind(&self) -> Option<MagicKind> {
		match self.magic {
			V2_MAGIC_1 => Some(MagicKind::Primary),
			V2_MAGIC_2 => Some(MagicKind::Secondary),
			_ => None
		}
	}

	pub fn set_magic(&mut self, magic: &[u8]) -> Result<(), LuksError> {
		if magic == V2_MAGIC_1 {
			self.magic = V2_MAGIC_1;
		} else if magic == V2_MAGIC_2 {
			self.magic = V2_MAGIC_2;
		} else {
			return Err(LuksError::InvalidMagic(magic.to_vec()));
		}
		Ok(())
	}

	pub fn version(&self) -> u16 {
		self.version
	}

	pub fn set_version(&mut self, version: u16) -> Result<(), LuksError> {
		if version != 2 {
			return Err(LuksError::InvalidVersion(version));
		}
		self.version = version;
		Ok(())
	}

	/// Size of the binary header plus JSON area, which is also the offset of the secondary copy.
	pub fn header_size(&self) -> u64 {
		self.hdr_size
	}

	pub fn set_header_size(&mut self, size: u64) {
		self.hdr_size = size;
	}

	pub fn sequence_id(&self) -> u64 {
		self.seqid
	}

	pub fn set_sequence_id(&mut self, seqid: u64) {
		self.seqid = seqid;
	}

	pub fn label(&self) -> String {
		padded_string(&self.label)
	}

	pub fn set_label(&mut self, label: &str) -> Result<(), LuksError> {
		set_padded("label", &mut self.label, label.as_bytes())
	}

	pub fn checksum_algorithm(&self) -> String {
		padded_string(&self.csum_alg)
	}

	pub fn set_checksum_algorithm(&mut self, alg: &str) -> Result<(), LuksError> {
		set_padded("checksum algorithm", &mut self.csum_alg, alg.as_bytes())
	}

	pub fn salt(&self) -> &[u8] {
		&self.salt
	}

	pub fn set_salt(&mut self, salt: &[u8]) -> Result<(), LuksError> {
		set_padded("salt", &mut self.salt, salt)
	}

	pub fn uuid(&self) -> String {
		padded_string(&self.uuid)
	}

	pub fn set_uuid(&mut self, uuid: &str) -> Result<(), LuksError> {
		set_padded("uuid", &mut self.uuid, uuid.as_bytes())
	}

	pub fn subsystem(&self) -> String {
		padded_string(&self.subsystem)
	}

	pub fn set_subsystem(&mut self, subsystem: &str) -> Result<(), LuksError> {
		set_padded("subsystem", &mut self.subsystem, subsystem.as_bytes())
	}

	/// Offset of this copy from the start of the device.
	pub fn header_offset(&self) -> u64 {
		self.hdr_offset
	}

	pub fn set_header_offset(&mut self, offset: u64) {
		self.hdr_offset = offset;
	}

	/// The hash named by the checksum algorithm field.
	pub fn checksum_hash(&self) -> Result<Hash, LuksError> {
		self.checksum_algorithm().parse()
	}

	/// The stored checksum, truncated to the output size of the checksum algorithm.
	pub fn checksum(&self) -> Result<&[u8], LuksError> {
		Ok(&self.csum[..self.checksum_hash()?.output_size()])
	}

	/// Stores a checksum, zero-padding the field. An empty slice clears it.
	pub fn set_checksum(&mut self, checksum: &[u8]) -> Result<(), LuksError> {
		set_padded("checksum", &mut self.csum, checksum)
	}

	/// Hashes this header (with a zeroed checksum field) followed by `json_area`, zero-padded up to
	/// the header size.
	pub fn compute_checksum(&self, json_area: &[u8]) -> Result<Vec<u8>, LuksError> {
		let hash = self.checksum_hash()?;
		let mut unsummed = self.clone();
		unsummed.csum = [0; 64];
		let header = unsummed.to_bytes()?;
		let used = (V2_SECTOR_SIZE + json_area.len()) as u64;
		let padding = vec![0; self.hdr_size.saturating_sub(used) as usize];
		Ok(hash.digest(&[&header, json_area, &padding]))
	}

	/// Recomputes and stores the checksum over this header and `json_area`.
	pub fn update_checksum(&mut self, json_area: &[u8]) -> Result<(), LuksError> {
		let checksum = self.compute_checksum(json_area)?;
		self.set_checksum(&checksum)
	}

	/// Checks the stored checksum against this header and the JSON area that follows it.
	pub fn verify_checksum(&self, json_area: &[u8]) -> Result<(), LuksError> {
		let calculated = self.compute_checksum(json_area)?;
		let found = self.checksum()?;
		if calculated != found {
			return Err(ParseError::InvalidChecksum {
				calculated: bytes_to_hex_string(&calculated),
				found: bytes_to_hex_string(found)
			}
			.into());
		}
		Ok(())
	}
}

// implement manually to omit always-zero padding sections
impl Debug for V2Header {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("V2Header")
			.field("magic", &self.magic)
			.field("version", &self.version)
			.field("hdr_size", &self.hdr_size)
			.field("seqid", &self.seqid)
			.field("label", &self.label)
			.field("csum_alg", &self.csum_alg)
			.field("salt", &self.salt)
			.field("uuid", &self.uuid)
			.field("subsystem", &self.subsystem)
			.field("hdr_offset", &self.hdr_offset)
			.field("csum", &self.csum)
			.finish()
	}
}

impl Display for V2Header {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "V2Header {{\n\
			\tmagic: {},\n\
			\tversion: {},\n\
			\theader size: {},\n\
			\tsequence id: {},\n\
			\tlabel: {},\n\
			\tchecksum algorithm: {},\n\
			\tsalt: {},\n\
			\tuuid: {},\n\
			\tsubsystem label: {},\n\
			\theader offset: {},\n\
			\tchecksum: {}\n\
			}}",
			magic_to_string(&self.magic), self.version, self.hdr_size, self.seqid,
			bytes_to_str("<no label>", &self.label),
			bytes_to_str("<no checksum algorithm>", &self.csum_alg),
			bytes_to_hex_string(&self.salt), bytes_to_str("<no uuid>", &self.uuid),
			bytes_to_str("<no subsystem label>", &self.subsystem),
			self.hdr_offset, bytes_to_hex_string(self.checksum().unwrap_or(&self.csum))
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(kind: MagicKind) -> V2Header {
		let mut h = V2Header::new(kind);
		h.set_header_size(0x4000);
		h.set_sequence_id(1);
		h.set_checksum_algorithm("sha256").unwrap();
		h.set_salt(&[0x5a; 64]).unwrap();
		h.set_uuid("1d4f3bbf-8bd5-4c6b-9a66-25f2b6c6a3b0").unwrap();
		if kind == MagicKind::Secondary {
			h.set_header_offset(0x4000);
		}
		h
	}

	#[test]
	fn layout() {
		let bytes = sample(MagicKind::Secondary).to_bytes().unwrap();
		assert_eq!(bytes.len(), 4096);
		assert_eq!(&bytes[0..6], b"SKUL\xba\xbe");
		assert_eq!(&bytes[6..8], &2u16.to_be_bytes());
		assert_eq!(&bytes[8..16], &0x4000u64.to_be_bytes());
		assert_eq!(&bytes[16..24], &1u64.to_be_bytes());
		assert_eq!(&bytes[72..78], b"sha256");
		assert_eq!(&bytes[104..168], &[0x5a; 64]);
		assert_eq!(&bytes[168..172], b"1d4f");
		assert_eq!(&bytes[256..264], &0x4000u64.to_be_bytes());
	}

	#[test]
	fn checksum_covers_header_and_json() {
		let json = br#"{"config":{}}"#;
		let mut h = sample(MagicKind::Primary);
		h.update_checksum(json).unwrap();
		assert_eq!(h.checksum().unwrap().len(), 32);
		h.verify_checksum(json).unwrap();

		// the checksum lands at its fixed offset, the rest of the field stays zeroed
		let bytes = h.to_bytes().unwrap();
		assert_eq!(&bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 32], h.checksum().unwrap());
		assert_eq!(&bytes[CHECKSUM_OFFSET + 32..CHECKSUM_OFFSET + 64], &[0; 32]);

		// explicit zero padding of the JSON area does not change the result
		let mut padded = json.to_vec();
		padded.resize(0x4000 - 4096, 0);
		h.verify_checksum(&padded).unwrap();

		assert!(matches!(
			h.verify_checksum(br#"{"config":[]}"#),
			Err(LuksError::ParseError(ParseError::InvalidChecksum { .. }))
		));
		h.set_sequence_id(2);
		assert!(h.verify_checksum(json).is_err());
	}

	#[test]
	fn checksum_matches_manual_computation() {
		let json = b"{}";
		let h = sample(MagicKind::Primary);
		let mut bytes = h.to_bytes().unwrap();
		bytes.extend_from_slice(json);
		bytes.resize(0x4000, 0);
		assert_eq!(h.compute_checksum(json).unwrap(), Hash::Sha256.digest(&[&bytes]));
	}

	#[test]
	fn setters_validate() {
		let mut h = V2Header::new(MagicKind::Primary);
		assert_eq!(h.kind(), Some(MagicKind::Primary));
		h.set_magic(&V2_MAGIC_2).unwrap();
		assert_eq!(h.kind(), Some(MagicKind::Secondary));
		assert!(matches!(h.set_magic(b"LUKS\0\0"), Err(LuksError::InvalidMagic(_))));
		assert!(matches!(h.set_version(1), Err(LuksError::InvalidVersion(1))));
		assert!(matches!(h.checksum(), Err(LuksError::UnsupportedHash(_))));
	}

	#[test]
	fn decode_what_was_encoded() {
		let h = sample(MagicKind::Primary);
		let decoded = V2Header::from_bytes(&h.to_bytes().unwrap()).unwrap();
		assert_eq!(decoded, h);
		assert_eq!(decoded.checksum_algorithm(), "sha256");
		assert_eq!(decoded.uuid(), "1d4f3bbf-8bd5-4c6b-9a66-25f2b6c6a3b0");
		assert!(decoded.to_string().contains("header size: 16384"));
	}
}
