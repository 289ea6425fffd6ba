use crate::{
	error::{LuksError, ParseError}, json::LuksJson, v1::V1Header, v2::{MagicKind, V2Header}, V1_MAGIC,
	V2_MAX_HEADER_SIZE, V2_SECTOR_SIZE
};
use log::debug;
use std::io::{Read, Seek, SeekFrom};

/// Options for [`read_headers`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOptions {
	/// Verify the checksums of both LUKS2 header copies against their JSON areas.
	pub verify_checksums: bool
}

impl Default for ReadOptions {
	fn default() -> Self {
		Self { verify_checksums: true }
	}
}

/// The headers found at the start of a LUKS device.
#[derive(Clone, Debug, PartialEq)]
pub enum LuksHeaders {
	V1(V1Header),
	V2 {
		primary: V2Header,
		secondary: V2Header,
		json: LuksJson
	}
}

impl LuksHeaders {
	pub fn version(&self) -> u16 {
		match self {
			Self::V1(_) => 1,
			Self::V2 { .. } => 2
		}
	}
}

pub(crate) fn read_exact_at<R: Read + Seek>(device: &mut R, offset: u64, buf: &mut [u8]) -> Result<(), LuksError> {
	device.seek(SeekFrom::Start(offset))?;
	device.read_exact(buf)?;
	Ok(())
}

/// Reads the LUKS1 header, or both LUKS2 header copies and the primary JSON metadata, from the
/// start of `device`.
pub fn read_headers<R: Read + Seek>(device: &mut R, options: &ReadOptions) -> Result<LuksHeaders, LuksError> {
	let mut block = vec![0; V2_SECTOR_SIZE];
	read_exact_at(device, 0, &mut block)?;
	if block[..6] != V1_MAGIC {
		return Err(ParseError::InvalidHeaderMagic.into());
	}

	match u16::from_be_bytes([block[6], block[7]]) {
		1 => {
			let header = V1Header::from_bytes(&block)?;
			debug!(
				"found LUKS1 header: {}-{}, {} key bytes, payload at sector {}",
				header.cipher_name(), header.cipher_mode(), header.key_bytes(), header.payload_offset()
			);
			Ok(LuksHeaders::V1(header))
		},
		2 => read_v2(device, &block, options),
		v => Err(ParseError::InvalidHeaderVersion(v).into())
	}
}

fn read_v2<R: Read + Seek>(device: &mut R, block: &[u8], options: &ReadOptions) -> Result<LuksHeaders, LuksError> {
	let primary = V2Header::from_bytes(block)?;
	let hdr_size = primary.header_size();
	if hdr_size < V2_SECTOR_SIZE as u64 {
		return Err(ParseError::HeaderTooSmall(hdr_size).into());
	}
	if hdr_size > i64::MAX as u64 || hdr_size > V2_MAX_HEADER_SIZE {
		return Err(ParseError::HeaderTooLarge(hdr_size).into());
	}
	let json_size = hdr_size - V2_SECTOR_SIZE as u64;

	let mut block = vec![0; V2_SECTOR_SIZE];
	read_exact_at(device, hdr_size, &mut block)?;
	let secondary = V2Header::from_bytes(&block)?;
	if secondary.kind() != Some(MagicKind::Secondary) {
		return Err(ParseError::InvalidSecondaryHeaderMagic.into());
	}

	let mut json_area = vec![0; json_size as usize];
	read_exact_at(device, V2_SECTOR_SIZE as u64, &mut json_area)?;
	if options.verify_checksums {
		primary.verify_checksum(&json_area)?;
		let mut secondary_json = vec![0; json_size as usize];
		read_exact_at(device, hdr_size + V2_SECTOR_SIZE as u64, &mut secondary_json)?;
		secondary.verify_checksum(&secondary_json)?;
	}

	let json = LuksJson::from_slice(&json_area)?;
	if json.config.json_size != json_size {
		return Err(ParseError::JsonSizeMismatch { available: json_size, declared: json.config.json_size }.into());
	}
	debug!(
		"found LUKS2 header: {} bytes, {} keyslots, {} segments, {} digests",
		hdr_size, json.keyslots.len(), json.segments.len(), json.digests.len()
	);

	Ok(LuksHeaders::V2 { primary, secondary, json })
}
