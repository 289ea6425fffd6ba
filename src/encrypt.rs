use crate::{
	af,
	cipher::{encrypt_sectors, CipherSpec, Direction},
	error::LuksError,
	hash::Hash,
	json::{
		LuksAf, LuksArea, LuksConfig, LuksDigest, LuksJson, LuksKdf, LuksKeyslot, LuksPriority, LuksSegment,
		LuksSegmentSize
	},
	kdf::{argon2_key, PbkdfOptions},
	random_bytes, round_up_to_multiple,
	stream::CipherStream,
	v1::{V1Header, V1KeySlot, V1_HEADER_SIZE},
	v2::{MagicKind, V2Header},
	V1_ALIGN_KEYSLOTS, V1_DIGEST_SIZE, V1_NUM_KEYS, V1_SALT_SIZE, V1_SECTOR_SIZE, V1_STRIPES, V2_ALIGN_KEYSLOTS,
	V2_MAX_HEADER_SIZE, V2_SECTOR_SIZE, V2_STRIPES
};
use argon2::Algorithm;
use log::{debug, trace};
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_CIPHER: &str = "aes-xts-plain64";
const HASH: Hash = Hash::Sha256;
// the header layout depends on the JSON size and vice versa; this settles in two or three rounds
const MAX_REBUILDS: usize = 16;
// minimum number of keyslots the LUKS2 keyslots area has room for
const V2_MIN_KEYSLOTS: usize = 64;

/// A freshly formatted volume: the complete header and a stream encrypting the payload after it.
#[derive(Debug)]
pub struct FormattedVolume {
	/// Everything up to the start of the payload, key material included.
	pub header: Vec<u8>,
	pub stream: CipherStream,
	/// The payload sector size, which is also the block size the stream expects.
	pub sector_size: usize
}

// a dm-crypt cipher string such as "aes-xts-plain64", or "" for the default
struct ParsedCipher<'a> {
	text: &'a str,
	name: &'a str,
	mode: String,
	spec: CipherSpec
}

fn parse_cipher(cipher: &str) -> Result<ParsedCipher<'_>, LuksError> {
	let text = if cipher.is_empty() { DEFAULT_CIPHER } else { cipher };
	let parts: Vec<&str> = text.splitn(3, '-').collect();
	let invalid = || LuksError::InvalidCipherSpec(text.to_string());
	if parts.iter().any(|p| p.is_empty()) {
		return Err(invalid());
	}
	let mode = match parts[..] {
		[_, mode, iv] => format!("{}-{}", mode, iv),
		[_, "ecb"] => String::from("ecb"),
		_ => return Err(invalid())
	};
	let spec = CipherSpec::from_parts(parts[0], &mode)?;
	Ok(ParsedCipher { text, name: parts[0], mode, spec })
}

fn check_password_count(count: usize, max: Option<usize>) -> Result<(), LuksError> {
	if count == 0 {
		return Err(LuksError::NoPasswordGiven);
	}
	match max {
		Some(max) if count > max => Err(LuksError::TooManyPasswords { given: count, max }),
		_ => Ok(())
	}
}

// encrypts an AF-split key with a password-derived key the way key material is stored on disk
fn encrypt_key_material(
	spec: &CipherSpec, password_key: &[u8], master_key: &[u8], stripes: u32
) -> Result<Vec<u8>, LuksError> {
	let mut material = af::split_with(HASH, master_key, stripes as usize)?;
	encrypt_sectors(spec, 0, password_key, &mut material, V1_SECTOR_SIZE, false)?;
	let expected = master_key.len() * stripes as usize;
	if material.len() != expected {
		return Err(LuksError::Internal(format!(
			"got {} stripe bytes, expected {}", material.len(), expected
		)));
	}
	Ok(material)
}

/// Formats a LUKS1 volume with up to eight passwords, tuning key derivation to the default target.
///
/// An empty `cipher` means "aes-xts-plain64".
pub fn encrypt_v1<P: AsRef<[u8]>>(passwords: &[P], cipher: &str) -> Result<FormattedVolume, LuksError> {
	encrypt_v1_with(passwords, cipher, &PbkdfOptions::default())
}

/// [`encrypt_v1`] with explicit key derivation settings.
pub fn encrypt_v1_with<P: AsRef<[u8]>>(
	passwords: &[P], cipher: &str, options: &PbkdfOptions
) -> Result<FormattedVolume, LuksError> {
	check_password_count(passwords.len(), Some(V1_NUM_KEYS))?;
	let cipher = parse_cipher(cipher)?;

	let mut h = V1Header::default();
	h.set_cipher_name(cipher.name)?;
	h.set_cipher_mode(&cipher.mode)?;
	h.set_hash_spec(HASH.name())?;
	let key_bytes = cipher.spec.default_key_size();
	h.set_key_bytes(key_bytes as u32);
	let salt = random_bytes(V1_SALT_SIZE)?;
	h.set_mk_digest_salt(&salt)?;
	h.set_mk_digest_iter(V1_STRIPES);
	h.set_uuid(&Uuid::new_v4().to_string())?;

	let master_key = random_bytes(key_bytes)?;
	h.set_mk_digest(&HASH.pbkdf2_vec(&master_key, &salt, h.mk_digest_iter(), V1_DIGEST_SIZE))?;

	let iterations = options.pbkdf2_iterations(&salt, key_bytes, HASH)?;
	let mut header_length = round_up_to_multiple(V1_HEADER_SIZE as u64, V1_ALIGN_KEYSLOTS as u64);
	let mut materials = Vec::with_capacity(passwords.len());
	for i in 0..V1_NUM_KEYS {
		let mut slot = V1KeySlot::default();
		slot.set_active(i < passwords.len());
		slot.set_iterations(iterations);
		slot.set_stripes(V1_STRIPES);
		slot.set_salt(&random_bytes(V1_SALT_SIZE)?)?;
		slot.set_key_material_offset((header_length / V1_SECTOR_SIZE as u64) as u32);
		if let Some(password) = passwords.get(i) {
			let password_key = HASH.pbkdf2_vec(password.as_ref(), slot.salt(), iterations, key_bytes);
			let material = encrypt_key_material(&cipher.spec, &password_key, &master_key, slot.stripes())?;
			materials.push((header_length as usize, material));
		}
		h.set_key_slot(i, slot)?;
		header_length += key_bytes as u64 * slot.stripes() as u64;
		header_length = round_up_to_multiple(header_length, V1_ALIGN_KEYSLOTS as u64);
	}
	header_length = round_up_to_multiple(header_length, V1_SECTOR_SIZE as u64);
	h.set_payload_offset((header_length / V1_SECTOR_SIZE as u64) as u32);
	debug!(
		"formatting LUKS1 volume: {}, {} key bytes, {} passwords, {} iterations, payload at {}",
		cipher.text, key_bytes, passwords.len(), iterations, header_length
	);

	let mut header = vec![0; header_length as usize];
	header[..V1_HEADER_SIZE].copy_from_slice(&h.to_bytes()?);
	for (offset, material) in materials {
		header[offset..offset + material.len()].copy_from_slice(&material);
	}

	let stream = CipherStream::new(cipher.spec, master_key, 0, V1_SECTOR_SIZE, Direction::Encrypt)?;
	Ok(FormattedVolume { header, stream, sector_size: V1_SECTOR_SIZE })
}

/// Formats a LUKS2 volume with any number of passwords, tuning key derivation to the default
/// target.
///
/// An empty `cipher` means "aes-xts-plain64"; a `payload_sector_size` of 0 means 4096.
pub fn encrypt_v2<P: AsRef<[u8]>>(
	passwords: &[P], cipher: &str, payload_sector_size: usize
) -> Result<FormattedVolume, LuksError> {
	encrypt_v2_with(passwords, cipher, payload_sector_size, &PbkdfOptions::default())
}

// smallest header size cryptsetup allows that holds `size` bytes
fn round_header_size(size: u64) -> Result<u64, LuksError> {
	let mut bucket = 0x4000;
	while bucket <= V2_MAX_HEADER_SIZE {
		if size < bucket {
			return Ok(bucket);
		}
		bucket *= 2;
	}
	Err(LuksError::Internal(format!("unsupported header size {}", size)))
}

/// [`encrypt_v2`] with explicit key derivation settings.
pub fn encrypt_v2_with<P: AsRef<[u8]>>(
	passwords: &[P], cipher: &str, payload_sector_size: usize, options: &PbkdfOptions
) -> Result<FormattedVolume, LuksError> {
	check_password_count(passwords.len(), None)?;
	let cipher = parse_cipher(cipher)?;
	let sector_size = match payload_sector_size {
		0 => V2_SECTOR_SIZE,
		512 | 1024 | 2048 | 4096 => payload_sector_size,
		_ => return Err(LuksError::InvalidSectorSize(payload_sector_size))
	};

	let key_size = cipher.spec.default_key_size();
	let master_key = random_bytes(key_size)?;
	let digest_salt = random_bytes(V1_SALT_SIZE)?;
	let tuning_salt = [0; V1_SALT_SIZE];
	let iterations = options.pbkdf2_iterations(&tuning_salt, key_size, HASH)?;
	let argon2 = &options.argon2;
	let memory = options.argon2_memory_cost(&tuning_salt, key_size)?;

	let mut keyslots = Vec::with_capacity(passwords.len());
	let mut materials = Vec::with_capacity(passwords.len());
	for password in passwords {
		let salt = random_bytes(V1_SALT_SIZE)?;
		let mut password_key = vec![0; key_size];
		argon2_key(
			Algorithm::Argon2i, password.as_ref(), &salt, argon2.time_cost, memory, argon2.threads, &mut password_key
		)?;
		let material = encrypt_key_material(&cipher.spec, &password_key, &master_key, V2_STRIPES)?;
		keyslots.push(LuksKeyslot::luks2 {
			key_size: key_size as u32,
			area: LuksArea::raw {
				encryption: cipher.text.to_string(),
				key_size: password_key.len() as u32,
				// filled in once the header size is known
				offset: 0,
				size: round_up_to_multiple(material.len() as u64, V2_ALIGN_KEYSLOTS as u64)
			},
			kdf: LuksKdf::argon2i { salt, time: argon2.time_cost, memory, cpus: argon2.threads },
			af: LuksAf::luks1 { stripes: V2_STRIPES, hash: HASH.name().to_string() },
			priority: Some(LuksPriority::normal)
		});
		materials.push(material);
	}

	let digest = LuksDigest::pbkdf2 {
		keyslots: (0..passwords.len() as u32).collect(),
		segments: vec![0],
		digest: HASH.pbkdf2_vec(&master_key, &digest_salt, iterations, HASH.output_size()),
		salt: digest_salt,
		hash: HASH.name().to_string(),
		iterations
	};

	// every slot gets the same stride, and the area has room for at least 64 of them
	let stride = round_up_to_multiple((key_size * V2_STRIPES as usize) as u64, V2_ALIGN_KEYSLOTS as u64);
	let keyslots_size = stride * passwords.len().max(V2_MIN_KEYSLOTS) as u64;

	let mut json = LuksJson {
		keyslots: BTreeMap::new(),
		tokens: BTreeMap::new(),
		segments: BTreeMap::new(),
		digests: BTreeMap::from([(0, digest)]),
		config: LuksConfig { json_size: 0, keyslots_size, flags: None, requirements: None }
	};
	let mut hdr_size = 0;
	let mut rounds = 0;
	let encoded = loop {
		if rounds == MAX_REBUILDS {
			return Err(LuksError::Internal(String::from("header size did not settle")));
		}
		rounds += 1;

		let keyslots_offset = hdr_size * 2;
		for (i, keyslot) in keyslots.iter_mut().enumerate() {
			if let LuksKeyslot::luks2 { area: LuksArea::raw { offset, .. }, .. } = keyslot {
				*offset = keyslots_offset + stride * i as u64;
			}
			json.keyslots.insert(i as u32, keyslot.clone());
		}
		json.segments.insert(0, LuksSegment::crypt {
			offset: round_up_to_multiple(keyslots_offset + keyslots_size, V2_SECTOR_SIZE as u64),
			size: LuksSegmentSize::dynamic,
			iv_tweak: 0,
			encryption: cipher.text.to_string(),
			sector_size: sector_size as u32,
			integrity: None,
			flags: None
		});
		json.config.json_size = hdr_size.saturating_sub(V2_SECTOR_SIZE as u64);

		let encoded = json.to_vec()?;
		// leave room for at least one terminating NUL
		let needed = round_header_size((V2_SECTOR_SIZE + encoded.len() + 1) as u64)?;
		trace!("header rebuild {}: {} bytes of JSON, header size {} -> {}", rounds, encoded.len(), hdr_size, needed);
		if needed == hdr_size {
			break encoded;
		}
		hdr_size = needed;
	};
	let keyslots_offset = hdr_size * 2;
	let segment_offset = round_up_to_multiple(keyslots_offset + keyslots_size, V2_SECTOR_SIZE as u64);
	debug!(
		"formatting LUKS2 volume: {}, {} key bytes, {} passwords, header size {}, payload at {}",
		cipher.text, key_size, passwords.len(), hdr_size, segment_offset
	);

	let uuid = Uuid::new_v4().to_string();
	let mut head = vec![0; segment_offset as usize];
	for (kind, offset) in [(MagicKind::Primary, 0), (MagicKind::Secondary, hdr_size)] {
		let mut h = V2Header::new(kind);
		h.set_header_size(hdr_size);
		h.set_sequence_id(1);
		h.set_checksum_algorithm(HASH.name())?;
		h.set_salt(&random_bytes(64)?)?;
		h.set_uuid(&uuid)?;
		h.set_header_offset(offset);
		h.update_checksum(&encoded)?;

		let start = offset as usize;
		let json_start = start + V2_SECTOR_SIZE;
		head[start..json_start].copy_from_slice(&h.to_bytes()?);
		head[json_start..json_start + encoded.len()].copy_from_slice(&encoded);
	}
	for (i, material) in materials.iter().enumerate() {
		let start = (keyslots_offset + stride * i as u64) as usize;
		head[start..start + material.len()].copy_from_slice(material);
	}

	let stream = CipherStream::new(cipher.spec, master_key, 0, sector_size, Direction::Encrypt)?;
	Ok(FormattedVolume { header: head, stream, sector_size })
}
