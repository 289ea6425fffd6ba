use crate::{
	af,
	cipher::{decrypt_sectors, CipherSpec, Direction},
	error::LuksError,
	hash::Hash,
	json::{LuksAf, LuksArea, LuksDigest, LuksJson, LuksKdf, LuksKeyslot, LuksPriority, LuksSegment, LuksSegmentSize},
	kdf::argon2_key,
	read::{read_exact_at, LuksHeaders},
	stream::{CipherStream, DecryptReader},
	v1::V1Header,
	v2::V2Header,
	V1_DIGEST_SIZE, V1_SECTOR_SIZE, V2_SECTOR_SIZE
};
use argon2::Algorithm;
use log::{debug, trace, warn};
use std::{
	cmp::Reverse,
	io::{Read, Seek, SeekFrom, Take}
};

/// The result of unlocking a volume: a stream decrypting the payload and where to find it.
#[derive(Debug)]
pub struct UnlockedVolume {
	pub stream: CipherStream,
	/// The payload sector size, which is also the block size the stream expects.
	pub sector_size: usize,
	/// Start of the payload in bytes from the start of the device.
	pub payload_offset: u64,
	/// Payload length in bytes. For payloads running to the end of the device this is measured at
	/// unlock time.
	pub payload_size: u64
}

impl UnlockedVolume {
	/// Positions `device` at the payload and wraps it in a reader yielding plaintext.
	pub fn into_reader<R: Read + Seek>(self, mut device: R) -> Result<DecryptReader<CipherStream, Take<R>>, LuksError> {
		device.seek(SeekFrom::Start(self.payload_offset))?;
		Ok(DecryptReader::new(self.stream, device.take(self.payload_size), self.sector_size))
	}
}

fn material_len(needed: u64) -> Result<usize, LuksError> {
	usize::try_from(needed).map_err(|_| LuksError::Internal(format!("{} bytes of key material", needed)))
}

// decrypts AF-split key material with a password-derived key and merges it into a key candidate
fn unlock_material(
	spec: &CipherSpec, af_hash: Hash, password_key: &[u8], mut material: Vec<u8>, key_size: usize, stripes: u32
) -> Result<Vec<u8>, LuksError> {
	decrypt_sectors(spec, 0, password_key, &mut material, V1_SECTOR_SIZE, false)?;
	af::merge_with(af_hash, &material, key_size, stripes as usize)
}

impl V1Header {
	// bytes a key slot's material may occupy from `start`: up to the next slot's material, the
	// payload, or the end of the device, whichever comes first
	fn material_room(&self, start: u64, device_size: u64) -> u64 {
		let sector = V1_SECTOR_SIZE as u64;
		let end = self.key_slots()
			.iter()
			.map(|slot| slot.key_material_offset() as u64 * sector)
			.chain(std::iter::once(self.payload_offset() as u64 * sector))
			.filter(|&offset| offset > start)
			.min()
			.map_or(device_size, |end| end.min(device_size));
		end.saturating_sub(start)
	}

	/// Tries `password` against every active key slot and returns a decrypting stream for the
	/// first one it unlocks.
	pub fn decrypt<R: Read + Seek>(&self, password: &[u8], device: &mut R) -> Result<UnlockedVolume, LuksError> {
		let size = device.seek(SeekFrom::End(0))?;
		let hash: Hash = self.hash_spec().parse()?;
		let spec = CipherSpec::from_parts(&self.cipher_name(), &self.cipher_mode())?;
		let key_bytes = self.key_bytes() as usize;

		let mut active_keys = 0;
		for (k, slot) in self.key_slots().iter().enumerate() {
			if !slot.active()? {
				continue;
			}
			active_keys += 1;
			trace!("trying LUKS1 key slot {}", k);

			let start = slot.key_material_offset() as u64 * V1_SECTOR_SIZE as u64;
			let needed = key_bytes as u64 * slot.stripes() as u64;
			if needed == 0 || needed > self.material_room(start, size) {
				warn!(
					"key slot {} has an impossible key material size ({} bytes x {} stripes)",
					k, key_bytes, slot.stripes()
				);
				continue;
			}
			let mut material = vec![0; material_len(needed)?];
			read_exact_at(device, start, &mut material)?;
			let password_key = hash.pbkdf2_vec(password, slot.salt(), slot.iterations(), key_bytes);
			let candidate = match unlock_material(&spec, hash, &password_key, material, key_bytes, slot.stripes()) {
				Ok(candidate) => candidate,
				Err(e) => {
					warn!("error attempting to compute main key from key slot {}: {}", k, e);
					continue;
				}
			};

			let digest = hash.pbkdf2_vec(&candidate, self.mk_digest_salt(), self.mk_digest_iter(), V1_DIGEST_SIZE);
			if digest == self.mk_digest() {
				debug!("unlocked LUKS1 key slot {}", k);
				let payload_offset = self.payload_offset() as u64 * V1_SECTOR_SIZE as u64;
				return Ok(UnlockedVolume {
					stream: CipherStream::new(spec, candidate, 0, V1_SECTOR_SIZE, Direction::Decrypt)?,
					sector_size: V1_SECTOR_SIZE,
					payload_offset,
					payload_size: size.saturating_sub(payload_offset)
				});
			}
		}

		if active_keys == 0 {
			return Err(LuksError::NoPasswordsV1);
		}
		Err(LuksError::InvalidPassword)
	}
}

// where and how the payload of a segment is encrypted
struct Payload {
	spec: CipherSpec,
	offset: u64,
	size: u64,
	sector_size: usize,
	iv_tweak: u64
}

// the first crypt segment among `segments`
fn find_payload<R: Seek>(device: &mut R, json: &LuksJson, segments: &[u32]) -> Result<Option<Payload>, LuksError> {
	for id in segments {
		if let Some(LuksSegment::crypt { offset, size, iv_tweak, encryption, sector_size, .. }) = json.segments.get(id) {
			let size = match size {
				LuksSegmentSize::dynamic => device.seek(SeekFrom::End(0))?.saturating_sub(*offset),
				LuksSegmentSize::fixed(size) => *size
			};
			return Ok(Some(Payload {
				spec: encryption.parse()?,
				offset: *offset,
				size,
				sector_size: *sector_size as usize,
				iv_tweak: *iv_tweak
			}));
		}
	}
	Ok(None)
}

fn corrupt(id: u32, reason: impl Into<String>) -> LuksError {
	LuksError::CorruptKeyslot { id, reason: reason.into() }
}

enum PasswordKey {
	Derived(Vec<u8>),
	Unsupported,
	// the keyslot's own KDF parameters are unusable
	Failed(LuksError)
}

// derives the key that encrypts a keyslot's area
fn derive_password_key(kdf: &LuksKdf, password: &[u8], key_size: usize) -> Result<PasswordKey, LuksError> {
	let mut key = vec![0; key_size];
	let derived = match kdf {
		LuksKdf::pbkdf2 { salt, hash, iterations } => {
			hash.parse::<Hash>()?.pbkdf2(password, salt, *iterations, &mut key);
			Ok(())
		},
		LuksKdf::argon2i { salt, time, memory, cpus } => {
			argon2_key(Algorithm::Argon2i, password, salt, *time, *memory, *cpus, &mut key)
		},
		LuksKdf::argon2id { salt, time, memory, cpus } => {
			argon2_key(Algorithm::Argon2id, password, salt, *time, *memory, *cpus, &mut key)
		},
		LuksKdf::unsupported => return Ok(PasswordKey::Unsupported)
	};
	Ok(match derived {
		Ok(()) => PasswordKey::Derived(key),
		Err(e) => PasswordKey::Failed(e)
	})
}

impl V2Header {
	/// Tries `password` against the keyslots of every PBKDF2 digest in `json` and returns a
	/// decrypting stream for the segment of the first digest it matches.
	///
	/// Keyslots with high priority are tried first, then normal ones; slots with priority
	/// `ignore` are never tried.
	pub fn decrypt<R: Read + Seek>(
		&self, password: &[u8], device: &mut R, json: &LuksJson
	) -> Result<UnlockedVolume, LuksError> {
		let device_size = device.seek(SeekFrom::End(0))?;
		let mut keyslots: Vec<(u32, &LuksKeyslot)> = json.keyslots.iter()
			.map(|(id, k)| (*id, k))
			.filter(|(_, k)| k.priority() != LuksPriority::ignore)
			.collect();
		// stable, so ids stay ascending within a priority
		keyslots.sort_by_key(|(_, k)| Reverse(k.priority()));

		let mut found_digests = 0;
		for (&d, digest) in &json.digests {
			let (digest_keyslots, segments, salt, digest, hash, iterations) = match digest {
				LuksDigest::pbkdf2 { keyslots, segments, salt, digest, hash, iterations } => {
					(keyslots, segments, salt, digest, hash, *iterations)
				},
				LuksDigest::unsupported => continue
			};
			found_digests += 1;
			if segments.is_empty() || digest.is_empty() {
				continue;
			}
			let payload = match find_payload(device, json, segments)? {
				Some(payload) => payload,
				None => continue
			};
			let digest_hash: Hash = hash.parse()?;

			let mut attempted = 0;
			for &(k, keyslot) in &keyslots {
				if !digest_keyslots.is_empty() && !digest_keyslots.contains(&k) {
					continue;
				}
				let (key_size, area, kdf, af) = match keyslot {
					LuksKeyslot::luks2 { key_size, area, kdf, af, .. } => (*key_size as usize, area, kdf, af),
					LuksKeyslot::unsupported => continue
				};
				let (stripes, af_hash) = match af {
					LuksAf::luks1 { stripes, hash } => (*stripes, hash),
					LuksAf::unsupported => continue
				};
				let (encryption, area_key_size, offset, area_size) = match area {
					LuksArea::raw { encryption, key_size, offset, size } => {
						(encryption, *key_size as usize, *offset, *size)
					},
					LuksArea::unsupported => return Err(corrupt(k, "key data area is not raw"))
				};
				let needed = key_size as u64 * stripes as u64;
				if (area_key_size as u64 * V2_SECTOR_SIZE as u64) < needed {
					return Err(corrupt(k, format!(
						"key data area is too small ({} < {})", area_key_size as u64 * V2_SECTOR_SIZE as u64, needed
					)));
				}
				if needed > area_size {
					return Err(corrupt(k, format!("key material needs {} bytes, the area has {}", needed, area_size)));
				}
				if offset.checked_add(needed).map_or(true, |end| end > device_size) {
					return Err(corrupt(k, "key data area ends past the end of the device"));
				}
				if area_key_size as u64 > area_size {
					return Err(corrupt(k, format!("area key size {} exceeds the area", area_key_size)));
				}
				let password_key = match derive_password_key(kdf, password, area_key_size)? {
					PasswordKey::Derived(key) => key,
					PasswordKey::Unsupported => continue,
					PasswordKey::Failed(e) => {
						attempted += 1;
						warn!("error deriving the key for keyslot {}: {}", k, e);
						continue;
					}
				};
				attempted += 1;
				trace!("trying LUKS2 keyslot {} for digest {}", k, d);

				let mut material = vec![0; material_len(needed)?];
				read_exact_at(device, offset, &mut material)?;
				let af_hash: Hash = af_hash.parse()?;
				let candidate = match encryption.parse::<CipherSpec>().and_then(|spec| {
					unlock_material(&spec, af_hash, &password_key, material, key_size, stripes)
				}) {
					Ok(candidate) => candidate,
					Err(e) => {
						warn!("error attempting to compute main key from keyslot {}: {}", k, e);
						continue;
					}
				};

				if digest_hash.pbkdf2_vec(&candidate, salt, iterations, digest.len()) == *digest {
					debug!("unlocked LUKS2 keyslot {} for digest {}", k, d);
					let stream = CipherStream::new(
						payload.spec, candidate, payload.iv_tweak, payload.sector_size, Direction::Decrypt
					)?;
					return Ok(UnlockedVolume {
						sector_size: stream.sector_size(),
						stream,
						payload_offset: payload.offset,
						payload_size: payload.size
					});
				}
			}
			if attempted == 0 {
				return Err(LuksError::NoPasswordsForDigest(d));
			}
		}

		if found_digests == 0 {
			return Err(LuksError::NoUsableDigests);
		}
		Err(LuksError::InvalidPassword)
	}
}

impl LuksHeaders {
	/// Unlocks the volume with `password`, whatever its version.
	pub fn decrypt<R: Read + Seek>(&self, password: &[u8], device: &mut R) -> Result<UnlockedVolume, LuksError> {
		match self {
			Self::V1(header) => header.decrypt(password, device),
			Self::V2 { primary, json, .. } => primary.decrypt(password, device, json)
		}
	}
}
