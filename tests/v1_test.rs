use luksy::*;
use std::{
	io::{Cursor, Read, Write},
	time::Duration
};

fn options() -> PbkdfOptions {
	PbkdfOptions {
		target: Duration::from_millis(10),
		pbkdf2_iterations: Some(1000),
		argon2: Argon2Options { time_cost: 1, threads: 1, memory_cost: Some(64) }
	}
}

// header followed by the encrypted payload
fn image(volume: FormattedVolume, payload: &[u8]) -> Vec<u8> {
	let mut image = volume.header;
	let mut writer = EncryptWriter::new(volume.stream, Vec::new(), volume.sector_size);
	writer.write_all(payload).unwrap();
	image.extend(writer.finish().unwrap());
	image
}

fn v1(headers: LuksHeaders) -> V1Header {
	match headers {
		LuksHeaders::V1(h) => h,
		h => panic!("expected a LUKS1 header, got {:?}", h)
	}
}

fn unlock(image: Vec<u8>, password: &str) -> Result<Vec<u8>, LuksError> {
	let mut device = Cursor::new(image);
	let headers = read_headers(&mut device, &ReadOptions::default())?;
	let unlocked = headers.decrypt(password.as_bytes(), &mut device)?;
	let mut plaintext = Vec::new();
	unlocked.into_reader(device)?.read_to_end(&mut plaintext)?;
	Ok(plaintext)
}

#[test_log::test]
fn default_cipher_layout() {
	let volume = encrypt_v1_with(&["password"], "", &options()).unwrap();
	assert_eq!(volume.sector_size, 512);
	// eight slots of 64 * 4000 bytes, each rounded up to 4096, after the first 4096 bytes
	assert_eq!(volume.header.len(), 4096 + 8 * 258048);
	assert_eq!(&volume.header[..6], &V1_MAGIC);

	let h = v1(read_headers(&mut Cursor::new(volume.header.clone()), &ReadOptions::default()).unwrap());
	assert_eq!(h.version(), 1);
	assert_eq!(h.cipher_name(), "aes");
	assert_eq!(h.cipher_mode(), "xts-plain64");
	assert_eq!(h.hash_spec(), "sha256");
	assert_eq!(h.key_bytes(), 64);
	assert_eq!(h.mk_digest_iter(), 4000);
	assert_eq!(h.payload_offset() as usize * 512, volume.header.len());
	assert_eq!(h.uuid().len(), 36);
	assert_eq!(h.to_bytes().unwrap(), &volume.header[..592]);

	for (i, slot) in h.key_slots().iter().enumerate() {
		assert_eq!(slot.active().unwrap(), i == 0);
		assert_eq!(slot.iterations(), 1000);
		assert_eq!(slot.stripes(), 4000);
		assert_eq!(slot.key_material_offset() as usize, (4096 + i * 258048) / 512);
	}
	// slot salts are independent
	assert_ne!(h.key_slot(0).unwrap().salt(), h.key_slot(1).unwrap().salt());
}

#[test_log::test]
fn essiv_round_trip() {
	let payload: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
	let volume = encrypt_v1_with(&["password"], "aes-cbc-essiv:sha256", &options()).unwrap();
	let header_len = volume.header.len();
	let image = image(volume, &payload);
	assert_eq!(image.len(), header_len + 8192);
	assert_ne!(&image[header_len..], &payload[..]);

	let h = v1(read_headers(&mut Cursor::new(image.clone()), &ReadOptions::default()).unwrap());
	assert_eq!(h.cipher_mode(), "cbc-essiv:sha256");
	assert_eq!(h.key_bytes(), 32);

	let unlocked = h.decrypt(b"password", &mut Cursor::new(image.clone())).unwrap();
	assert_eq!(unlocked.payload_offset, header_len as u64);
	assert_eq!(unlocked.payload_size, 8192);
	assert_eq!(unlock(image, "password").unwrap(), payload);
}

#[test_log::test]
fn other_ciphers_round_trip() {
	let payload = b"The quick brown fox jumps over the lazy dog".repeat(40);
	for cipher in ["twofish-xts-plain64", "serpent-cbc-plain", "cast5-cbc-plain64", "aes-ecb"] {
		let volume = encrypt_v1_with(&["pw"], cipher, &options()).unwrap();
		let plaintext = unlock(image(volume, &payload), "pw").unwrap();
		// the last block is zero-padded to the sector size
		assert_eq!(plaintext.len() % 512, 0, "{}", cipher);
		assert_eq!(&plaintext[..payload.len()], &payload[..], "{}", cipher);
		assert!(plaintext[payload.len()..].iter().all(|b| *b == 0), "{}", cipher);
	}
}

#[test_log::test]
fn every_password_unlocks() {
	let passwords = ["first", "second", "third"];
	let volume = encrypt_v1_with(&passwords, "aes-xts-plain64", &options()).unwrap();
	let image = image(volume, &[0x5a; 1024]);
	for password in passwords {
		assert_eq!(unlock(image.clone(), password).unwrap(), vec![0x5a; 1024]);
	}
	assert!(matches!(unlock(image, "fourth"), Err(LuksError::InvalidPassword)));
}

#[test_log::test]
fn no_active_slots() {
	let volume = encrypt_v1_with(&["password"], "", &options()).unwrap();
	let mut device = Cursor::new(volume.header);
	let mut h = v1(read_headers(&mut device, &ReadOptions::default()).unwrap());
	let mut slot = *h.key_slot(0).unwrap();
	slot.set_active(false);
	h.set_key_slot(0, slot).unwrap();
	assert!(matches!(h.decrypt(b"password", &mut device), Err(LuksError::NoPasswordsV1)));
}

#[test_log::test]
fn invalid_slot_marker() {
	let volume = encrypt_v1_with(&["password"], "", &options()).unwrap();
	let mut image = volume.header;
	// state marker of the second key slot
	image[256..260].copy_from_slice(&0x12345678u32.to_be_bytes());
	let mut device = Cursor::new(image);
	let headers = read_headers(&mut device, &ReadOptions::default()).unwrap();
	assert!(matches!(
		headers.decrypt(b"wrong", &mut device),
		Err(LuksError::ParseError(ParseError::InvalidKeySlotState(0x12345678)))
	));
}

#[test_log::test]
fn tuned_iterations() {
	let options = PbkdfOptions { target: Duration::from_millis(50), ..PbkdfOptions::default() };
	let volume = encrypt_v1_with(&["password"], "", &options).unwrap();
	let h = v1(read_headers(&mut Cursor::new(volume.header.clone()), &ReadOptions::default()).unwrap());
	assert!(h.key_slot(0).unwrap().iterations() >= 2);
	assert!(h.decrypt(b"password", &mut Cursor::new(volume.header)).is_ok());
}

#[test_log::test]
fn oversized_key_material_is_skipped() {
	let volume = encrypt_v1_with(&["pw"], "", &options()).unwrap();
	let header = v1(read_headers(&mut Cursor::new(volume.header.clone()), &ReadOptions::default()).unwrap());
	let patched = |key_bytes: u32, stripes: u32| {
		let mut h = header.clone();
		h.set_key_bytes(key_bytes);
		let mut slot = *h.key_slot(0).unwrap();
		slot.set_stripes(stripes);
		h.set_key_slot(0, slot).unwrap();
		let mut image = volume.header.clone();
		image[..592].copy_from_slice(&h.to_bytes().unwrap());
		image
	};

	// petabytes of key material
	assert!(matches!(unlock(patched(1 << 20, 0x8000_0000), "pw"), Err(LuksError::InvalidPassword)));
	// overlaps the next key slot's material
	assert!(matches!(unlock(patched(64, 4100), "pw"), Err(LuksError::InvalidPassword)));
	assert!(matches!(unlock(patched(64, 0), "pw"), Err(LuksError::InvalidPassword)));
	// the untouched geometry still unlocks
	assert!(unlock(patched(64, 4000), "pw").is_ok());
}
