use crate::{error::LuksError, hash::Hash};
use digest::{Digest, FixedOutputReset};
use rand::{rngs::OsRng, RngCore};
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Sha256, Sha512};

fn xor_block(src: &[u8], dst: &mut [u8]) {
	for (d, s) in dst.iter_mut().zip(src) {
		*d ^= *s;
	}
}

// hashes the buffer window by window, each window prefixed with its big-endian index;
// a trailing short window keeps only as many digest bytes as it is long
fn diffuse<H: Digest + FixedOutputReset>(buf: &mut [u8]) {
	let mut hasher = H::new();
	let digest_size = <H as Digest>::output_size();

	for (i, window) in buf.chunks_mut(digest_size).enumerate() {
		Digest::update(&mut hasher, (i as u32).to_be_bytes()); // i is the iv
		Digest::update(&mut hasher, &*window);
		let digest = hasher.finalize_reset();
		let n = window.len();
		window.copy_from_slice(&digest[..n]);
	}
}

fn check_geometry(blocksize: usize, stripes: usize) -> Result<(), LuksError> {
	if blocksize == 0 || stripes == 0 {
		return Err(LuksError::Internal(format!(
			"af geometry {} bytes x {} stripes is empty", blocksize, stripes
		)));
	}
	Ok(())
}

/// Expands `key` into `stripes` stripes of anti-forensic material, compatible with `cryptsetup`'s
/// `afsplitter` implementation.
///
/// All stripes but the last are random; the last one is the key XORed with the diffused
/// accumulation of the others, so losing any single stripe makes the key unrecoverable.
pub fn split<H: Digest + FixedOutputReset>(key: &[u8], stripes: usize) -> Result<Vec<u8>, LuksError> {
	let blocksize = key.len();
	check_geometry(blocksize, stripes)?;

	let mut dst = vec![0; blocksize * stripes];
	let (random, last) = dst.split_at_mut(blocksize * (stripes - 1));
	OsRng.try_fill_bytes(random)?;

	let mut bufblock = vec![0; blocksize];
	for stripe in random.chunks_exact(blocksize) {
		xor_block(stripe, &mut bufblock);
		diffuse::<H>(&mut bufblock);
	}
	for ((l, b), k) in last.iter_mut().zip(&bufblock).zip(key) {
		*l = b ^ k;
	}

	Ok(dst)
}

/// Recovers information from data that was split with [`split`] or `cryptsetup`'s `afsplitter`
/// implementation.
///
/// The blocksize, stripes and hash must be the same as when splitting the information. A wrong
/// hash is not detected here and yields garbage.
pub fn merge<H: Digest + FixedOutputReset>(
	src: &[u8], blocksize: usize, stripes: usize
) -> Result<Vec<u8>, LuksError> {
	check_geometry(blocksize, stripes)?;
	if src.len() != blocksize * stripes {
		return Err(LuksError::AfLengthMismatch { expected: blocksize * stripes, found: src.len() });
	}

	let mut bufblock = vec![0; blocksize];
	let (diffused, last) = src.split_at(blocksize * (stripes - 1));
	for stripe in diffused.chunks_exact(blocksize) {
		xor_block(stripe, &mut bufblock);
		diffuse::<H>(&mut bufblock);
	}
	xor_block(last, &mut bufblock);

	Ok(bufblock)
}

/// [`split`] with the hash picked at runtime.
pub fn split_with(hash: Hash, key: &[u8], stripes: usize) -> Result<Vec<u8>, LuksError> {
	match hash {
		Hash::Sha1 => split::<Sha1>(key, stripes),
		Hash::Sha256 => split::<Sha256>(key, stripes),
		Hash::Sha512 => split::<Sha512>(key, stripes),
		Hash::Ripemd160 => split::<Ripemd160>(key, stripes)
	}
}

/// [`merge`] with the hash picked at runtime.
pub fn merge_with(hash: Hash, src: &[u8], blocksize: usize, stripes: usize) -> Result<Vec<u8>, LuksError> {
	match hash {
		Hash::Sha1 => merge::<Sha1>(src, blocksize, stripes),
		Hash::Sha256 => merge::<Sha256>(src, blocksize, stripes),
		Hash::Sha512 => merge::<Sha512>(src, blocksize, stripes),
		Hash::Ripemd160 => merge::<Ripemd160>(src, blocksize, stripes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const HASHES: [Hash; 4] = [Hash::Sha1, Hash::Sha256, Hash::Sha512, Hash::Ripemd160];

	fn key(len: usize) -> Vec<u8> {
		(0..len).map(|i| (i * 7 + 3) as u8).collect()
	}

	#[test]
	fn split_then_merge() {
		for hash in HASHES {
			for len in [16, 32, 64] {
				for stripes in [1, 2, 4000] {
					let k = key(len);
					let split = split_with(hash, &k, stripes).unwrap();
					assert_eq!(split.len(), len * stripes);
					assert_eq!(merge_with(hash, &split, len, stripes).unwrap(), k, "{} {} {}", hash, len, stripes);
				}
			}
		}
	}

	#[test]
	fn single_stripe_is_the_key() {
		let k = key(32);
		assert_eq!(split::<Sha256>(&k, 1).unwrap(), k);
		assert_eq!(merge::<Sha256>(&k, 32, 1).unwrap(), k);
	}

	#[test]
	fn two_stripes_diffuse_once() {
		// 40 bytes with sha256 covers one full and one short window
		let first = key(40);
		let second: Vec<u8> = (0..40u8).rev().collect();
		let mut expected = first.clone();
		diffuse::<Sha256>(&mut expected);
		xor_block(&second, &mut expected);

		let src = [first, second].concat();
		assert_eq!(merge::<Sha256>(&src, 40, 2).unwrap(), expected);
	}

	#[test]
	fn diffuse_windows() {
		let mut buf = vec![0xaa; 40];
		diffuse::<Sha256>(&mut buf);

		let mut h = Sha256::new();
		Digest::update(&mut h, 0u32.to_be_bytes());
		Digest::update(&mut h, [0xaa; 32]);
		assert_eq!(&buf[..32], &h.finalize()[..]);

		let mut h = Sha256::new();
		Digest::update(&mut h, 1u32.to_be_bytes());
		Digest::update(&mut h, [0xaa; 8]);
		assert_eq!(&buf[32..], &h.finalize()[..8]);
	}

	#[test]
	fn wrong_length() {
		assert!(matches!(
			merge::<Sha256>(&[0; 100], 32, 4),
			Err(LuksError::AfLengthMismatch { expected: 128, found: 100 })
		));
	}

	#[test]
	fn split_is_randomized() {
		let k = key(32);
		assert_ne!(split::<Sha256>(&k, 2).unwrap(), split::<Sha256>(&k, 2).unwrap());
	}
}
