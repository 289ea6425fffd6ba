//! Password-based key derivation and cost tuning.
//!
//! Costs are only tuned when a header is created; unlocking always uses the parameters stored in
//! the header.

use crate::{error::LuksError, hash::Hash};
use argon2::{Algorithm, Argon2, Params, Version};
use log::debug;
use std::time::{Duration, Instant};

/// Largest Argon2 memory cost (in KiB) tuning will pick, same as `cryptsetup`.
pub const ARGON2_MAX_MEMORY_COST: u32 = 4 * 1024 * 1024;

/// Argon2 costs for LUKS2 key slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Argon2Options {
	/// Number of passes.
	pub time_cost: u32,
	/// Lanes, stored as `cpus` in the key slot.
	pub threads: u32,
	/// Memory in KiB. Tuned against the target duration when unset.
	pub memory_cost: Option<u32>
}

impl Default for Argon2Options {
	fn default() -> Self {
		Self { time_cost: 16, threads: 16, memory_cost: None }
	}
}

/// Key derivation settings used when formatting a volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbkdfOptions {
	/// How long one key derivation should take on this machine.
	pub target: Duration,
	/// Fixed PBKDF2 iteration count, skipping tuning.
	pub pbkdf2_iterations: Option<u32>,
	pub argon2: Argon2Options
}

impl Default for PbkdfOptions {
	fn default() -> Self {
		Self { target: Duration::from_secs(1), pbkdf2_iterations: None, argon2: Argon2Options::default() }
	}
}

impl PbkdfOptions {
	pub(crate) fn pbkdf2_iterations(&self, salt: &[u8], key_len: usize, hash: Hash) -> Result<u32, LuksError> {
		match self.pbkdf2_iterations {
			Some(iterations) => Ok(iterations),
			None => iterations_pbkdf2(salt, key_len, hash, self.target)
		}
	}

	pub(crate) fn argon2_memory_cost(&self, salt: &[u8], key_len: usize) -> Result<u32, LuksError> {
		match self.argon2.memory_cost {
			Some(memory) => Ok(memory),
			None => memory_cost_argon2(
				salt, key_len, self.argon2.time_cost, self.argon2.threads, Algorithm::Argon2i, self.target
			)
		}
	}
}

// times one run of `trial` per cost
fn tune<F>(start: u32, max: u32, target: Duration, mut trial: F) -> Result<u32, LuksError>
where
	F: FnMut(u32) -> Result<(), LuksError>
{
	tune_measured(start, max, target, |cost| {
		let began = Instant::now();
		trial(cost)?;
		Ok(began.elapsed())
	})
}

// doubles the cost until one run takes a tenth of the target, then scales it up linearly
fn tune_measured<F>(start: u32, max: u32, target: Duration, mut measure: F) -> Result<u32, LuksError>
where
	F: FnMut(u32) -> Result<Duration, LuksError>
{
	let mut cost = start;
	loop {
		let elapsed = measure(cost)?;
		if elapsed >= target / 10 || cost > max / 2 {
			let scaled = cost as u128 * target.as_nanos() / elapsed.as_nanos().max(1);
			return Ok(scaled.clamp(start as u128, max as u128) as u32);
		}
		cost *= 2;
	}
}

/// Finds a PBKDF2 iteration count for which deriving `key_len` bytes takes about `target`.
pub fn iterations_pbkdf2(salt: &[u8], key_len: usize, hash: Hash, target: Duration) -> Result<u32, LuksError> {
	let mut out = vec![0; key_len];
	let iterations = tune(2, u32::MAX, target, |iterations| {
		hash.pbkdf2(b"", salt, iterations, &mut out);
		Ok(())
	})?;
	debug!("tuned pbkdf2-{} to {} iterations", hash, iterations);
	Ok(iterations)
}

/// Finds an Argon2 memory cost (in KiB) for which deriving `key_len` bytes with the given time
/// and thread costs takes about `target`.
pub fn memory_cost_argon2(
	salt: &[u8], key_len: usize, time_cost: u32, threads: u32, algorithm: Algorithm, target: Duration
) -> Result<u32, LuksError> {
	let mut out = vec![0; key_len];
	let start = (8 * threads).max(2);
	let memory = tune(start, ARGON2_MAX_MEMORY_COST, target, |memory| {
		argon2_key(algorithm, b"", salt, time_cost, memory, threads, &mut out)
	})?;
	debug!("tuned {:?} to {} KiB (time {}, threads {})", algorithm, memory, time_cost, threads);
	Ok(memory)
}

/// Derives `out.len()` bytes from `password` with Argon2 version 0x13.
pub fn argon2_key(
	algorithm: Algorithm, password: &[u8], salt: &[u8], time_cost: u32, memory_cost: u32, threads: u32,
	out: &mut [u8]
) -> Result<(), LuksError> {
	let params = Params::new(memory_cost, time_cost, threads, Some(out.len()))?;
	Argon2::new(algorithm, Version::V0x13, params).hash_password_into(password, salt, out)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		let options = PbkdfOptions::default();
		assert_eq!(options.target, Duration::from_secs(1));
		assert_eq!(options.argon2.time_cost, 16);
		assert_eq!(options.argon2.threads, 16);
		assert_eq!(options.argon2.memory_cost, None);
	}

	#[test]
	fn fixed_costs_skip_tuning() {
		let options = PbkdfOptions {
			target: Duration::from_secs(3600),
			pbkdf2_iterations: Some(1000),
			argon2: Argon2Options { time_cost: 1, threads: 1, memory_cost: Some(64) }
		};
		assert_eq!(options.pbkdf2_iterations(&[0; 32], 32, Hash::Sha256).unwrap(), 1000);
		assert_eq!(options.argon2_memory_cost(&[0; 32], 32).unwrap(), 64);
	}

	#[test]
	fn tuning_pbkdf2() {
		let iterations = iterations_pbkdf2(&[0; 32], 32, Hash::Sha256, Duration::from_millis(20)).unwrap();
		assert!(iterations >= 2);
	}

	#[test]
	fn tuning_argon2() {
		let memory = memory_cost_argon2(&[0; 32], 32, 1, 2, Algorithm::Argon2i, Duration::from_millis(20)).unwrap();
		assert!(memory >= 16);
		assert!(memory <= ARGON2_MAX_MEMORY_COST);
	}

	#[test]
	fn tune_scales_to_target() {
		// 50us per unit of cost: 256 is the first cost reaching 10ms, and 100ms is 2000 units
		let cost = tune_measured(2, 1 << 20, Duration::from_millis(100), |cost| {
			Ok(Duration::from_micros(cost as u64 * 50))
		})
		.unwrap();
		assert_eq!(cost, 2000);
	}

	#[test]
	fn tune_clamps_to_bounds() {
		let instant = tune_measured(2, 1 << 20, Duration::from_secs(1), |_| Ok(Duration::ZERO)).unwrap();
		assert_eq!(instant, 1 << 20);
		let slow = tune_measured(8, 1 << 20, Duration::from_millis(10), |_| Ok(Duration::from_secs(5))).unwrap();
		assert_eq!(slow, 8);
	}

	#[test]
	fn tune_propagates_errors() {
		let err = tune_measured(2, 16, Duration::from_secs(1), |_| Err(LuksError::Internal(String::from("boom"))));
		assert!(matches!(err, Err(LuksError::Internal(_))));
	}

	#[test]
	fn argon2_is_deterministic() {
		let mut a = [0; 32];
		let mut b = [0; 32];
		argon2_key(Algorithm::Argon2id, b"password", b"saltsaltsalt", 1, 64, 1, &mut a).unwrap();
		argon2_key(Algorithm::Argon2id, b"password", b"saltsaltsalt", 1, 64, 1, &mut b).unwrap();
		assert_eq!(a, b);
		argon2_key(Algorithm::Argon2i, b"password", b"saltsaltsalt", 1, 64, 1, &mut b).unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn argon2_rejects_bad_params() {
		let mut out = [0; 32];
		assert!(matches!(
			argon2_key(Algorithm::Argon2i, b"password", b"saltsaltsalt", 0, 64, 1, &mut out),
			Err(LuksError::HashError(_))
		));
	}
}
