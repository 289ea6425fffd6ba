//! Sector-aligned buffering between arbitrary-sized I/O and sector transforms.

use crate::{
	cipher::{check_sector_size, transform, CipherSpec, Direction}, error::LuksError, round_down_to_multiple,
	round_up_to_multiple
};
use secrecy::{ExposeSecret, Secret};
use std::{
	fmt::{self, Debug},
	io::{self, Read, Write}
};

/// Data is handed to transforms in chunks of (at most) this size, rounded up to the block size.
pub const STREAM_BUFFER_SIZE: usize = 1024 * 1024;

/// Something that encrypts or decrypts consecutive runs of whole sectors.
///
/// Each call continues where the previous one left off, so chunks must be passed in order.
pub trait SectorTransform {
	fn transform(&mut self, data: &[u8]) -> Result<Vec<u8>, LuksError>;
}

impl<F> SectorTransform for F
where
	F: FnMut(&[u8]) -> Result<Vec<u8>, LuksError>
{
	fn transform(&mut self, data: &[u8]) -> Result<Vec<u8>, LuksError> {
		self(data)
	}
}

/// Encrypts or decrypts a payload with a volume key, numbering sectors from an advancing IV tweak.
pub struct CipherStream {
	spec: CipherSpec,
	key: Secret<Vec<u8>>,
	iv_tweak: u64,
	sector_size: usize,
	direction: Direction
}

impl CipherStream {
	/// A sector size of 0 means 512.
	pub fn new(
		spec: CipherSpec, key: Vec<u8>, iv_tweak: u64, sector_size: usize, direction: Direction
	) -> Result<Self, LuksError> {
		let sector_size = check_sector_size(sector_size)?;
		Ok(Self { spec, key: Secret::new(key), iv_tweak, sector_size, direction })
	}

	pub fn spec(&self) -> &CipherSpec {
		&self.spec
	}

	pub fn key_size(&self) -> usize {
		self.key.expose_secret().len()
	}

	/// The sector number the next call to [`process`](Self::process) starts at.
	pub fn iv_tweak(&self) -> u64 {
		self.iv_tweak
	}

	pub fn sector_size(&self) -> usize {
		self.sector_size
	}

	pub fn direction(&self) -> Direction {
		self.direction
	}

	/// Transforms `data`, which must be a multiple of the cipher block size, and advances the IV
	/// tweak by the number of sectors processed.
	pub fn process(&mut self, data: &[u8]) -> Result<Vec<u8>, LuksError> {
		let mut out = data.to_vec();
		transform(
			&self.spec, self.direction, self.iv_tweak, self.key.expose_secret(), &mut out, self.sector_size, true
		)?;
		let sectors = round_up_to_multiple(data.len() as u64, self.sector_size as u64) / self.sector_size as u64;
		self.iv_tweak = self.iv_tweak.wrapping_add(sectors);
		Ok(out)
	}
}

impl SectorTransform for CipherStream {
	fn transform(&mut self, data: &[u8]) -> Result<Vec<u8>, LuksError> {
		self.process(data)
	}
}

// implement manually to keep the key out of logs
impl Debug for CipherStream {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CipherStream")
			.field("spec", &self.spec.to_string())
			.field("key", &"[REDACTED]")
			.field("iv_tweak", &self.iv_tweak)
			.field("sector_size", &self.sector_size)
			.field("direction", &self.direction)
			.finish()
	}
}

fn buffer_size(block_size: usize) -> usize {
	round_up_to_multiple(STREAM_BUFFER_SIZE as u64, block_size as u64) as usize
}

/// Buffers written data and passes whole blocks through a [`SectorTransform`] into `sink`.
///
/// [`finish`](Self::finish) must be called to write out a trailing partial block, which is
/// zero-padded to the block size.
pub struct EncryptWriter<T: SectorTransform, W: Write> {
	transform: T,
	sink: W,
	block_size: usize,
	capacity: usize,
	buf: Vec<u8>
}

impl<T: SectorTransform, W: Write> EncryptWriter<T, W> {
	pub fn new(transform: T, sink: W, block_size: usize) -> Self {
		let block_size = block_size.max(1);
		let capacity = buffer_size(block_size);
		Self { transform, sink, block_size, capacity, buf: Vec::with_capacity(capacity) }
	}

	// transforms and writes out every complete block in the buffer
	fn write_blocks(&mut self) -> io::Result<()> {
		let whole = round_down_to_multiple(self.buf.len(), self.block_size);
		if whole == 0 {
			return Ok(());
		}
		let out = self.transform.transform(&self.buf[..whole])?;
		self.sink.write_all(&out)?;
		self.buf.drain(..whole);
		Ok(())
	}

	/// Pads and writes out any buffered data, then returns the sink.
	pub fn finish(mut self) -> io::Result<W> {
		self.write_blocks()?;
		if !self.buf.is_empty() {
			let padded = round_up_to_multiple(self.buf.len() as u64, self.block_size as u64) as usize;
			self.buf.resize(padded, 0);
			self.write_blocks()?;
		}
		self.sink.flush()?;
		Ok(self.sink)
	}
}

impl<T: SectorTransform, W: Write> Write for EncryptWriter<T, W> {
	fn write(&mut self, data: &[u8]) -> io::Result<usize> {
		let n = data.len().min(self.capacity - self.buf.len());
		self.buf.extend_from_slice(&data[..n]);
		if self.buf.len() == self.capacity {
			self.write_blocks()?;
		}
		Ok(n)
	}

	/// Writes out complete blocks only; a partial block stays buffered until more data arrives or
	/// the writer is finished.
	fn flush(&mut self) -> io::Result<()> {
		self.write_blocks()?;
		self.sink.flush()
	}
}

/// Reads whole blocks from `source` and passes them through a [`SectorTransform`].
///
/// A source that ends in the middle of a block is reported as [`io::ErrorKind::InvalidData`].
pub struct DecryptReader<T: SectorTransform, R: Read> {
	transform: T,
	source: R,
	block_size: usize,
	capacity: usize,
	out: Vec<u8>,
	pos: usize,
	eof: bool
}

impl<T: SectorTransform, R: Read> DecryptReader<T, R> {
	pub fn new(transform: T, source: R, block_size: usize) -> Self {
		let block_size = block_size.max(1);
		let capacity = buffer_size(block_size);
		Self { transform, source, block_size, capacity, out: Vec::new(), pos: 0, eof: false }
	}

	pub fn into_inner(self) -> R {
		self.source
	}

	fn fill(&mut self) -> io::Result<()> {
		let mut chunk = vec![0; self.capacity];
		let mut filled = 0;
		while filled < self.capacity {
			match self.source.read(&mut chunk[filled..]) {
				Ok(0) => {
					self.eof = true;
					break;
				}
				Ok(n) => filled += n,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => return Err(e)
			}
		}
		if filled % self.block_size != 0 {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("input ends with a partial block of {} bytes", filled % self.block_size)
			));
		}
		self.out = if filled == 0 { Vec::new() } else { self.transform.transform(&chunk[..filled])? };
		self.pos = 0;
		Ok(())
	}
}

impl<T: SectorTransform, R: Read> Read for DecryptReader<T, R> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if self.pos == self.out.len() {
			if self.eof {
				return Ok(0);
			}
			self.fill()?;
		}
		let n = buf.len().min(self.out.len() - self.pos);
		buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
		self.pos += n;
		Ok(n)
	}
}
