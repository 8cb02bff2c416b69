/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! The block device interface the ext2 driver is built against.
//!
//! A real kernel interposes a page/block cache between the filesystem and
//! the physical disk driver; that cache is out of scope here; [`BlockDevice`]
//! is the seam the driver is written against, and a real cache or disk
//! driver is expected to implement it. [`RamDisk`] is the one real backend
//! this crate ships, primarily useful for tests.

use alloc::{sync::Arc, vec, vec::Vec};
use utils::{errno, errno::EResult};

/// A randomly addressable block storage device.
pub trait BlockDevice: Send + Sync {
	/// Returns the size of a single block in bytes.
	fn block_size(&self) -> u32;

	/// Returns the number of blocks on the device.
	fn block_count(&self) -> u32;

	/// Reads block `block` into `buf`.
	///
	/// `buf` must be exactly [`block_size`](Self::block_size) bytes long.
	fn read_block(&self, block: u32, buf: &mut [u8]) -> EResult<()>;

	/// Writes `buf` to block `block`.
	///
	/// `buf` must be exactly [`block_size`](Self::block_size) bytes long.
	fn write_block(&self, block: u32, buf: &[u8]) -> EResult<()>;
}

/// An in-memory block device, backed by a single contiguous buffer.
///
/// Used by tests in place of a real disk; also a plausible backend for a
/// ramdisk-rooted boot image.
pub struct RamDisk {
	block_size: u32,
	data: crate::sync::mutex::Mutex<Vec<u8>>,
}

impl RamDisk {
	/// Creates a new, zero-filled ramdisk of `block_count` blocks of
	/// `block_size` bytes each.
	pub fn new(block_size: u32, block_count: u32) -> Arc<Self> {
		Arc::new(Self {
			block_size,
			data: crate::sync::mutex::Mutex::new(vec![0u8; (block_size as usize) * (block_count as usize)]),
		})
	}
}

impl BlockDevice for RamDisk {
	fn block_size(&self) -> u32 {
		self.block_size
	}

	fn block_count(&self) -> u32 {
		(self.data.lock().len() / self.block_size as usize) as u32
	}

	fn read_block(&self, block: u32, buf: &mut [u8]) -> EResult<()> {
		let size = self.block_size as usize;
		if buf.len() != size {
			return Err(errno!(EINVAL));
		}
		let data = self.data.lock();
		let off = block as usize * size;
		let Some(src) = data.get(off..off + size) else {
			return Err(errno!(EINVAL));
		};
		buf.copy_from_slice(src);
		Ok(())
	}

	fn write_block(&self, block: u32, buf: &[u8]) -> EResult<()> {
		let size = self.block_size as usize;
		if buf.len() != size {
			return Err(errno!(EINVAL));
		}
		let mut data = self.data.lock();
		let off = block as usize * size;
		let Some(dst) = data.get_mut(off..off + size) else {
			return Err(errno!(EINVAL));
		};
		dst.copy_from_slice(buf);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ramdisk_round_trips_a_block() {
		let dev = RamDisk::new(512, 16);
		let mut buf = [0xAAu8; 512];
		dev.write_block(3, &buf).unwrap();
		buf.fill(0);
		dev.read_block(3, &mut buf).unwrap();
		assert!(buf.iter().all(|&b| b == 0xAA));
	}

	#[test]
	fn ramdisk_rejects_out_of_range_block() {
		let dev = RamDisk::new(512, 4);
		let buf = [0u8; 512];
		assert!(dev.write_block(100, &buf).is_err());
	}
}
