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

//! The on-disk inode record and the block-pointer table it carries.
//!
//! Only the fields this driver's operations actually read or write are
//! interpreted; uid/gid, the OS-dependent words, the generation number and
//! the ACL/fragment fields are carried verbatim so the 128-byte record
//! round-trips byte for byte, matching a real ext2 revision 0 inode.

use bytemuck::{Pod, Zeroable};

/// Number of direct block pointers in the inode's block table.
pub const DIRECT_BLOCKS_COUNT: usize = 12;
/// Index of the single-indirect block pointer.
pub const IND_SINGLE: usize = 12;
/// Index of the double-indirect block pointer.
pub const IND_DOUBLE: usize = 13;
/// Index of the triple-indirect block pointer.
pub const IND_TRIPLE: usize = 14;
/// Total number of entries in the block-pointer table.
pub const BLOCK_TABLE_LEN: usize = 15;

/// File type/permission bitmask.
pub const S_IFMT: u16 = 0xf000;
/// Regular file.
pub const S_IFREG: u16 = 0x8000;
/// Directory.
pub const S_IFDIR: u16 = 0x4000;
/// Character device.
pub const S_IFCHR: u16 = 0x2000;

/// Returns whether `mode` describes a regular file.
pub fn is_reg(mode: u16) -> bool {
	mode & S_IFMT == S_IFREG
}

/// Returns whether `mode` describes a directory.
pub fn is_dir(mode: u16) -> bool {
	mode & S_IFMT == S_IFDIR
}

/// Returns whether `mode` describes a character device.
pub fn is_chr(mode: u16) -> bool {
	mode & S_IFMT == S_IFCHR
}

/// The on-disk inode record, 128 bytes, matching a revision 0 ext2 inode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct DiskInode {
	pub i_mode: u16,
	pub i_uid: u16,
	pub i_size: u32,
	pub i_atime: u32,
	pub i_ctime: u32,
	pub i_mtime: u32,
	pub i_dtime: u32,
	pub i_gid: u16,
	pub i_links_count: u16,
	/// Number of 512-byte sectors allocated to the file, including indirect
	/// blocks themselves; not the same unit as a filesystem block.
	pub i_blocks: u32,
	pub i_flags: u32,
	pub i_osd1: u32,
	/// Direct (0..12), single- (12), double- (13) and triple- (14) indirect
	/// block pointers.
	pub i_block: [u32; BLOCK_TABLE_LEN],
	pub i_generation: u32,
	pub i_file_acl: u32,
	pub i_dir_acl: u32,
	pub i_faddr: u32,
	pub i_osd2: [u8; 12],
}

impl DiskInode {
	/// Returns the number of filesystem blocks referenced by
	/// [`i_blocks`](Self::i_blocks), converting from the on-disk 512-byte
	/// sector unit.
	pub fn block_count(&self, block_size: u32) -> u32 {
		let sectors_per_block = block_size / 512;
		self.i_blocks.div_ceil(sectors_per_block.max(1))
	}

	/// Sets [`i_blocks`](Self::i_blocks) from a count of filesystem blocks.
	pub fn set_block_count(&mut self, blocks: u32, block_size: u32) {
		self.i_blocks = blocks * (block_size / 512);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn disk_inode_is_128_bytes() {
		assert_eq!(core::mem::size_of::<DiskInode>(), 128);
	}

	#[test]
	fn mode_predicates_match_type_bits() {
		assert!(is_dir(S_IFDIR | 0o755));
		assert!(is_reg(S_IFREG | 0o644));
		assert!(is_chr(S_IFCHR));
		assert!(!is_dir(S_IFREG));
	}

	#[test]
	fn block_count_round_trips_through_sector_conversion() {
		let mut di = DiskInode::zeroed();
		di.set_block_count(3, 1024);
		assert_eq!(di.i_blocks, 6);
		assert_eq!(di.block_count(1024), 3);
	}
}
