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

//! The ext2 on-disk filesystem driver.
//!
//! Layout on disk, from block zero: a boot block, the superblock, the
//! group descriptor table, and then, per block group, a block bitmap, an
//! inode bitmap, an inode table, and data blocks. Journalling, extended
//! attributes, symbolic links, online resize and block-group rebalancing
//! are not implemented; inode truncation is accepted as a no-op.

pub mod blockmap;
pub mod dirent;
pub mod inode;
pub mod namespace;

use crate::file::block::BlockDevice;
use alloc::{sync::Arc, vec, vec::Vec};
use bytemuck::{Pod, Zeroable};
use utils::{errno, errno::EResult};

/// Magic number identifying an ext2 superblock.
pub const EXT2_MAGIC: u16 = 0xef53;
/// The inode number of the filesystem's root directory.
pub const ROOT_INODE: u32 = 2;
/// The first inode number available to a revision 0 filesystem that does
/// not record `s_first_ino` explicitly.
const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
/// Size in bytes of an inode on a revision 0 filesystem.
const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;

/// On-disk superblock, describing the whole filesystem.
///
/// Most fields beyond block/inode counts and the magic number are carried
/// only so a block read back from disk round-trips byte for byte; they are
/// not otherwise interpreted.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct Superblock {
	pub s_inodes_count: u32,
	pub s_blocks_count: u32,
	pub s_r_blocks_count: u32,
	pub s_free_blocks_count: u32,
	pub s_free_inodes_count: u32,
	pub s_first_data_block: u32,
	pub s_log_block_size: u32,
	pub s_log_frag_size: u32,
	pub s_blocks_per_group: u32,
	pub s_frags_per_group: u32,
	pub s_inodes_per_group: u32,
	pub s_mtime: u32,
	pub s_wtime: u32,
	pub s_mnt_count: u16,
	pub s_max_mnt_count: u16,
	pub s_magic: u16,
	pub s_state: u16,
	pub s_errors: u16,
	pub s_minor_rev_level: u16,
	pub s_lastcheck: u32,
	pub s_checkinterval: u32,
	pub s_creator_os: u32,
	pub s_rev_level: u32,
	pub s_def_resuid: u16,
	pub s_def_resgid: u16,
	// -- revision 1+ fields --
	pub s_first_ino: u32,
	pub s_inode_size: u16,
	pub s_block_group_nr: u16,
	pub s_feature_compat: u32,
	pub s_feature_incompat: u32,
	pub s_feature_ro_compat: u32,
	pub s_uuid: [u8; 16],
	pub s_volume_name: [u8; 16],
	pub s_last_mounted: [u8; 64],
	pub s_algo_bitmap: u32,
	pub s_prealloc_blocks: u8,
	pub s_prealloc_dir_blocks: u8,
	_pad0: u16,
	pub s_journal_uuid: [u8; 16],
	pub s_journal_inum: u32,
	pub s_journal_dev: u32,
	pub s_last_orphan: u32,
	_padding: [u8; 788],
}

impl Superblock {
	/// Tells whether the magic number matches ext2's.
	pub fn is_valid(&self) -> bool {
		self.s_magic == EXT2_MAGIC
	}

	/// Returns the size of a block in bytes.
	pub fn block_size(&self) -> u32 {
		1024u32 << self.s_log_block_size
	}

	/// Returns the size of an on-disk inode in bytes.
	pub fn inode_size(&self) -> u16 {
		if self.s_rev_level >= 1 {
			self.s_inode_size
		} else {
			EXT2_GOOD_OLD_INODE_SIZE
		}
	}

	/// Returns the first inode number available for user files; inodes
	/// below this are reserved (root, bad-blocks, etc).
	pub fn first_user_inode(&self) -> u32 {
		if self.s_rev_level >= 1 {
			self.s_first_ino
		} else {
			EXT2_GOOD_OLD_FIRST_INO
		}
	}

	/// Returns the number of block groups in the filesystem.
	pub fn group_count(&self) -> u32 {
		self.s_blocks_count.div_ceil(self.s_blocks_per_group.max(1))
	}
}

/// On-disk group descriptor, one per block group, describing where that
/// group's bitmaps and inode table live.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[allow(missing_docs)]
pub struct GroupDescriptor {
	pub bg_block_bitmap: u32,
	pub bg_inode_bitmap: u32,
	pub bg_inode_table: u32,
	pub bg_free_blocks_count: u16,
	pub bg_free_inodes_count: u16,
	pub bg_used_dirs_count: u16,
	_pad: u16,
	_reserved: [u8; 12],
}

/// A mounted ext2 filesystem.
///
/// The superblock and group descriptor table are cached in memory and
/// written back through on every mutation; both are guarded by a single
/// sleeping mutex since allocation routines read-modify-write them and
/// must not interleave.
pub struct Ext2Fs {
	dev: Arc<dyn BlockDevice>,
	state: crate::sync::mutex::Mutex<FsState>,
}

struct FsState {
	sb: Superblock,
	groups: Vec<GroupDescriptor>,
}

/// Returns the block holding the group descriptor table, which immediately
/// follows the block containing the superblock.
fn gdt_start_block(sb: &Superblock) -> u32 {
	if sb.block_size() == 1024 {
		2
	} else {
		1
	}
}

impl Ext2Fs {
	/// Mounts the filesystem found on `dev`, reading its superblock and
	/// group descriptor table.
	///
	/// Returns [`EINVAL`](utils::errno::EINVAL) if the superblock's magic
	/// number does not match.
	pub fn mount(dev: Arc<dyn BlockDevice>) -> EResult<Self> {
		let sb = read_superblock(&*dev)?;
		if !sb.is_valid() {
			return Err(errno!(EINVAL));
		}
		let groups = read_group_descriptors(&*dev, &sb)?;
		Ok(Self {
			dev,
			state: crate::sync::mutex::Mutex::new(FsState {
				sb,
				groups,
			}),
		})
	}

	/// Returns the filesystem's block size in bytes.
	pub fn block_size(&self) -> u32 {
		self.state.lock().sb.block_size()
	}

	/// Reads block `block` into a freshly allocated buffer.
	pub(crate) fn read_block(&self, block: u32) -> EResult<Vec<u8>> {
		let size = self.block_size();
		let mut buf = vec![0u8; size as usize];
		self.dev.read_block(block, &mut buf)?;
		Ok(buf)
	}

	/// Writes `buf` to block `block`.
	pub(crate) fn write_block(&self, block: u32, buf: &[u8]) -> EResult<()> {
		self.dev.write_block(block, buf)
	}

	/// Allocates a free block, marking it used in its group's bitmap and
	/// decrementing the free-block counters. Scans groups in order and
	/// returns [`ENOSPC`](utils::errno::ENOSPC) once every group has been
	/// tried.
	pub fn alloc_block(&self) -> EResult<u32> {
		let mut st = self.state.lock();
		let group_count = st.sb.group_count();
		let blocks_per_group = st.sb.s_blocks_per_group;
		let total_blocks = st.sb.s_blocks_count;
		let first_data_block = st.sb.s_first_data_block;
		for group in 0..group_count {
			// Block `b` of group `group` is numbered `group*bpg + b + first_data_block`, so the
			// group's own share of the filesystem's total block count is offset by that same
			// amount; omitting it would let the last group's scan return one past the last valid
			// block number.
			let remaining = total_blocks
				.saturating_sub(first_data_block)
				.saturating_sub(group * blocks_per_group);
			let limit = remaining.min(blocks_per_group);
			let bitmap_block = st.groups[group as usize].bg_block_bitmap;
			let mut buf = self.read_block(bitmap_block)?;
			if let Some(bit) = bitmap_scan(&buf, 0, limit) {
				bitmap_set(&mut buf, bit);
				self.write_block(bitmap_block, &buf)?;
				st.groups[group as usize].bg_free_blocks_count -= 1;
				st.sb.s_free_blocks_count -= 1;
				self.write_group_descriptors(&st.sb, &st.groups)?;
				self.write_superblock(&st.sb)?;
				return Ok(group * blocks_per_group + bit + st.sb.s_first_data_block);
			}
		}
		Err(errno!(ENOSPC))
	}

	/// Releases `block` back to its group's free list.
	pub fn free_block(&self, block: u32) -> EResult<()> {
		let mut st = self.state.lock();
		let blocks_per_group = st.sb.s_blocks_per_group;
		let block0 = block - st.sb.s_first_data_block;
		let group = block0 / blocks_per_group;
		let bit = block0 % blocks_per_group;
		let bitmap_block = st.groups[group as usize].bg_block_bitmap;
		let mut buf = self.read_block(bitmap_block)?;
		bitmap_clear(&mut buf, bit);
		self.write_block(bitmap_block, &buf)?;
		st.groups[group as usize].bg_free_blocks_count += 1;
		st.sb.s_free_blocks_count += 1;
		self.write_group_descriptors(&st.sb, &st.groups)?;
		self.write_superblock(&st.sb)
	}

	/// Allocates a free inode number, skipping reserved inodes in group
	/// zero. Does not populate the inode's contents.
	pub fn alloc_inode(&self) -> EResult<u32> {
		let mut st = self.state.lock();
		let group_count = st.sb.group_count();
		let inodes_per_group = st.sb.s_inodes_per_group;
		let total_inodes = st.sb.s_inodes_count;
		let first_user = st.sb.first_user_inode();
		for group in 0..group_count {
			let remaining = total_inodes.saturating_sub(group * inodes_per_group);
			let limit = remaining.min(inodes_per_group);
			let start = if group == 0 { first_user - 1 } else { 0 };
			let bitmap_block = st.groups[group as usize].bg_inode_bitmap;
			let mut buf = self.read_block(bitmap_block)?;
			if let Some(bit) = bitmap_scan(&buf, start, limit) {
				bitmap_set(&mut buf, bit);
				self.write_block(bitmap_block, &buf)?;
				st.groups[group as usize].bg_free_inodes_count -= 1;
				st.sb.s_free_inodes_count -= 1;
				self.write_group_descriptors(&st.sb, &st.groups)?;
				self.write_superblock(&st.sb)?;
				return Ok(group * inodes_per_group + bit + 1);
			}
		}
		Err(errno!(ENOSPC))
	}

	/// Releases inode number `ino` back to its group's free list.
	pub fn free_inode(&self, ino: u32) -> EResult<()> {
		let mut st = self.state.lock();
		let inodes_per_group = st.sb.s_inodes_per_group;
		let (group, bit) = ((ino - 1) / inodes_per_group, (ino - 1) % inodes_per_group);
		let bitmap_block = st.groups[group as usize].bg_inode_bitmap;
		let mut buf = self.read_block(bitmap_block)?;
		bitmap_clear(&mut buf, bit);
		self.write_block(bitmap_block, &buf)?;
		st.groups[group as usize].bg_free_inodes_count += 1;
		st.sb.s_free_inodes_count += 1;
		self.write_group_descriptors(&st.sb, &st.groups)?;
		self.write_superblock(&st.sb)
	}

	/// Returns the on-disk group/offset pair an inode number maps to.
	fn inode_location(&self, sb: &Superblock, groups: &[GroupDescriptor], ino: u32) -> (u32, u32) {
		let inodes_per_group = sb.s_inodes_per_group;
		let index_in_group = (ino - 1) % inodes_per_group;
		let group = (ino - 1) / inodes_per_group;
		let inode_size = sb.inode_size() as u32;
		let byte_off = index_in_group * inode_size;
		let block_size = sb.block_size();
		let block = groups[group as usize].bg_inode_table + byte_off / block_size;
		(block, byte_off % block_size)
	}

	/// Reads the on-disk inode numbered `ino`.
	pub fn read_inode(&self, ino: u32) -> EResult<inode::DiskInode> {
		let st = self.state.lock();
		let (block, off) = self.inode_location(&st.sb, &st.groups, ino);
		drop(st);
		let buf = self.read_block(block)?;
		let size = core::mem::size_of::<inode::DiskInode>();
		let slice = buf.get(off as usize..off as usize + size).ok_or(errno!(EIO))?;
		Ok(*bytemuck::from_bytes::<inode::DiskInode>(slice))
	}

	/// Writes `disk_inode` back to the slot numbered `ino`.
	pub fn write_inode(&self, ino: u32, disk_inode: &inode::DiskInode) -> EResult<()> {
		let st = self.state.lock();
		let (block, off) = self.inode_location(&st.sb, &st.groups, ino);
		drop(st);
		let mut buf = self.read_block(block)?;
		let size = core::mem::size_of::<inode::DiskInode>();
		buf[off as usize..off as usize + size].copy_from_slice(bytemuck::bytes_of(disk_inode));
		self.write_block(block, &buf)
	}

	fn write_superblock(&self, sb: &Superblock) -> EResult<()> {
		let bytes = bytemuck::bytes_of(sb);
		let block_size = sb.block_size();
		if block_size == 1024 {
			self.write_block(1, bytes)
		} else {
			// The superblock occupies the first 1024 bytes of block 0; read-modify-write to
			// avoid clobbering whatever precedes it (a boot sector, on real media).
			let mut buf = self.read_block(0)?;
			buf[..bytes.len()].copy_from_slice(bytes);
			self.write_block(0, &buf)
		}
	}

	fn write_group_descriptors(&self, sb: &Superblock, groups: &[GroupDescriptor]) -> EResult<()> {
		write_group_descriptors_impl(self, sb, groups)
	}

	/// Returns the number of free blocks remaining on the filesystem.
	pub fn free_blocks(&self) -> u32 {
		self.state.lock().sb.s_free_blocks_count
	}

	/// Returns the number of free inodes remaining on the filesystem.
	pub fn free_inodes(&self) -> u32 {
		self.state.lock().sb.s_free_inodes_count
	}
}

fn read_superblock(dev: &dyn BlockDevice) -> EResult<Superblock> {
	let block_size = dev.block_size();
	let mut raw = vec![0u8; block_size.max(1024) as usize];
	if block_size == 1024 {
		dev.read_block(1, &mut raw)?;
	} else {
		dev.read_block(0, &mut raw)?;
	}
	let size = core::mem::size_of::<Superblock>();
	Ok(*bytemuck::from_bytes::<Superblock>(&raw[..size]))
}

fn read_group_descriptors(dev: &dyn BlockDevice, sb: &Superblock) -> EResult<Vec<GroupDescriptor>> {
	let group_count = sb.group_count() as usize;
	let gd_size = core::mem::size_of::<GroupDescriptor>();
	let block_size = sb.block_size() as usize;
	let per_block = block_size / gd_size;
	let mut groups = Vec::with_capacity(group_count);
	let mut block = gdt_start_block(sb);
	let mut remaining = group_count;
	while remaining > 0 {
		let mut buf = vec![0u8; block_size];
		dev.read_block(block, &mut buf)?;
		let n = remaining.min(per_block);
		for i in 0..n {
			let off = i * gd_size;
			groups.push(*bytemuck::from_bytes::<GroupDescriptor>(&buf[off..off + gd_size]));
		}
		remaining -= n;
		block += 1;
	}
	Ok(groups)
}

fn write_group_descriptors_impl(fs: &Ext2Fs, sb: &Superblock, groups: &[GroupDescriptor]) -> EResult<()> {
	let gd_size = core::mem::size_of::<GroupDescriptor>();
	let block_size = sb.block_size() as usize;
	let per_block = block_size / gd_size;
	let mut block = gdt_start_block(sb);
	for chunk in groups.chunks(per_block) {
		let mut buf = vec![0u8; block_size];
		for (i, gd) in chunk.iter().enumerate() {
			let off = i * gd_size;
			buf[off..off + gd_size].copy_from_slice(bytemuck::bytes_of(gd));
		}
		fs.write_block(block, &buf)?;
		block += 1;
	}
	Ok(())
}

/// Returns the index of the first clear bit in `[start, start + limit)`,
/// scanned byte by byte, least significant bit first within each byte.
pub(crate) fn bitmap_scan(buf: &[u8], start: u32, limit: u32) -> Option<u32> {
	(start..limit).find(|&i| buf[(i / 8) as usize] & (1 << (i % 8)) == 0)
}

/// Sets bit `idx` in a bitmap buffer.
pub(crate) fn bitmap_set(buf: &mut [u8], idx: u32) {
	buf[(idx / 8) as usize] |= 1 << (idx % 8);
}

/// Clears bit `idx` in a bitmap buffer.
pub(crate) fn bitmap_clear(buf: &mut [u8], idx: u32) {
	buf[(idx / 8) as usize] &= !(1 << (idx % 8));
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use crate::file::block::RamDisk;

	/// Builds a tiny single-group ext2 image on a ramdisk, with the root
	/// directory already containing `.` and `..`, ready to mount.
	pub fn make_test_image() -> Arc<RamDisk> {
		const BLOCK_SIZE: u32 = 1024;
		const BLOCKS_PER_GROUP: u32 = 256;
		const INODES_PER_GROUP: u32 = 64;
		const BLOCK_COUNT: u32 = 64;

		let dev = RamDisk::new(BLOCK_SIZE, BLOCK_COUNT);

		let mut sb = Superblock::zeroed();
		sb.s_magic = EXT2_MAGIC;
		sb.s_log_block_size = 0;
		sb.s_blocks_count = BLOCK_COUNT;
		sb.s_blocks_per_group = BLOCKS_PER_GROUP;
		sb.s_inodes_per_group = INODES_PER_GROUP;
		sb.s_inodes_count = INODES_PER_GROUP;
		sb.s_first_data_block = 1;
		sb.s_rev_level = 1;
		sb.s_first_ino = EXT2_GOOD_OLD_FIRST_INO;
		sb.s_inode_size = core::mem::size_of::<inode::DiskInode>() as u16;

		// Fixed, simple layout: block 1 superblock (1024-byte blocks), block 2 group
		// descriptor table, block 3 block bitmap, block 4 inode bitmap, blocks 5..=12
		// inode table (64 inodes * 128 bytes / 1024 per block = 8 blocks), data from 13.
		let block_bitmap_blk = 3;
		let inode_bitmap_blk = 4;
		let inode_table_blk = 5;
		let inode_table_blocks = (INODES_PER_GROUP as usize * core::mem::size_of::<inode::DiskInode>())
			.div_ceil(BLOCK_SIZE as usize) as u32;
		let first_data_block = inode_table_blk + inode_table_blocks;

		let mut gd = GroupDescriptor::zeroed();
		gd.bg_block_bitmap = block_bitmap_blk;
		gd.bg_inode_bitmap = inode_bitmap_blk;
		gd.bg_inode_table = inode_table_blk;
		gd.bg_used_dirs_count = 1;

		// Mark metadata + root's one data block used in the block bitmap.
		let reserved_blocks = first_data_block - sb.s_first_data_block + 1;
		let mut block_bitmap = vec![0u8; BLOCK_SIZE as usize];
		for i in 0..reserved_blocks {
			bitmap_set(&mut block_bitmap, i);
		}
		sb.s_free_blocks_count = BLOCK_COUNT - reserved_blocks;
		gd.bg_free_blocks_count = sb.s_free_blocks_count as u16;
		dev.write_block(block_bitmap_blk, &block_bitmap).unwrap();

		// Mark reserved inodes plus the root inode (2) used.
		let mut inode_bitmap = vec![0u8; BLOCK_SIZE as usize];
		for i in 0..(sb.first_user_inode() - 1) {
			bitmap_set(&mut inode_bitmap, i);
		}
		sb.s_free_inodes_count = INODES_PER_GROUP - (sb.first_user_inode() - 1);
		gd.bg_free_inodes_count = sb.s_free_inodes_count as u16;
		dev.write_block(inode_bitmap_blk, &inode_bitmap).unwrap();

		// Root inode.
		let root_data_block = first_data_block;
		let mut root_inode = inode::DiskInode::zeroed();
		root_inode.i_mode = inode::S_IFDIR | 0o755;
		root_inode.i_links_count = 2;
		root_inode.i_block[0] = root_data_block;
		root_inode.i_blocks = BLOCK_SIZE / 512;

		let mut root_block = vec![0u8; BLOCK_SIZE as usize];
		let dot_len = dirent::rec_len_for(1);
		dirent::Dirent::write(&mut root_block[0..dot_len as usize], ROOT_INODE, dot_len, Some(crate::file::FileType::Directory), b".").unwrap();
		let remaining = BLOCK_SIZE as u16 - dot_len;
		dirent::Dirent::write(
			&mut root_block[dot_len as usize..],
			ROOT_INODE,
			remaining,
			Some(crate::file::FileType::Directory),
			b"..",
		)
		.unwrap();
		root_inode.i_size = BLOCK_SIZE;
		dev.write_block(root_data_block, &root_block).unwrap();

		// Write superblock, group descriptor table, and root inode in their final
		// positions.
		dev.write_block(1, bytemuck::bytes_of(&sb)).unwrap();
		let mut gdt_block = vec![0u8; BLOCK_SIZE as usize];
		gdt_block[..core::mem::size_of::<GroupDescriptor>()].copy_from_slice(bytemuck::bytes_of(&gd));
		dev.write_block(2, &gdt_block).unwrap();

		let fs_scratch = Ext2Fs::mount(dev.clone()).unwrap();
		fs_scratch.write_inode(ROOT_INODE, &root_inode).unwrap();

		dev
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::file::fs::ext2::test_support::make_test_image;

	#[test]
	fn mount_reads_back_the_superblock() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		assert_eq!(fs.block_size(), 1024);
	}

	#[test]
	fn mount_rejects_bad_magic() {
		let dev = crate::file::block::RamDisk::new(1024, 16);
		assert!(Ext2Fs::mount(dev).is_err());
	}

	#[test]
	fn block_alloc_then_free_is_reusable() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let a = fs.alloc_block().unwrap();
		let b = fs.alloc_block().unwrap();
		assert_ne!(a, b);
		fs.free_block(a).unwrap();
		let c = fs.alloc_block().unwrap();
		assert_eq!(a, c);
	}

	#[test]
	fn inode_alloc_skips_reserved_inodes() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let ino = fs.alloc_inode().unwrap();
		assert!(ino >= fs.state.lock().sb.first_user_inode());
	}

	#[test]
	fn inode_round_trips_through_read_write() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let mut di = fs.read_inode(ROOT_INODE).unwrap();
		assert_eq!(di.i_links_count, 2);
		di.i_size = 4096;
		fs.write_inode(ROOT_INODE, &di).unwrap();
		let reread = fs.read_inode(ROOT_INODE).unwrap();
		assert_eq!(reread.i_size, 4096);
	}
}
