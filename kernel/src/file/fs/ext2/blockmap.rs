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

//! Resolution of a file-relative logical block index to a physical block
//! number through the inode's direct/indirect pointer tree, and the generic
//! recursive traversal the directory engine drives its visitors through.
//!
//! The source material encodes "stop the scan" as a first non-negative
//! return value from the visitor; that sentinel convention is replaced here
//! with [`Action`], a tri-state the visitor returns explicitly.

use super::{
	Ext2Fs,
	inode::{BLOCK_TABLE_LEN, DiskInode, IND_DOUBLE, IND_SINGLE, IND_TRIPLE},
};
use alloc::vec;
use utils::{errno, errno::EResult};

/// What a block visitor wants the traversal to do next.
pub enum Action<T> {
	/// Keep visiting the remaining blocks.
	Continue,
	/// Stop the scan, yielding this value to the caller.
	Stop(T),
}

/// Returns the number of block-number entries an indirect block holds.
fn entries_per_block(block_size: u32) -> u32 {
	block_size / 4
}

/// Returns the indirection level (1/2/3) of a block-table slot known to be
/// one of the three indirect slots.
fn indirect_level(slot: usize) -> u32 {
	if slot == IND_SINGLE {
		1
	} else if slot == IND_DOUBLE {
		2
	} else {
		debug_assert_eq!(slot, IND_TRIPLE);
		3
	}
}

/// Returns one past the highest inode block-table slot needed to address
/// `block_count` logical blocks (0 if `block_count` is 0).
///
/// Slots 0..12 are direct pointers, one per block; slots 12/13/14 are
/// single/double/triple indirect roots, each covering many blocks through
/// one table entry, so the count does not grow linearly past slot 11.
pub fn slots_for_block_count(block_count: u32, block_size: u32) -> usize {
	if block_count == 0 {
		return 0;
	}
	match locate(block_count - 1, block_size) {
		Some((slot, _)) => slot + 1,
		None => BLOCK_TABLE_LEN,
	}
}

/// Splits a file-relative logical block index into the slot of the inode's
/// block table that roots its lookup, and the indirection level of that
/// slot (0 for a direct pointer, 1/2/3 for single/double/triple indirect).
///
/// Returns `None` if `index` is too large to be addressed by a triple
/// indirect block at this block size.
pub fn locate(index: u32, block_size: u32) -> Option<(usize, u32)> {
	let p = entries_per_block(block_size);
	if (index as usize) < super::inode::DIRECT_BLOCKS_COUNT {
		return Some((index as usize, 0));
	}
	let index = index - super::inode::DIRECT_BLOCKS_COUNT as u32;
	if index < p {
		return Some((IND_SINGLE, index));
	}
	let index = index - p;
	if index < p * p {
		return Some((IND_DOUBLE, index));
	}
	let index = index - p * p;
	if index < p * p * p {
		return Some((IND_TRIPLE, index));
	}
	None
}

/// Reads the resolved physical block number for logical block `index` of
/// `inode`, without allocating anything. Returns `Ok(None)` for a hole
/// (an unallocated pointer anywhere along the path).
pub fn resolve(fs: &Ext2Fs, inode: &DiskInode, index: u32) -> EResult<Option<u32>> {
	let block_size = fs.block_size();
	let Some((slot, rel)) = locate(index, block_size) else {
		return Ok(None);
	};
	if slot < super::inode::DIRECT_BLOCKS_COUNT {
		return Ok(non_zero(inode.i_block[slot]));
	}
	let level = indirect_level(slot);
	let root = inode.i_block[slot];
	if root == 0 {
		return Ok(None);
	}
	descend(fs, root, level, rel)
}

fn non_zero(b: u32) -> Option<u32> {
	(b != 0).then_some(b)
}

fn descend(fs: &Ext2Fs, block: u32, level: u32, rel: u32) -> EResult<Option<u32>> {
	if level == 0 {
		return Ok(non_zero(block));
	}
	let entries_buf = fs.read_block(block)?;
	let p = entries_per_block(fs.block_size());
	let span = p.pow(level - 1);
	let idx = (rel / span) as usize;
	let next = u32::from_le_bytes(entries_buf[idx * 4..idx * 4 + 4].try_into().unwrap());
	if next == 0 {
		return Ok(None);
	}
	descend(fs, next, level - 1, rel % span)
}

/// Resolves logical block `index` of `inode` to a physical block number,
/// allocating any pointer (indirect blocks included) that does not yet
/// exist along the path. Updates `inode`'s block-pointer table in place;
/// the caller is responsible for persisting the inode and updating its
/// size/block-count bookkeeping.
pub fn resolve_or_alloc(fs: &Ext2Fs, inode: &mut DiskInode, index: u32) -> EResult<u32> {
	let block_size = fs.block_size();
	let Some((slot, rel)) = locate(index, block_size) else {
		return Err(errno!(EINVAL));
	};
	if slot < super::inode::DIRECT_BLOCKS_COUNT {
		if inode.i_block[slot] == 0 {
			inode.i_block[slot] = fs.alloc_block()?;
		}
		return Ok(inode.i_block[slot]);
	}
	let level = indirect_level(slot);
	if inode.i_block[slot] == 0 {
		inode.i_block[slot] = fs.alloc_block()?;
		fs.write_block(inode.i_block[slot], &vec![0u8; block_size as usize])?;
	}
	descend_or_alloc(fs, inode.i_block[slot], level, rel)
}

fn descend_or_alloc(fs: &Ext2Fs, block: u32, level: u32, rel: u32) -> EResult<u32> {
	if level == 0 {
		return Ok(block);
	}
	let mut buf = fs.read_block(block)?;
	let block_size = fs.block_size();
	let p = entries_per_block(block_size);
	let span = p.pow(level - 1);
	let idx = (rel / span) as usize;
	let mut next = u32::from_le_bytes(buf[idx * 4..idx * 4 + 4].try_into().unwrap());
	if next == 0 {
		next = fs.alloc_block()?;
		if level > 1 {
			fs.write_block(next, &vec![0u8; block_size as usize])?;
		}
		buf[idx * 4..idx * 4 + 4].copy_from_slice(&next.to_le_bytes());
		fs.write_block(block, &buf)?;
	}
	descend_or_alloc(fs, next, level - 1, rel % span)
}

/// Runs `visitor` over every data block referenced by `inode`'s first
/// `block_count` table slots, dispatching to the right indirection level
/// for each slot, stopping early if the visitor returns [`Action::Stop`].
///
/// `block_count` is the number of occupied entries in the inode's block
/// table (equivalently, one past the highest populated slot), not the
/// `i_blocks` sector count.
pub fn for_each_block<T>(
	fs: &Ext2Fs,
	inode: &DiskInode,
	slots_used: usize,
	mut visitor: impl FnMut(u32) -> EResult<Action<T>>,
) -> EResult<Option<T>> {
	for i in 0..slots_used.min(BLOCK_TABLE_LEN) {
		let block = inode.i_block[i];
		if block == 0 {
			continue;
		}
		let level = if i < super::inode::DIRECT_BLOCKS_COUNT { 0 } else { indirect_level(i) };
		if let Some(v) = visit_recursive(fs, block, level, &mut visitor)? {
			return Ok(Some(v));
		}
	}
	Ok(None)
}

fn visit_recursive<T>(
	fs: &Ext2Fs,
	block: u32,
	level: u32,
	visitor: &mut impl FnMut(u32) -> EResult<Action<T>>,
) -> EResult<Option<T>> {
	if level == 0 {
		return match visitor(block)? {
			Action::Continue => Ok(None),
			Action::Stop(v) => Ok(Some(v)),
		};
	}
	let buf = fs.read_block(block)?;
	let n = entries_per_block(fs.block_size()) as usize;
	for chunk in buf.chunks_exact(4).take(n) {
		let child = u32::from_le_bytes(chunk.try_into().unwrap());
		if child == 0 {
			continue;
		}
		if let Some(v) = visit_recursive(fs, child, level - 1, visitor)? {
			return Ok(Some(v));
		}
	}
	Ok(None)
}

/// Frees every block `inode` references, direct data blocks and indirect
/// blocks alike, via [`Ext2Fs::free_block`]. Used when a file's link count
/// reaches zero.
pub fn free_all_blocks(fs: &Ext2Fs, inode: &DiskInode) -> EResult<()> {
	for i in 0..BLOCK_TABLE_LEN {
		let block = inode.i_block[i];
		if block == 0 {
			continue;
		}
		let level = if i < super::inode::DIRECT_BLOCKS_COUNT { 0 } else { indirect_level(i) };
		free_recursive(fs, block, level)?;
	}
	Ok(())
}

fn free_recursive(fs: &Ext2Fs, block: u32, level: u32) -> EResult<()> {
	if level > 0 {
		let buf = fs.read_block(block)?;
		let n = entries_per_block(fs.block_size()) as usize;
		for chunk in buf.chunks_exact(4).take(n) {
			let child = u32::from_le_bytes(chunk.try_into().unwrap());
			if child != 0 {
				free_recursive(fs, child, level - 1)?;
			}
		}
	}
	fs.free_block(block)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::file::fs::ext2::test_support::make_test_image;
	use bytemuck::Zeroable;

	#[test]
	fn locate_places_indices_in_expected_ranges() {
		assert_eq!(locate(0, 1024), Some((0, 0)));
		assert_eq!(locate(11, 1024), Some((11, 0)));
		let p = 1024 / 4;
		assert_eq!(locate(12, 1024), Some((IND_SINGLE, 0)));
		assert_eq!(locate(12 + p - 1, 1024), Some((IND_SINGLE, p - 1)));
		assert_eq!(locate(12 + p, 1024), Some((IND_DOUBLE, 0)));
	}

	#[test]
	fn slots_for_block_count_tracks_indirection_boundaries() {
		assert_eq!(slots_for_block_count(0, 1024), 0);
		assert_eq!(slots_for_block_count(1, 1024), 1);
		assert_eq!(slots_for_block_count(12, 1024), IND_SINGLE + 1);
		let p = 1024 / 4;
		assert_eq!(slots_for_block_count(12 + p, 1024), IND_DOUBLE + 1);
	}

	#[test]
	fn resolve_or_alloc_populates_direct_and_indirect_slots() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let mut inode = DiskInode::zeroed();
		let p = fs.block_size() / 4;

		let b0 = resolve_or_alloc(&fs, &mut inode, 0).unwrap();
		assert_ne!(b0, 0);
		assert_eq!(inode.i_block[0], b0);

		let b11 = resolve_or_alloc(&fs, &mut inode, 11).unwrap();
		assert_ne!(b11, 0);

		let b12 = resolve_or_alloc(&fs, &mut inode, 12).unwrap();
		assert_ne!(inode.i_block[IND_SINGLE], 0);
		assert_eq!(resolve(&fs, &inode, 12).unwrap(), Some(b12));

		let b_double_first = resolve_or_alloc(&fs, &mut inode, 12 + p).unwrap();
		assert_ne!(inode.i_block[IND_DOUBLE], 0);
		assert_ne!(b_double_first, b12);
		assert_eq!(resolve(&fs, &inode, 12 + p).unwrap(), Some(b_double_first));

		assert_eq!(resolve(&fs, &inode, 13).unwrap(), None);
	}

	#[test]
	fn free_all_blocks_reclaims_direct_and_indirect_blocks() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let mut inode = DiskInode::zeroed();
		let p = fs.block_size() / 4;
		resolve_or_alloc(&fs, &mut inode, 0).unwrap();
		resolve_or_alloc(&fs, &mut inode, 12 + p).unwrap();
		let free_before = fs.free_blocks();
		free_all_blocks(&fs, &inode).unwrap();
		assert!(fs.free_blocks() > free_before);
	}
}
