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

//! Directory entry records, and the visitors that scan, insert into and
//! remove them from a directory's data blocks.
//!
//! A record is `inode(u32) rec_len(u16) name_len(u8) file_type(u8) name(..)`,
//! 4-byte aligned, packed back to back to fill a block; a record with
//! `inode == 0` is a tombstone, free space `add_entry` may reuse.

use super::{
	Ext2Fs,
	blockmap::{self, Action},
	inode::DiskInode,
};
use crate::file::FileType;
use alloc::vec;
use utils::{errno, errno::EResult};

/// Byte offset of the name field within a record.
pub const NAME_OFF: usize = 8;
/// Alignment every record's length is rounded up to.
pub const ALIGN: usize = 4;

/// Returns the minimum `rec_len` a record holding a name of `name_len` bytes
/// needs, rounded up to [`ALIGN`].
pub fn rec_len_for(name_len: usize) -> u16 {
	(NAME_OFF + name_len).next_multiple_of(ALIGN) as u16
}

fn file_type_byte(t: FileType) -> u8 {
	match t {
		FileType::Regular => 1,
		FileType::Directory => 2,
		FileType::CharDevice => 3,
	}
}

fn byte_file_type(b: u8) -> Option<FileType> {
	match b {
		1 => Some(FileType::Regular),
		2 => Some(FileType::Directory),
		3 => Some(FileType::CharDevice),
		_ => None,
	}
}

/// A directory entry record, viewed in place within a block buffer.
pub struct Dirent;

impl Dirent {
	/// Writes a record at the start of `buf`, occupying exactly `rec_len`
	/// bytes (`buf` must be at least that long).
	pub fn write(buf: &mut [u8], ino: u32, rec_len: u16, file_type: Option<FileType>, name: &[u8]) -> EResult<()> {
		if buf.len() < rec_len as usize || (rec_len as usize) < rec_len_for(name.len()) as usize {
			return Err(errno!(EINVAL));
		}
		buf[0..4].copy_from_slice(&ino.to_le_bytes());
		buf[4..6].copy_from_slice(&rec_len.to_le_bytes());
		buf[6] = name.len() as u8;
		buf[7] = file_type.map(file_type_byte).unwrap_or(0);
		buf[NAME_OFF..NAME_OFF + name.len()].copy_from_slice(name);
		Ok(())
	}

	/// Marks the record at the start of `buf` as free, keeping its `rec_len`
	/// so later insertions can reuse the slot.
	pub fn clear(buf: &mut [u8]) {
		buf[0..4].copy_from_slice(&0u32.to_le_bytes());
	}

	/// Returns the inode number of the record at the start of `buf`.
	pub fn ino(buf: &[u8]) -> u32 {
		u32::from_le_bytes(buf[0..4].try_into().unwrap())
	}

	/// Returns the total byte span of the record at the start of `buf`.
	pub fn rec_len(buf: &[u8]) -> u16 {
		u16::from_le_bytes(buf[4..6].try_into().unwrap())
	}

	/// Returns the byte length of the record's name field.
	pub fn name_len(buf: &[u8]) -> u8 {
		buf[6]
	}

	/// Returns the record's file type, or `None` if it doesn't map to a
	/// known [`FileType`] (as is the case for a tombstone).
	pub fn file_type(buf: &[u8]) -> Option<FileType> {
		byte_file_type(buf[7])
	}

	/// Returns the record's name.
	pub fn name(buf: &[u8]) -> &[u8] {
		&buf[NAME_OFF..NAME_OFF + Self::name_len(buf) as usize]
	}

	/// Returns whether the record at the start of `buf` is a tombstone.
	pub fn is_free(buf: &[u8]) -> bool {
		Self::ino(buf) == 0
	}

	fn set_rec_len(buf: &mut [u8], rec_len: u16) {
		buf[4..6].copy_from_slice(&rec_len.to_le_bytes());
	}

	/// Overwrites the inode number of the record at the start of `buf`,
	/// leaving its name and `rec_len` untouched. Used to repoint a moved
	/// directory's `..` entry at its new parent.
	pub fn set_ino(buf: &mut [u8], ino: u32) {
		buf[0..4].copy_from_slice(&ino.to_le_bytes());
	}
}

fn slots_used(dir: &DiskInode, block_size: u32) -> usize {
	let block_count = dir.i_size.div_ceil(block_size);
	blockmap::slots_for_block_count(block_count, block_size)
}

/// Looks up `name` among `dir`'s entries, returning its inode number.
pub fn find_ino(fs: &Ext2Fs, dir: &DiskInode, name: &[u8]) -> EResult<Option<u32>> {
	let block_size = fs.block_size() as usize;
	blockmap::for_each_block(fs, dir, slots_used(dir, block_size as u32), |block| {
		let buf = fs.read_block(block)?;
		let mut off = 0;
		while off + NAME_OFF <= buf.len() {
			let rec = &buf[off..];
			let rec_len = Dirent::rec_len(rec);
			if rec_len == 0 {
				break;
			}
			if !Dirent::is_free(rec) && Dirent::name(rec) == name {
				return Ok(Action::Stop(Dirent::ino(rec)));
			}
			off += rec_len as usize;
		}
		Ok(Action::Continue)
	})
}

/// Attempts to place a new record in the free space of an existing record at
/// `buf[off..]`; returns `true` if it did.
fn try_place(buf: &mut [u8], off: usize, needed: u16, ino: u32, file_type: FileType, name: &[u8]) -> bool {
	let rec_len = Dirent::rec_len(&buf[off..]);
	let occupied_min = if Dirent::is_free(&buf[off..]) {
		0
	} else {
		rec_len_for(Dirent::name_len(&buf[off..]) as usize)
	};
	let free_space = rec_len - occupied_min;
	if free_space < needed {
		return false;
	}
	if occupied_min == 0 {
		// The whole record is free: reuse it entirely, unless enough is left
		// over after carving out exactly what's needed to leave a usable
		// tombstone behind.
		if free_space - needed >= rec_len_for(0) {
			Dirent::set_rec_len(&mut buf[off..], needed);
			Dirent::write(&mut buf[off..off + needed as usize], ino, needed, Some(file_type), name).unwrap();
			let rest_off = off + needed as usize;
			let rest_len = free_space - needed;
			Dirent::write(&mut buf[rest_off..], 0, rest_len, None, b"").unwrap();
		} else {
			Dirent::write(&mut buf[off..off + rec_len as usize], ino, rec_len, Some(file_type), name).unwrap();
		}
	} else {
		// Carve the trailing free space of an occupied record, splitting off
		// exactly what's needed and leaving any further remainder as a
		// standalone tombstone instead of handing the new entry the whole
		// leftover span.
		Dirent::set_rec_len(&mut buf[off..], occupied_min);
		let rest_off = off + occupied_min as usize;
		let rest_len = rec_len - occupied_min;
		if rest_len - needed >= rec_len_for(0) {
			Dirent::write(&mut buf[rest_off..rest_off + needed as usize], ino, needed, Some(file_type), name).unwrap();
			let tomb_off = rest_off + needed as usize;
			Dirent::write(&mut buf[tomb_off..], 0, rest_len - needed, None, b"").unwrap();
		} else {
			Dirent::write(&mut buf[rest_off..], ino, rest_len, Some(file_type), name).unwrap();
		}
	}
	true
}

/// Inserts a new entry named `name`, pointing at `ino`, into `dir`'s
/// listing, reusing free space in an existing block if any is large enough,
/// allocating a new block otherwise. Updates `dir`'s size in place.
pub fn add_entry(fs: &Ext2Fs, dir: &mut DiskInode, ino: u32, file_type: FileType, name: &[u8]) -> EResult<()> {
	let block_size = fs.block_size();
	let needed = rec_len_for(name.len());
	if needed as u32 > block_size {
		return Err(errno!(ENAMETOOLONG));
	}
	let used = slots_used(dir, block_size);
	let placed = blockmap::for_each_block(fs, dir, used, |block| {
		let mut buf = fs.read_block(block)?;
		let mut off = 0;
		while off + NAME_OFF <= buf.len() {
			let rec_len = Dirent::rec_len(&buf[off..]);
			if rec_len == 0 {
				break;
			}
			if try_place(&mut buf, off, needed, ino, file_type, name) {
				fs.write_block(block, &buf)?;
				return Ok(Action::Stop(()));
			}
			off += rec_len as usize;
		}
		Ok(Action::Continue)
	})?;
	if placed.is_some() {
		return Ok(());
	}
	// No existing block had room: append a fresh one, holding just this entry.
	let block_count = dir.i_size.div_ceil(block_size);
	let new_block = blockmap::resolve_or_alloc(fs, dir, block_count)?;
	let mut buf = vec![0u8; block_size as usize];
	Dirent::write(&mut buf, ino, block_size as u16, Some(file_type), name)?;
	fs.write_block(new_block, &buf)?;
	dir.i_size += block_size;
	dir.set_block_count(dir.block_count(block_size) + block_size / 512, block_size);
	Ok(())
}

/// Removes the entry named `name` from `dir`'s listing, merging its space
/// into the preceding record if any, or leaving it a standalone tombstone
/// otherwise. Returns whether an entry was found and removed.
pub fn delete_entry(fs: &Ext2Fs, dir: &DiskInode, name: &[u8]) -> EResult<bool> {
	let block_size = fs.block_size();
	let used = slots_used(dir, block_size);
	let found = blockmap::for_each_block(fs, dir, used, |block| {
		let mut buf = fs.read_block(block)?;
		let mut off = 0;
		let mut prev: Option<usize> = None;
		while off + NAME_OFF <= buf.len() {
			let rec_len = Dirent::rec_len(&buf[off..]);
			if rec_len == 0 {
				break;
			}
			if !Dirent::is_free(&buf[off..]) && Dirent::name(&buf[off..]) == name {
				if let Some(prev_off) = prev {
					let prev_len = Dirent::rec_len(&buf[prev_off..]);
					Dirent::set_rec_len(&mut buf[prev_off..], prev_len + rec_len);
				} else {
					Dirent::clear(&mut buf[off..]);
				}
				fs.write_block(block, &buf)?;
				return Ok(Action::Stop(()));
			}
			prev = Some(off);
			off += rec_len as usize;
		}
		Ok(Action::Continue)
	})?;
	Ok(found.is_some())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::file::fs::ext2::{Ext2Fs, ROOT_INODE, test_support::make_test_image};

	#[test]
	fn rec_len_for_rounds_up_to_alignment() {
		assert_eq!(rec_len_for(1), 12);
		assert_eq!(rec_len_for(4), 12);
		assert_eq!(rec_len_for(5), 16);
	}

	#[test]
	fn add_then_find_round_trips() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let mut dir = fs.read_inode(ROOT_INODE).unwrap();
		add_entry(&fs, &mut dir, 42, FileType::Regular, b"hello.txt").unwrap();
		fs.write_inode(ROOT_INODE, &dir).unwrap();

		let dir = fs.read_inode(ROOT_INODE).unwrap();
		assert_eq!(find_ino(&fs, &dir, b"hello.txt").unwrap(), Some(42));
		assert_eq!(find_ino(&fs, &dir, b"missing").unwrap(), None);
	}

	#[test]
	fn add_entry_splits_a_record_with_enough_trailing_space() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let mut dir = fs.read_inode(ROOT_INODE).unwrap();
		// The root block's ".." record spans to the end of the block; adding a
		// small entry must carve it rather than allocate a new block.
		let before_size = dir.i_size;
		add_entry(&fs, &mut dir, 50, FileType::Regular, b"a").unwrap();
		assert_eq!(dir.i_size, before_size);
		fs.write_inode(ROOT_INODE, &dir).unwrap();

		let dir = fs.read_inode(ROOT_INODE).unwrap();
		assert_eq!(find_ino(&fs, &dir, b"a").unwrap(), Some(50));
		assert_eq!(find_ino(&fs, &dir, b"..").unwrap(), Some(ROOT_INODE));
	}

	#[test]
	fn delete_entry_coalesces_into_the_preceding_record() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let mut dir = fs.read_inode(ROOT_INODE).unwrap();
		add_entry(&fs, &mut dir, 50, FileType::Regular, b"a").unwrap();
		fs.write_inode(ROOT_INODE, &dir).unwrap();

		let dir = fs.read_inode(ROOT_INODE).unwrap();
		assert!(delete_entry(&fs, &dir, b"a").unwrap());
		assert_eq!(find_ino(&fs, &dir, b"a").unwrap(), None);
		// ".." absorbed the freed space; re-adding a same-size name must fit.
		assert_eq!(find_ino(&fs, &dir, b"..").unwrap(), Some(ROOT_INODE));
	}

	#[test]
	fn delete_entry_reports_when_name_is_absent() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let dir = fs.read_inode(ROOT_INODE).unwrap();
		assert!(!delete_entry(&fs, &dir, b"nope").unwrap());
	}
}
