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

//! Name-level directory operations: lookup, create, unlink and rename,
//! built on top of the [`dirent`](super::dirent) record scanner and the
//! [`blockmap`](super::blockmap) block walker.

use super::{
	Ext2Fs,
	blockmap::{self, Action},
	dirent,
	inode::{self, DiskInode},
};
use crate::file::FileType;
use alloc::vec;
use bytemuck::Zeroable;
use utils::{errno, errno::EResult};

fn mode_bits(file_type: FileType) -> u16 {
	match file_type {
		FileType::Regular => inode::S_IFREG,
		FileType::Directory => inode::S_IFDIR,
		FileType::CharDevice => inode::S_IFCHR,
	}
}

fn disk_file_type(mode: u16) -> FileType {
	if inode::is_dir(mode) {
		FileType::Directory
	} else if inode::is_chr(mode) {
		FileType::CharDevice
	} else {
		FileType::Regular
	}
}

/// Resolves `name` within the directory numbered `parent_ino` to an inode
/// number.
pub fn lookup(fs: &Ext2Fs, parent_ino: u32, name: &[u8]) -> EResult<u32> {
	let parent = fs.read_inode(parent_ino)?;
	if !inode::is_dir(parent.i_mode) {
		return Err(errno!(ENOTDIR));
	}
	dirent::find_ino(fs, &parent, name).and_then(|r| r.ok_or(errno!(ENOENT)))
}

/// Creates a new inode of kind `file_type` named `name` inside the
/// directory numbered `parent_ino`, with permission bits `perm`.
///
/// Creating a directory populates its first data block with `.` and `..`
/// and bumps the parent's link count for the child's `..`.
pub fn mknod(fs: &Ext2Fs, parent_ino: u32, name: &[u8], file_type: FileType, perm: u16) -> EResult<u32> {
	let mut parent = fs.read_inode(parent_ino)?;
	if !inode::is_dir(parent.i_mode) {
		return Err(errno!(ENOTDIR));
	}
	if dirent::find_ino(fs, &parent, name)?.is_some() {
		return Err(errno!(EEXIST));
	}

	let ino = fs.alloc_inode()?;
	let mut new_inode = DiskInode::zeroed();
	new_inode.i_mode = mode_bits(file_type) | (perm & 0o7777);
	new_inode.i_links_count = if file_type == FileType::Directory { 2 } else { 1 };

	if file_type == FileType::Directory {
		let block_size = fs.block_size();
		let block = blockmap::resolve_or_alloc(fs, &mut new_inode, 0)?;
		let mut buf = vec![0u8; block_size as usize];
		let dot_len = dirent::rec_len_for(1);
		dirent::Dirent::write(&mut buf[0..dot_len as usize], ino, dot_len, Some(FileType::Directory), b".")?;
		let rest_len = block_size as u16 - dot_len;
		dirent::Dirent::write(&mut buf[dot_len as usize..], parent_ino, rest_len, Some(FileType::Directory), b"..")?;
		fs.write_block(block, &buf)?;
		new_inode.i_size = block_size;
		new_inode.set_block_count(1, block_size);
	}
	fs.write_inode(ino, &new_inode)?;

	dirent::add_entry(fs, &mut parent, ino, file_type, name)?;
	if file_type == FileType::Directory {
		parent.i_links_count += 1;
	}
	fs.write_inode(parent_ino, &parent)?;
	Ok(ino)
}

/// Creates a regular file. Equivalent to [`mknod`] with
/// [`FileType::Regular`].
pub fn create(fs: &Ext2Fs, parent_ino: u32, name: &[u8], perm: u16) -> EResult<u32> {
	mknod(fs, parent_ino, name, FileType::Regular, perm)
}

/// Returns whether `dir` holds any entry other than `.`/`..`.
fn has_children(fs: &Ext2Fs, dir: &DiskInode) -> EResult<bool> {
	let block_size = fs.block_size();
	let used = blockmap::slots_for_block_count(dir.i_size.div_ceil(block_size), block_size);
	let found = blockmap::for_each_block(fs, dir, used, |block| {
		let buf = fs.read_block(block)?;
		let mut off = 0;
		while off + dirent::NAME_OFF <= buf.len() {
			let rec_len = dirent::Dirent::rec_len(&buf[off..]);
			if rec_len == 0 {
				break;
			}
			if !dirent::Dirent::is_free(&buf[off..]) {
				let name = dirent::Dirent::name(&buf[off..]);
				if name != b"." && name != b".." {
					return Ok(Action::Stop(()));
				}
			}
			off += rec_len as usize;
		}
		Ok(Action::Continue)
	})?;
	Ok(found.is_some())
}

/// Removes the entry named `name` from the directory numbered `parent_ino`.
///
/// Refuses to remove a non-empty directory. When the target's link count
/// drops to zero, its blocks and inode number are reclaimed.
pub fn unlink(fs: &Ext2Fs, parent_ino: u32, name: &[u8]) -> EResult<()> {
	let mut parent = fs.read_inode(parent_ino)?;
	let ino = dirent::find_ino(fs, &parent, name)?.ok_or(errno!(ENOENT))?;
	let mut target = fs.read_inode(ino)?;
	let is_dir = inode::is_dir(target.i_mode);
	if is_dir && has_children(fs, &target)? {
		return Err(errno!(ENOTEMPTY));
	}

	if !dirent::delete_entry(fs, &parent, name)? {
		return Err(errno!(ENOENT));
	}
	if is_dir {
		parent.i_links_count = parent.i_links_count.saturating_sub(1);
	}
	fs.write_inode(parent_ino, &parent)?;

	target.i_links_count = target.i_links_count.saturating_sub(1);
	if target.i_links_count == 0 {
		blockmap::free_all_blocks(fs, &target)?;
		fs.free_inode(ino)?;
	} else {
		fs.write_inode(ino, &target)?;
	}
	Ok(())
}

/// Repoints the `..` entry of the directory numbered `dir_ino` at
/// `new_parent_ino`. `..` is always the second entry of a directory's first
/// block, written there by [`mknod`].
fn repoint_dotdot(fs: &Ext2Fs, dir_ino: u32, new_parent_ino: u32) -> EResult<()> {
	let dir = fs.read_inode(dir_ino)?;
	let block = dir.i_block[0];
	let mut buf = fs.read_block(block)?;
	let dot_len = dirent::Dirent::rec_len(&buf) as usize;
	dirent::Dirent::set_ino(&mut buf[dot_len..], new_parent_ino);
	fs.write_block(block, &buf)
}

/// Moves/renames `old_name` under `old_parent_ino` to `new_name` under
/// `new_parent_ino`. A rename onto itself (same parent, same name) is a
/// no-op; renaming onto an existing destination name fails with
/// [`EEXIST`](utils::errno::EEXIST) rather than silently replacing it.
pub fn rename(fs: &Ext2Fs, old_parent_ino: u32, old_name: &[u8], new_parent_ino: u32, new_name: &[u8]) -> EResult<()> {
	if old_parent_ino == new_parent_ino && old_name == new_name {
		return Ok(());
	}

	let mut old_parent = fs.read_inode(old_parent_ino)?;
	let ino = dirent::find_ino(fs, &old_parent, old_name)?.ok_or(errno!(ENOENT))?;
	let target = fs.read_inode(ino)?;
	let file_type = disk_file_type(target.i_mode);

	let dest_parent_check = fs.read_inode(new_parent_ino)?;
	if !inode::is_dir(dest_parent_check.i_mode) {
		return Err(errno!(ENOTDIR));
	}
	if dirent::find_ino(fs, &dest_parent_check, new_name)?.is_some() {
		return Err(errno!(EEXIST));
	}

	if old_parent_ino == new_parent_ino {
		dirent::add_entry(fs, &mut old_parent, ino, file_type, new_name)?;
		dirent::delete_entry(fs, &old_parent, old_name)?;
		fs.write_inode(old_parent_ino, &old_parent)?;
		return Ok(());
	}

	let mut new_parent = dest_parent_check;
	dirent::add_entry(fs, &mut new_parent, ino, file_type, new_name)?;
	dirent::delete_entry(fs, &old_parent, old_name)?;
	if file_type == FileType::Directory {
		repoint_dotdot(fs, ino, new_parent_ino)?;
		old_parent.i_links_count = old_parent.i_links_count.saturating_sub(1);
		new_parent.i_links_count += 1;
	}
	fs.write_inode(new_parent_ino, &new_parent)?;
	fs.write_inode(old_parent_ino, &old_parent)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::file::fs::ext2::{ROOT_INODE, test_support::make_test_image};

	#[test]
	fn create_then_lookup_round_trips() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let ino = create(&fs, ROOT_INODE, b"file.txt", 0o644).unwrap();
		assert_eq!(lookup(&fs, ROOT_INODE, b"file.txt").unwrap(), ino);
	}

	#[test]
	fn create_rejects_duplicate_names() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		create(&fs, ROOT_INODE, b"dup", 0o644).unwrap();
		assert_eq!(create(&fs, ROOT_INODE, b"dup", 0o644), Err(errno!(EEXIST)));
	}

	#[test]
	fn mkdir_links_parent_and_self() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let root_before = fs.read_inode(ROOT_INODE).unwrap().i_links_count;
		let dir_ino = mknod(&fs, ROOT_INODE, b"sub", FileType::Directory, 0o755).unwrap();
		let di = fs.read_inode(dir_ino).unwrap();
		assert_eq!(di.i_links_count, 2);
		assert_eq!(lookup(&fs, dir_ino, b"..").unwrap(), ROOT_INODE);
		let root_after = fs.read_inode(ROOT_INODE).unwrap().i_links_count;
		assert_eq!(root_after, root_before + 1);
	}

	#[test]
	fn unlink_reclaims_inode_and_blocks_once_links_reach_zero() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let free_blocks_before = fs.free_blocks();
		let free_inodes_before = fs.free_inodes();
		let ino = create(&fs, ROOT_INODE, b"gone.txt", 0o644).unwrap();
		let mut di = fs.read_inode(ino).unwrap();
		blockmap::resolve_or_alloc(&fs, &mut di, 0).unwrap();
		fs.write_inode(ino, &di).unwrap();

		unlink(&fs, ROOT_INODE, b"gone.txt").unwrap();
		assert_eq!(lookup(&fs, ROOT_INODE, b"gone.txt"), Err(errno!(ENOENT)));
		assert_eq!(fs.free_inodes(), free_inodes_before);
		assert_eq!(fs.free_blocks(), free_blocks_before);
	}

	#[test]
	fn unlink_refuses_non_empty_directory() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let dir_ino = mknod(&fs, ROOT_INODE, b"sub", FileType::Directory, 0o755).unwrap();
		create(&fs, dir_ino, b"child", 0o644).unwrap();
		assert_eq!(unlink(&fs, ROOT_INODE, b"sub"), Err(errno!(ENOTEMPTY)));
	}

	#[test]
	fn rename_same_directory_same_name_is_a_no_op() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let ino = create(&fs, ROOT_INODE, b"a", 0o644).unwrap();
		rename(&fs, ROOT_INODE, b"a", ROOT_INODE, b"a").unwrap();
		assert_eq!(lookup(&fs, ROOT_INODE, b"a").unwrap(), ino);
	}

	#[test]
	fn rename_removes_the_old_entry() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let ino = create(&fs, ROOT_INODE, b"old", 0o644).unwrap();
		rename(&fs, ROOT_INODE, b"old", ROOT_INODE, b"new").unwrap();
		assert_eq!(lookup(&fs, ROOT_INODE, b"old"), Err(errno!(ENOENT)));
		assert_eq!(lookup(&fs, ROOT_INODE, b"new").unwrap(), ino);
	}

	#[test]
	fn rename_across_directories_updates_dotdot() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		let dir_a = mknod(&fs, ROOT_INODE, b"a", FileType::Directory, 0o755).unwrap();
		let dir_b = mknod(&fs, ROOT_INODE, b"b", FileType::Directory, 0o755).unwrap();
		let moved = mknod(&fs, dir_a, b"moved", FileType::Directory, 0o755).unwrap();

		rename(&fs, dir_a, b"moved", dir_b, b"moved").unwrap();
		assert_eq!(lookup(&fs, dir_a, b"moved"), Err(errno!(ENOENT)));
		assert_eq!(lookup(&fs, dir_b, b"moved").unwrap(), moved);
		assert_eq!(lookup(&fs, moved, b"..").unwrap(), dir_b);
	}

	#[test]
	fn rename_onto_an_existing_name_fails() {
		let dev = make_test_image();
		let fs = Ext2Fs::mount(dev).unwrap();
		create(&fs, ROOT_INODE, b"a", 0o644).unwrap();
		create(&fs, ROOT_INODE, b"b", 0o644).unwrap();
		assert_eq!(rename(&fs, ROOT_INODE, b"a", ROOT_INODE, b"b"), Err(errno!(EEXIST)));
	}
}
