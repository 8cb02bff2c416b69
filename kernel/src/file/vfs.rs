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

//! The virtual filesystem layer: a registry of filesystem types, a mount
//! table, and path resolution across mountpoints.
//!
//! A full VFS also owns the dentry/inode cache, open file descriptions and
//! permission checks; none of that lives here. [`Dentry`] is kept
//! deliberately thin, just enough to describe "this name, in this parent,
//! resolves to this inode of this mounted filesystem" and to let path
//! lookup cross from one mounted filesystem into another.

use crate::{
	file::{FileType, block::BlockDevice, fs::ext2},
	sync::mutex::Mutex,
};
use alloc::{
	string::{String, ToString},
	sync::Arc,
	vec::Vec,
};
use utils::{errno, errno::EResult};

/// Operations a mounted filesystem exposes to the VFS, independent of the
/// on-disk format backing it.
pub trait Filesystem: Send + Sync {
	/// Returns the inode number of the filesystem's root directory.
	fn root_ino(&self) -> u32;

	/// Resolves `name` inside the directory `parent`.
	fn lookup(&self, parent: u32, name: &[u8]) -> EResult<u32>;

	/// Returns whether `ino` is a directory.
	fn is_dir(&self, ino: u32) -> EResult<bool>;

	/// Creates an entry named `name` inside `parent`.
	fn create(&self, parent: u32, name: &[u8], file_type: FileType, perm: u16) -> EResult<u32>;

	/// Removes the entry named `name` from `parent`.
	fn unlink(&self, parent: u32, name: &[u8]) -> EResult<()>;

	/// Moves/renames an entry, see [`ext2::namespace::rename`].
	fn rename(&self, old_parent: u32, old_name: &[u8], new_parent: u32, new_name: &[u8]) -> EResult<()>;
}

impl Filesystem for ext2::Ext2Fs {
	fn root_ino(&self) -> u32 {
		ext2::ROOT_INODE
	}

	fn lookup(&self, parent: u32, name: &[u8]) -> EResult<u32> {
		ext2::namespace::lookup(self, parent, name)
	}

	fn is_dir(&self, ino: u32) -> EResult<bool> {
		Ok(ext2::inode::is_dir(self.read_inode(ino)?.i_mode))
	}

	fn create(&self, parent: u32, name: &[u8], file_type: FileType, perm: u16) -> EResult<u32> {
		ext2::namespace::mknod(self, parent, name, file_type, perm)
	}

	fn unlink(&self, parent: u32, name: &[u8]) -> EResult<()> {
		ext2::namespace::unlink(self, parent, name)
	}

	fn rename(&self, old_parent: u32, old_name: &[u8], new_parent: u32, new_name: &[u8]) -> EResult<()> {
		ext2::namespace::rename(self, old_parent, old_name, new_parent, new_name)
	}
}

/// A filesystem driver, registered by name, that knows how to mount a block
/// device.
pub trait FileSystemType: Send + Sync {
	/// The name filesystems of this type are mounted under, e.g. `"ext2"`.
	fn name(&self) -> &str;

	/// Mounts `dev`, producing the [`Filesystem`] handle the VFS drives
	/// lookups and namespace operations through.
	fn mount(&self, dev: Arc<dyn BlockDevice>) -> EResult<Arc<dyn Filesystem>>;
}

/// The [`FileSystemType`] for the ext2 driver.
pub struct Ext2Type;

impl FileSystemType for Ext2Type {
	fn name(&self) -> &str {
		"ext2"
	}

	fn mount(&self, dev: Arc<dyn BlockDevice>) -> EResult<Arc<dyn Filesystem>> {
		Ok(Arc::new(ext2::Ext2Fs::mount(dev)?))
	}
}

/// A directory entry binding a name, in a parent directory, to an inode on
/// a mounted filesystem.
pub struct Dentry {
	name: String,
	fs: Arc<dyn Filesystem>,
	ino: u32,
}

impl Dentry {
	fn root(fs: Arc<dyn Filesystem>) -> Arc<Self> {
		let ino = fs.root_ino();
		Arc::new(Self {
			name: String::new(),
			fs,
			ino,
		})
	}

	/// The inode number this dentry resolves to, on its own filesystem.
	pub fn ino(&self) -> u32 {
		self.ino
	}

	/// The filesystem this dentry belongs to.
	pub fn filesystem(&self) -> &Arc<dyn Filesystem> {
		&self.fs
	}
}

/// A filesystem mounted somewhere in the namespace.
///
/// `parent_fs`/`parent_ino` identify the mountpoint: the dentry in the
/// *mounting* filesystem that `root` is grafted onto. Keying off the
/// mount table (rather than a flag living on the mountpoint dentry itself)
/// is what lets a mount survive past the lifetime of whatever transient
/// [`Dentry`] happened to resolve to that inode at mount time; every
/// later lookup that lands on the same `(fs, ino)` pair consults this
/// table afresh.
struct Mount {
	parent_fs: Arc<dyn Filesystem>,
	parent_ino: u32,
	root: Arc<Dentry>,
}

struct VfsState {
	types: Vec<Arc<dyn FileSystemType>>,
	mounts: Vec<Mount>,
	root: Option<Arc<Dentry>>,
}

static STATE: Mutex<VfsState> = Mutex::new(VfsState {
	types: Vec::new(),
	mounts: Vec::new(),
	root: None,
});

/// Registers a filesystem type. Fails with
/// [`EBUSY`](utils::errno::EBUSY) if a type of the same name is already
/// registered.
pub fn register_filesystem(ty: Arc<dyn FileSystemType>) -> EResult<()> {
	let mut st = STATE.lock();
	if st.types.iter().any(|t| t.name() == ty.name()) {
		return Err(errno!(EBUSY));
	}
	st.types.push(ty);
	Ok(())
}

/// Unregisters the filesystem type named `name`. Fails with
/// [`EINVAL`](utils::errno::EINVAL) if no such type is registered.
pub fn unregister_filesystem(name: &str) -> EResult<()> {
	let mut st = STATE.lock();
	let before = st.types.len();
	st.types.retain(|t| t.name() != name);
	if st.types.len() == before {
		return Err(errno!(EINVAL));
	}
	Ok(())
}

/// Returns the registered type named `name`.
pub fn find_filesystem(name: &str) -> EResult<Arc<dyn FileSystemType>> {
	STATE
		.lock()
		.types
		.iter()
		.find(|t| t.name() == name)
		.cloned()
		.ok_or(errno!(EINVAL))
}

/// Mounts `dev` as the root filesystem. Unlike [`mount`], there is no
/// parent dentry to graft onto: the namespace's root is simply redirected
/// to the new filesystem's root.
pub fn init_rootfs(name: &str, dev: Arc<dyn BlockDevice>) -> EResult<()> {
	let ty = find_filesystem(name)?;
	let fs = ty.mount(dev)?;
	let root = Dentry::root(fs);
	STATE.lock().root = Some(root);
	Ok(())
}

/// Mounts `dev` as a `name`-type filesystem at `path`, grafting its root
/// onto the dentry found by resolving `path`.
pub fn mount(name: &str, dev: Arc<dyn BlockDevice>, path: &[u8]) -> EResult<()> {
	let ty = find_filesystem(name)?;
	let fs = ty.mount(dev)?;
	let target = lookup_path(path)?;
	if !target.fs.is_dir(target.ino)? {
		return Err(errno!(ENOTDIR));
	}
	let root = Dentry::root(fs);
	STATE.lock().mounts.push(Mount {
		parent_fs: target.fs.clone(),
		parent_ino: target.ino,
		root,
	});
	Ok(())
}

/// Splits `path` on `/`, dropping empty components (so leading, trailing
/// and repeated slashes are all tolerated).
fn split_path(path: &[u8]) -> Vec<&[u8]> {
	path.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect()
}

/// If `dentry` is a mountpoint, returns the root of whatever is mounted
/// there instead (repeating in case a filesystem is itself mounted at the
/// root of another mount). Otherwise returns `dentry` unchanged.
///
/// This consults the mount table by `(fs, ino)` identity on every call,
/// rather than relying on any state cached on `dentry` itself, since
/// dentries are recreated fresh on every [`lookup_path`] call.
fn cross_mounts(mut dentry: Arc<Dentry>) -> Arc<Dentry> {
	loop {
		let st = STATE.lock();
		let next = st
			.mounts
			.iter()
			.find(|m| Arc::ptr_eq(&m.parent_fs, &dentry.fs) && m.parent_ino == dentry.ino)
			.map(|m| m.root.clone());
		drop(st);
		match next {
			Some(root) => dentry = root,
			None => return dentry,
		}
	}
}

/// Resolves `path` against the current root, switching to a mounted
/// filesystem's root whenever traversal reaches a mountpoint.
pub fn lookup_path(path: &[u8]) -> EResult<Arc<Dentry>> {
	let root = STATE.lock().root.clone().ok_or(errno!(ENOENT))?;
	let mut current = cross_mounts(root);
	for component in split_path(path) {
		if component == b"." {
			continue;
		}
		let ino = current.fs.lookup(current.ino, component)?;
		current = Arc::new(Dentry {
			name: String::from_utf8_lossy(component).to_string(),
			fs: current.fs.clone(),
			ino,
		});
		current = cross_mounts(current);
	}
	Ok(current)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::file::block::RamDisk;

	fn make_ext2_disk() -> Arc<RamDisk> {
		ext2::test_support::make_test_image()
	}

	fn reset_state() {
		let mut st = STATE.lock();
		st.types.clear();
		st.mounts.clear();
		st.root = None;
	}

	#[test]
	fn register_rejects_duplicate_names() {
		reset_state();
		register_filesystem(Arc::new(Ext2Type)).unwrap();
		assert_eq!(register_filesystem(Arc::new(Ext2Type)), Err(errno!(EBUSY)));
		reset_state();
	}

	#[test]
	fn unregister_rejects_unknown_names() {
		reset_state();
		assert_eq!(unregister_filesystem("ext2"), Err(errno!(EINVAL)));
	}

	#[test]
	fn init_rootfs_then_lookup_resolves_a_path() {
		reset_state();
		register_filesystem(Arc::new(Ext2Type)).unwrap();
		init_rootfs("ext2", make_ext2_disk()).unwrap();
		let root = lookup_path(b"/").unwrap();
		assert_eq!(root.ino(), ext2::ROOT_INODE);
		let dotdot = lookup_path(b"/..").unwrap();
		assert_eq!(dotdot.ino(), ext2::ROOT_INODE);
		reset_state();
	}

	#[test]
	fn mount_grafts_a_second_filesystem_at_a_subdirectory() {
		reset_state();
		register_filesystem(Arc::new(Ext2Type)).unwrap();
		init_rootfs("ext2", make_ext2_disk()).unwrap();
		let root = lookup_path(b"/").unwrap();
		root.fs.create(root.ino(), b"mnt", FileType::Directory, 0o755).unwrap();

		mount("ext2", make_ext2_disk(), b"/mnt").unwrap();
		let mounted_root = lookup_path(b"/mnt").unwrap();
		assert_eq!(mounted_root.ino(), ext2::ROOT_INODE);
		assert!(!Arc::ptr_eq(&mounted_root.fs, &root.fs));
		reset_state();
	}
}
