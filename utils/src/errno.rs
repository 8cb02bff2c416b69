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

//! Errno utilities.
//!
//! The kernel represents errors as small negative integers rather than a fat
//! enum so that they can cross interrupt frames and FFI-like boundaries
//! cheaply.

/// Type representing an Unix errno.
pub type Errno = i32;

/// Shorthand for a result whose error variant is an [`Errno`].
pub type EResult<T> = Result<T, Errno>;

/// Permission denied.
pub const EPERM: Errno = 1;
/// No such file or directory.
pub const ENOENT: Errno = 2;
/// No such process.
pub const ESRCH: Errno = 3;
/// I/O error.
pub const EIO: Errno = 5;
/// Bad file descriptor.
pub const EBADF: Errno = 9;
/// Resource unavailable, try again.
pub const EAGAIN: Errno = 11;
/// Not enough space.
pub const ENOMEM: Errno = 12;
/// Permission denied (access).
pub const EACCES: Errno = 13;
/// Bad address.
pub const EFAULT: Errno = 14;
/// Device or resource busy.
pub const EBUSY: Errno = 16;
/// File exists.
pub const EEXIST: Errno = 17;
/// Cross-device link.
pub const EXDEV: Errno = 18;
/// No such device.
pub const ENODEV: Errno = 19;
/// Not a directory or a symbolic link to a directory.
pub const ENOTDIR: Errno = 20;
/// Is a directory.
pub const EISDIR: Errno = 21;
/// Invalid argument.
pub const EINVAL: Errno = 22;
/// Too many links.
pub const EMLINK: Errno = 31;
/// No space left on device.
pub const ENOSPC: Errno = 28;
/// Directory not empty.
pub const ENOTEMPTY: Errno = 39;
/// Functionality not supported.
pub const ENOSYS: Errno = 38;
/// Filename too long.
pub const ENAMETOOLONG: Errno = 36;
/// Result too large / out of range.
pub const ERANGE: Errno = 34;

/// Builds an [`Errno`] value from one of the named constants in this module.
///
/// This exists purely for call-site readability (`errno!(ENOENT)` instead of
/// `errno::ENOENT`) at places that already import the module under a
/// different name.
#[macro_export]
macro_rules! errno {
	($name:ident) => {
		$crate::errno::$name
	};
}
