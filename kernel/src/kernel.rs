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

//! An ext2 filesystem driver, the virtual filesystem layer mediating
//! access to it, and the process scheduler, extracted as a standalone
//! `no_std` crate.
//!
//! Booting, architecture bring-up, memory management, device drivers and
//! the rest of a full kernel are out of scope: this crate only owns the
//! subsystems listed above, plus the synchronization primitives and the
//! ring-buffer logger they are built on. It is meant to be linked into a
//! host that provides everything else through the seams documented on
//! [`file::block::BlockDevice`] and [`cpu`].

#![no_std]
#![feature(negative_impls)]
#![deny(missing_docs)]
#![allow(clippy::tabs_in_doc_comments)]

extern crate alloc;

pub mod cpu;
pub mod file;
#[macro_use]
pub mod logger;
#[macro_use]
pub mod panic;
#[macro_use]
pub mod print;
pub mod process;
pub mod sync;

/// The crate's name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// The crate's version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
