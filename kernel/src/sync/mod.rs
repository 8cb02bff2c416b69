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

//! Synchronization primitives.
//!
//! [`spin`] provides a spinlock usable both from regular code and from
//! interrupt handlers. [`mutex`] provides a sleeping lock for sections that
//! may be held across a reschedule. [`atomic`] and [`once`] are small
//! utilities built on top of those two.

pub mod atomic;
pub mod mutex;
pub mod once;
pub mod spin;

pub use spin::Spin;

/// A spinlock that disables interrupts while held.
///
/// This is the primitive used for any state an interrupt handler might also
/// touch: the logger, the scheduler's ready lists, bitmaps, and the VFS
/// registry.
pub type IntMutex<T> = Spin<T, false>;
