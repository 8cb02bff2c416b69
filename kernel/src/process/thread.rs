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

//! Scheduling-visible state for a single thread of execution.
//!
//! A thread is the unit the scheduler moves between ready lists; it knows
//! nothing about address spaces, file descriptors or signal semantics
//! beyond the small amount of state the scheduler itself needs.

use crate::cpu::Context;
use core::sync::atomic::{
	AtomicU32, AtomicU8,
	Ordering::{Acquire, Relaxed, Release},
};

/// Thread identifier.
pub type Tid = u32;

/// Priority class a thread is scheduled under.
///
/// Kernel-class threads always run before system-class ones, which always
/// run before user-class ones; there is no aging across classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Policy {
	/// Highest priority class, reserved for in-kernel housekeeping threads.
	Kernel = 0,
	/// Intermediate priority class, for system services.
	System = 1,
	/// Lowest priority class; the only class subject to the preemption
	/// rescale.
	User = 2,
}

/// A thread's scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
	/// Currently loaded onto the CPU.
	Running = 0,
	/// Runnable, sitting in one of the three ready lists.
	Ready = 1,
	/// Blocked on a wait queue.
	Waiting = 2,
	/// Finished; kept around until reaped.
	Terminated = 3,
}

impl State {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => Self::Running,
			1 => Self::Ready,
			2 => Self::Waiting,
			_ => Self::Terminated,
		}
	}
}

/// A thread of execution, as seen by the scheduler.
pub struct Thread {
	/// The thread's identifier.
	pub tid: Tid,
	/// The priority class the thread is scheduled under. Fixed for the
	/// thread's lifetime.
	pub policy: Policy,
	/// Current scheduling state.
	state: AtomicU8,
	/// Dynamic priority within the thread's class. Lower values are
	/// scheduled first; this is rewritten by the preemption rescale for
	/// user-class threads.
	priority: AtomicU32,
	/// Number of timer ticks the thread has run for since it was last
	/// scheduled in. Reset on every switch-in.
	time_slice: AtomicU32,
	/// Bitmask of signals pending delivery to this thread.
	pending_signals: AtomicU32,
	/// Bitmask of signals currently blocked by this thread.
	blocked_signals: AtomicU32,
	/// The thread's saved stack pointer, valid while not running.
	context: AtomicU32,
}

impl Thread {
	/// Creates a new thread in the [`State::Ready`] state.
	pub const fn new(tid: Tid, policy: Policy, priority: i32) -> Self {
		Self {
			tid,
			policy,
			state: AtomicU8::new(State::Ready as u8),
			priority: AtomicU32::new(priority as u32),
			time_slice: AtomicU32::new(0),
			pending_signals: AtomicU32::new(0),
			blocked_signals: AtomicU32::new(0),
			context: AtomicU32::new(0),
		}
	}

	/// Returns the thread's current state.
	pub fn state(&self) -> State {
		State::from_u8(self.state.load(Acquire))
	}

	/// Sets the thread's state directly. Scheduler bookkeeping (which list
	/// the thread sits in) is the caller's responsibility; use
	/// [`super::scheduler::update_thread`] instead of this in general code.
	pub(super) fn set_state(&self, state: State) {
		self.state.store(state as u8, Release);
	}

	/// Returns the thread's current dynamic priority.
	pub fn priority(&self) -> i32 {
		self.priority.load(Acquire) as i32
	}

	/// Overwrites the thread's dynamic priority.
	pub fn set_priority(&self, priority: i32) {
		self.priority.store(priority as u32, Release);
	}

	/// Adds `delta` to the thread's dynamic priority, returning the new
	/// value.
	pub fn add_priority(&self, delta: i32) -> i32 {
		let prev = self.priority.fetch_add(delta as u32, Relaxed) as i32;
		prev.wrapping_add(delta)
	}

	/// Returns the number of ticks elapsed since the thread was last
	/// scheduled in.
	pub fn time_slice(&self) -> u32 {
		self.time_slice.load(Relaxed)
	}

	/// Increments the elapsed tick count, returning the new value.
	pub fn tick(&self) -> u32 {
		self.time_slice.fetch_add(1, Relaxed) + 1
	}

	/// Resets the elapsed tick count to zero.
	pub fn reset_time_slice(&self) {
		self.time_slice.store(0, Relaxed);
	}

	/// Marks `sig` as pending delivery.
	pub fn raise_signal(&self, sig: u32) {
		self.pending_signals.fetch_or(1 << sig, Relaxed);
	}

	/// Tells whether a pending, unblocked signal is waiting for delivery.
	pub fn has_deliverable_signal(&self) -> bool {
		let pending = self.pending_signals.load(Relaxed);
		let blocked = self.blocked_signals.load(Relaxed);
		pending & !blocked != 0
	}

	/// Saves the thread's stack pointer, as recorded at the last switch-out.
	pub fn save_context(&self, ctx: Context) {
		self.context.store(ctx as u32, Release);
	}

	/// Returns the thread's saved stack pointer.
	pub fn context(&self) -> Context {
		self.context.load(Acquire) as Context
	}
}

impl PartialEq for Thread {
	fn eq(&self, other: &Self) -> bool {
		self.tid == other.tid
	}
}

impl Eq for Thread {}
