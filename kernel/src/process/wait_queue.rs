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

//! Wait queues: the building block every blocking operation (mutex
//! acquisition, pipe reads, anything waiting on another thread) is
//! expressed in terms of.
//!
//! A queue is a list pairing a thread with a wakeup callback. [`wake_up`]
//! invokes every pending callback in order; there is no notion of an
//! "exclusive" wakeup that stops after the first successful one, so a
//! caller relying on only one waiter winning a race (as [`super::mutex::Mutex`]
//! does) must re-check its condition after being woken.

use crate::{
	process::{
		scheduler,
		thread::{State, Thread},
	},
	sync::IntMutex,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};

struct Waiter {
	thread: Arc<Thread>,
	wake: Box<dyn Fn(&Arc<Thread>) + Send + Sync>,
}

/// A queue of threads blocked on some condition.
pub struct WaitQueue {
	waiters: IntMutex<Vec<Waiter>>,
}

impl WaitQueue {
	/// Creates a new, empty wait queue.
	pub const fn new() -> Self {
		Self {
			waiters: IntMutex::new(Vec::new()),
		}
	}

	/// Blocks the current thread on this queue with the default wakeup
	/// action (transition back to [`State::Ready`]), returning once it has
	/// been woken up.
	///
	/// If there is no current thread (e.g. called from non-threaded test
	/// code), this is a no-op: there is nothing to block.
	pub fn wait(&self) {
		let Some(current) = scheduler::current() else {
			return;
		};
		self.wait_with(current.clone(), |t| scheduler::update_thread(t, State::Ready));
		scheduler::schedule();
	}

	/// Registers `thread` on the queue with a custom wakeup action, and
	/// transitions it to [`State::Waiting`]. Does not yield the CPU; the
	/// caller (typically [`wait`](Self::wait)) is responsible for calling
	/// into the scheduler afterwards.
	pub fn wait_with(&self, thread: Arc<Thread>, wake: impl Fn(&Arc<Thread>) + Send + Sync + 'static) {
		scheduler::update_thread(&thread, State::Waiting);
		self.waiters.lock().push(Waiter {
			thread,
			wake: Box::new(wake),
		});
	}

	/// Wakes up every thread currently queued, invoking each one's wakeup
	/// action in the order they were enqueued. The queue is empty again
	/// once this returns.
	pub fn wake_up(&self) {
		let drained: Vec<Waiter> = core::mem::take(&mut *self.waiters.lock());
		for waiter in drained {
			(waiter.wake)(&waiter.thread);
		}
	}

	/// Tells whether any thread is currently queued.
	pub fn is_empty(&self) -> bool {
		self.waiters.lock().is_empty()
	}
}

impl Default for WaitQueue {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::process::thread::Policy;

	#[test]
	fn wake_up_readies_every_waiter_and_empties_the_queue() {
		let q = WaitQueue::new();
		let a = Arc::new(Thread::new(1, Policy::User, 0));
		let b = Arc::new(Thread::new(2, Policy::User, 0));
		scheduler::queue_thread(a.clone());
		scheduler::queue_thread(b.clone());
		scheduler::update_thread(&a, State::Waiting);
		scheduler::update_thread(&b, State::Waiting);
		q.wait_with(a.clone(), |t| scheduler::update_thread(t, State::Ready));
		q.wait_with(b.clone(), |t| scheduler::update_thread(t, State::Ready));
		assert!(!q.is_empty());
		q.wake_up();
		assert!(q.is_empty());
		assert_eq!(a.state(), State::Ready);
		assert_eq!(b.state(), State::Ready);
	}
}
