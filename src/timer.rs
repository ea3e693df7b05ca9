//! Tick-driven timer manager.
//!
//! MAC forwards one tick per RTS (1 ms). Timers are one-shot; expiry events
//! are drained by the timer queue's consumer and dispatched to their
//! owners.

use hashbrown::HashMap;
use parking_lot::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

impl core::fmt::Display for TimerId {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// What a timer does when it fires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expiry {
	/// The C-RNTI went unused for its guard window; release it.
	CRntiRelease { c_rnti: u16 },
	/// The UE has been idle past its inactivity window.
	UeInactivity { c_rnti: u16 },
	/// Sweep the delayed-deletion user list.
	DeleteSweep,
}

struct Entry {
	deadline: u64,
	expiry: Expiry,
}

struct Inner {
	tick: u64,
	next_id: u32,
	timers: HashMap<TimerId, Entry>,
}

pub struct TimerManager {
	inner: Mutex<Inner>,
}

impl Default for TimerManager {
	fn default() -> TimerManager {
		TimerManager::new()
	}
}

impl TimerManager {
	pub fn new() -> TimerManager {
		TimerManager {
			inner: Mutex::new(Inner {
				tick: 0,
				next_id: 0,
				timers: HashMap::new(),
			}),
		}
	}

	pub fn start_timer(&self, ms: u64, expiry: Expiry) -> TimerId {
		let mut inner = self.inner.lock();
		let id = TimerId(inner.next_id);
		inner.next_id = inner.next_id.wrapping_add(1);
		let deadline = inner.tick + ms;
		inner.timers.insert(id, Entry { deadline, expiry });
		id
	}

	pub fn stop_timer(&self, id: TimerId) {
		self.inner.lock().timers.remove(&id);
	}

	/// Push the deadline of a running timer out to `ms` from now.
	pub fn reset_timer(&self, id: TimerId, ms: u64) {
		let mut inner = self.inner.lock();
		let deadline = inner.tick + ms;
		if let Some(entry) = inner.timers.get_mut(&id) {
			entry.deadline = deadline;
		}
	}

	/// Advance one millisecond and collect everything that fired.
	pub fn tick(&self) -> Vec<Expiry> {
		let mut inner = self.inner.lock();
		inner.tick += 1;
		let now = inner.tick;
		let fired: Vec<TimerId> = inner
			.timers
			.iter()
			.filter(|(_, entry)| entry.deadline <= now)
			.map(|(id, _)| *id)
			.collect();
		fired
			.into_iter()
			.filter_map(|id| inner.timers.remove(&id).map(|entry| entry.expiry))
			.collect()
	}
}
