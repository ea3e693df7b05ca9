// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! User manager: C-RNTI and M-TMSI allocation, record lookups, and the
//! two-phase deletion that lets queued references drain before a record is
//! freed.

pub mod rb;
pub mod ue;

pub use rb::RbId;
pub use ue::User;

use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, info};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::nas::msg::Guti;
use crate::timer::{Expiry, TimerId, TimerManager};

pub type UserRef = Arc<Mutex<User>>;

/// First C-RNTI handed out; the allocator rolls forward and skips live
/// values.
const C_RNTI_START: u16 = 61;
const C_RNTI_RELEASE_TIMER_MS: u64 = 5000;
pub const USER_INACTIVITY_TIMER_MS: u64 = 10_000;

struct MgrInner {
	users: HashMap<u16, UserRef>,
	delayed_del: Vec<UserRef>,
	c_rnti_timers: HashMap<u16, TimerId>,
	next_c_rnti: u16,
	next_m_tmsi: u32,
}

pub struct UserMgr {
	timers: Arc<TimerManager>,
	inner: Mutex<MgrInner>,
}

impl UserMgr {
	pub fn new(timers: Arc<TimerManager>) -> Arc<UserMgr> {
		Arc::new(UserMgr {
			timers,
			inner: Mutex::new(MgrInner {
				users: HashMap::new(),
				delayed_del: Vec::new(),
				c_rnti_timers: HashMap::new(),
				next_c_rnti: C_RNTI_START,
				next_m_tmsi: 1,
			}),
		})
	}

	/// Allocate a C-RNTI and a fresh record (carrying SRB0) for it.
	pub fn add_user(&self) -> Result<(u16, UserRef)> {
		let mut inner = self.inner.lock();
		let mut c_rnti = inner.next_c_rnti;
		let mut tries = 0u32;
		while inner.users.contains_key(&c_rnti) {
			c_rnti = next_rnti(c_rnti);
			tries += 1;
			if tries > u32::from(u16::MAX) {
				return Err(Error::CantSchedule);
			}
		}
		inner.next_c_rnti = next_rnti(c_rnti);
		let user = Arc::new(Mutex::new(User::new(c_rnti)));
		inner.users.insert(c_rnti, Arc::clone(&user));
		let timer_id = self
			.timers
			.start_timer(C_RNTI_RELEASE_TIMER_MS, Expiry::CRntiRelease { c_rnti });
		inner.c_rnti_timers.insert(c_rnti, timer_id);
		debug!(target: "user", "added user RNTI={c_rnti}");
		Ok((c_rnti, user))
	}

	pub fn find_user(&self, c_rnti: u16) -> Option<UserRef> {
		self.inner.lock().users.get(&c_rnti).cloned()
	}

	pub fn find_user_imsi(&self, imsi: u64) -> Option<UserRef> {
		let inner = self.inner.lock();
		inner
			.users
			.values()
			.find(|user| user.lock().id().is_some_and(|id| id.imsi == imsi))
			.cloned()
	}

	pub fn find_user_guti(&self, guti: &Guti) -> Option<UserRef> {
		let inner = self.inner.lock();
		inner
			.users
			.values()
			.find(|user| user.lock().guti.as_ref() == Some(guti))
			.cloned()
	}

	/// S-TMSI is the MME-code + M-TMSI tail of the GUTI.
	pub fn find_user_s_tmsi(&self, mmec: u8, m_tmsi: u32) -> Option<UserRef> {
		let inner = self.inner.lock();
		inner
			.users
			.values()
			.find(|user| {
				user.lock()
					.guti
					.is_some_and(|guti| guti.mme_code == mmec && guti.m_tmsi == m_tmsi)
			})
			.cloned()
	}

	pub fn find_user_ip(&self, ip_addr: u32) -> Option<UserRef> {
		let inner = self.inner.lock();
		inner
			.users
			.values()
			.find(|user| user.lock().ip_addr == Some(ip_addr))
			.cloned()
	}

	pub fn get_next_m_tmsi(&self) -> u32 {
		let mut inner = self.inner.lock();
		let m_tmsi = inner.next_m_tmsi;
		inner.next_m_tmsi = inner.next_m_tmsi.wrapping_add(1);
		m_tmsi
	}

	/// Push the release guard of a C-RNTI out; called on every decoded
	/// uplink transmission.
	pub fn reset_c_rnti_timer(&self, c_rnti: u16) {
		let inner = self.inner.lock();
		if let Some(timer_id) = inner.c_rnti_timers.get(&c_rnti) {
			self.timers.reset_timer(*timer_id, C_RNTI_RELEASE_TIMER_MS);
		}
	}

	/// Drop the C-RNTI binding and park the record for the delete sweep.
	pub fn release_c_rnti(&self, c_rnti: u16) {
		let mut inner = self.inner.lock();
		if let Some(timer_id) = inner.c_rnti_timers.remove(&c_rnti) {
			self.timers.stop_timer(timer_id);
		}
		if let Some(user) = inner.users.remove(&c_rnti) {
			user.lock().prepare_for_deletion();
			inner.delayed_del.push(user);
			info!(target: "user", "released RNTI={c_rnti}");
		}
	}

	/// Re-point a C-RNTI at an existing record (contention resolution with
	/// a returning UE). The transient record that held it is parked for
	/// deletion.
	pub fn transfer_c_rnti(&self, c_rnti: u16, target: &UserRef) {
		let mut inner = self.inner.lock();
		if let Some(old) = inner.users.insert(c_rnti, Arc::clone(target)) {
			if !Arc::ptr_eq(&old, target) {
				old.lock().prepare_for_deletion();
				inner.delayed_del.push(old);
			}
		}
		let old_rnti = target.lock().c_rnti();
		if old_rnti != c_rnti {
			// The target's previous binding is gone with its old C-RNTI.
			if let Some(timer_id) = inner.c_rnti_timers.remove(&old_rnti) {
				self.timers.stop_timer(timer_id);
			}
			inner.users.remove(&old_rnti);
			target.lock().set_c_rnti(c_rnti);
		}
	}

	pub fn del_user(&self, c_rnti: u16) -> Result<()> {
		let mut inner = self.inner.lock();
		if let Some(timer_id) = inner.c_rnti_timers.remove(&c_rnti) {
			self.timers.stop_timer(timer_id);
		}
		match inner.users.remove(&c_rnti) {
			Some(user) => {
				user.lock().prepare_for_deletion();
				inner.delayed_del.push(user);
				Ok(())
			}
			None => Err(Error::InvalidParam),
		}
	}

	/// Second phase of the delete: free records no queue references any
	/// more (the manager holds the only remaining handle).
	pub fn sweep_delayed_delete(&self) {
		let mut inner = self.inner.lock();
		inner.delayed_del.retain(|user| Arc::strong_count(user) > 1);
	}

	pub fn handle_timer_expiry(&self, expiry: Expiry) {
		match expiry {
			Expiry::CRntiRelease { c_rnti } => {
				debug!(target: "user", "C-RNTI release timer expired RNTI={c_rnti}");
				self.release_c_rnti(c_rnti);
			}
			Expiry::UeInactivity { c_rnti } => {
				info!(target: "user", "inactivity timeout RNTI={c_rnti}");
				let _ = self.del_user(c_rnti);
			}
			Expiry::DeleteSweep => self.sweep_delayed_delete(),
		}
	}

	pub fn num_users(&self) -> usize {
		self.inner.lock().users.len()
	}

	pub fn print_all_users(&self) -> String {
		let inner = self.inner.lock();
		let mut out = String::new();
		for (c_rnti, user) in &inner.users {
			let user = user.lock();
			out.push_str(&format!(
				"rnti={} imsi={} ip={:?}\n",
				c_rnti,
				user.imsi_str(),
				user.ip_addr
			));
		}
		out
	}
}

fn next_rnti(c_rnti: u16) -> u16 {
	// Stay clear of the reserved RNTI space at the top.
	if c_rnti >= 0xFFF0 {
		C_RNTI_START
	} else {
		c_rnti + 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mgr() -> Arc<UserMgr> {
		UserMgr::new(Arc::new(TimerManager::new()))
	}

	#[test]
	fn c_rnti_allocation_is_unique() {
		let mgr = mgr();
		let (a, _ua) = mgr.add_user().unwrap();
		let (b, _ub) = mgr.add_user().unwrap();
		assert_ne!(a, b);
		assert!(mgr.find_user(a).is_some());
		assert!(mgr.find_user(b).is_some());
	}

	#[test]
	fn released_rnti_is_not_findable() {
		let mgr = mgr();
		let (c_rnti, _user) = mgr.add_user().unwrap();
		mgr.release_c_rnti(c_rnti);
		assert!(mgr.find_user(c_rnti).is_none());
	}

	#[test]
	fn sweep_waits_for_references_to_drain() {
		let mgr = mgr();
		let (c_rnti, user) = mgr.add_user().unwrap();
		mgr.del_user(c_rnti).unwrap();
		mgr.sweep_delayed_delete();
		// The test still holds a handle, so the record survives the sweep.
		assert_eq!(mgr.inner.lock().delayed_del.len(), 1);
		drop(user);
		mgr.sweep_delayed_delete();
		assert_eq!(mgr.inner.lock().delayed_del.len(), 0);
	}

	#[test]
	fn transfer_rebinds_the_c_rnti() {
		let mgr = mgr();
		let (old_rnti, act_user) = mgr.add_user().unwrap();
		let (new_rnti, _transient) = mgr.add_user().unwrap();
		mgr.transfer_c_rnti(new_rnti, &act_user);
		assert_eq!(act_user.lock().c_rnti(), new_rnti);
		assert!(mgr.find_user(old_rnti).is_none());
		let found = mgr.find_user(new_rnti).unwrap();
		assert!(Arc::ptr_eq(&found, &act_user));
	}

	#[test]
	fn ip_lookup_finds_the_bound_user() {
		let mgr = mgr();
		let (_c_rnti, user) = mgr.add_user().unwrap();
		user.lock().ip_addr = Some(0xC0A8_0102);
		assert!(mgr.find_user_ip(0xC0A8_0102).is_some());
		assert!(mgr.find_user_ip(0xC0A8_0103).is_none());
	}
}
