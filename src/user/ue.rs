//! The UE record: identities, security state, HARQ bookkeeping and the
//! radio bearers it owns.

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::mac::pdu::MacPdu;
use crate::nas::msg::{Guti, Pco};
use crate::phy::Allocation;
use crate::security::AuthVec;
use crate::timer::TimerId;
use crate::user::rb::{RadioBearer, RbId, N_RB};

bitflags! {
	/// Algorithm support mask as carried in the UE network capability:
	/// bit 7 is algorithm 0.
	#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
	pub struct AlgMask: u8 {
		const ALG0 = 0x80;
		const ALG1 = 0x40;
		const ALG2 = 0x20;
		const ALG3 = 0x10;
		const ALG4 = 0x08;
		const ALG5 = 0x04;
		const ALG6 = 0x02;
		const ALG7 = 0x01;
	}
}

impl AlgMask {
	pub fn supports(self, idx: u8) -> bool {
		self.bits() & (0x80 >> idx) != 0
	}
}

/// Security capabilities reported in the attach request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SecCaps {
	pub eea: AlgMask,
	pub eia: AlgMask,
	pub uea: Option<AlgMask>,
	pub uia: Option<AlgMask>,
	pub gea: Option<AlgMask>,
}

/// Permanent subscriber identity pair.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserId {
	pub imsi: u64,
	pub imei: u64,
}

/// A DL allocation parked for HARQ, keyed by its ACK/NACK TTI.
#[derive(Clone, Debug)]
pub struct HarqEntry {
	pub mac_pdu: MacPdu,
	pub alloc: Allocation,
}

pub const MAX_UL_BYTES_PER_SUBFN: u32 = 1250;

#[derive(Debug)]
pub struct User {
	c_rnti: u16,
	id: Option<UserId>,
	/// Identity claimed before admission succeeded; kept for reject logs.
	pub temp_id: u64,
	pub guti: Option<Guti>,
	pub ip_addr: Option<u32>,
	pub attach_type: u8,
	pub emm_cause: u8,
	pub eps_bearer_id: u8,
	pub proc_transaction_id: u8,
	pub pdn_type: u8,
	pub pco_reply: Pco,
	pub esm_info_transfer: bool,
	pub caps: SecCaps,
	auth_vec: Option<AuthVec>,
	dl_ndi: bool,
	ul_ndi: bool,
	harq: HashMap<u32, HarqEntry>,
	pub inactivity_timer: Option<TimerId>,
	pub ul_buffer_size: u32,
	pub max_ul_bytes_per_subfn: u32,
	delete_pending: bool,
	bearers: [Option<RadioBearer>; N_RB],
}

impl User {
	pub fn new(c_rnti: u16) -> User {
		let mut user = User {
			c_rnti,
			id: None,
			temp_id: 0,
			guti: None,
			ip_addr: None,
			attach_type: 0,
			emm_cause: 0,
			eps_bearer_id: 0,
			proc_transaction_id: 0,
			pdn_type: 0,
			pco_reply: Pco::default(),
			esm_info_transfer: false,
			caps: SecCaps::default(),
			auth_vec: None,
			dl_ndi: false,
			ul_ndi: false,
			harq: HashMap::new(),
			inactivity_timer: None,
			ul_buffer_size: 0,
			max_ul_bytes_per_subfn: MAX_UL_BYTES_PER_SUBFN,
			delete_pending: false,
			bearers: [None, None, None, None, None],
		};
		user.bearers[RbId::Srb0 as usize] = Some(RadioBearer::new(RbId::Srb0));
		user
	}

	pub fn c_rnti(&self) -> u16 {
		self.c_rnti
	}

	pub(super) fn set_c_rnti(&mut self, c_rnti: u16) {
		self.c_rnti = c_rnti;
	}

	pub fn id(&self) -> Option<UserId> {
		self.id
	}

	pub fn set_id(&mut self, id: UserId) {
		self.id = Some(id);
	}

	pub fn imsi_str(&self) -> String {
		match self.id {
			Some(id) => format!("{:015}", id.imsi),
			None => "unknown".into(),
		}
	}

	pub fn imei_str(&self) -> String {
		match self.id {
			Some(id) => format!("{:015}", id.imei),
			None => "unknown".into(),
		}
	}

	// ---- security ----

	pub fn auth_vec(&self) -> Option<&AuthVec> {
		self.auth_vec.as_ref()
	}

	pub fn auth_vec_mut(&mut self) -> Option<&mut AuthVec> {
		self.auth_vec.as_mut()
	}

	pub fn set_auth_vec(&mut self, auth_vec: AuthVec) {
		self.auth_vec = Some(auth_vec);
	}

	pub fn increment_nas_count_dl(&mut self) {
		if let Some(auth_vec) = &mut self.auth_vec {
			auth_vec.nas_count_dl = auth_vec.nas_count_dl.wrapping_add(1);
		}
	}

	pub fn increment_nas_count_ul(&mut self) {
		if let Some(auth_vec) = &mut self.auth_vec {
			auth_vec.nas_count_ul = auth_vec.nas_count_ul.wrapping_add(1);
		}
	}

	// ---- HARQ ----

	pub fn dl_ndi(&self) -> bool {
		self.dl_ndi
	}

	pub fn flip_dl_ndi(&mut self) {
		self.dl_ndi = !self.dl_ndi;
	}

	pub fn ul_ndi(&self) -> bool {
		self.ul_ndi
	}

	pub fn flip_ul_ndi(&mut self) {
		self.ul_ndi = !self.ul_ndi;
	}

	pub fn store_harq_info(&mut self, tti: u32, mac_pdu: MacPdu, alloc: Allocation) {
		self.harq.insert(tti, HarqEntry { mac_pdu, alloc });
	}

	pub fn harq_info(&self, tti: u32) -> Option<&HarqEntry> {
		self.harq.get(&tti)
	}

	pub fn clear_harq_info(&mut self, tti: u32) -> Option<HarqEntry> {
		self.harq.remove(&tti)
	}

	/// Drop HARQ slots whose ACK opportunity is long past; the allocation
	/// aged out without a PUCCH decode.
	pub fn age_out_harq(&mut self, current_tti: u32) {
		self.harq
			.retain(|tti, _| crate::phy::is_tti_in_future(*tti, current_tti) || *tti == current_tti);
	}

	// ---- buffers ----

	pub fn update_ul_buffer_size(&mut self, n_bytes: u32) {
		self.ul_buffer_size = self.ul_buffer_size.saturating_sub(n_bytes);
	}

	pub fn set_ul_buffer_size(&mut self, n_bytes: u32) {
		self.ul_buffer_size = n_bytes;
	}

	// ---- deletion ----

	/// First phase of the two-phase delete: mark the record; the manager's
	/// sweep frees it once nothing references it any more.
	pub fn prepare_for_deletion(&mut self) {
		self.delete_pending = true;
	}

	pub fn is_delete_pending(&self) -> bool {
		self.delete_pending
	}

	// ---- bearers ----

	pub fn rb(&self, id: RbId) -> Option<&RadioBearer> {
		self.bearers[id as usize].as_ref()
	}

	pub fn rb_mut(&mut self, id: RbId) -> Option<&mut RadioBearer> {
		self.bearers[id as usize].as_mut()
	}

	pub fn srb0(&mut self) -> &mut RadioBearer {
		self.bearers[RbId::Srb0 as usize]
			.get_or_insert_with(|| RadioBearer::new(RbId::Srb0))
	}

	/// Create the bearer if missing and return it.
	pub fn setup_rb(&mut self, id: RbId) -> Result<&mut RadioBearer> {
		if self.delete_pending {
			return Err(Error::InvalidParam);
		}
		Ok(self.bearers[id as usize].get_or_insert_with(|| RadioBearer::new(id)))
	}

	pub fn clear_rbs(&mut self) {
		for slot in &mut self.bearers[1..] {
			*slot = None;
		}
	}

	/// Move every bearer of `other` into this record (a returning UE
	/// shows up under a fresh C-RNTI; the procedure state rides along).
	pub fn take_rbs_from(&mut self, other: &mut User) {
		for idx in 0..N_RB {
			if other.bearers[idx].is_some() {
				self.bearers[idx] = other.bearers[idx].take();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alg_mask_bit_order() {
		let mask = AlgMask::from_bits_truncate(0b1010_0000);
		assert!(mask.supports(0));
		assert!(!mask.supports(1));
		assert!(mask.supports(2));
		assert!(!mask.supports(7));
	}

	#[test]
	fn new_user_owns_srb0_only() {
		let mut user = User::new(70);
		assert!(user.rb(RbId::Srb0).is_some());
		assert!(user.rb(RbId::Srb1).is_none());
		user.setup_rb(RbId::Srb1).unwrap();
		assert!(user.rb(RbId::Srb1).is_some());
	}

	#[test]
	fn harq_slots_age_out() {
		let mut user = User::new(70);
		user.store_harq_info(50, MacPdu::default(), Allocation::new_dl(70, 1));
		user.store_harq_info(104, MacPdu::default(), Allocation::new_dl(70, 1));
		user.age_out_harq(100);
		assert!(user.harq_info(50).is_none());
		assert!(user.harq_info(104).is_some());
	}

	#[test]
	fn nas_counts_are_monotonic() {
		let mut user = User::new(70);
		user.set_auth_vec(AuthVec::default());
		user.increment_nas_count_dl();
		user.increment_nas_count_dl();
		user.increment_nas_count_ul();
		let auth_vec = user.auth_vec().unwrap();
		assert_eq!(auth_vec.nas_count_dl, 2);
		assert_eq!(auth_vec.nas_count_ul, 1);
	}
}
