//! Radio bearers: per-bearer protocol state and the inter-layer queues.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::rlc::pdu::{AmdPdu, UmdPdu};

/// The five bearers a UE can own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RbId {
	Srb0 = 0,
	Srb1 = 1,
	Srb2 = 2,
	Drb1 = 3,
	Drb2 = 4,
}

pub const N_RB: usize = 5;

impl RbId {
	/// Logical channel id carried in MAC subheaders.
	pub fn lcid(self) -> u8 {
		self as u8
	}

	pub fn from_lcid(lcid: u8) -> Option<RbId> {
		Some(match lcid {
			0 => RbId::Srb0,
			1 => RbId::Srb1,
			2 => RbId::Srb2,
			3 => RbId::Drb1,
			4 => RbId::Drb2,
			_ => return None,
		})
	}

	pub fn is_srb(self) -> bool {
		matches!(self, RbId::Srb0 | RbId::Srb1 | RbId::Srb2)
	}
}

impl core::fmt::Display for RbId {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let name = match self {
			RbId::Srb0 => "SRB0",
			RbId::Srb1 => "SRB1",
			RbId::Srb2 => "SRB2",
			RbId::Drb1 => "DRB1",
			RbId::Drb2 => "DRB2",
		};
		write!(f, "{name}")
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RrcProc {
	Idle,
	ConRequest,
	ConReestRequest,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RrcState {
	Idle,
	Srb1Setup,
	WaitForConSetupComplete,
	WaitForConReestComplete,
	Connected,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MmeProc {
	Idle,
	Attach,
	ServiceRequest,
	Detach,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MmeState {
	Idle,
	IdRequestImsi,
	Reject,
	Authenticate,
	AuthRejected,
	EnableSecurity,
	Release,
	RrcSecurity,
	EsmInfoTransfer,
	AttachAccept,
	Attached,
	SendDetachAccept,
	SetupDrb,
}

/// PDCP header/protection mode of a bearer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PdcpConfig {
	Plain,
	Security,
	/// 18-bit sequence numbers on a data bearer.
	LongSn,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RlcMode {
	Tm,
	Um,
	Am,
}

/// AM transmit/receive state, 36.322 window variables plus the buffers the
/// ARQ machinery needs.
#[derive(Clone, Debug, Default)]
pub struct RlcAmState {
	pub vt_a: u16,
	pub vt_s: u16,
	pub vr_r: u16,
	pub vr_h: u16,
	/// Sent PDUs kept until acknowledged, keyed by SN.
	pub tx_buffer: HashMap<u16, AmdPdu>,
	/// Out-of-order receptions waiting for reassembly.
	pub rx_buffer: HashMap<u16, AmdPdu>,
	/// Partially reassembled SDU spanning in-sequence PDUs.
	pub reassembly: Vec<u8>,
	/// A poll was received; a status PDU is owed.
	pub status_owed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RlcUmState {
	pub vt_us: u8,
	pub vr_ur: u8,
	pub rx_buffer: HashMap<u8, UmdPdu>,
	pub reassembly: Vec<u8>,
}

/// One radio bearer: identity, layered state machines, and the queues the
/// message fabric signals about.
#[derive(Debug)]
pub struct RadioBearer {
	id: RbId,
	pub rrc_proc: RrcProc,
	pub rrc_state: RrcState,
	pub mme_proc: MmeProc,
	pub mme_state: MmeState,
	pub pdcp_config: PdcpConfig,
	pub rlc_mode: RlcMode,
	pub eps_bearer_id: u8,
	pub drb_id: u8,
	pub lc_id: u8,
	pub log_chan_group: u8,
	pub rrc_transaction_id: u8,
	con_res_id: u64,
	send_con_res_id: bool,

	pub rlc_am: RlcAmState,
	pub rlc_um: RlcUmState,
	pub pdcp_tx_count: u32,
	pub pdcp_rx_count: u32,

	// Inter-layer queues, one per producing direction.
	rrc_pdus: VecDeque<Vec<u8>>,
	rrc_nas_msgs: VecDeque<Vec<u8>>,
	mme_nas_msgs: VecDeque<Vec<u8>>,
	pdcp_sdus: VecDeque<Vec<u8>>,
	pdcp_data_sdus: VecDeque<Vec<u8>>,
	rlc_sdus: VecDeque<Vec<u8>>,
	rlc_pdus: VecDeque<Vec<u8>>,
	pdcp_pdus: VecDeque<Vec<u8>>,
	mac_sdus: VecDeque<Vec<u8>>,
	gw_data_msgs: VecDeque<Vec<u8>>,
}

macro_rules! rb_queue {
	($queue:ident, $push:ident, $front:ident, $pop:ident) => {
		pub fn $push(&mut self, msg: Vec<u8>) {
			self.$queue.push_back(msg);
		}

		pub fn $front(&self) -> Option<&Vec<u8>> {
			self.$queue.front()
		}

		pub fn $pop(&mut self) -> Option<Vec<u8>> {
			self.$queue.pop_front()
		}
	};
}

impl RadioBearer {
	pub fn new(id: RbId) -> RadioBearer {
		let (rlc_mode, lc_id) = match id {
			RbId::Srb0 => (RlcMode::Tm, 0),
			RbId::Srb1 => (RlcMode::Am, 1),
			RbId::Srb2 => (RlcMode::Am, 2),
			RbId::Drb1 => (RlcMode::Am, 3),
			RbId::Drb2 => (RlcMode::Am, 4),
		};
		RadioBearer {
			id,
			rrc_proc: RrcProc::Idle,
			rrc_state: RrcState::Idle,
			mme_proc: MmeProc::Idle,
			mme_state: MmeState::Idle,
			pdcp_config: PdcpConfig::Plain,
			rlc_mode,
			eps_bearer_id: 0,
			drb_id: 0,
			lc_id,
			log_chan_group: 0,
			rrc_transaction_id: 0,
			con_res_id: 0,
			send_con_res_id: false,
			rlc_am: RlcAmState::default(),
			rlc_um: RlcUmState::default(),
			pdcp_tx_count: 0,
			pdcp_rx_count: 0,
			rrc_pdus: VecDeque::new(),
			rrc_nas_msgs: VecDeque::new(),
			mme_nas_msgs: VecDeque::new(),
			pdcp_sdus: VecDeque::new(),
			pdcp_data_sdus: VecDeque::new(),
			rlc_sdus: VecDeque::new(),
			rlc_pdus: VecDeque::new(),
			pdcp_pdus: VecDeque::new(),
			mac_sdus: VecDeque::new(),
			gw_data_msgs: VecDeque::new(),
		}
	}

	pub fn id(&self) -> RbId {
		self.id
	}

	pub fn set_con_res_id(&mut self, id: u64) {
		self.con_res_id = id;
	}

	pub fn con_res_id(&self) -> u64 {
		self.con_res_id
	}

	pub fn set_send_con_res_id(&mut self, send: bool) {
		self.send_con_res_id = send;
	}

	pub fn send_con_res_id(&self) -> bool {
		self.send_con_res_id
	}

	rb_queue!(rrc_pdus, queue_rrc_pdu, next_rrc_pdu, pop_rrc_pdu);
	rb_queue!(rrc_nas_msgs, queue_rrc_nas_msg, next_rrc_nas_msg, pop_rrc_nas_msg);
	rb_queue!(mme_nas_msgs, queue_mme_nas_msg, next_mme_nas_msg, pop_mme_nas_msg);
	rb_queue!(pdcp_sdus, queue_pdcp_sdu, next_pdcp_sdu, pop_pdcp_sdu);
	rb_queue!(pdcp_data_sdus, queue_pdcp_data_sdu, next_pdcp_data_sdu, pop_pdcp_data_sdu);
	rb_queue!(rlc_sdus, queue_rlc_sdu, next_rlc_sdu, pop_rlc_sdu);
	rb_queue!(rlc_pdus, queue_rlc_pdu, next_rlc_pdu, pop_rlc_pdu);
	rb_queue!(pdcp_pdus, queue_pdcp_pdu, next_pdcp_pdu, pop_pdcp_pdu);
	rb_queue!(mac_sdus, queue_mac_sdu, next_mac_sdu, pop_mac_sdu);
	rb_queue!(gw_data_msgs, queue_gw_data_msg, next_gw_data_msg, pop_gw_data_msg);

	/// Copy the layered procedure state from another bearer (used when a
	/// returning UE shows up under a fresh C-RNTI).
	pub fn copy_proc_state_from(&mut self, other: &RadioBearer) {
		self.rrc_proc = other.rrc_proc;
		self.rrc_state = other.rrc_state;
		self.mme_proc = other.mme_proc;
		self.mme_state = other.mme_state;
		self.pdcp_config = other.pdcp_config;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lcid_round_trip() {
		for id in [RbId::Srb0, RbId::Srb1, RbId::Srb2, RbId::Drb1, RbId::Drb2] {
			assert_eq!(RbId::from_lcid(id.lcid()), Some(id));
		}
		assert_eq!(RbId::from_lcid(9), None);
	}

	#[test]
	fn queues_are_fifo() {
		let mut rb = RadioBearer::new(RbId::Srb1);
		rb.queue_rrc_pdu(vec![1]);
		rb.queue_rrc_pdu(vec![2]);
		assert_eq!(rb.next_rrc_pdu(), Some(&vec![1]));
		assert_eq!(rb.pop_rrc_pdu(), Some(vec![1]));
		assert_eq!(rb.pop_rrc_pdu(), Some(vec![2]));
		assert_eq!(rb.pop_rrc_pdu(), None);
	}
}
