//! PHY interface contract: the subframe/allocation types exchanged with the
//! external PHY, plus the transport-sizing helpers the scheduler relies on.
//!
//! The PHY proper (signal generation and decoding, the SDR driver) lives
//! outside this crate; MAC talks to it exclusively through the message
//! fabric using the types below.

use smallvec::SmallVec;

/// Highest system frame number of the air interface.
pub const SFN_MAX: u32 = 1023;
/// TTIs count subframes across the whole SFN cycle.
pub const TTI_MAX: u32 = SFN_MAX * 10 + 9;

pub const SI_RNTI: u16 = 0xFFFF;
pub const P_RNTI: u16 = 0xFFFE;

/// PUCCH opportunities a single UL subframe can carry.
pub const N_PUCCH_PER_SUBFR: usize = 12;

pub fn add_to_tti(tti: u32, addition: u32) -> u32 {
	(tti + addition) % (TTI_MAX + 1)
}

/// `tti_to_check` lies within the next 100 subframes after `current_tti`.
pub fn is_tti_in_future(tti_to_check: u32, current_tti: u32) -> bool {
	let max_future = add_to_tti(current_tti, 100);
	tti_to_check > current_tti && tti_to_check < max_future
}

/// RA-RNTI for a preamble received in `tti` (single-carrier FDD: f_id = 0).
pub fn ra_rnti(tti: u32) -> u16 {
	(1 + tti % 10) as u16
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Modulation {
	Qpsk,
	Qam16,
	Qam64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PreCoder {
	TxDiversity,
	SpatialMultiplexing,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChanType {
	Dlsch,
	Ulsch,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PucchType {
	AckNack,
	Sr,
}

/// One PDSCH or PUSCH grant, together with the packed transport block (DL)
/// or the decode parameters (UL).
#[derive(Clone, Debug)]
pub struct Allocation {
	pub pre_coder: PreCoder,
	pub modulation: Modulation,
	pub chan_type: ChanType,
	pub rnti: u16,
	pub rv_idx: u8,
	pub n_codewords: u8,
	pub n_layers: u8,
	pub tx_mode: u8,
	pub ndi: bool,
	pub harq_retx_count: u8,
	pub tbs: u32,
	pub mcs: u8,
	pub n_prb: u32,
	pub prb_start: u32,
	/// Packed PDU octets for DL allocations; empty for UL decode plans.
	pub payload: Vec<u8>,
}

impl Allocation {
	pub fn new_dl(rnti: u16, tx_mode: u8) -> Allocation {
		Allocation {
			pre_coder: PreCoder::TxDiversity,
			modulation: Modulation::Qpsk,
			chan_type: ChanType::Dlsch,
			rnti,
			rv_idx: 0,
			n_codewords: 1,
			n_layers: 1,
			tx_mode,
			ndi: false,
			harq_retx_count: 0,
			tbs: 0,
			mcs: 0,
			n_prb: 0,
			prb_start: 0,
			payload: Vec::new(),
		}
	}

	pub fn new_ul(rnti: u16) -> Allocation {
		Allocation {
			chan_type: ChanType::Ulsch,
			..Allocation::new_dl(rnti, 1)
		}
	}
}

/// Scheduled PUCCH decode in a UL subframe.
#[derive(Copy, Clone, Debug)]
pub struct Pucch {
	pub pucch_type: PucchType,
	pub n_1_p_pucch: u32,
	pub rnti: u16,
	pub decode: bool,
}

/// DL half of a `PhySchedule` message: everything the PHY needs to build
/// one downlink subframe.
#[derive(Clone, Debug, Default)]
pub struct DlSchedule {
	pub dl_allocations: Vec<Allocation>,
	pub ul_allocations: Vec<Allocation>,
	pub n_avail_prbs: u32,
	pub n_sched_prbs: u32,
	pub current_tti: u32,
}

impl Default for Allocation {
	fn default() -> Allocation {
		Allocation::new_dl(0, 1)
	}
}

/// UL half of a `PhySchedule` message: the decode plan for one uplink
/// subframe.
#[derive(Clone, Debug, Default)]
pub struct UlSchedule {
	pub decodes: Vec<Allocation>,
	pub pucch: SmallVec<[Pucch; N_PUCCH_PER_SUBFR]>,
	pub n_avail_prbs: u32,
	pub n_sched_prbs: u32,
	pub current_tti: u32,
	pub next_prb: u32,
}

/// Transport block sizes per PRB for I_TBS 0..=26, used as a monotone model
/// of the 36.213 sizing grid by both the scheduler and its tests.
const TBS_PER_PRB: [u32; 27] = [
	16, 24, 32, 40, 56, 72, 88, 104, 120, 136, 144, 176, 208, 224, 256, 280, 328, 336, 376, 408,
	440, 488, 520, 552, 584, 616, 648,
];

fn tbs_for(i_tbs: usize, n_prb: u32) -> u32 {
	TBS_PER_PRB[i_tbs] * n_prb
}

/// Smallest (TBS, MCS, N_prb) triple whose TBS holds `n_bits`, scanning
/// narrow allocations first. Returns the largest available block when even
/// the widest allocation cannot hold the request.
fn get_tbs_mcs_and_n_prb(n_bits: u32, n_prb_max: u32) -> (u32, u8, u32) {
	for n_prb in 1..=n_prb_max.max(1) {
		for (i_tbs, _) in TBS_PER_PRB.iter().enumerate() {
			let tbs = tbs_for(i_tbs, n_prb);
			if tbs >= n_bits {
				return (tbs, i_tbs as u8, n_prb);
			}
		}
	}
	let n_prb = n_prb_max.max(1);
	(tbs_for(TBS_PER_PRB.len() - 1, n_prb), (TBS_PER_PRB.len() - 1) as u8, n_prb)
}

pub fn get_tbs_mcs_and_n_prb_for_dl(n_bits: u32, n_prb_max: u32) -> (u32, u8, u32) {
	get_tbs_mcs_and_n_prb(n_bits, n_prb_max)
}

pub fn get_tbs_mcs_and_n_prb_for_ul(n_bits: u32, n_prb_max: u32) -> (u32, u8, u32) {
	get_tbs_mcs_and_n_prb(n_bits, n_prb_max)
}

/// Control channel elements available for DCIs in one subframe.
pub fn get_n_cce(n_rb_dl: u32) -> u32 {
	(n_rb_dl / 3).max(2)
}

/// Map an SR configuration index to (periodicity, subframe offset),
/// 36.213 table 10.1.5-1.
pub fn pucch_map_sr_config_idx(i_sr: u32) -> (u32, u32) {
	match i_sr {
		0..=4 => (5, i_sr),
		5..=14 => (10, i_sr - 5),
		15..=34 => (20, i_sr - 15),
		35..=74 => (40, i_sr - 35),
		75..=154 => (80, i_sr - 75),
		_ => (80, 0),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tti_arithmetic_wraps() {
		assert_eq!(add_to_tti(TTI_MAX, 1), 0);
		assert_eq!(add_to_tti(TTI_MAX - 1, 4), 2);
		assert!(is_tti_in_future(add_to_tti(100, 4), 100));
		assert!(!is_tti_in_future(99, 100));
		assert!(!is_tti_in_future(add_to_tti(100, 100), 100));
	}

	#[test]
	fn sizing_is_monotone_and_sufficient() {
		let (tbs, _, n_prb) = get_tbs_mcs_and_n_prb_for_ul(56, 50);
		assert!(tbs >= 56);
		assert_eq!(n_prb, 1);

		let (big_tbs, _, big_n_prb) = get_tbs_mcs_and_n_prb_for_dl(5000, 50);
		assert!(big_tbs >= 5000);
		assert!(big_n_prb > 1);
	}

	#[test]
	fn sizing_clamps_at_widest_allocation() {
		let (tbs, mcs, n_prb) = get_tbs_mcs_and_n_prb_for_dl(10_000_000, 6);
		assert_eq!(n_prb, 6);
		assert_eq!(mcs, 26);
		assert!(tbs < 10_000_000);
	}

	#[test]
	fn sr_config_index_mapping() {
		assert_eq!(pucch_map_sr_config_idx(15), (20, 0));
		assert_eq!(pucch_map_sr_config_idx(34), (20, 19));
		assert_eq!(pucch_map_sr_config_idx(7), (10, 2));
	}

	#[test]
	fn ra_rnti_follows_prach_slot() {
		assert_eq!(ra_rnti(0), 1);
		assert_eq!(ra_rnti(10239), 10);
	}
}
