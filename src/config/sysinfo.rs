//! System information construction.
//!
//! Builds the MIB/SIB bundle from the parameter store, maps SIBs onto SI
//! message slots, and pre-packs every broadcast payload together with its
//! PHY allocation descriptor. The result is snapshotted wholesale into
//! each consuming layer.

use crate::config::{ConfigDb, Param};
use crate::phy::{self, Allocation, SI_RNTI};
use crate::rrc::msg::{
	pack_bcch_dlsch_msg, pack_mib, BcchDlSchMessage, DlBandwidth, Mib, SchedInfo, Sib, Sib1, Sib2,
	Sib3, Sib8,
};

/// SI periodicity in radio frames by parameter index.
const SI_PERIODICITY: [u32; 7] = [8, 16, 32, 64, 128, 256, 512];
/// SI window length in subframes by parameter index.
const SI_WINDOW_LEN: [u32; 7] = [1, 2, 5, 10, 15, 20, 40];

pub const N_SIB_ALLOCS: usize = 4;

#[derive(Clone, Debug, Default)]
pub struct SysInfo {
	pub mib: Mib,
	pub sib1: Sib1,
	pub sib2: Sib2,
	pub sib3: Option<Sib3>,
	pub sib4_present: bool,
	pub sib5_present: bool,
	pub sib6_present: bool,
	pub sib7_present: bool,
	pub sib8: Option<Sib8>,
	/// Packed MIB payload.
	pub mib_payload: Vec<u8>,
	/// SIB1 broadcast, already encoded with its allocation descriptor.
	pub sib1_alloc: Allocation,
	/// One entry per SI message slot of the scheduling info.
	pub sib_alloc: Vec<Allocation>,
	pub n_ant: u8,
	pub n_id_cell: u16,
	pub n_rb_dl: u32,
	pub n_rb_ul: u32,
	pub n_sc_rb_dl: u32,
	pub n_sc_rb_ul: u32,
	pub si_periodicity_t: u32,
	pub si_win_len: u32,
	pub mcc: u16,
	pub mnc: u16,
	pub mnc_two_digits: bool,
}

impl Default for Mib {
	fn default() -> Mib {
		Mib {
			dl_bw: DlBandwidth::N50,
			phich_duration_normal: true,
			phich_resource: 1,
			sfn_msb: 0,
		}
	}
}

fn si_allocation(payload: Vec<u8>, n_rb_dl: u32) -> Allocation {
	let mut alloc = Allocation::new_dl(SI_RNTI, 1);
	let (tbs, mcs, n_prb) = phy::get_tbs_mcs_and_n_prb_for_dl(payload.len() as u32 * 8, n_rb_dl);
	alloc.tbs = tbs;
	alloc.mcs = mcs;
	alloc.n_prb = n_prb;
	alloc.payload = payload;
	alloc
}

pub fn build(db: &ConfigDb) -> SysInfo {
	let (mcc, mnc, mnc_two_digits) = db.plmn();
	let n_rb_dl = db.get_i64(Param::NRbDl) as u32;
	let dl_bw = DlBandwidth::from_mhz(db.get_f64(Param::Bandwidth)).unwrap_or(DlBandwidth::N50);

	let mib = Mib {
		dl_bw,
		phich_duration_normal: true,
		phich_resource: db.get_i64(Param::PhichResource) as u8,
		sfn_msb: 0,
	};

	// Which SIBs beyond SIB2 go on the air.
	let mut extra_sibs: Vec<u8> = Vec::new();
	for (param, sib_type) in [
		(Param::Sib3Present, 3u8),
		(Param::Sib4Present, 4),
		(Param::Sib5Present, 5),
		(Param::Sib6Present, 6),
		(Param::Sib7Present, 7),
		(Param::Sib8Present, 8),
	] {
		if db.get_i64(param) == 1 {
			extra_sibs.push(sib_type);
		}
	}

	// Map them onto SI message slots: the first slot carries SIB2 and has
	// room for one more only in the 1.4 MHz case; later slots take two
	// each. Every slot runs at the shortest periodicity.
	let mut sched_info = vec![SchedInfo {
		si_periodicity_idx: 0,
		sib_mapping: Vec::new(),
	}];
	let mut remaining = extra_sibs.as_slice();
	if dl_bw == DlBandwidth::N6 && !remaining.is_empty() {
		sched_info[0].sib_mapping.push(remaining[0]);
		remaining = &remaining[1..];
	}
	for chunk in remaining.chunks(2) {
		sched_info.push(SchedInfo {
			si_periodicity_idx: 0,
			sib_mapping: chunk.to_vec(),
		});
	}

	let q_rx_lev_min = db.get_i64(Param::QRxLevMin) as i16;
	let p_max = 23i8;
	let si_window_idx = db.get_i64(Param::SystemInfoWindowLength) as usize % SI_WINDOW_LEN.len();
	let si_periodicity_idx =
		db.get_i64(Param::SystemInfoPeriodicity) as usize % SI_PERIODICITY.len();

	let sib1 = Sib1 {
		mcc,
		mnc,
		mnc_two_digits,
		tracking_area_code: db.get_i64(Param::TrackingAreaCode) as u16,
		cell_id: db.get_i64(Param::CellId) as u32,
		cell_barred: false,
		intra_freq_reselection: true,
		q_rx_lev_min,
		p_max,
		freq_band_indicator: db.get_i64(Param::FreqBand) as u8,
		sched_info,
		si_window_length: SI_WINDOW_LEN[si_window_idx] as u8,
		system_info_value_tag: (db.get_u32(Param::SystemInfoValueTag) & 0x1F) as u8,
	};

	let sib2 = Sib2 {
		p0_nominal_pusch: db.get_i64(Param::P0NominalPusch) as i16,
		p0_nominal_pucch: db.get_i64(Param::P0NominalPucch) as i16,
		..Sib2::default()
	};

	let sib3 = (db.get_i64(Param::Sib3Present) == 1).then(|| {
		let q_hyst = db.get_f64(Param::QHyst);
		let q_hyst_idx = match q_hyst as u32 {
			0..=6 => q_hyst as u8,
			v => (6 + (v - 6) / 2) as u8,
		};
		Sib3 {
			q_hyst_idx,
			q_rx_lev_min,
			p_max,
			t_resel_eutra: 0,
		}
	});
	let sib8 = (db.get_i64(Param::Sib8Present) == 1).then(|| Sib8 {
		search_win_size: db.get_i64(Param::SearchWinSize) as u8,
	});

	let sib_by_type = |sib_type: u8| -> Sib {
		match sib_type {
			3 => Sib::Sib3(sib3.clone().unwrap_or_default()),
			4 => Sib::Sib4,
			5 => Sib::Sib5,
			6 => Sib::Sib6 { t_resel_utra: 1 },
			7 => Sib::Sib7 { t_resel_geran: 1 },
			_ => Sib::Sib8(sib8.clone().unwrap_or_default()),
		}
	};

	// Pack SIB1 and every SI message into broadcast-ready buffers.
	let sib1_alloc = si_allocation(
		pack_bcch_dlsch_msg(&BcchDlSchMessage::Sib1(sib1.clone())),
		n_rb_dl,
	);

	let mut sib_alloc = Vec::new();
	for (slot, info) in sib1.sched_info.iter().enumerate().take(N_SIB_ALLOCS) {
		let mut sibs = Vec::new();
		if slot == 0 {
			sibs.push(Sib::Sib2(sib2.clone()));
		}
		for sib_type in &info.sib_mapping {
			sibs.push(sib_by_type(*sib_type));
		}
		let payload = pack_bcch_dlsch_msg(&BcchDlSchMessage::SystemInformation { sibs });
		sib_alloc.push(si_allocation(payload, n_rb_dl));
	}

	SysInfo {
		mib_payload: pack_mib(&mib),
		mib,
		sib1,
		sib2,
		sib3,
		sib4_present: db.get_i64(Param::Sib4Present) == 1,
		sib5_present: db.get_i64(Param::Sib5Present) == 1,
		sib6_present: db.get_i64(Param::Sib6Present) == 1,
		sib7_present: db.get_i64(Param::Sib7Present) == 1,
		sib8,
		sib1_alloc,
		sib_alloc,
		n_ant: db.get_i64(Param::NAnt) as u8,
		n_id_cell: db.get_i64(Param::NIdCell) as u16,
		n_rb_dl,
		n_rb_ul: db.get_i64(Param::NRbUl) as u32,
		n_sc_rb_dl: db.get_i64(Param::NScRbDl) as u32,
		n_sc_rb_ul: db.get_i64(Param::NScRbUl) as u32,
		si_periodicity_t: SI_PERIODICITY[si_periodicity_idx],
		si_win_len: SI_WINDOW_LEN[si_window_idx],
		mcc,
		mnc,
		mnc_two_digits,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rrc::msg::unpack_bcch_dlsch_msg;

	#[test]
	fn snapshot_carries_packed_broadcast_payloads() {
		let db = ConfigDb::new();
		db.construct_sys_info();
		let si = db.sys_info();
		assert_eq!(si.mib_payload.len(), 3);
		assert!(!si.sib1_alloc.payload.is_empty());
		assert_eq!(si.sib1_alloc.rnti, SI_RNTI);
		assert_eq!(si.sib_alloc.len(), 1);

		let decoded = unpack_bcch_dlsch_msg(&si.sib1_alloc.payload).unwrap();
		assert_eq!(decoded, BcchDlSchMessage::Sib1(si.sib1.clone()));
	}

	#[test]
	fn optional_sibs_map_two_per_slot() {
		let db = ConfigDb::new();
		db.set_param_i64(Param::Sib3Present, 1).unwrap();
		db.set_param_i64(Param::Sib4Present, 1).unwrap();
		db.set_param_i64(Param::Sib8Present, 1).unwrap();
		db.construct_sys_info();
		let si = db.sys_info();
		// Slot 0 holds SIB2 alone at 10 MHz; three extras fill two slots.
		assert_eq!(si.sib1.sched_info.len(), 3);
		assert_eq!(si.sib1.sched_info[0].sib_mapping.len(), 0);
		assert_eq!(si.sib1.sched_info[1].sib_mapping, vec![3, 4]);
		assert_eq!(si.sib1.sched_info[2].sib_mapping, vec![8]);
		assert_eq!(si.sib_alloc.len(), 3);
	}

	#[test]
	fn narrowband_cell_packs_the_first_extra_sib_with_sib2() {
		let db = ConfigDb::new();
		db.set_param_f64(Param::Bandwidth, 1.4).unwrap();
		db.set_param_i64(Param::Sib3Present, 1).unwrap();
		db.construct_sys_info();
		let si = db.sys_info();
		assert_eq!(si.sib1.sched_info.len(), 1);
		assert_eq!(si.sib1.sched_info[0].sib_mapping, vec![3]);
	}

	#[test]
	fn hooks_see_every_commit() {
		use std::sync::atomic::{AtomicU32, Ordering};
		use std::sync::Arc;

		let db = ConfigDb::new();
		let seen = Arc::new(AtomicU32::new(0));
		let seen_hook = Arc::clone(&seen);
		db.on_sys_info(Box::new(move |_si| {
			seen_hook.fetch_add(1, Ordering::Relaxed);
		}));
		// Registration replays the current snapshot once.
		assert_eq!(seen.load(Ordering::Relaxed), 1);
		db.construct_sys_info();
		assert_eq!(seen.load(Ordering::Relaxed), 2);
	}
}
