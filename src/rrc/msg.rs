//! RRC message codec.
//!
//! Covers the CCCH/DCCH procedures and the BCCH broadcast set this cell
//! uses. Packing is MSB-first with explicit choice indices and presence
//! bits; `unpack(pack(m)) == m` holds for every message constructed here.

use crate::bits::{BitReader, BitWriter};
use crate::error::{Error, Result};

/// Downlink bandwidth in resource blocks, as carried in the MIB.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DlBandwidth {
	N6 = 0,
	N15,
	N25,
	N50,
	N75,
	N100,
}

impl DlBandwidth {
	pub fn n_rb(self) -> u32 {
		match self {
			DlBandwidth::N6 => 6,
			DlBandwidth::N15 => 15,
			DlBandwidth::N25 => 25,
			DlBandwidth::N50 => 50,
			DlBandwidth::N75 => 75,
			DlBandwidth::N100 => 100,
		}
	}

	pub fn from_mhz(mhz: f64) -> Option<DlBandwidth> {
		Some(match mhz {
			x if (x - 1.4).abs() < 1e-9 => DlBandwidth::N6,
			x if (x - 3.0).abs() < 1e-9 => DlBandwidth::N15,
			x if (x - 5.0).abs() < 1e-9 => DlBandwidth::N25,
			x if (x - 10.0).abs() < 1e-9 => DlBandwidth::N50,
			x if (x - 15.0).abs() < 1e-9 => DlBandwidth::N75,
			x if (x - 20.0).abs() < 1e-9 => DlBandwidth::N100,
			_ => return None,
		})
	}

	fn from_bits(bits: u32) -> DlBandwidth {
		match bits {
			0 => DlBandwidth::N6,
			1 => DlBandwidth::N15,
			2 => DlBandwidth::N25,
			3 => DlBandwidth::N50,
			4 => DlBandwidth::N75,
			_ => DlBandwidth::N100,
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mib {
	pub dl_bw: DlBandwidth,
	pub phich_duration_normal: bool,
	/// PHICH resource index (one of four ratios).
	pub phich_resource: u8,
	/// Eight MSBs of the system frame number.
	pub sfn_msb: u8,
}

pub fn pack_mib(mib: &Mib) -> Vec<u8> {
	let mut w = BitWriter::new();
	w.write(mib.dl_bw as u32, 3);
	w.write_bool(mib.phich_duration_normal);
	w.write(u32::from(mib.phich_resource), 2);
	w.write(u32::from(mib.sfn_msb), 8);
	w.write(0, 10); // spare
	w.into_bytes()
}

pub fn unpack_mib(data: &[u8]) -> Result<Mib> {
	let mut r = BitReader::new(data);
	let mib = Mib {
		dl_bw: DlBandwidth::from_bits(r.read(3)?),
		phich_duration_normal: r.read_bool()?,
		phich_resource: r.read(2)? as u8,
		sfn_msb: r.read(8)? as u8,
	};
	r.read(10)?;
	Ok(mib)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedInfo {
	/// SI periodicity exponent: periodicity = 8 << idx radio frames.
	pub si_periodicity_idx: u8,
	/// Mapped SIB types (3..=8); SIB2 is implicit in the first entry.
	pub sib_mapping: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sib1 {
	pub mcc: u16,
	pub mnc: u16,
	pub mnc_two_digits: bool,
	pub tracking_area_code: u16,
	pub cell_id: u32,
	pub cell_barred: bool,
	pub intra_freq_reselection: bool,
	pub q_rx_lev_min: i16,
	pub p_max: i8,
	pub freq_band_indicator: u8,
	pub sched_info: Vec<SchedInfo>,
	/// SI window length in subframes.
	pub si_window_length: u8,
	pub system_info_value_tag: u8,
}

fn pack_sib1(w: &mut BitWriter, sib1: &Sib1) {
	w.write(u32::from(sib1.mcc), 10);
	w.write(u32::from(sib1.mnc), 10);
	w.write_bool(sib1.mnc_two_digits);
	w.write(u32::from(sib1.tracking_area_code), 16);
	w.write(sib1.cell_id, 28);
	w.write_bool(sib1.cell_barred);
	w.write_bool(sib1.intra_freq_reselection);
	w.write((sib1.q_rx_lev_min + 70) as u32, 6);
	w.write((i32::from(sib1.p_max) + 30) as u32, 6);
	w.write(u32::from(sib1.freq_band_indicator), 6);
	w.write(sib1.sched_info.len() as u32, 5);
	for info in &sib1.sched_info {
		w.write(u32::from(info.si_periodicity_idx), 3);
		w.write(info.sib_mapping.len() as u32, 5);
		for sib_type in &info.sib_mapping {
			w.write(u32::from(*sib_type), 4);
		}
	}
	w.write(u32::from(sib1.si_window_length), 4);
	w.write(u32::from(sib1.system_info_value_tag), 5);
}

fn unpack_sib1(r: &mut BitReader<'_>) -> Result<Sib1> {
	let mcc = r.read(10)? as u16;
	let mnc = r.read(10)? as u16;
	let mnc_two_digits = r.read_bool()?;
	let tracking_area_code = r.read(16)? as u16;
	let cell_id = r.read(28)?;
	let cell_barred = r.read_bool()?;
	let intra_freq_reselection = r.read_bool()?;
	let q_rx_lev_min = r.read(6)? as i16 - 70;
	let p_max = (r.read(6)? as i32 - 30) as i8;
	let freq_band_indicator = r.read(6)? as u8;
	let n_sched = r.read(5)? as usize;
	let mut sched_info = Vec::with_capacity(n_sched);
	for _ in 0..n_sched {
		let si_periodicity_idx = r.read(3)? as u8;
		let n_map = r.read(5)? as usize;
		let mut sib_mapping = Vec::with_capacity(n_map);
		for _ in 0..n_map {
			sib_mapping.push(r.read(4)? as u8);
		}
		sched_info.push(SchedInfo {
			si_periodicity_idx,
			sib_mapping,
		});
	}
	Ok(Sib1 {
		mcc,
		mnc,
		mnc_two_digits,
		tracking_area_code,
		cell_id,
		cell_barred,
		intra_freq_reselection,
		q_rx_lev_min,
		p_max,
		freq_band_indicator,
		sched_info,
		si_window_length: r.read(4)? as u8,
		system_info_value_tag: r.read(5)? as u8,
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RachConfigCommon {
	pub num_ra_preambles_idx: u8,
	pub pwr_ramping_step_idx: u8,
	pub preamble_init_target_pwr_idx: u8,
	pub preamble_trans_max_idx: u8,
	/// RA response window size in subframes.
	pub ra_resp_win_size: u8,
	pub mac_con_res_timer_idx: u8,
	pub max_harq_msg3_tx: u8,
}

impl Default for RachConfigCommon {
	fn default() -> RachConfigCommon {
		RachConfigCommon {
			num_ra_preambles_idx: 0,
			pwr_ramping_step_idx: 3,
			preamble_init_target_pwr_idx: 10,
			preamble_trans_max_idx: 10,
			ra_resp_win_size: 7,
			mac_con_res_timer_idx: 5,
			max_harq_msg3_tx: 1,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PucchConfigCommon {
	pub delta_pucch_shift_idx: u8,
	pub n_rb_cqi: u8,
	pub n_cs_an: u8,
	pub n1_pucch_an: u16,
}

impl Default for PucchConfigCommon {
	fn default() -> PucchConfigCommon {
		PucchConfigCommon {
			delta_pucch_shift_idx: 0,
			n_rb_cqi: 0,
			n_cs_an: 0,
			n1_pucch_an: 0,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sib2 {
	pub rach: RachConfigCommon,
	pub bcch_mod_period_coeff_idx: u8,
	pub default_paging_cycle_idx: u8,
	pub nb_idx: u8,
	pub prach_root_seq_idx: u16,
	pub prach_config_idx: u8,
	pub prach_high_speed: bool,
	pub prach_zero_corr_zone: u8,
	pub prach_freq_offset: u8,
	pub pdsch_rs_power: i8,
	pub pdsch_p_b: u8,
	pub pusch_n_sb: u8,
	pub pusch_hopping_offset: u8,
	pub pusch_enable_64qam: bool,
	pub pucch: PucchConfigCommon,
	pub p0_nominal_pusch: i16,
	pub p0_nominal_pucch: i16,
	pub ul_cp_length_idx: u8,
	pub t300_idx: u8,
	pub t301_idx: u8,
	pub t310_idx: u8,
	pub n310_idx: u8,
	pub t311_idx: u8,
	pub n311_idx: u8,
	pub additional_spectrum_emission: u8,
	pub time_alignment_timer_idx: u8,
}

impl Default for Sib2 {
	fn default() -> Sib2 {
		Sib2 {
			rach: RachConfigCommon::default(),
			bcch_mod_period_coeff_idx: 0,
			default_paging_cycle_idx: 2,
			nb_idx: 2,
			prach_root_seq_idx: 0,
			prach_config_idx: 0,
			prach_high_speed: false,
			prach_zero_corr_zone: 1,
			prach_freq_offset: 0,
			pdsch_rs_power: 0,
			pdsch_p_b: 0,
			pusch_n_sb: 1,
			pusch_hopping_offset: 0,
			pusch_enable_64qam: true,
			pucch: PucchConfigCommon::default(),
			p0_nominal_pusch: -70,
			p0_nominal_pucch: -96,
			ul_cp_length_idx: 0,
			t300_idx: 5,
			t301_idx: 5,
			t310_idx: 5,
			n310_idx: 5,
			t311_idx: 4,
			n311_idx: 0,
			additional_spectrum_emission: 1,
			time_alignment_timer_idx: 6,
		}
	}
}

fn pack_sib2(w: &mut BitWriter, sib2: &Sib2) {
	w.write(u32::from(sib2.rach.num_ra_preambles_idx), 4);
	w.write(u32::from(sib2.rach.pwr_ramping_step_idx), 2);
	w.write(u32::from(sib2.rach.preamble_init_target_pwr_idx), 4);
	w.write(u32::from(sib2.rach.preamble_trans_max_idx), 4);
	w.write(u32::from(sib2.rach.ra_resp_win_size), 4);
	w.write(u32::from(sib2.rach.mac_con_res_timer_idx), 3);
	w.write(u32::from(sib2.rach.max_harq_msg3_tx), 3);
	w.write(u32::from(sib2.bcch_mod_period_coeff_idx), 2);
	w.write(u32::from(sib2.default_paging_cycle_idx), 2);
	w.write(u32::from(sib2.nb_idx), 3);
	w.write(u32::from(sib2.prach_root_seq_idx), 10);
	w.write(u32::from(sib2.prach_config_idx), 6);
	w.write_bool(sib2.prach_high_speed);
	w.write(u32::from(sib2.prach_zero_corr_zone), 4);
	w.write(u32::from(sib2.prach_freq_offset), 7);
	w.write((i32::from(sib2.pdsch_rs_power) + 60) as u32, 7);
	w.write(u32::from(sib2.pdsch_p_b), 2);
	w.write(u32::from(sib2.pusch_n_sb), 2);
	w.write(u32::from(sib2.pusch_hopping_offset), 7);
	w.write_bool(sib2.pusch_enable_64qam);
	w.write(u32::from(sib2.pucch.delta_pucch_shift_idx), 2);
	w.write(u32::from(sib2.pucch.n_rb_cqi), 7);
	w.write(u32::from(sib2.pucch.n_cs_an), 3);
	w.write(u32::from(sib2.pucch.n1_pucch_an), 11);
	w.write((i32::from(sib2.p0_nominal_pusch) + 126) as u32, 8);
	w.write((i32::from(sib2.p0_nominal_pucch) + 127) as u32, 5);
	w.write(u32::from(sib2.ul_cp_length_idx), 1);
	w.write(u32::from(sib2.t300_idx), 3);
	w.write(u32::from(sib2.t301_idx), 3);
	w.write(u32::from(sib2.t310_idx), 3);
	w.write(u32::from(sib2.n310_idx), 3);
	w.write(u32::from(sib2.t311_idx), 3);
	w.write(u32::from(sib2.n311_idx), 3);
	w.write(u32::from(sib2.additional_spectrum_emission), 5);
	w.write(u32::from(sib2.time_alignment_timer_idx), 3);
}

fn unpack_sib2(r: &mut BitReader<'_>) -> Result<Sib2> {
	Ok(Sib2 {
		rach: RachConfigCommon {
			num_ra_preambles_idx: r.read(4)? as u8,
			pwr_ramping_step_idx: r.read(2)? as u8,
			preamble_init_target_pwr_idx: r.read(4)? as u8,
			preamble_trans_max_idx: r.read(4)? as u8,
			ra_resp_win_size: r.read(4)? as u8,
			mac_con_res_timer_idx: r.read(3)? as u8,
			max_harq_msg3_tx: r.read(3)? as u8,
		},
		bcch_mod_period_coeff_idx: r.read(2)? as u8,
		default_paging_cycle_idx: r.read(2)? as u8,
		nb_idx: r.read(3)? as u8,
		prach_root_seq_idx: r.read(10)? as u16,
		prach_config_idx: r.read(6)? as u8,
		prach_high_speed: r.read_bool()?,
		prach_zero_corr_zone: r.read(4)? as u8,
		prach_freq_offset: r.read(7)? as u8,
		pdsch_rs_power: (r.read(7)? as i32 - 60) as i8,
		pdsch_p_b: r.read(2)? as u8,
		pusch_n_sb: r.read(2)? as u8,
		pusch_hopping_offset: r.read(7)? as u8,
		pusch_enable_64qam: r.read_bool()?,
		pucch: PucchConfigCommon {
			delta_pucch_shift_idx: r.read(2)? as u8,
			n_rb_cqi: r.read(7)? as u8,
			n_cs_an: r.read(3)? as u8,
			n1_pucch_an: r.read(11)? as u16,
		},
		p0_nominal_pusch: (r.read(8)? as i32 - 126) as i16,
		p0_nominal_pucch: (r.read(5)? as i32 - 127) as i16,
		ul_cp_length_idx: r.read(1)? as u8,
		t300_idx: r.read(3)? as u8,
		t301_idx: r.read(3)? as u8,
		t310_idx: r.read(3)? as u8,
		n310_idx: r.read(3)? as u8,
		t311_idx: r.read(3)? as u8,
		n311_idx: r.read(3)? as u8,
		additional_spectrum_emission: r.read(5)? as u8,
		time_alignment_timer_idx: r.read(3)? as u8,
	})
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sib3 {
	pub q_hyst_idx: u8,
	pub q_rx_lev_min: i16,
	pub p_max: i8,
	pub t_resel_eutra: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sib8 {
	pub search_win_size: u8,
}

/// Broadcast blocks beyond SIB1; the skeleton SIBs carry their one live
/// parameter each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sib {
	Sib2(Sib2),
	Sib3(Sib3),
	Sib4,
	Sib5,
	Sib6 { t_resel_utra: u8 },
	Sib7 { t_resel_geran: u8 },
	Sib8(Sib8),
}

impl Sib {
	pub fn type_num(&self) -> u8 {
		match self {
			Sib::Sib2(_) => 2,
			Sib::Sib3(_) => 3,
			Sib::Sib4 => 4,
			Sib::Sib5 => 5,
			Sib::Sib6 { .. } => 6,
			Sib::Sib7 { .. } => 7,
			Sib::Sib8(_) => 8,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BcchDlSchMessage {
	Sib1(Sib1),
	SystemInformation { sibs: Vec<Sib> },
}

pub fn pack_bcch_dlsch_msg(msg: &BcchDlSchMessage) -> Vec<u8> {
	let mut w = BitWriter::new();
	match msg {
		BcchDlSchMessage::Sib1(sib1) => {
			w.write_bool(true);
			pack_sib1(&mut w, sib1);
		}
		BcchDlSchMessage::SystemInformation { sibs } => {
			w.write_bool(false);
			w.write(sibs.len() as u32, 5);
			for sib in sibs {
				w.write(u32::from(sib.type_num()), 4);
				match sib {
					Sib::Sib2(sib2) => pack_sib2(&mut w, sib2),
					Sib::Sib3(sib3) => {
						w.write(u32::from(sib3.q_hyst_idx), 4);
						w.write((sib3.q_rx_lev_min + 70) as u32, 6);
						w.write((i32::from(sib3.p_max) + 30) as u32, 6);
						w.write(u32::from(sib3.t_resel_eutra), 3);
					}
					Sib::Sib4 | Sib::Sib5 => {}
					Sib::Sib6 { t_resel_utra } => w.write(u32::from(*t_resel_utra), 3),
					Sib::Sib7 { t_resel_geran } => w.write(u32::from(*t_resel_geran), 3),
					Sib::Sib8(sib8) => w.write(u32::from(sib8.search_win_size), 4),
				}
			}
		}
	}
	w.into_bytes()
}

pub fn unpack_bcch_dlsch_msg(data: &[u8]) -> Result<BcchDlSchMessage> {
	let mut r = BitReader::new(data);
	if r.read_bool()? {
		return Ok(BcchDlSchMessage::Sib1(unpack_sib1(&mut r)?));
	}
	let n_sibs = r.read(5)? as usize;
	let mut sibs = Vec::with_capacity(n_sibs);
	for _ in 0..n_sibs {
		let sib = match r.read(4)? {
			2 => Sib::Sib2(unpack_sib2(&mut r)?),
			3 => Sib::Sib3(Sib3 {
				q_hyst_idx: r.read(4)? as u8,
				q_rx_lev_min: r.read(6)? as i16 - 70,
				p_max: (r.read(6)? as i32 - 30) as i8,
				t_resel_eutra: r.read(3)? as u8,
			}),
			4 => Sib::Sib4,
			5 => Sib::Sib5,
			6 => Sib::Sib6 {
				t_resel_utra: r.read(3)? as u8,
			},
			7 => Sib::Sib7 {
				t_resel_geran: r.read(3)? as u8,
			},
			8 => Sib::Sib8(Sib8 {
				search_win_size: r.read(4)? as u8,
			}),
			_ => return Err(Error::InvalidParam),
		};
		sibs.push(sib);
	}
	Ok(BcchDlSchMessage::SystemInformation { sibs })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct STmsi {
	pub mmec: u8,
	pub m_tmsi: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConReqUeId {
	STmsi(STmsi),
	/// 40-bit random value.
	Random(u64),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConRequest {
	pub ue_id: ConReqUeId,
	pub cause: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConReestRequest {
	pub c_rnti: u16,
	pub pci: u16,
	pub short_mac_i: u16,
	pub cause: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UlCcchMessage {
	ConRequest(ConRequest),
	ConReestRequest(ConReestRequest),
}

pub fn pack_ul_ccch_msg(msg: &UlCcchMessage) -> Vec<u8> {
	let mut w = BitWriter::new();
	match msg {
		UlCcchMessage::ConRequest(req) => {
			w.write(0, 2);
			match req.ue_id {
				ConReqUeId::STmsi(s_tmsi) => {
					w.write_bool(false);
					w.write(u32::from(s_tmsi.mmec), 8);
					w.write(s_tmsi.m_tmsi, 32);
				}
				ConReqUeId::Random(value) => {
					w.write_bool(true);
					w.write_u64(value, 40);
				}
			}
			w.write(u32::from(req.cause), 3);
		}
		UlCcchMessage::ConReestRequest(req) => {
			w.write(1, 2);
			w.write(u32::from(req.c_rnti), 16);
			w.write(u32::from(req.pci), 9);
			w.write(u32::from(req.short_mac_i), 16);
			w.write(u32::from(req.cause), 2);
		}
	}
	w.into_bytes()
}

pub fn unpack_ul_ccch_msg(data: &[u8]) -> Result<UlCcchMessage> {
	let mut r = BitReader::new(data);
	match r.read(2)? {
		0 => {
			let ue_id = if r.read_bool()? {
				ConReqUeId::Random(r.read_u64(40)?)
			} else {
				ConReqUeId::STmsi(STmsi {
					mmec: r.read(8)? as u8,
					m_tmsi: r.read(32)?,
				})
			};
			Ok(UlCcchMessage::ConRequest(ConRequest {
				ue_id,
				cause: r.read(3)? as u8,
			}))
		}
		1 => Ok(UlCcchMessage::ConReestRequest(ConReestRequest {
			c_rnti: r.read(16)? as u16,
			pci: r.read(9)? as u16,
			short_mac_i: r.read(16)? as u16,
			cause: r.read(2)? as u8,
		})),
		_ => Err(Error::InvalidParam),
	}
}

/// Dedicated scheduling-request resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SrConfig {
	pub i_sr: u8,
	pub n_1_pucch_sr: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhysicalConfigDedicated {
	pub sr_config: Option<SrConfig>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DrbToAdd {
	pub eps_bearer_id: u8,
	pub drb_id: u8,
	pub lc_id: u8,
	pub log_chan_group: u8,
}

/// The dedicated radio resource configuration this cell hands out: SRBs
/// with the default RLC/logical channel profile, AM DRBs with the fixed
/// t_poll_retx 45 ms / t_reordering 35 ms profile, and the dedicated
/// PUCCH-SR resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RadioResourceConfigDedicated {
	pub srb_to_add: Vec<u8>,
	pub drb_to_add: Vec<DrbToAdd>,
	pub phy_config: PhysicalConfigDedicated,
}

fn pack_rr_config(w: &mut BitWriter, config: &RadioResourceConfigDedicated) {
	w.write(config.srb_to_add.len() as u32, 2);
	for srb_id in &config.srb_to_add {
		w.write(u32::from(*srb_id), 2);
	}
	w.write(config.drb_to_add.len() as u32, 3);
	for drb in &config.drb_to_add {
		w.write(u32::from(drb.eps_bearer_id), 4);
		w.write(u32::from(drb.drb_id), 5);
		w.write(u32::from(drb.lc_id), 5);
		w.write(u32::from(drb.log_chan_group), 2);
	}
	match config.phy_config.sr_config {
		Some(sr) => {
			w.write_bool(true);
			w.write(u32::from(sr.i_sr), 8);
			w.write(u32::from(sr.n_1_pucch_sr), 11);
		}
		None => w.write_bool(false),
	}
}

fn unpack_rr_config(r: &mut BitReader<'_>) -> Result<RadioResourceConfigDedicated> {
	let n_srb = r.read(2)? as usize;
	let mut srb_to_add = Vec::with_capacity(n_srb);
	for _ in 0..n_srb {
		srb_to_add.push(r.read(2)? as u8);
	}
	let n_drb = r.read(3)? as usize;
	let mut drb_to_add = Vec::with_capacity(n_drb);
	for _ in 0..n_drb {
		drb_to_add.push(DrbToAdd {
			eps_bearer_id: r.read(4)? as u8,
			drb_id: r.read(5)? as u8,
			lc_id: r.read(5)? as u8,
			log_chan_group: r.read(2)? as u8,
		});
	}
	let sr_config = if r.read_bool()? {
		Some(SrConfig {
			i_sr: r.read(8)? as u8,
			n_1_pucch_sr: r.read(11)? as u16,
		})
	} else {
		None
	};
	Ok(RadioResourceConfigDedicated {
		srb_to_add,
		drb_to_add,
		phy_config: PhysicalConfigDedicated { sr_config },
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DlCcchMessage {
	ConSetup {
		rrc_transaction_id: u8,
		config: RadioResourceConfigDedicated,
	},
	ConReest {
		rrc_transaction_id: u8,
		config: RadioResourceConfigDedicated,
	},
	ConReestReject,
}

pub fn pack_dl_ccch_msg(msg: &DlCcchMessage) -> Vec<u8> {
	let mut w = BitWriter::new();
	match msg {
		DlCcchMessage::ConSetup {
			rrc_transaction_id,
			config,
		} => {
			w.write(0, 2);
			w.write(u32::from(*rrc_transaction_id), 2);
			pack_rr_config(&mut w, config);
		}
		DlCcchMessage::ConReest {
			rrc_transaction_id,
			config,
		} => {
			w.write(1, 2);
			w.write(u32::from(*rrc_transaction_id), 2);
			pack_rr_config(&mut w, config);
		}
		DlCcchMessage::ConReestReject => w.write(2, 2),
	}
	w.into_bytes()
}

pub fn unpack_dl_ccch_msg(data: &[u8]) -> Result<DlCcchMessage> {
	let mut r = BitReader::new(data);
	match r.read(2)? {
		0 => Ok(DlCcchMessage::ConSetup {
			rrc_transaction_id: r.read(2)? as u8,
			config: unpack_rr_config(&mut r)?,
		}),
		1 => Ok(DlCcchMessage::ConReest {
			rrc_transaction_id: r.read(2)? as u8,
			config: unpack_rr_config(&mut r)?,
		}),
		2 => Ok(DlCcchMessage::ConReestReject),
		_ => Err(Error::InvalidParam),
	}
}

fn pack_octet_string(w: &mut BitWriter, data: &[u8]) {
	w.write(data.len() as u32, 16);
	w.write_bytes(data);
}

fn unpack_octet_string(r: &mut BitReader<'_>) -> Result<Vec<u8>> {
	let len = r.read(16)? as usize;
	r.read_bytes(len)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UlDcchMessage {
	ConReestComplete {
		rrc_transaction_id: u8,
	},
	ConReconfigComplete {
		rrc_transaction_id: u8,
	},
	ConSetupComplete {
		rrc_transaction_id: u8,
		selected_plmn_id: u8,
		dedicated_info_nas: Vec<u8>,
	},
	SecurityModeComplete {
		rrc_transaction_id: u8,
	},
	SecurityModeFailure {
		rrc_transaction_id: u8,
	},
	UeCapabilityInfo {
		rrc_transaction_id: u8,
		capabilities: Vec<u8>,
	},
	UlInfoTransfer {
		dedicated_info_nas: Vec<u8>,
	},
}

pub fn pack_ul_dcch_msg(msg: &UlDcchMessage) -> Vec<u8> {
	let mut w = BitWriter::new();
	match msg {
		UlDcchMessage::ConReestComplete { rrc_transaction_id } => {
			w.write(0, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
		}
		UlDcchMessage::ConReconfigComplete { rrc_transaction_id } => {
			w.write(1, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
		}
		UlDcchMessage::ConSetupComplete {
			rrc_transaction_id,
			selected_plmn_id,
			dedicated_info_nas,
		} => {
			w.write(2, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
			w.write(u32::from(*selected_plmn_id), 3);
			pack_octet_string(&mut w, dedicated_info_nas);
		}
		UlDcchMessage::SecurityModeComplete { rrc_transaction_id } => {
			w.write(3, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
		}
		UlDcchMessage::SecurityModeFailure { rrc_transaction_id } => {
			w.write(4, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
		}
		UlDcchMessage::UeCapabilityInfo {
			rrc_transaction_id,
			capabilities,
		} => {
			w.write(5, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
			pack_octet_string(&mut w, capabilities);
		}
		UlDcchMessage::UlInfoTransfer { dedicated_info_nas } => {
			w.write(6, 4);
			pack_octet_string(&mut w, dedicated_info_nas);
		}
	}
	w.into_bytes()
}

pub fn unpack_ul_dcch_msg(data: &[u8]) -> Result<UlDcchMessage> {
	let mut r = BitReader::new(data);
	Ok(match r.read(4)? {
		0 => UlDcchMessage::ConReestComplete {
			rrc_transaction_id: r.read(2)? as u8,
		},
		1 => UlDcchMessage::ConReconfigComplete {
			rrc_transaction_id: r.read(2)? as u8,
		},
		2 => UlDcchMessage::ConSetupComplete {
			rrc_transaction_id: r.read(2)? as u8,
			selected_plmn_id: r.read(3)? as u8,
			dedicated_info_nas: unpack_octet_string(&mut r)?,
		},
		3 => UlDcchMessage::SecurityModeComplete {
			rrc_transaction_id: r.read(2)? as u8,
		},
		4 => UlDcchMessage::SecurityModeFailure {
			rrc_transaction_id: r.read(2)? as u8,
		},
		5 => UlDcchMessage::UeCapabilityInfo {
			rrc_transaction_id: r.read(2)? as u8,
			capabilities: unpack_octet_string(&mut r)?,
		},
		6 => UlDcchMessage::UlInfoTransfer {
			dedicated_info_nas: unpack_octet_string(&mut r)?,
		},
		_ => return Err(Error::InvalidParam),
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DlDcchMessage {
	DlInfoTransfer {
		rrc_transaction_id: u8,
		dedicated_info_nas: Vec<u8>,
	},
	ConReconfig {
		rrc_transaction_id: u8,
		dedicated_info_nas: Option<Vec<u8>>,
		config: Option<RadioResourceConfigDedicated>,
	},
	ConRelease {
		rrc_transaction_id: u8,
		release_cause: u8,
	},
	SecurityModeCommand {
		rrc_transaction_id: u8,
		cipher_alg: u8,
		integrity_alg: u8,
	},
	UeCapabilityEnquiry {
		rrc_transaction_id: u8,
		rat_types: Vec<u8>,
	},
}

pub fn pack_dl_dcch_msg(msg: &DlDcchMessage) -> Vec<u8> {
	let mut w = BitWriter::new();
	match msg {
		DlDcchMessage::DlInfoTransfer {
			rrc_transaction_id,
			dedicated_info_nas,
		} => {
			w.write(0, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
			pack_octet_string(&mut w, dedicated_info_nas);
		}
		DlDcchMessage::ConReconfig {
			rrc_transaction_id,
			dedicated_info_nas,
			config,
		} => {
			w.write(1, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
			match dedicated_info_nas {
				Some(nas) => {
					w.write_bool(true);
					pack_octet_string(&mut w, nas);
				}
				None => w.write_bool(false),
			}
			match config {
				Some(config) => {
					w.write_bool(true);
					pack_rr_config(&mut w, config);
				}
				None => w.write_bool(false),
			}
		}
		DlDcchMessage::ConRelease {
			rrc_transaction_id,
			release_cause,
		} => {
			w.write(2, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
			w.write(u32::from(*release_cause), 2);
		}
		DlDcchMessage::SecurityModeCommand {
			rrc_transaction_id,
			cipher_alg,
			integrity_alg,
		} => {
			w.write(3, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
			w.write(u32::from(*cipher_alg), 4);
			w.write(u32::from(*integrity_alg), 4);
		}
		DlDcchMessage::UeCapabilityEnquiry {
			rrc_transaction_id,
			rat_types,
		} => {
			w.write(4, 4);
			w.write(u32::from(*rrc_transaction_id), 2);
			w.write(rat_types.len() as u32, 3);
			for rat in rat_types {
				w.write(u32::from(*rat), 3);
			}
		}
	}
	w.into_bytes()
}

pub fn unpack_dl_dcch_msg(data: &[u8]) -> Result<DlDcchMessage> {
	let mut r = BitReader::new(data);
	Ok(match r.read(4)? {
		0 => DlDcchMessage::DlInfoTransfer {
			rrc_transaction_id: r.read(2)? as u8,
			dedicated_info_nas: unpack_octet_string(&mut r)?,
		},
		1 => {
			let rrc_transaction_id = r.read(2)? as u8;
			let dedicated_info_nas = if r.read_bool()? {
				Some(unpack_octet_string(&mut r)?)
			} else {
				None
			};
			let config = if r.read_bool()? {
				Some(unpack_rr_config(&mut r)?)
			} else {
				None
			};
			DlDcchMessage::ConReconfig {
				rrc_transaction_id,
				dedicated_info_nas,
				config,
			}
		}
		2 => DlDcchMessage::ConRelease {
			rrc_transaction_id: r.read(2)? as u8,
			release_cause: r.read(2)? as u8,
		},
		3 => DlDcchMessage::SecurityModeCommand {
			rrc_transaction_id: r.read(2)? as u8,
			cipher_alg: r.read(4)? as u8,
			integrity_alg: r.read(4)? as u8,
		},
		4 => {
			let rrc_transaction_id = r.read(2)? as u8;
			let n_rats = r.read(3)? as usize;
			let mut rat_types = Vec::with_capacity(n_rats);
			for _ in 0..n_rats {
				rat_types.push(r.read(3)? as u8);
			}
			DlDcchMessage::UeCapabilityEnquiry {
				rrc_transaction_id,
				rat_types,
			}
		}
		_ => return Err(Error::InvalidParam),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mib_round_trip() {
		let mib = Mib {
			dl_bw: DlBandwidth::N50,
			phich_duration_normal: true,
			phich_resource: 1,
			sfn_msb: 0x5a,
		};
		assert_eq!(unpack_mib(&pack_mib(&mib)).unwrap(), mib);
		assert_eq!(pack_mib(&mib).len(), 3);
	}

	#[test]
	fn sib1_round_trip() {
		let sib1 = Sib1 {
			mcc: 1,
			mnc: 1,
			mnc_two_digits: true,
			tracking_area_code: 1,
			cell_id: 0x1a2b3c,
			cell_barred: false,
			intra_freq_reselection: true,
			q_rx_lev_min: -65,
			p_max: 23,
			freq_band_indicator: 7,
			sched_info: vec![
				SchedInfo {
					si_periodicity_idx: 0,
					sib_mapping: vec![],
				},
				SchedInfo {
					si_periodicity_idx: 0,
					sib_mapping: vec![3, 8],
				},
			],
			si_window_length: 2,
			system_info_value_tag: 11,
		};
		let packed = pack_bcch_dlsch_msg(&BcchDlSchMessage::Sib1(sib1.clone()));
		assert_eq!(unpack_bcch_dlsch_msg(&packed).unwrap(), BcchDlSchMessage::Sib1(sib1));
	}

	#[test]
	fn system_information_round_trip() {
		let msg = BcchDlSchMessage::SystemInformation {
			sibs: vec![
				Sib::Sib2(Sib2::default()),
				Sib::Sib3(Sib3 {
					q_hyst_idx: 4,
					q_rx_lev_min: -65,
					p_max: 23,
					t_resel_eutra: 0,
				}),
				Sib::Sib8(Sib8 { search_win_size: 9 }),
			],
		};
		assert_eq!(unpack_bcch_dlsch_msg(&pack_bcch_dlsch_msg(&msg)).unwrap(), msg);
	}

	#[test]
	fn ul_ccch_round_trip() {
		let req = UlCcchMessage::ConRequest(ConRequest {
			ue_id: ConReqUeId::STmsi(STmsi { mmec: 0, m_tmsi: 42 }),
			cause: 4,
		});
		assert_eq!(unpack_ul_ccch_msg(&pack_ul_ccch_msg(&req)).unwrap(), req);

		let reest = UlCcchMessage::ConReestRequest(ConReestRequest {
			c_rnti: 70,
			pci: 123,
			short_mac_i: 0xbeef,
			cause: 1,
		});
		assert_eq!(unpack_ul_ccch_msg(&pack_ul_ccch_msg(&reest)).unwrap(), reest);
	}

	#[test]
	fn dl_ccch_round_trip() {
		let msg = DlCcchMessage::ConSetup {
			rrc_transaction_id: 1,
			config: RadioResourceConfigDedicated {
				srb_to_add: vec![1],
				drb_to_add: vec![],
				phy_config: PhysicalConfigDedicated {
					sr_config: Some(SrConfig {
						i_sr: 15,
						n_1_pucch_sr: 1,
					}),
				},
			},
		};
		assert_eq!(unpack_dl_ccch_msg(&pack_dl_ccch_msg(&msg)).unwrap(), msg);
	}

	#[test]
	fn dcch_round_trips() {
		let setup_complete = UlDcchMessage::ConSetupComplete {
			rrc_transaction_id: 1,
			selected_plmn_id: 0,
			dedicated_info_nas: vec![0x07, 0x41, 0x01],
		};
		assert_eq!(
			unpack_ul_dcch_msg(&pack_ul_dcch_msg(&setup_complete)).unwrap(),
			setup_complete
		);

		let reconfig = DlDcchMessage::ConReconfig {
			rrc_transaction_id: 2,
			dedicated_info_nas: Some(vec![0x27, 0x01]),
			config: Some(RadioResourceConfigDedicated {
				srb_to_add: vec![2],
				drb_to_add: vec![DrbToAdd {
					eps_bearer_id: 5,
					drb_id: 1,
					lc_id: 3,
					log_chan_group: 2,
				}],
				phy_config: PhysicalConfigDedicated {
					sr_config: Some(SrConfig {
						i_sr: 16,
						n_1_pucch_sr: 1,
					}),
				},
			}),
		};
		assert_eq!(unpack_dl_dcch_msg(&pack_dl_dcch_msg(&reconfig)).unwrap(), reconfig);

		let sec = DlDcchMessage::SecurityModeCommand {
			rrc_transaction_id: 0,
			cipher_alg: 0,
			integrity_alg: 2,
		};
		assert_eq!(unpack_dl_dcch_msg(&pack_dl_dcch_msg(&sec)).unwrap(), sec);
	}
}
