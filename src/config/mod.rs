// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide parameter store.
//!
//! Every parameter has a typed slot, bounds, and `dynamic`/`read_only`
//! flags. Writes validate, commit, cascade into dependent parameters, and
//! rewrite the flat config file when persistence is on. The system
//! information constructor lives in [`sysinfo`].

pub mod sysinfo;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use log::{info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::logging;
use crate::rrc::msg::DlBandwidth;
use sysinfo::SysInfo;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Param {
	Bandwidth,
	FreqBand,
	DlEarfcn,
	UlEarfcn,
	DlCenterFreq,
	UlCenterFreq,
	NRbDl,
	NRbUl,
	DlBw,
	NScRbDl,
	NScRbUl,
	NAnt,
	NIdCell,
	NId2,
	NId1,
	Mcc,
	Mnc,
	CellId,
	TrackingAreaCode,
	QRxLevMin,
	P0NominalPusch,
	P0NominalPucch,
	Sib3Present,
	QHyst,
	Sib4Present,
	Sib5Present,
	Sib6Present,
	Sib7Present,
	Sib8Present,
	SearchWinSize,
	SystemInfoValueTag,
	SystemInfoWindowLength,
	PhichResource,
	NSchedInfo,
	SystemInfoPeriodicity,
	DebugType,
	DebugLevel,
	EnablePcap,
	IpAddrStart,
	DnsAddr,
	UseCnfgFile,
	UseUserFile,
	TxGain,
	RxGain,
}

pub const PARAMS: [Param; 44] = [
	Param::Bandwidth,
	Param::FreqBand,
	Param::DlEarfcn,
	Param::UlEarfcn,
	Param::DlCenterFreq,
	Param::UlCenterFreq,
	Param::NRbDl,
	Param::NRbUl,
	Param::DlBw,
	Param::NScRbDl,
	Param::NScRbUl,
	Param::NAnt,
	Param::NIdCell,
	Param::NId2,
	Param::NId1,
	Param::Mcc,
	Param::Mnc,
	Param::CellId,
	Param::TrackingAreaCode,
	Param::QRxLevMin,
	Param::P0NominalPusch,
	Param::P0NominalPucch,
	Param::Sib3Present,
	Param::QHyst,
	Param::Sib4Present,
	Param::Sib5Present,
	Param::Sib6Present,
	Param::Sib7Present,
	Param::Sib8Present,
	Param::SearchWinSize,
	Param::SystemInfoValueTag,
	Param::SystemInfoWindowLength,
	Param::PhichResource,
	Param::NSchedInfo,
	Param::SystemInfoPeriodicity,
	Param::DebugType,
	Param::DebugLevel,
	Param::EnablePcap,
	Param::IpAddrStart,
	Param::DnsAddr,
	Param::UseCnfgFile,
	Param::UseUserFile,
	Param::TxGain,
	Param::RxGain,
];

impl Param {
	pub fn name(self) -> &'static str {
		match self {
			Param::Bandwidth => "bandwidth",
			Param::FreqBand => "band",
			Param::DlEarfcn => "dl_earfcn",
			Param::UlEarfcn => "ul_earfcn",
			Param::DlCenterFreq => "dl_center_freq",
			Param::UlCenterFreq => "ul_center_freq",
			Param::NRbDl => "n_rb_dl",
			Param::NRbUl => "n_rb_ul",
			Param::DlBw => "dl_bw",
			Param::NScRbDl => "n_sc_rb_dl",
			Param::NScRbUl => "n_sc_rb_ul",
			Param::NAnt => "n_ant",
			Param::NIdCell => "n_id_cell",
			Param::NId2 => "n_id_2",
			Param::NId1 => "n_id_1",
			Param::Mcc => "mcc",
			Param::Mnc => "mnc",
			Param::CellId => "cell_id",
			Param::TrackingAreaCode => "tracking_area_code",
			Param::QRxLevMin => "q_rx_lev_min",
			Param::P0NominalPusch => "p0_nominal_pusch",
			Param::P0NominalPucch => "p0_nominal_pucch",
			Param::Sib3Present => "sib3_present",
			Param::QHyst => "q_hyst",
			Param::Sib4Present => "sib4_present",
			Param::Sib5Present => "sib5_present",
			Param::Sib6Present => "sib6_present",
			Param::Sib7Present => "sib7_present",
			Param::Sib8Present => "sib8_present",
			Param::SearchWinSize => "search_win_size",
			Param::SystemInfoValueTag => "system_info_value_tag",
			Param::SystemInfoWindowLength => "system_info_window_length",
			Param::PhichResource => "phich_resource",
			Param::NSchedInfo => "n_sched_info",
			Param::SystemInfoPeriodicity => "system_info_periodicity",
			Param::DebugType => "debug_type",
			Param::DebugLevel => "debug_level",
			Param::EnablePcap => "enable_pcap",
			Param::IpAddrStart => "ip_addr_start",
			Param::DnsAddr => "dns_addr",
			Param::UseCnfgFile => "use_cnfg_file",
			Param::UseUserFile => "use_user_file",
			Param::TxGain => "tx_gain",
			Param::RxGain => "rx_gain",
		}
	}

	pub fn from_name(name: &str) -> Option<Param> {
		PARAMS.iter().copied().find(|param| param.name() == name)
	}
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
	Double(f64),
	Int64(i64),
	/// Opaque fields, printed as hex in the config file.
	Uint32(u32),
}

#[derive(Copy, Clone, Debug)]
struct Meta {
	double_bounds: (f64, f64),
	int64_bounds: (i64, i64),
	/// Bounds are an enumerated set rather than a range.
	special_bounds: Option<&'static [f64]>,
	dynamic: bool,
	read_only: bool,
}

impl Default for Meta {
	fn default() -> Meta {
		Meta {
			double_bounds: (f64::MIN, f64::MAX),
			int64_bounds: (i64::MIN, i64::MAX),
			special_bounds: None,
			dynamic: false,
			read_only: false,
		}
	}
}

const BANDWIDTHS: [f64; 6] = [1.4, 3.0, 5.0, 10.0, 15.0, 20.0];
const Q_HYST_SET: [f64; 16] = [
	0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0, 20.0, 22.0, 24.0,
];

/// FDD band plan subset: (band, f_dl_low Hz, n_offs_dl, n_dl_max, f_ul_low Hz).
const BANDS: [(i64, u64, u32, u32, u64); 4] = [
	(1, 2_110_000_000, 0, 599, 1_920_000_000),
	(3, 1_805_000_000, 1200, 1949, 1_710_000_000),
	(7, 2_620_000_000, 2750, 3449, 2_500_000_000),
	(20, 791_000_000, 6150, 6449, 832_000_000),
];

/// DL to UL EARFCN distance for FDD.
const EARFCN_UL_OFFSET: u32 = 18000;

fn meta_for(param: Param) -> Meta {
	match param {
		Param::Bandwidth => Meta {
			special_bounds: Some(&BANDWIDTHS),
			..Meta::default()
		},
		Param::FreqBand => Meta {
			int64_bounds: (1, 20),
			..Meta::default()
		},
		Param::DlEarfcn => Meta {
			int64_bounds: (0, 6449),
			..Meta::default()
		},
		Param::UlEarfcn | Param::DlCenterFreq | Param::UlCenterFreq | Param::NRbDl
		| Param::NRbUl | Param::DlBw | Param::NScRbDl | Param::NScRbUl | Param::NIdCell => Meta {
			read_only: true,
			..Meta::default()
		},
		Param::NAnt => Meta {
			int64_bounds: (1, 4),
			..Meta::default()
		},
		Param::NId2 => Meta {
			int64_bounds: (0, 2),
			..Meta::default()
		},
		Param::NId1 => Meta {
			int64_bounds: (0, 167),
			..Meta::default()
		},
		Param::CellId => Meta {
			int64_bounds: (0, 268_435_455),
			..Meta::default()
		},
		Param::TrackingAreaCode => Meta {
			int64_bounds: (0, 65535),
			..Meta::default()
		},
		Param::QRxLevMin => Meta {
			int64_bounds: (-70, -22),
			..Meta::default()
		},
		Param::P0NominalPusch => Meta {
			int64_bounds: (-126, 24),
			dynamic: true,
			..Meta::default()
		},
		Param::P0NominalPucch => Meta {
			int64_bounds: (-127, -96),
			dynamic: true,
			..Meta::default()
		},
		Param::Sib3Present | Param::Sib4Present | Param::Sib5Present | Param::Sib6Present
		| Param::Sib7Present | Param::Sib8Present | Param::UseCnfgFile | Param::UseUserFile
		| Param::EnablePcap => Meta {
			int64_bounds: (0, 1),
			dynamic: true,
			..Meta::default()
		},
		Param::QHyst => Meta {
			special_bounds: Some(&Q_HYST_SET),
			dynamic: true,
			..Meta::default()
		},
		Param::SearchWinSize => Meta {
			int64_bounds: (0, 15),
			dynamic: true,
			..Meta::default()
		},
		Param::SystemInfoValueTag => Meta {
			int64_bounds: (0, 31),
			dynamic: true,
			..Meta::default()
		},
		Param::SystemInfoWindowLength => Meta {
			int64_bounds: (0, 6),
			..Meta::default()
		},
		Param::PhichResource => Meta {
			int64_bounds: (0, 3),
			..Meta::default()
		},
		Param::NSchedInfo => Meta {
			read_only: true,
			..Meta::default()
		},
		Param::SystemInfoPeriodicity => Meta {
			int64_bounds: (0, 6),
			..Meta::default()
		},
		Param::DebugType => Meta {
			dynamic: true,
			..Meta::default()
		},
		Param::DebugLevel => Meta {
			dynamic: true,
			..Meta::default()
		},
		Param::IpAddrStart | Param::DnsAddr | Param::Mcc | Param::Mnc => Meta::default(),
		Param::TxGain | Param::RxGain => Meta {
			int64_bounds: (0, 100),
			dynamic: true,
			..Meta::default()
		},
	}
}

fn var_type(param: Param) -> Value {
	match param {
		Param::Bandwidth | Param::DlCenterFreq | Param::UlCenterFreq | Param::QHyst => {
			Value::Double(0.0)
		}
		Param::Mcc | Param::Mnc | Param::SystemInfoValueTag | Param::DebugType
		| Param::DebugLevel | Param::IpAddrStart | Param::DnsAddr => Value::Uint32(0),
		_ => Value::Int64(0),
	}
}

pub type SysInfoHook = Box<dyn Fn(&SysInfo) + Send + Sync>;

pub struct ConfigDb {
	values: Mutex<HashMap<Param, Value>>,
	sys_info: Mutex<SysInfo>,
	hooks: Mutex<Vec<SysInfoHook>>,
	cnfg_file: Mutex<Option<PathBuf>>,
	started: AtomicBool,
}

impl ConfigDb {
	pub fn new() -> Arc<ConfigDb> {
		let db = ConfigDb {
			values: Mutex::new(HashMap::new()),
			sys_info: Mutex::new(SysInfo::default()),
			hooks: Mutex::new(Vec::new()),
			cnfg_file: Mutex::new(None),
			started: AtomicBool::new(false),
		};
		db.load_defaults();
		Arc::new(db)
	}

	fn load_defaults(&self) {
		let mut values = self.values.lock();
		values.insert(Param::Bandwidth, Value::Double(10.0));
		values.insert(Param::FreqBand, Value::Int64(1));
		values.insert(Param::DlEarfcn, Value::Int64(300));
		values.insert(Param::UlEarfcn, Value::Int64(300 + EARFCN_UL_OFFSET as i64));
		values.insert(Param::DlCenterFreq, Value::Double(0.0));
		values.insert(Param::UlCenterFreq, Value::Double(0.0));
		values.insert(Param::NRbDl, Value::Int64(50));
		values.insert(Param::NRbUl, Value::Int64(50));
		values.insert(Param::DlBw, Value::Int64(DlBandwidth::N50 as i64));
		values.insert(Param::NScRbDl, Value::Int64(12));
		values.insert(Param::NScRbUl, Value::Int64(12));
		values.insert(Param::NAnt, Value::Int64(1));
		values.insert(Param::NIdCell, Value::Int64(0));
		values.insert(Param::NId2, Value::Int64(0));
		values.insert(Param::NId1, Value::Int64(0));
		values.insert(Param::Mcc, Value::Uint32(0xF001));
		values.insert(Param::Mnc, Value::Uint32(0xFF01));
		values.insert(Param::CellId, Value::Int64(0));
		values.insert(Param::TrackingAreaCode, Value::Int64(0));
		values.insert(Param::QRxLevMin, Value::Int64(-70));
		values.insert(Param::P0NominalPusch, Value::Int64(-70));
		values.insert(Param::P0NominalPucch, Value::Int64(-96));
		values.insert(Param::Sib3Present, Value::Int64(0));
		values.insert(Param::QHyst, Value::Double(0.0));
		values.insert(Param::Sib4Present, Value::Int64(0));
		values.insert(Param::Sib5Present, Value::Int64(0));
		values.insert(Param::Sib6Present, Value::Int64(0));
		values.insert(Param::Sib7Present, Value::Int64(0));
		values.insert(Param::Sib8Present, Value::Int64(0));
		values.insert(Param::SearchWinSize, Value::Int64(0));
		values.insert(Param::SystemInfoValueTag, Value::Uint32(0));
		values.insert(Param::SystemInfoWindowLength, Value::Int64(1));
		values.insert(Param::PhichResource, Value::Int64(1));
		values.insert(Param::NSchedInfo, Value::Int64(1));
		values.insert(Param::SystemInfoPeriodicity, Value::Int64(0));
		values.insert(Param::DebugType, Value::Uint32(0xF));
		values.insert(Param::DebugLevel, Value::Uint32((1 << logging::N_FACILITIES) - 1));
		values.insert(Param::EnablePcap, Value::Int64(0));
		values.insert(Param::IpAddrStart, Value::Uint32(0xC0A8_0101));
		values.insert(Param::DnsAddr, Value::Uint32(0x0808_0808));
		values.insert(Param::UseCnfgFile, Value::Int64(0));
		values.insert(Param::UseUserFile, Value::Int64(0));
		values.insert(Param::TxGain, Value::Int64(0));
		values.insert(Param::RxGain, Value::Int64(0));
	}

	pub fn set_started(&self, started: bool) {
		self.started.store(started, Ordering::Relaxed);
	}

	fn check_writable(&self, param: Param, meta: &Meta) -> Result<()> {
		if meta.read_only {
			return Err(Error::ReadOnly);
		}
		if self.started.load(Ordering::Relaxed) && !meta.dynamic {
			warn!(target: "iface", "{} is not dynamic", param.name());
			return Err(Error::NotDynamic);
		}
		Ok(())
	}

	pub fn set_param_f64(&self, param: Param, value: f64) -> Result<()> {
		let meta = meta_for(param);
		self.check_writable(param, &meta)?;
		if let Some(set) = meta.special_bounds {
			if !set.iter().any(|allowed| (allowed - value).abs() < 1e-9) {
				return Err(Error::OutOfBounds);
			}
		} else if value < meta.double_bounds.0 || value > meta.double_bounds.1 {
			return Err(Error::OutOfBounds);
		}
		self.commit(param, Value::Double(value));
		Ok(())
	}

	pub fn set_param_i64(&self, param: Param, value: i64) -> Result<()> {
		let meta = meta_for(param);
		self.check_writable(param, &meta)?;
		if value < meta.int64_bounds.0 || value > meta.int64_bounds.1 {
			return Err(Error::OutOfBounds);
		}
		self.commit(param, Value::Int64(value));
		Ok(())
	}

	pub fn set_param_u32(&self, param: Param, value: u32) -> Result<()> {
		let meta = meta_for(param);
		self.check_writable(param, &meta)?;
		self.commit(param, Value::Uint32(value));
		Ok(())
	}

	/// Parse a textual value against the parameter's slot type; used by the
	/// config file replay.
	pub fn set_param_str(&self, param: Param, value: &str) -> Result<()> {
		match var_type(param) {
			Value::Double(_) => {
				let parsed = value
					.parse::<f64>()
					.map_err(|e| Error::Exception(e.to_string()))?;
				self.set_param_f64(param, parsed)
			}
			Value::Int64(_) => {
				let parsed = value
					.parse::<i64>()
					.map_err(|e| Error::Exception(e.to_string()))?;
				self.set_param_i64(param, parsed)
			}
			Value::Uint32(_) => {
				let parsed = u32::from_str_radix(value, 16)
					.map_err(|e| Error::Exception(e.to_string()))?;
				self.set_param_u32(param, parsed)
			}
		}
	}

	fn commit(&self, param: Param, value: Value) {
		self.values.lock().insert(param, value);
		self.cascade(param);
		if param == Param::DebugType {
			if let Some(Value::Uint32(mask)) = self.raw(Param::DebugType) {
				logging::set_severity_mask(mask);
			}
		}
		if param == Param::DebugLevel {
			if let Some(Value::Uint32(mask)) = self.raw(Param::DebugLevel) {
				logging::set_facility_mask(mask);
			}
		}
		if self.get_i64(Param::UseCnfgFile) == 1 {
			self.write_cnfg_file();
		}
	}

	/// Recompute parameters derived from the one just written.
	fn cascade(&self, param: Param) {
		match param {
			Param::Bandwidth => {
				let mhz = self.get_f64(Param::Bandwidth);
				if let Some(bw) = DlBandwidth::from_mhz(mhz) {
					let mut values = self.values.lock();
					values.insert(Param::NRbDl, Value::Int64(i64::from(bw.n_rb())));
					values.insert(Param::NRbUl, Value::Int64(i64::from(bw.n_rb())));
					values.insert(Param::DlBw, Value::Int64(bw as i64));
					values.insert(Param::NScRbDl, Value::Int64(12));
					values.insert(Param::NScRbUl, Value::Int64(12));
				}
			}
			Param::DlEarfcn | Param::FreqBand => {
				let band = self.get_i64(Param::FreqBand);
				let dl_earfcn = self.get_i64(Param::DlEarfcn) as u32;
				if let Some((_, f_dl_low, n_offs_dl, _, f_ul_low)) =
					BANDS.iter().copied().find(|entry| entry.0 == band)
				{
					let ul_earfcn = dl_earfcn + EARFCN_UL_OFFSET;
					let dl_freq =
						f_dl_low as f64 + 100_000.0 * f64::from(dl_earfcn.saturating_sub(n_offs_dl));
					let ul_freq = f_ul_low as f64
						+ 100_000.0 * f64::from(dl_earfcn.saturating_sub(n_offs_dl));
					let mut values = self.values.lock();
					values.insert(Param::UlEarfcn, Value::Int64(i64::from(ul_earfcn)));
					values.insert(Param::DlCenterFreq, Value::Double(dl_freq));
					values.insert(Param::UlCenterFreq, Value::Double(ul_freq));
				}
			}
			Param::NId1 | Param::NId2 => {
				let n_id_cell = 3 * self.get_i64(Param::NId1) + self.get_i64(Param::NId2);
				self.values.lock().insert(Param::NIdCell, Value::Int64(n_id_cell));
			}
			_ => {}
		}
	}

	fn raw(&self, param: Param) -> Option<Value> {
		self.values.lock().get(&param).copied()
	}

	pub fn get_f64(&self, param: Param) -> f64 {
		match self.raw(param) {
			Some(Value::Double(v)) => v,
			Some(Value::Int64(v)) => v as f64,
			Some(Value::Uint32(v)) => f64::from(v),
			None => 0.0,
		}
	}

	pub fn get_i64(&self, param: Param) -> i64 {
		match self.raw(param) {
			Some(Value::Int64(v)) => v,
			Some(Value::Double(v)) => v as i64,
			Some(Value::Uint32(v)) => i64::from(v),
			None => 0,
		}
	}

	pub fn get_u32(&self, param: Param) -> u32 {
		match self.raw(param) {
			Some(Value::Uint32(v)) => v,
			Some(Value::Int64(v)) => v as u32,
			Some(Value::Double(v)) => v as u32,
			None => 0,
		}
	}

	// ---- system information ----

	/// Layers register here; every snapshot commit replays into each hook.
	pub fn on_sys_info(&self, hook: SysInfoHook) {
		let snapshot = self.sys_info.lock().clone();
		hook(&snapshot);
		self.hooks.lock().push(hook);
	}

	/// Rebuild the broadcast bundle from the current parameters and push a
	/// consistent snapshot into every registered layer.
	pub fn construct_sys_info(&self) {
		let snapshot = sysinfo::build(self);
		*self.sys_info.lock() = snapshot.clone();
		for hook in self.hooks.lock().iter() {
			hook(&snapshot);
		}
	}

	pub fn sys_info(&self) -> SysInfo {
		self.sys_info.lock().clone()
	}

	// ---- config file ----

	pub fn set_cnfg_file(&self, path: Option<PathBuf>) {
		*self.cnfg_file.lock() = path;
	}

	/// Replay the flat file line-by-line through the validated set path.
	pub fn read_cnfg_file(&self) {
		let Some(path) = self.cnfg_file.lock().clone() else {
			return;
		};
		let Ok(file) = std::fs::File::open(&path) else {
			return;
		};
		for line in std::io::BufReader::new(file).lines().map_while(|l| l.ok()) {
			let mut fields = line.split_whitespace();
			let (Some(name), Some(value)) = (fields.next(), fields.next()) else {
				continue;
			};
			let Some(param) = Param::from_name(name) else {
				warn!(target: "iface", "unknown config parameter {name}");
				continue;
			};
			if meta_for(param).read_only {
				continue;
			}
			if let Err(err) = self.set_param_str(param, value) {
				warn!(target: "iface", "config replay {name}={value}: {err}");
			}
		}
		info!(target: "iface", "configuration loaded from {}", path.display());
	}

	fn write_cnfg_file(&self) {
		let Some(path) = self.cnfg_file.lock().clone() else {
			return;
		};
		let mut out = String::new();
		for param in PARAMS {
			let line = match self.raw(param) {
				Some(Value::Double(v)) => format!("{} {}\n", param.name(), v),
				Some(Value::Int64(v)) => format!("{} {}\n", param.name(), v),
				Some(Value::Uint32(v)) => format!("{} {:x}\n", param.name(), v),
				None => continue,
			};
			out.push_str(&line);
		}
		if let Ok(mut file) = std::fs::File::create(&path) {
			let _ = file.write_all(out.as_bytes());
		}
	}

	/// Numeric MCC/MNC decoded from their BCD parameter slots.
	pub fn plmn(&self) -> (u16, u16, bool) {
		let mcc_bcd = self.get_u32(Param::Mcc);
		let mnc_bcd = self.get_u32(Param::Mnc);
		let mut mcc = 0u16;
		for i in 0..3 {
			mcc = mcc * 10 + ((mcc_bcd >> ((2 - i) * 4)) & 0xF) as u16;
		}
		let two_digits = (mnc_bcd >> 8) & 0xF == 0xF;
		let mut mnc = 0u16;
		if two_digits {
			for i in 0..2 {
				mnc = mnc * 10 + ((mnc_bcd >> ((1 - i) * 4)) & 0xF) as u16;
			}
		} else {
			for i in 0..3 {
				mnc = mnc * 10 + ((mnc_bcd >> ((2 - i) * 4)) & 0xF) as u16;
			}
		}
		(mcc, mnc, two_digits)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bandwidth_cascades_into_rb_counts() {
		let db = ConfigDb::new();
		db.set_param_f64(Param::Bandwidth, 5.0).unwrap();
		assert_eq!(db.get_i64(Param::NRbDl), 25);
		assert_eq!(db.get_i64(Param::NRbUl), 25);
		assert_eq!(db.get_i64(Param::DlBw), DlBandwidth::N25 as i64);
	}

	#[test]
	fn bandwidth_rejects_values_outside_the_set() {
		let db = ConfigDb::new();
		assert_eq!(db.set_param_f64(Param::Bandwidth, 7.0), Err(Error::OutOfBounds));
	}

	#[test]
	fn earfcn_cascades_into_frequencies() {
		let db = ConfigDb::new();
		db.set_param_i64(Param::DlEarfcn, 300).unwrap();
		assert_eq!(db.get_i64(Param::UlEarfcn), 18300);
		assert!((db.get_f64(Param::DlCenterFreq) - 2_140_000_000.0).abs() < 1.0);
		assert!((db.get_f64(Param::UlCenterFreq) - 1_950_000_000.0).abs() < 1.0);
	}

	#[test]
	fn read_only_parameters_reject_writes() {
		let db = ConfigDb::new();
		assert_eq!(db.set_param_i64(Param::NRbDl, 100), Err(Error::ReadOnly));
	}

	#[test]
	fn non_dynamic_parameters_lock_after_start() {
		let db = ConfigDb::new();
		db.set_param_i64(Param::NId1, 5).unwrap();
		db.set_started(true);
		assert_eq!(db.set_param_i64(Param::NId1, 6), Err(Error::NotDynamic));
		// Dynamic parameters stay writable.
		db.set_param_i64(Param::TxGain, 30).unwrap();
	}

	#[test]
	fn cell_identity_folds_from_its_parts() {
		let db = ConfigDb::new();
		db.set_param_i64(Param::NId1, 12).unwrap();
		db.set_param_i64(Param::NId2, 2).unwrap();
		assert_eq!(db.get_i64(Param::NIdCell), 38);
	}

	#[test]
	fn plmn_decoding_handles_two_digit_mnc() {
		let db = ConfigDb::new();
		assert_eq!(db.plmn(), (1, 1, true));
		db.set_param_u32(Param::Mnc, 0x023).unwrap();
		assert_eq!(db.plmn(), (1, 23, false));
	}

	#[test]
	fn cnfg_file_round_trip() {
		let dir = std::env::temp_dir().join("ferrolte-cnfg-test");
		let _ = std::fs::create_dir_all(&dir);
		let path = dir.join("enb.conf");
		let _ = std::fs::remove_file(&path);

		let db = ConfigDb::new();
		db.set_cnfg_file(Some(path.clone()));
		db.set_param_i64(Param::UseCnfgFile, 1).unwrap();
		db.set_param_i64(Param::TrackingAreaCode, 777).unwrap();

		let fresh = ConfigDb::new();
		fresh.set_cnfg_file(Some(path.clone()));
		fresh.read_cnfg_file();
		assert_eq!(fresh.get_i64(Param::TrackingAreaCode), 777);
		let _ = std::fs::remove_file(&path);
	}
}
