// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stack logger behind the `log` facade.
//!
//! Every record is tagged with a facility (the `log` target string) and
//! filtered through two runtime-mutable bitmasks: one over severities, one
//! over facilities. Both masks are wired to the `debug_type` / `debug_level`
//! config parameters.

use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// A subsystem a log record originates from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Facility {
	Radio = 0,
	Phy,
	Mac,
	Rlc,
	Pdcp,
	Rrc,
	Mme,
	Gw,
	User,
	Rb,
	Timer,
	Iface,
	Msgq,
}

pub const N_FACILITIES: usize = 13;

impl Facility {
	pub const fn as_str(self) -> &'static str {
		match self {
			Facility::Radio => "radio",
			Facility::Phy => "phy",
			Facility::Mac => "mac",
			Facility::Rlc => "rlc",
			Facility::Pdcp => "pdcp",
			Facility::Rrc => "rrc",
			Facility::Mme => "mme",
			Facility::Gw => "gw",
			Facility::User => "user",
			Facility::Rb => "rb",
			Facility::Timer => "timer",
			Facility::Iface => "iface",
			Facility::Msgq => "msgq",
		}
	}

	fn from_target(target: &str) -> Option<Facility> {
		Some(match target {
			"radio" => Facility::Radio,
			"phy" => Facility::Phy,
			"mac" => Facility::Mac,
			"rlc" => Facility::Rlc,
			"pdcp" => Facility::Pdcp,
			"rrc" => Facility::Rrc,
			"mme" => Facility::Mme,
			"gw" => Facility::Gw,
			"user" => Facility::User,
			"rb" => Facility::Rb,
			"timer" => Facility::Timer,
			"iface" => Facility::Iface,
			"msgq" => Facility::Msgq,
			_ => return None,
		})
	}
}

fn severity_bit(level: Level) -> u32 {
	match level {
		Level::Error => 1 << 0,
		Level::Warn => 1 << 1,
		Level::Info => 1 << 2,
		Level::Debug | Level::Trace => 1 << 3,
	}
}

pub struct StackLogger {
	severity_mask: AtomicU32,
	facility_mask: AtomicU32,
}

static LOGGER: StackLogger = StackLogger {
	severity_mask: AtomicU32::new(0xF),
	facility_mask: AtomicU32::new((1 << N_FACILITIES as u32) - 1),
};

/// Install the stack logger. Later calls are no-ops; the first install wins.
pub fn init() {
	let _ = log::set_logger(&LOGGER);
	log::set_max_level(LevelFilter::Debug);
}

/// Severity bitmask, bit order error/warning/info/debug.
pub fn set_severity_mask(mask: u32) {
	LOGGER.severity_mask.store(mask & 0xF, Ordering::Relaxed);
}

/// Facility bitmask in `Facility` discriminant order.
pub fn set_facility_mask(mask: u32) {
	LOGGER
		.facility_mask
		.store(mask & ((1 << N_FACILITIES as u32) - 1), Ordering::Relaxed);
}

fn level_style(level: Level) -> anstyle::Style {
	let color = match level {
		Level::Error => anstyle::AnsiColor::Red,
		Level::Warn => anstyle::AnsiColor::Yellow,
		Level::Info => anstyle::AnsiColor::Green,
		Level::Debug | Level::Trace => anstyle::AnsiColor::Cyan,
	};
	anstyle::Style::new().fg_color(Some(color.into()))
}

impl Log for StackLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		if severity_bit(metadata.level()) & self.severity_mask.load(Ordering::Relaxed) == 0 {
			return false;
		}
		match Facility::from_target(metadata.target()) {
			Some(fac) => self.facility_mask.load(Ordering::Relaxed) & (1 << fac as u32) != 0,
			// Records from other crates pass the severity filter only.
			None => true,
		}
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let stderr = std::io::stderr();
		let mut out = stderr.lock();
		if out.is_terminal() {
			let style = level_style(record.level());
			let _ = writeln!(
				out,
				"[{style}{:7}{style:#}][{}] {}",
				record.level(),
				record.target(),
				record.args()
			);
		} else {
			let _ = writeln!(out, "[{:7}][{}] {}", record.level(), record.target(), record.args());
		}
	}

	fn flush(&self) {}
}

/// Render a PDU for the hex dumps that accompany codec-level log lines.
pub fn hexdump(data: &[u8]) -> String {
	use core::fmt::Write as _;

	let mut out = String::with_capacity(data.len() * 3);
	for (i, byte) in data.iter().enumerate() {
		if i != 0 {
			out.push(if i % 16 == 0 { '\n' } else { ' ' });
		}
		let _ = write!(out, "{byte:02x}");
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn facility_round_trip() {
		for fac in [Facility::Radio, Facility::Mac, Facility::Msgq] {
			assert_eq!(Facility::from_target(fac.as_str()), Some(fac));
		}
		assert_eq!(Facility::from_target("nonsense"), None);
	}

	#[test]
	fn hexdump_groups_bytes() {
		assert_eq!(hexdump(&[0xde, 0xad]), "de ad");
	}
}
