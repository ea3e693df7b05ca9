//! RLC PDU codec: AMD, UMD and status PDUs in 36.322 layout.

use crate::bits::{BitReader, BitWriter};
use crate::error::{Error, Result};

pub const AM_SN_MOD: u16 = 1024;
pub const UM_SN_MOD: u8 = 32;

/// Framing info: first/last bits of the carried SDU segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FramingInfo {
	FullSdu = 0b00,
	FirstSegment = 0b01,
	LastSegment = 0b10,
	MiddleSegment = 0b11,
}

impl FramingInfo {
	fn from_bits(bits: u32) -> FramingInfo {
		match bits {
			0b00 => FramingInfo::FullSdu,
			0b01 => FramingInfo::FirstSegment,
			0b10 => FramingInfo::LastSegment,
			_ => FramingInfo::MiddleSegment,
		}
	}

	pub fn first(self) -> bool {
		matches!(self, FramingInfo::FullSdu | FramingInfo::FirstSegment)
	}

	pub fn last(self) -> bool {
		matches!(self, FramingInfo::FullSdu | FramingInfo::LastSegment)
	}

	pub fn from_flags(first: bool, last: bool) -> FramingInfo {
		match (first, last) {
			(true, true) => FramingInfo::FullSdu,
			(true, false) => FramingInfo::FirstSegment,
			(false, true) => FramingInfo::LastSegment,
			(false, false) => FramingInfo::MiddleSegment,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmdPdu {
	/// Retransmission flag.
	pub rf: bool,
	/// Polling bit: the receiver owes a status report.
	pub p: bool,
	pub fi: FramingInfo,
	pub sn: u16,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusPdu {
	/// SN of the next expected in-sequence PDU.
	pub ack_sn: u16,
	pub nack_sn: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UmdPdu {
	pub fi: FramingInfo,
	pub sn: u8,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AmPdu {
	Amd(AmdPdu),
	Status(StatusPdu),
}

pub fn pack_amd(pdu: &AmdPdu) -> Vec<u8> {
	let mut w = BitWriter::new();
	w.write_bool(true); // D/C = data
	w.write_bool(pdu.rf);
	w.write_bool(pdu.p);
	w.write(pdu.fi as u32, 2);
	w.write_bool(false); // E = no extension headers
	w.write(u32::from(pdu.sn), 10);
	w.write_bytes(&pdu.data);
	w.into_bytes()
}

pub fn pack_status(pdu: &StatusPdu) -> Vec<u8> {
	let mut w = BitWriter::new();
	w.write_bool(false); // D/C = control
	w.write(0, 3); // CPT = status
	w.write(u32::from(pdu.ack_sn), 10);
	for sn in &pdu.nack_sn {
		w.write_bool(true); // E1
		w.write(u32::from(*sn), 10);
		w.write_bool(false); // E2
	}
	w.write_bool(false); // E1
	w.into_bytes()
}

/// Distinguish data and control PDUs on an AM bearer and decode.
pub fn unpack_am(data: &[u8]) -> Result<AmPdu> {
	let mut r = BitReader::new(data);
	if r.read_bool()? {
		let rf = r.read_bool()?;
		let p = r.read_bool()?;
		let fi = FramingInfo::from_bits(r.read(2)?);
		let ext = r.read_bool()?;
		if ext {
			return Err(Error::InvalidParam);
		}
		let sn = r.read(10)? as u16;
		let data = r.read_bytes(r.bits_left() / 8)?;
		Ok(AmPdu::Amd(AmdPdu { rf, p, fi, sn, data }))
	} else {
		if r.read(3)? != 0 {
			return Err(Error::InvalidParam);
		}
		let ack_sn = r.read(10)? as u16;
		let mut nack_sn = Vec::new();
		while r.read_bool()? {
			nack_sn.push(r.read(10)? as u16);
			if r.read_bool()? {
				// E2 segment offsets are never emitted by this stack.
				return Err(Error::InvalidParam);
			}
		}
		Ok(AmPdu::Status(StatusPdu { ack_sn, nack_sn }))
	}
}

pub fn pack_umd(pdu: &UmdPdu) -> Vec<u8> {
	let mut w = BitWriter::new();
	w.write(pdu.fi as u32, 2);
	w.write_bool(false); // E
	w.write(u32::from(pdu.sn), 5);
	w.write_bytes(&pdu.data);
	w.into_bytes()
}

pub fn unpack_umd(data: &[u8]) -> Result<UmdPdu> {
	let mut r = BitReader::new(data);
	let fi = FramingInfo::from_bits(r.read(2)?);
	let ext = r.read_bool()?;
	if ext {
		return Err(Error::InvalidParam);
	}
	let sn = r.read(5)? as u8;
	let data = r.read_bytes(r.bits_left() / 8)?;
	Ok(UmdPdu { fi, sn, data })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn amd_round_trip() {
		let pdu = AmdPdu {
			rf: false,
			p: true,
			fi: FramingInfo::FirstSegment,
			sn: 1023,
			data: vec![1, 2, 3],
		};
		assert_eq!(unpack_am(&pack_amd(&pdu)).unwrap(), AmPdu::Amd(pdu));
	}

	#[test]
	fn status_round_trip() {
		let pdu = StatusPdu {
			ack_sn: 17,
			nack_sn: vec![12, 14, 15],
		};
		assert_eq!(unpack_am(&pack_status(&pdu)).unwrap(), AmPdu::Status(pdu));

		let empty = StatusPdu {
			ack_sn: 0,
			nack_sn: vec![],
		};
		assert_eq!(unpack_am(&pack_status(&empty)).unwrap(), AmPdu::Status(empty));
	}

	#[test]
	fn umd_round_trip() {
		let pdu = UmdPdu {
			fi: FramingInfo::LastSegment,
			sn: 31,
			data: vec![0xfe; 40],
		};
		assert_eq!(unpack_umd(&pack_umd(&pdu)).unwrap(), pdu);
	}

	#[test]
	fn framing_flags_round_trip() {
		for first in [false, true] {
			for last in [false, true] {
				let fi = FramingInfo::from_flags(first, last);
				assert_eq!(fi.first(), first);
				assert_eq!(fi.last(), last);
			}
		}
	}
}
