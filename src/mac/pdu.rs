//! MAC PDU codec: subheaders, control elements and the random access
//! response, bit-for-bit in 36.321 layout.

use smallvec::SmallVec;

use crate::bits::{BitReader, BitWriter};
use crate::error::{Error, Result};

// DL-SCH LCIDs
pub const LCID_CCCH: u8 = 0;
pub const LCID_DCCH_BEGIN: u8 = 1;
pub const LCID_DCCH_END: u8 = 10;
pub const LCID_UE_CON_RES_ID: u8 = 28;
pub const LCID_TA_COMMAND: u8 = 29;
pub const LCID_PADDING: u8 = 31;

// UL-SCH LCIDs
pub const LCID_EXT_POWER_HEADROOM: u8 = 25;
pub const LCID_POWER_HEADROOM: u8 = 26;
pub const LCID_C_RNTI: u8 = 27;
pub const LCID_TRUNCATED_BSR: u8 = 28;
pub const LCID_SHORT_BSR: u8 = 29;
pub const LCID_LONG_BSR: u8 = 30;

/// Buffer size levels in bytes, 36.321 table 6.1.3.1-1. Entry `i` is the
/// upper bound reported by index `i`; the last index means "more".
const BSR_BUFFER_SIZE: [u32; 64] = [
	0, 10, 12, 14, 17, 19, 22, 26, 31, 36, 42, 49, 57, 67, 78, 91, 107, 125, 146, 171, 200, 234,
	274, 321, 376, 440, 515, 603, 706, 826, 967, 1132, 1326, 1552, 1817, 2127, 2490, 2915, 3413,
	3995, 4677, 5476, 6411, 7505, 8787, 10287, 12043, 14099, 16507, 19325, 22624, 26487, 31009,
	36304, 42502, 49759, 58255, 68201, 79846, 93479, 109439, 128125, 150000, 150001,
];

pub fn bsr_max_bytes(idx: u8) -> u32 {
	BSR_BUFFER_SIZE[idx as usize & 0x3F]
}

pub fn bsr_index_for(bytes: u32) -> u8 {
	BSR_BUFFER_SIZE
		.iter()
		.position(|&bound| bytes <= bound)
		.unwrap_or(BSR_BUFFER_SIZE.len() - 1) as u8
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
	Sdu(Vec<u8>),
	/// UE contention resolution identity, 48 bits.
	ConResId(u64),
	TaCommand(u8),
	CRnti(u16),
	TruncatedBsr { lcg_id: u8, bsr_idx: u8 },
	ShortBsr { lcg_id: u8, bsr_idx: u8 },
	LongBsr { bsr_idx: [u8; 4] },
	PowerHeadroom(u8),
	Padding,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubHeader {
	pub lcid: u8,
	pub payload: Payload,
}

impl SubHeader {
	pub fn sdu(lcid: u8, data: Vec<u8>) -> SubHeader {
		SubHeader {
			lcid,
			payload: Payload::Sdu(data),
		}
	}

	fn body_len(&self) -> usize {
		match &self.payload {
			Payload::Sdu(data) => data.len(),
			Payload::ConResId(_) => 6,
			Payload::TaCommand(_) | Payload::PowerHeadroom(_) => 1,
			Payload::CRnti(_) => 2,
			Payload::TruncatedBsr { .. } | Payload::ShortBsr { .. } => 1,
			Payload::LongBsr { .. } => 3,
			Payload::Padding => 0,
		}
	}

	/// Only SDUs carry a length field in their subheader.
	fn has_length_field(&self) -> bool {
		matches!(self.payload, Payload::Sdu(_))
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MacPdu {
	pub subheaders: SmallVec<[SubHeader; 4]>,
}

impl MacPdu {
	pub fn single_sdu(lcid: u8, data: Vec<u8>) -> MacPdu {
		let mut pdu = MacPdu::default();
		pdu.subheaders.push(SubHeader::sdu(lcid, data));
		pdu
	}

	/// Packed length in bytes of the current subheader set.
	pub fn packed_len(&self) -> usize {
		pack_pdu(self).len()
	}
}

/// Pack header then payloads. Every subheader but the last carries its
/// length field when the payload size is not implied by the LCID.
pub fn pack_pdu(pdu: &MacPdu) -> Vec<u8> {
	let mut w = BitWriter::new();
	let n = pdu.subheaders.len();
	for (i, sub) in pdu.subheaders.iter().enumerate() {
		let last = i == n - 1;
		w.write(0, 2); // R R
		w.write_bool(!last); // E
		w.write(u32::from(sub.lcid), 5);
		if !last && sub.has_length_field() {
			let len = sub.body_len();
			if len < 128 {
				w.write_bool(false); // F
				w.write(len as u32, 7);
			} else {
				w.write_bool(true);
				w.write(len as u32, 15);
			}
		}
	}
	for sub in &pdu.subheaders {
		match &sub.payload {
			Payload::Sdu(data) => w.write_bytes(data),
			Payload::ConResId(id) => w.write_u64(*id, 48),
			Payload::TaCommand(ta) => w.write(u32::from(*ta), 8),
			Payload::CRnti(rnti) => w.write(u32::from(*rnti), 16),
			Payload::TruncatedBsr { lcg_id, bsr_idx } | Payload::ShortBsr { lcg_id, bsr_idx } => {
				w.write(u32::from(*lcg_id), 2);
				w.write(u32::from(*bsr_idx), 6);
			}
			Payload::LongBsr { bsr_idx } => {
				for idx in bsr_idx {
					w.write(u32::from(*idx), 6);
				}
			}
			Payload::PowerHeadroom(ph) => w.write(u32::from(*ph), 8),
			Payload::Padding => {}
		}
	}
	w.into_bytes()
}

struct RawSubHeader {
	lcid: u8,
	length: Option<usize>,
}

/// Parse a transport block into subheaders and payloads. `uplink` selects
/// the UL-SCH interpretation of the shared LCID space.
pub fn unpack_pdu(data: &[u8], uplink: bool) -> Result<MacPdu> {
	let mut r = BitReader::new(data);
	let mut raw: SmallVec<[RawSubHeader; 4]> = SmallVec::new();
	loop {
		r.read(2)?; // R R
		let ext = r.read_bool()?;
		let lcid = r.read(5)? as u8;
		let is_sdu = lcid <= LCID_DCCH_END;
		let length = if ext && is_sdu {
			let f = r.read_bool()?;
			Some(if f { r.read(15)? as usize } else { r.read(7)? as usize })
		} else {
			None
		};
		raw.push(RawSubHeader { lcid, length });
		if !ext {
			break;
		}
	}

	let mut pdu = MacPdu::default();
	let n = raw.len();
	for (i, sub) in raw.iter().enumerate() {
		let last = i == n - 1;
		let payload = match sub.lcid {
			LCID_PADDING => {
				if last {
					// Trailing padding consumes the remainder.
					break;
				}
				Payload::Padding
			}
			lcid if lcid <= LCID_DCCH_END => {
				let len = match sub.length {
					Some(len) => len,
					None => r.bits_left() / 8,
				};
				Payload::Sdu(r.read_bytes(len)?)
			}
			LCID_C_RNTI if uplink => Payload::CRnti(r.read(16)? as u16),
			LCID_TRUNCATED_BSR if uplink => Payload::TruncatedBsr {
				lcg_id: r.read(2)? as u8,
				bsr_idx: r.read(6)? as u8,
			},
			LCID_SHORT_BSR if uplink => Payload::ShortBsr {
				lcg_id: r.read(2)? as u8,
				bsr_idx: r.read(6)? as u8,
			},
			LCID_LONG_BSR if uplink => {
				let mut bsr_idx = [0u8; 4];
				for idx in &mut bsr_idx {
					*idx = r.read(6)? as u8;
				}
				Payload::LongBsr { bsr_idx }
			}
			LCID_POWER_HEADROOM | LCID_EXT_POWER_HEADROOM if uplink => {
				Payload::PowerHeadroom(r.read(8)? as u8)
			}
			LCID_UE_CON_RES_ID if !uplink => Payload::ConResId(r.read_u64(48)?),
			LCID_TA_COMMAND if !uplink => Payload::TaCommand(r.read(8)? as u8),
			_ => return Err(Error::InvalidParam),
		};
		pdu.subheaders.push(SubHeader { lcid: sub.lcid, payload });
	}
	Ok(pdu)
}

/// Random access response, one RAPID entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rar {
	pub rapid: u8,
	pub timing_adv: u16,
	pub hopping: bool,
	/// Resource block assignment of the Msg3 grant.
	pub rba: u16,
	pub mcs: u8,
	pub tpc: u8,
	pub ul_delay: bool,
	pub csi_req: bool,
	pub temp_c_rnti: u16,
}

pub fn pack_rar(rar: &Rar) -> Vec<u8> {
	let mut w = BitWriter::new();
	w.write_bool(false); // E
	w.write_bool(true); // T = RAPID
	w.write(u32::from(rar.rapid), 6);
	w.write_bool(false); // R
	w.write(u32::from(rar.timing_adv), 11);
	w.write_bool(rar.hopping);
	w.write(u32::from(rar.rba), 10);
	w.write(u32::from(rar.mcs), 4);
	w.write(u32::from(rar.tpc), 3);
	w.write_bool(rar.ul_delay);
	w.write_bool(rar.csi_req);
	w.write(u32::from(rar.temp_c_rnti), 16);
	w.into_bytes()
}

pub fn unpack_rar(data: &[u8]) -> Result<Rar> {
	let mut r = BitReader::new(data);
	r.read_bool()?; // E
	if !r.read_bool()? {
		// Backoff-indicator-only responses are never sent by this stack.
		return Err(Error::InvalidParam);
	}
	let rapid = r.read(6)? as u8;
	r.read_bool()?; // R
	Ok(Rar {
		rapid,
		timing_adv: r.read(11)? as u16,
		hopping: r.read_bool()?,
		rba: r.read(10)? as u16,
		mcs: r.read(4)? as u8,
		tpc: r.read(3)? as u8,
		ul_delay: r.read_bool()?,
		csi_req: r.read_bool()?,
		temp_c_rnti: r.read(16)? as u16,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_sdu_round_trip() {
		let pdu = MacPdu::single_sdu(LCID_CCCH, vec![1, 2, 3, 4, 5]);
		let packed = pack_pdu(&pdu);
		assert_eq!(unpack_pdu(&packed, true).unwrap(), pdu);
	}

	#[test]
	fn con_res_id_plus_sdu_round_trip() {
		let mut pdu = MacPdu::default();
		pdu.subheaders.push(SubHeader {
			lcid: LCID_UE_CON_RES_ID,
			payload: Payload::ConResId(0x0000_dead_beef_cafe),
		});
		pdu.subheaders.push(SubHeader::sdu(1, vec![0xaa; 20]));
		let packed = pack_pdu(&pdu);
		assert_eq!(unpack_pdu(&packed, false).unwrap(), pdu);
	}

	#[test]
	fn ul_control_elements_round_trip() {
		let mut pdu = MacPdu::default();
		pdu.subheaders.push(SubHeader {
			lcid: LCID_C_RNTI,
			payload: Payload::CRnti(0x1234),
		});
		pdu.subheaders.push(SubHeader {
			lcid: LCID_SHORT_BSR,
			payload: Payload::ShortBsr { lcg_id: 2, bsr_idx: 17 },
		});
		pdu.subheaders.push(SubHeader::sdu(2, vec![9; 7]));
		let packed = pack_pdu(&pdu);
		assert_eq!(unpack_pdu(&packed, true).unwrap(), pdu);
	}

	#[test]
	fn trailing_padding_is_discarded() {
		let mut pdu = MacPdu::default();
		pdu.subheaders.push(SubHeader::sdu(1, vec![7; 5]));
		pdu.subheaders.push(SubHeader {
			lcid: LCID_PADDING,
			payload: Payload::Padding,
		});
		let mut packed = pack_pdu(&pdu);
		packed.extend_from_slice(&[0, 0, 0]);
		let unpacked = unpack_pdu(&packed, true).unwrap();
		assert_eq!(unpacked.subheaders.len(), 1);
		assert_eq!(unpacked.subheaders[0], SubHeader::sdu(1, vec![7; 5]));
	}

	#[test]
	fn long_sdu_uses_the_15_bit_length() {
		let mut pdu = MacPdu::default();
		pdu.subheaders.push(SubHeader::sdu(3, vec![0x5a; 300]));
		pdu.subheaders.push(SubHeader::sdu(4, vec![0xa5; 2]));
		let packed = pack_pdu(&pdu);
		assert_eq!(unpack_pdu(&packed, true).unwrap(), pdu);
	}

	#[test]
	fn rar_round_trip() {
		let rar = Rar {
			rapid: 17,
			timing_adv: 99,
			hopping: false,
			rba: 0x2a,
			mcs: 4,
			tpc: 3,
			ul_delay: false,
			csi_req: false,
			temp_c_rnti: 73,
		};
		assert_eq!(unpack_rar(&pack_rar(&rar)).unwrap(), rar);
	}

	#[test]
	fn bsr_table_is_monotone() {
		for i in 1..64u8 {
			assert!(bsr_max_bytes(i) > bsr_max_bytes(i - 1));
		}
		assert_eq!(bsr_index_for(0), 0);
		assert_eq!(bsr_index_for(11), 2);
		assert!(bsr_max_bytes(bsr_index_for(5000)) >= 5000);
	}
}
