//! Packet captures: LTE MAC PDUs (DLT 147 with a DCT2000-style
//! per-packet header) and user IP datagrams (DLT 228).

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PcapDirection {
	Uplink = 0,
	Downlink = 1,
}

const MAC_LTE_START: u8 = 0x01;
const MAC_LTE_RNTI_TAG: u8 = 0x02;
const MAC_LTE_UEID_TAG: u8 = 0x03;
const MAC_LTE_SUBFN_TAG: u8 = 0x04;
const MAC_LTE_CRC_STATUS_TAG: u8 = 0x07;
const MAC_LTE_PAYLOAD_TAG: u8 = 0x01;

const RADIO_TYPE_FDD: u8 = 1;
const RNTI_TYPE_C_RNTI: u8 = 3;

fn header(datalink: DataLink) -> PcapHeader {
	PcapHeader {
		version_major: 2,
		version_minor: 4,
		ts_correction: 0,
		ts_accuracy: 0,
		snaplen: 65535,
		datalink,
		ts_resolution: TsResolution::MicroSecond,
		endianness: Endianness::Big,
	}
}

pub struct Pcap {
	lte: Mutex<Option<PcapWriter<File>>>,
	ip: Mutex<Option<PcapWriter<File>>>,
}

impl Pcap {
	/// A disabled capture; all sends are no-ops.
	pub fn disabled() -> Pcap {
		Pcap {
			lte: Mutex::new(None),
			ip: Mutex::new(None),
		}
	}

	pub fn open(lte_path: &Path, ip_path: &Path) -> Result<Pcap> {
		let lte_file =
			File::create(lte_path).map_err(|e| Error::CantStart(e.to_string()))?;
		let ip_file = File::create(ip_path).map_err(|e| Error::CantStart(e.to_string()))?;
		let lte = PcapWriter::with_header(lte_file, header(DataLink::Unknown(147)))
			.map_err(|e| Error::CantStart(e.to_string()))?;
		let ip = PcapWriter::with_header(ip_file, header(DataLink::IPV4))
			.map_err(|e| Error::CantStart(e.to_string()))?;
		Ok(Pcap {
			lte: Mutex::new(Some(lte)),
			ip: Mutex::new(Some(ip)),
		})
	}

	/// Write one MAC PDU with the DCT2000-style context header in front.
	pub fn send_lte_pcap_msg(&self, dir: PcapDirection, rnti: u16, current_tti: u32, pdu: &[u8]) {
		let mut guard = self.lte.lock();
		let Some(writer) = guard.as_mut() else {
			return;
		};
		let mut packet = Vec::with_capacity(16 + pdu.len());
		packet.push(MAC_LTE_START);
		packet.push(RADIO_TYPE_FDD);
		packet.push(dir as u8);
		packet.push(RNTI_TYPE_C_RNTI);
		packet.push(MAC_LTE_RNTI_TAG);
		packet.extend_from_slice(&rnti.to_be_bytes());
		packet.push(MAC_LTE_UEID_TAG);
		packet.extend_from_slice(&rnti.to_be_bytes());
		packet.push(MAC_LTE_SUBFN_TAG);
		packet.extend_from_slice(&((current_tti % 10) as u16).to_be_bytes());
		packet.push(MAC_LTE_CRC_STATUS_TAG);
		packet.push(1);
		packet.push(MAC_LTE_PAYLOAD_TAG);
		packet.extend_from_slice(pdu);

		let ts = Duration::from_millis(u64::from(current_tti));
		let record = PcapPacket::new(ts, packet.len() as u32, &packet);
		if let Err(err) = writer.write_packet(&record) {
			warn!(target: "iface", "LTE pcap write failed: {err}");
		}
	}

	pub fn send_ip_pcap_msg(&self, datagram: &[u8]) {
		let mut guard = self.ip.lock();
		let Some(writer) = guard.as_mut() else {
			return;
		};
		let record = PcapPacket::new(
			Duration::from_millis(0),
			datagram.len() as u32,
			datagram,
		);
		if let Err(err) = writer.write_packet(&record) {
			warn!(target: "iface", "IP pcap write failed: {err}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn disabled_capture_ignores_writes() {
		let pcap = Pcap::disabled();
		pcap.send_lte_pcap_msg(PcapDirection::Downlink, 70, 123, &[1, 2, 3]);
		pcap.send_ip_pcap_msg(&[0x45, 0, 0, 0]);
	}

	#[test]
	fn open_writes_both_captures() {
		let dir = std::env::temp_dir().join("ferrolte-pcap-test");
		let _ = std::fs::create_dir_all(&dir);
		let lte_path = dir.join("lte.pcap");
		let ip_path = dir.join("ip.pcap");

		let pcap = Pcap::open(&lte_path, &ip_path).unwrap();
		pcap.send_lte_pcap_msg(PcapDirection::Uplink, 70, 42, &[0xaa; 8]);
		pcap.send_ip_pcap_msg(&[0x45; 20]);
		drop(pcap);

		// 24-byte global header plus at least one record each.
		assert!(std::fs::metadata(&lte_path).unwrap().len() > 24);
		assert!(std::fs::metadata(&ip_path).unwrap().len() > 24);
		let _ = std::fs::remove_file(&lte_path);
		let _ = std::fs::remove_file(&ip_path);
	}
}
