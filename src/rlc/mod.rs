//! Radio link control: TM, UM and AM bearers.
//!
//! Downlink SDUs from PDCP are segmented into RLC PDUs and queued for MAC;
//! uplink PDUs from MAC are reassembled and handed to PDCP. AM bearers run
//! the status/retransmission machinery on top.

pub mod pdu;

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::config::sysinfo::SysInfo;
use crate::msgq::{Dest, Envelope, Message, Msgq};
use crate::rlc::pdu::{
	pack_amd, pack_status, pack_umd, unpack_am, unpack_umd, AmPdu, AmdPdu, FramingInfo, StatusPdu,
	UmdPdu, AM_SN_MOD, UM_SN_MOD,
};
use crate::user::rb::{RadioBearer, RbId, RlcMode};
use crate::user::UserMgr;

/// Largest payload carried in one AMD/UMD PDU before segmentation.
const SEGMENT_SIZE: usize = 1500;

pub struct Rlc {
	user_mgr: Arc<UserMgr>,
	to_mac: Arc<Msgq>,
	to_pdcp: Arc<Msgq>,
	sys_info: RwLock<SysInfo>,
}

impl Rlc {
	pub fn new(user_mgr: Arc<UserMgr>, to_mac: Arc<Msgq>, to_pdcp: Arc<Msgq>) -> Arc<Rlc> {
		Arc::new(Rlc {
			user_mgr,
			to_mac,
			to_pdcp,
			sys_info: RwLock::new(SysInfo::default()),
		})
	}

	pub fn update_sys_info(&self, sys_info: &SysInfo) {
		*self.sys_info.write() = sys_info.clone();
	}

	pub fn start(
		self: &Arc<Rlc>,
		from_mac: &Arc<Msgq>,
		from_pdcp: &Arc<Msgq>,
	) -> Vec<std::thread::JoinHandle<()>> {
		let rlc = Arc::clone(self);
		let mac_rx = from_mac.attach_rx(0, move |env| rlc.handle_mac_msg(env));
		let rlc = Arc::clone(self);
		let pdcp_rx = from_pdcp.attach_rx(0, move |env| rlc.handle_pdcp_msg(env));
		vec![mac_rx, pdcp_rx]
	}

	fn handle_mac_msg(&self, env: Envelope) {
		if env.dest != Dest::Rlc && env.dest != Dest::Any {
			self.to_pdcp.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::RlcPduReady { rnti, rb } => self.handle_pdu_ready(rnti, rb),
			msg => warn!(target: "rlc", "invalid MAC message {msg:?}"),
		}
	}

	fn handle_pdcp_msg(&self, env: Envelope) {
		if env.dest != Dest::Rlc && env.dest != Dest::Any {
			self.to_mac.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::RlcSduReady { rnti, rb } => self.handle_sdu_ready(rnti, rb),
			msg => warn!(target: "rlc", "invalid PDCP message {msg:?}"),
		}
	}

	// ---- uplink ----

	fn handle_pdu_ready(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "rlc", "PDU for unknown RNTI={rnti}");
			return;
		};
		let mut delivered = false;
		{
			let mut user = user.lock();
			let Some(rb) = user.rb_mut(rb_id) else {
				error!(target: "rlc", "PDU for missing {rb_id} RNTI={rnti}");
				return;
			};
			while let Some(pdu) = rb.pop_rlc_pdu() {
				debug!(target: "rlc", "PDU received RNTI={rnti} RB={rb_id} ({} bytes)", pdu.len());
				match rb.rlc_mode {
					RlcMode::Tm => {
						rb.queue_pdcp_pdu(pdu);
						delivered = true;
					}
					RlcMode::Um => delivered |= handle_um_pdu(rb, &pdu),
					RlcMode::Am => delivered |= self.handle_am_pdu(rnti, rb, &pdu),
				}
			}
		}
		if delivered {
			self.to_pdcp
				.send(Dest::Pdcp, Message::PdcpPduReady { rnti, rb: rb_id });
		}
	}

	/// AM reception: duplicate detection, reordering, reassembly, and the
	/// status machinery. Returns true when an SDU reached PDCP.
	fn handle_am_pdu(&self, rnti: u16, rb: &mut RadioBearer, pdu: &[u8]) -> bool {
		let parsed = match unpack_am(pdu) {
			Ok(parsed) => parsed,
			Err(err) => {
				error!(target: "rlc", "undecodable AM PDU RNTI={rnti} RB={}: {err}", rb.id());
				return false;
			}
		};
		match parsed {
			AmPdu::Amd(amd) => {
				let sn = amd.sn;
				let dist = (sn.wrapping_sub(rb.rlc_am.vr_r)) % AM_SN_MOD;
				if dist >= AM_SN_MOD / 2 {
					debug!(target: "rlc", "duplicate AMD SN={sn} RNTI={rnti}");
					if amd.p {
						self.send_status_pdu(rnti, rb);
					}
					return false;
				}
				let poll = amd.p;
				rb.rlc_am.rx_buffer.insert(sn, amd);
				let vr_h_dist = (sn.wrapping_add(1).wrapping_sub(rb.rlc_am.vr_h)) % AM_SN_MOD;
				if vr_h_dist < AM_SN_MOD / 2 {
					rb.rlc_am.vr_h = (sn + 1) % AM_SN_MOD;
				}
				let delivered = reassemble_am(rb);
				if poll {
					self.send_status_pdu(rnti, rb);
				}
				delivered
			}
			AmPdu::Status(status) => {
				self.handle_status_pdu(rnti, rb, &status);
				false
			}
		}
	}

	/// Peer status report: release acknowledged PDUs, retransmit NACKs.
	fn handle_status_pdu(&self, rnti: u16, rb: &mut RadioBearer, status: &StatusPdu) {
		info!(
			target: "rlc",
			"status RNTI={rnti} RB={} ACK_SN={} NACKs={:?}",
			rb.id(),
			status.ack_sn,
			status.nack_sn
		);
		let vt_a = rb.rlc_am.vt_a;
		let acked = (status.ack_sn.wrapping_sub(vt_a)) % AM_SN_MOD;
		rb.rlc_am.tx_buffer.retain(|sn, _| {
			let dist = (sn.wrapping_sub(vt_a)) % AM_SN_MOD;
			dist >= acked || status.nack_sn.contains(sn)
		});
		rb.rlc_am.vt_a = status.ack_sn;

		let mut retransmit = Vec::new();
		for sn in &status.nack_sn {
			if let Some(amd) = rb.rlc_am.tx_buffer.get(sn) {
				let mut amd = amd.clone();
				amd.rf = true;
				retransmit.push(amd);
			} else {
				warn!(target: "rlc", "NACK for unknown SN={sn} RNTI={rnti}");
			}
		}
		for amd in retransmit {
			self.send_amd_pdu(rnti, rb, &amd);
		}
	}

	fn send_status_pdu(&self, rnti: u16, rb: &mut RadioBearer) {
		let mut nack_sn = Vec::new();
		let mut sn = rb.rlc_am.vr_r;
		while sn != rb.rlc_am.vr_h {
			if !rb.rlc_am.rx_buffer.contains_key(&sn) {
				nack_sn.push(sn);
			}
			sn = (sn + 1) % AM_SN_MOD;
		}
		let status = StatusPdu {
			ack_sn: rb.rlc_am.vr_h,
			nack_sn,
		};
		rb.queue_mac_sdu(pack_status(&status));
		self.to_mac.send(
			Dest::Mac,
			Message::MacSduReady {
				rnti,
				rb: rb.id(),
			},
		);
	}

	fn send_amd_pdu(&self, rnti: u16, rb: &mut RadioBearer, amd: &AmdPdu) {
		rb.queue_mac_sdu(pack_amd(amd));
		self.to_mac.send(
			Dest::Mac,
			Message::MacSduReady {
				rnti,
				rb: rb.id(),
			},
		);
	}

	// ---- downlink ----

	fn handle_sdu_ready(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "rlc", "SDU for unknown RNTI={rnti}");
			return;
		};
		let mut user = user.lock();
		let Some(rb) = user.rb_mut(rb_id) else {
			error!(target: "rlc", "SDU for missing {rb_id} RNTI={rnti}");
			return;
		};
		while let Some(sdu) = rb.pop_rlc_sdu() {
			match rb.rlc_mode {
				RlcMode::Tm => {
					rb.queue_mac_sdu(sdu);
					self.to_mac.send(
						Dest::Mac,
						Message::MacSduReady { rnti, rb: rb_id },
					);
				}
				RlcMode::Um => {
					let segments: Vec<&[u8]> = sdu.chunks(SEGMENT_SIZE).collect();
					let n = segments.len();
					for (i, segment) in segments.into_iter().enumerate() {
						let umd = UmdPdu {
							fi: FramingInfo::from_flags(i == 0, i == n - 1),
							sn: rb.rlc_um.vt_us,
							data: segment.to_vec(),
						};
						rb.rlc_um.vt_us = (rb.rlc_um.vt_us + 1) % UM_SN_MOD;
						rb.queue_mac_sdu(pack_umd(&umd));
						self.to_mac.send(
							Dest::Mac,
							Message::MacSduReady { rnti, rb: rb_id },
						);
					}
				}
				RlcMode::Am => {
					let segments: Vec<&[u8]> = sdu.chunks(SEGMENT_SIZE).collect();
					let n = segments.len();
					for (i, segment) in segments.into_iter().enumerate() {
						let amd = AmdPdu {
							rf: false,
							// Poll on the SDU tail so the peer owes a
							// status report for every delivery.
							p: i == n - 1,
							fi: FramingInfo::from_flags(i == 0, i == n - 1),
							sn: rb.rlc_am.vt_s,
							data: segment.to_vec(),
						};
						rb.rlc_am.vt_s = (rb.rlc_am.vt_s + 1) % AM_SN_MOD;
						rb.rlc_am.tx_buffer.insert(amd.sn, amd.clone());
						self.send_amd_pdu(rnti, rb, &amd);
					}
				}
			}
		}
	}

}

/// UM reception with 5-bit sequence numbers; no retransmission, stale
/// segments are dropped when the window moves past them.
fn handle_um_pdu(rb: &mut RadioBearer, pdu: &[u8]) -> bool {
	let umd = match unpack_umd(pdu) {
		Ok(umd) => umd,
		Err(err) => {
			error!(target: "rlc", "undecodable UM PDU RB={}: {err}", rb.id());
			return false;
		}
	};
	let dist = (umd.sn.wrapping_sub(rb.rlc_um.vr_ur)) % UM_SN_MOD;
	if dist >= UM_SN_MOD / 2 {
		debug!(target: "rlc", "stale UMD SN={}", umd.sn);
		return false;
	}
	rb.rlc_um.rx_buffer.insert(umd.sn, umd);
	reassemble_um(rb)
}

fn reassemble_am(rb: &mut RadioBearer) -> bool {
	let mut delivered = false;
	while let Some(amd) = rb.rlc_am.rx_buffer.remove(&rb.rlc_am.vr_r) {
		if amd.fi.first() {
			rb.rlc_am.reassembly.clear();
		}
		rb.rlc_am.reassembly.extend_from_slice(&amd.data);
		if amd.fi.last() {
			let sdu = core::mem::take(&mut rb.rlc_am.reassembly);
			rb.queue_pdcp_pdu(sdu);
			delivered = true;
		}
		rb.rlc_am.vr_r = (rb.rlc_am.vr_r + 1) % AM_SN_MOD;
	}
	delivered
}

fn reassemble_um(rb: &mut RadioBearer) -> bool {
	let mut delivered = false;
	while let Some(umd) = rb.rlc_um.rx_buffer.remove(&rb.rlc_um.vr_ur) {
		if umd.fi.first() {
			rb.rlc_um.reassembly.clear();
		}
		rb.rlc_um.reassembly.extend_from_slice(&umd.data);
		if umd.fi.last() {
			let sdu = core::mem::take(&mut rb.rlc_um.reassembly);
			rb.queue_pdcp_pdu(sdu);
			delivered = true;
		}
		rb.rlc_um.vr_ur = (rb.rlc_um.vr_ur + 1) % UM_SN_MOD;
	}
	delivered
}

#[cfg(test)]
mod tests {
	use super::*;

	fn am_rb() -> RadioBearer {
		RadioBearer::new(RbId::Srb1)
	}

	#[test]
	fn am_reassembles_in_order_segments() {
		let mut rb = am_rb();
		let pdus = [
			AmdPdu {
				rf: false,
				p: false,
				fi: FramingInfo::FirstSegment,
				sn: 0,
				data: vec![1, 2],
			},
			AmdPdu {
				rf: false,
				p: false,
				fi: FramingInfo::LastSegment,
				sn: 1,
				data: vec![3, 4],
			},
		];
		for pdu in &pdus {
			rb.rlc_am.rx_buffer.insert(pdu.sn, pdu.clone());
			rb.rlc_am.vr_h = pdu.sn + 1;
		}
		assert!(reassemble_am(&mut rb));
		assert_eq!(rb.pop_pdcp_pdu(), Some(vec![1, 2, 3, 4]));
		assert_eq!(rb.rlc_am.vr_r, 2);
	}

	#[test]
	fn am_reassembly_stalls_on_a_gap() {
		let mut rb = am_rb();
		rb.rlc_am.rx_buffer.insert(
			1,
			AmdPdu {
				rf: false,
				p: false,
				fi: FramingInfo::FullSdu,
				sn: 1,
				data: vec![9],
			},
		);
		rb.rlc_am.vr_h = 2;
		assert!(!reassemble_am(&mut rb));
		assert_eq!(rb.rlc_am.vr_r, 0);
		assert!(rb.next_pdcp_pdu().is_none());
	}

	#[test]
	fn um_drops_stale_sequence_numbers() {
		let mut rb = RadioBearer::new(RbId::Srb1);
		rb.rlc_um.vr_ur = 10;
		let stale = pack_umd(&UmdPdu {
			fi: FramingInfo::FullSdu,
			sn: 1,
			data: vec![1],
		});
		assert!(!handle_um_pdu(&mut rb, &stale));

		let fresh = pack_umd(&UmdPdu {
			fi: FramingInfo::FullSdu,
			sn: 10,
			data: vec![2],
		});
		assert!(handle_um_pdu(&mut rb, &fresh));
		assert_eq!(rb.pop_pdcp_pdu(), Some(vec![2]));
	}
}
