//! Packet data convergence protocol: sequence numbering, integrity and
//! ciphering per bearer configuration.
//!
//! SRB0 passes through transparently. SRB1/SRB2 carry 5-bit SN control
//! PDUs with a 4-byte MAC-I (zero until the bearer enters security mode).
//! DRBs carry 12-bit SN data PDUs (18-bit in long-SN mode), ciphered only.

use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::RwLock;

use crate::config::sysinfo::SysInfo;
use crate::error::{Error, Result};
use crate::msgq::{Dest, Envelope, Message, Msgq};
use crate::security::{self, Direction};
use crate::user::rb::{PdcpConfig, RadioBearer, RbId};
use crate::user::ue::User;
use crate::user::UserMgr;

pub struct Pdcp {
	user_mgr: Arc<UserMgr>,
	to_rlc: Arc<Msgq>,
	to_rrc: Arc<Msgq>,
	to_gw: Arc<Msgq>,
	sys_info: RwLock<SysInfo>,
}

impl Pdcp {
	pub fn new(
		user_mgr: Arc<UserMgr>,
		to_rlc: Arc<Msgq>,
		to_rrc: Arc<Msgq>,
		to_gw: Arc<Msgq>,
	) -> Arc<Pdcp> {
		Arc::new(Pdcp {
			user_mgr,
			to_rlc,
			to_rrc,
			to_gw,
			sys_info: RwLock::new(SysInfo::default()),
		})
	}

	pub fn update_sys_info(&self, sys_info: &SysInfo) {
		*self.sys_info.write() = sys_info.clone();
	}

	pub fn start(
		self: &Arc<Pdcp>,
		from_rlc: &Arc<Msgq>,
		from_rrc: &Arc<Msgq>,
		from_gw: &Arc<Msgq>,
	) -> Vec<std::thread::JoinHandle<()>> {
		let pdcp = Arc::clone(self);
		let rlc_rx = from_rlc.attach_rx(0, move |env| pdcp.handle_rlc_msg(env));
		let pdcp = Arc::clone(self);
		let rrc_rx = from_rrc.attach_rx(0, move |env| pdcp.handle_rrc_msg(env));
		let pdcp = Arc::clone(self);
		let gw_rx = from_gw.attach_rx(0, move |env| pdcp.handle_gw_msg(env));
		vec![rlc_rx, rrc_rx, gw_rx]
	}

	fn handle_rlc_msg(&self, env: Envelope) {
		if env.dest != Dest::Pdcp && env.dest != Dest::Any {
			self.to_rrc.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::PdcpPduReady { rnti, rb } => self.handle_pdu_ready(rnti, rb),
			msg => warn!(target: "pdcp", "invalid RLC message {msg:?}"),
		}
	}

	fn handle_rrc_msg(&self, env: Envelope) {
		if env.dest != Dest::Pdcp && env.dest != Dest::Any {
			self.to_rlc.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::PdcpSduReady { rnti, rb } => self.handle_sdu_ready(rnti, rb),
			msg => warn!(target: "pdcp", "invalid RRC message {msg:?}"),
		}
	}

	fn handle_gw_msg(&self, env: Envelope) {
		if env.dest != Dest::Pdcp && env.dest != Dest::Any {
			self.to_rlc.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::PdcpDataSduReady { rnti, rb } => self.handle_data_sdu_ready(rnti, rb),
			msg => warn!(target: "pdcp", "invalid GW message {msg:?}"),
		}
	}

	// ---- uplink ----

	fn handle_pdu_ready(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "pdcp", "PDU for unknown RNTI={rnti}");
			return;
		};
		let mut to_rrc = false;
		let mut to_gw = false;
		{
			let mut user = user.lock();
			loop {
				let pdu = {
					let Some(rb) = user.rb_mut(rb_id) else {
						error!(target: "pdcp", "PDU for missing {rb_id} RNTI={rnti}");
						return;
					};
					rb.pop_pdcp_pdu()
				};
				let Some(pdu) = pdu else {
					break;
				};
				if rb_id.is_srb() {
					match rx_srb_pdu(&mut user, rb_id, &pdu) {
						Ok(sdu) => {
							if let Some(rb) = user.rb_mut(rb_id) {
								rb.queue_rrc_pdu(sdu);
								to_rrc = true;
							}
						}
						Err(err) => {
							error!(target: "pdcp", "SRB PDU rejected RNTI={rnti} RB={rb_id}: {err}");
						}
					}
				} else {
					match rx_drb_pdu(&mut user, rb_id, &pdu) {
						Ok(sdu) => {
							if let Some(rb) = user.rb_mut(rb_id) {
								rb.queue_gw_data_msg(sdu);
								to_gw = true;
							}
						}
						Err(err) => {
							error!(target: "pdcp", "DRB PDU rejected RNTI={rnti} RB={rb_id}: {err}");
						}
					}
				}
			}
		}
		if to_rrc {
			self.to_rrc
				.send(Dest::Rrc, Message::RrcPduReady { rnti, rb: rb_id });
		}
		if to_gw {
			self.to_gw
				.send(Dest::Gw, Message::GwDataReady { rnti, rb: rb_id });
		}
	}

	// ---- downlink ----

	fn handle_sdu_ready(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "pdcp", "SDU for unknown RNTI={rnti}");
			return;
		};
		let mut queued = false;
		{
			let mut user = user.lock();
			loop {
				let sdu = {
					let Some(rb) = user.rb_mut(rb_id) else {
						error!(target: "pdcp", "SDU for missing {rb_id} RNTI={rnti}");
						return;
					};
					rb.pop_pdcp_sdu()
				};
				let Some(sdu) = sdu else {
					break;
				};
				let pdu = tx_srb_pdu(&mut user, rb_id, sdu);
				if let Some(rb) = user.rb_mut(rb_id) {
					debug!(target: "pdcp", "SDU packed RNTI={rnti} RB={rb_id} ({} bytes)", pdu.len());
					rb.queue_rlc_sdu(pdu);
					queued = true;
				}
			}
		}
		if queued {
			self.to_rlc
				.send(Dest::Rlc, Message::RlcSduReady { rnti, rb: rb_id });
		}
	}

	fn handle_data_sdu_ready(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "pdcp", "data SDU for unknown RNTI={rnti}");
			return;
		};
		let mut queued = false;
		{
			let mut user = user.lock();
			loop {
				let sdu = {
					let Some(rb) = user.rb_mut(rb_id) else {
						error!(target: "pdcp", "data SDU for missing {rb_id} RNTI={rnti}");
						return;
					};
					rb.pop_pdcp_data_sdu()
				};
				let Some(sdu) = sdu else {
					break;
				};
				let pdu = tx_drb_pdu(&mut user, rb_id, sdu);
				if let Some(rb) = user.rb_mut(rb_id) {
					rb.queue_rlc_sdu(pdu);
					queued = true;
				}
			}
		}
		if queued {
			self.to_rlc
				.send(Dest::Rlc, Message::RlcSduReady { rnti, rb: rb_id });
		}
	}
}

/// PDCP bearer identity for the security algorithms (LC id minus one).
fn bearer_of(rb: &RadioBearer) -> u8 {
	rb.lc_id.saturating_sub(1)
}

/// Pack one signalling SDU into a control PDU; SRB0 is transparent.
pub fn tx_srb_pdu(user: &mut User, rb_id: RbId, sdu: Vec<u8>) -> Vec<u8> {
	if rb_id == RbId::Srb0 {
		return sdu;
	}
	let k_rrc_int = user.auth_vec().map(|auth_vec| auth_vec.k_rrc_int);
	let Some(rb) = user.rb_mut(rb_id) else {
		return sdu;
	};
	let count = rb.pdcp_tx_count;
	let sn = (count & 0x1F) as u8;
	rb.pdcp_tx_count = rb.pdcp_tx_count.wrapping_add(1);

	let mut pdu = Vec::with_capacity(1 + sdu.len() + 4);
	pdu.push(sn);
	pdu.extend_from_slice(&sdu);
	let mac_i = match (rb.pdcp_config, k_rrc_int) {
		(PdcpConfig::Security, Some(key)) => {
			security::eia2(&security::key128(&key), count, bearer_of(rb), Direction::Downlink, &pdu)
		}
		_ => [0u8; 4],
	};
	pdu.extend_from_slice(&mac_i);
	pdu
}

/// Unpack an uplink signalling PDU: verify the MAC-I under the active
/// context and slide the receive count.
pub fn rx_srb_pdu(user: &mut User, rb_id: RbId, pdu: &[u8]) -> Result<Vec<u8>> {
	if rb_id == RbId::Srb0 {
		return Ok(pdu.to_vec());
	}
	if pdu.len() < 5 {
		return Err(Error::InvalidParam);
	}
	let k_rrc_int = user.auth_vec().map(|auth_vec| auth_vec.k_rrc_int);
	let Some(rb) = user.rb_mut(rb_id) else {
		return Err(Error::InvalidParam);
	};
	let sn = pdu[0] & 0x1F;
	let expected = (rb.pdcp_rx_count & 0x1F) as u8;
	if sn != expected {
		warn!(target: "pdcp", "receive window slide RB={} SN={sn} expected={expected}", rb.id());
		rb.pdcp_rx_count = (rb.pdcp_rx_count & !0x1F) | u32::from(sn);
	}
	let count = rb.pdcp_rx_count;
	rb.pdcp_rx_count = rb.pdcp_rx_count.wrapping_add(1);

	let body = &pdu[..pdu.len() - 4];
	let mac_i = &pdu[pdu.len() - 4..];
	if let (PdcpConfig::Security, Some(key)) = (rb.pdcp_config, k_rrc_int) {
		let expected_mac =
			security::eia2(&security::key128(&key), count, bearer_of(rb), Direction::Uplink, body);
		if mac_i != expected_mac {
			return Err(Error::InvalidParam);
		}
	}
	Ok(body[1..].to_vec())
}

/// Pack one IP datagram into a (long-SN capable) data PDU, ciphered under
/// the user-plane key.
pub fn tx_drb_pdu(user: &mut User, rb_id: RbId, sdu: Vec<u8>) -> Vec<u8> {
	let k_up_enc = user.auth_vec().map(|auth_vec| auth_vec.k_up_enc);
	let Some(rb) = user.rb_mut(rb_id) else {
		return sdu;
	};
	let count = rb.pdcp_tx_count;
	rb.pdcp_tx_count = rb.pdcp_tx_count.wrapping_add(1);

	let mut payload = sdu;
	if let Some(key) = k_up_enc {
		security::apply_eea(
			security::EEA0,
			&security::key128(&key),
			count,
			bearer_of(rb),
			Direction::Downlink,
			&mut payload,
		);
	}

	let mut pdu = Vec::with_capacity(3 + payload.len());
	match rb.pdcp_config {
		PdcpConfig::LongSn => {
			let sn = count & 0x3FFFF;
			pdu.push(0x80 | ((sn >> 16) as u8 & 0x03));
			pdu.push((sn >> 8) as u8);
			pdu.push(sn as u8);
		}
		_ => {
			let sn = count & 0xFFF;
			pdu.push(0x80 | ((sn >> 8) as u8 & 0x0F));
			pdu.push(sn as u8);
		}
	}
	pdu.extend_from_slice(&payload);
	pdu
}

/// Unpack an uplink data PDU and decipher it.
pub fn rx_drb_pdu(user: &mut User, rb_id: RbId, pdu: &[u8]) -> Result<Vec<u8>> {
	let k_up_enc = user.auth_vec().map(|auth_vec| auth_vec.k_up_enc);
	let Some(rb) = user.rb_mut(rb_id) else {
		return Err(Error::InvalidParam);
	};
	let long_sn = rb.pdcp_config == PdcpConfig::LongSn;
	let (sn, sn_mask, header_len) = if long_sn {
		if pdu.len() < 3 {
			return Err(Error::InvalidParam);
		}
		let sn =
			(u32::from(pdu[0] & 0x03) << 16) | (u32::from(pdu[1]) << 8) | u32::from(pdu[2]);
		(sn, 0x3FFFFu32, 3)
	} else {
		if pdu.len() < 2 {
			return Err(Error::InvalidParam);
		}
		((u32::from(pdu[0] & 0x0F) << 8) | u32::from(pdu[1]), 0xFFFu32, 2)
	};
	if pdu[0] & 0x80 == 0 {
		// Control PDUs (status reports) are not produced by this stack.
		return Err(Error::InvalidParam);
	}
	let expected = rb.pdcp_rx_count & sn_mask;
	if sn != expected {
		warn!(target: "pdcp", "receive window slide RB={} SN={sn} expected={expected}", rb.id());
		rb.pdcp_rx_count = (rb.pdcp_rx_count & !sn_mask) | sn;
	}
	let count = rb.pdcp_rx_count;
	rb.pdcp_rx_count = rb.pdcp_rx_count.wrapping_add(1);

	let mut payload = pdu[header_len..].to_vec();
	if let Some(key) = k_up_enc {
		security::apply_eea(
			security::EEA0,
			&security::key128(&key),
			count,
			bearer_of(rb),
			Direction::Uplink,
			&mut payload,
		);
	}
	Ok(payload)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::security::AuthVec;

	fn secured_user() -> User {
		let mut user = User::new(70);
		let mut auth_vec = AuthVec::default();
		auth_vec.k_rrc_int = [0x21; 32];
		auth_vec.k_up_enc = [0x22; 32];
		user.set_auth_vec(auth_vec);
		user.setup_rb(RbId::Srb1).unwrap();
		user.setup_rb(RbId::Drb1).unwrap();
		user
	}

	#[test]
	fn srb0_is_transparent() {
		let mut user = User::new(70);
		let sdu = vec![1, 2, 3];
		assert_eq!(tx_srb_pdu(&mut user, RbId::Srb0, sdu.clone()), sdu);
	}

	#[test]
	fn plain_srb_pdu_carries_zero_mac() {
		let mut user = secured_user();
		let pdu = tx_srb_pdu(&mut user, RbId::Srb1, vec![9, 9]);
		assert_eq!(pdu[0], 0);
		assert_eq!(&pdu[pdu.len() - 4..], &[0, 0, 0, 0]);
	}

	#[test]
	fn secured_srb_round_trip() {
		// Downlink pack on one side, uplink verify on a mirrored peer.
		let mut enb = secured_user();
		enb.rb_mut(RbId::Srb1).unwrap().pdcp_config = PdcpConfig::Security;
		let pdu = tx_srb_pdu(&mut enb, RbId::Srb1, vec![4, 5, 6]);
		assert_ne!(&pdu[pdu.len() - 4..], &[0, 0, 0, 0]);

		// The eNB's uplink verifier uses the uplink direction, so emulate
		// the UE side packing with the same key and count.
		let mut ue = secured_user();
		ue.rb_mut(RbId::Srb1).unwrap().pdcp_config = PdcpConfig::Security;
		let body: Vec<u8> = pdu[..pdu.len() - 4].to_vec();
		let mac = security::eia2(
			&security::key128(&[0x21; 32]),
			0,
			0,
			Direction::Uplink,
			&body,
		);
		let mut ul_pdu = body;
		ul_pdu.extend_from_slice(&mac);
		let sdu = rx_srb_pdu(&mut ue, RbId::Srb1, &ul_pdu).unwrap();
		assert_eq!(sdu, vec![4, 5, 6]);
	}

	#[test]
	fn tampered_mac_is_rejected() {
		let mut enb = secured_user();
		enb.rb_mut(RbId::Srb1).unwrap().pdcp_config = PdcpConfig::Security;
		let body = vec![0u8, 1, 2, 3];
		let mut pdu = body.clone();
		pdu.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
		assert!(rx_srb_pdu(&mut enb, RbId::Srb1, &pdu).is_err());
	}

	#[test]
	fn drb_round_trip() {
		let mut enb = secured_user();
		let original = vec![0x45, 0x00, 0x00, 0x1c, 0xaa, 0xbb];
		let pdu = tx_drb_pdu(&mut enb, RbId::Drb1, original.clone());
		assert_eq!(pdu[0] & 0x80, 0x80);

		// Mirror the count state on the receive side; EEA0 keeps the
		// payload legible either way.
		let mut peer = secured_user();
		let sdu = rx_drb_pdu(&mut peer, RbId::Drb1, &pdu).unwrap();
		assert_eq!(sdu, original);
	}

	#[test]
	fn drb_sequence_numbers_advance() {
		let mut enb = secured_user();
		let first = tx_drb_pdu(&mut enb, RbId::Drb1, vec![1]);
		let second = tx_drb_pdu(&mut enb, RbId::Drb1, vec![1]);
		let sn_of = |pdu: &[u8]| (u32::from(pdu[0] & 0x0F) << 8) | u32::from(pdu[1]);
		assert_eq!(sn_of(&second), sn_of(&first) + 1);
	}

	#[test]
	fn long_sn_uses_a_three_byte_header() {
		let mut enb = secured_user();
		enb.rb_mut(RbId::Drb1).unwrap().pdcp_config = PdcpConfig::LongSn;
		let pdu = tx_drb_pdu(&mut enb, RbId::Drb1, vec![7]);
		assert_eq!(pdu.len(), 4);
		let mut peer = secured_user();
		peer.rb_mut(RbId::Drb1).unwrap().pdcp_config = PdcpConfig::LongSn;
		assert_eq!(rx_drb_pdu(&mut peer, RbId::Drb1, &pdu).unwrap(), vec![7]);
	}
}
