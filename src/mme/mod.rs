// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Local mobility management entity: terminates NAS and drives the
//! attach, service-request and detach procedures.

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;

use crate::config::sysinfo::SysInfo;
use crate::config::{ConfigDb, Param};
use crate::hss::Hss;
use crate::msgq::{Dest, Envelope, Message, Msgq, RrcCmd, RrcCmdResp};
use crate::nas::{
	self,
	msg::{self as nas_msg, EmmMsgType, EsmMsgType, MobileId, Pco, UeNetworkCap},
	MSG_TYPE_SERVICE_REQUEST, PD_EMM, PD_ESM, SEC_HDR_INTEGRITY_AND_CIPHERED,
	SEC_HDR_INTEGRITY_NEW_CTX, SEC_HDR_PLAIN,
};
use crate::security::{self, Direction};
use crate::user::rb::{MmeProc, MmeState, RbId};
use crate::user::ue::{AlgMask, SecCaps};
use crate::user::{UserMgr, UserRef};

const NETWORK_NAME_FULL: &str = "ferrolte";
const NETWORK_NAME_SHORT: &str = "flte";
const APN: &str = "ferrolte.example.net";

pub struct Mme {
	user_mgr: Arc<UserMgr>,
	hss: Arc<Hss>,
	to_rrc: Arc<Msgq>,
	sys_info: RwLock<SysInfo>,
	next_ip_addr: Mutex<u32>,
	dns_addr: u32,
}

impl Mme {
	pub fn new(
		user_mgr: Arc<UserMgr>,
		hss: Arc<Hss>,
		config: &ConfigDb,
		to_rrc: Arc<Msgq>,
	) -> Arc<Mme> {
		Arc::new(Mme {
			user_mgr,
			hss,
			to_rrc,
			sys_info: RwLock::new(SysInfo::default()),
			// The gateway itself owns the first address of the range.
			next_ip_addr: Mutex::new(config.get_u32(Param::IpAddrStart) + 1),
			dns_addr: config.get_u32(Param::DnsAddr),
		})
	}

	pub fn update_sys_info(&self, sys_info: &SysInfo) {
		*self.sys_info.write() = sys_info.clone();
	}

	pub fn start(self: &Arc<Mme>, from_rrc: &Arc<Msgq>) -> Vec<std::thread::JoinHandle<()>> {
		let mme = Arc::clone(self);
		vec![from_rrc.attach_rx(0, move |env| mme.handle_rrc_msg(env))]
	}

	fn handle_rrc_msg(&self, env: Envelope) {
		if env.dest != Dest::Mme && env.dest != Dest::Any {
			warn!(target: "mme", "message for {:?} has nowhere to go", env.dest);
			return;
		}
		match env.msg {
			Message::MmeNasMsgReady { rnti, rb } => self.handle_nas_msg(rnti, rb),
			Message::MmeRrcCmdResp { rnti, rb, resp } => self.handle_rrc_cmd_resp(rnti, rb, resp),
			msg => warn!(target: "mme", "invalid RRC message {msg:?}"),
		}
	}

	// ---- RRC handlers ----

	fn handle_nas_msg(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "mme", "NAS message for unknown RNTI={rnti}");
			return;
		};
		let raw = {
			let mut locked = user.lock();
			locked.rb_mut(rb_id).and_then(|rb| rb.pop_mme_nas_msg())
		};
		let Some(raw) = raw else {
			error!(target: "mme", "NAS message ready with no message queued");
			return;
		};
		debug!(target: "mme", "NAS message RNTI={rnti} RB={rb_id} ({} bytes)", raw.len());

		// Strip and verify the security envelope when a context exists.
		let msg = match self.unprotect(&user, &raw) {
			Ok(msg) => msg,
			Err(err) => {
				error!(target: "mme", "NAS protection check failed RNTI={rnti}: {err}");
				return;
			}
		};
		let Ok((pd, msg_type)) = nas::parse_msg_header(&msg) else {
			error!(target: "mme", "short NAS message RNTI={rnti}");
			return;
		};

		let mut user = user;
		match (pd, msg_type) {
			(PD_EMM, t) if t == EmmMsgType::AttachRequest as u8 => {
				if let Some(rebound) = self.parse_attach_request(&msg, &user, rb_id) {
					user = rebound;
				}
			}
			(PD_EMM, t) if t == EmmMsgType::AttachComplete as u8 => {
				self.parse_attach_complete(&msg, &user, rb_id);
			}
			(PD_EMM, t) if t == EmmMsgType::AuthenticationResponse as u8 => {
				self.parse_authentication_response(&msg, &user, rb_id);
			}
			(PD_EMM, t) if t == EmmMsgType::AuthenticationFailure as u8 => {
				self.parse_authentication_failure(&msg, &user, rb_id);
			}
			(PD_EMM, t) if t == EmmMsgType::IdentityResponse as u8 => {
				self.parse_identity_response(&msg, &user, rb_id);
			}
			(PD_EMM, t) if t == EmmMsgType::SecurityModeComplete as u8 => {
				self.parse_security_mode_complete(&msg, &user, rb_id);
			}
			(PD_EMM, t) if t == EmmMsgType::SecurityModeReject as u8 => {
				self.parse_security_mode_reject(&msg, &user, rb_id);
			}
			(PD_EMM, t) if t == EmmMsgType::DetachRequest as u8 => {
				self.parse_detach_request(&msg, &user, rb_id);
			}
			(PD_EMM, MSG_TYPE_SERVICE_REQUEST) => {
				self.parse_service_request(&msg, &user, rb_id);
			}
			(PD_ESM, t) if t == EsmMsgType::EsmInformationResponse as u8 => {
				self.parse_esm_information_response(&msg, &user, rb_id);
			}
			(PD_ESM, t) if t == EsmMsgType::ActivateDefaultEpsBearerContextAccept as u8 => {
				info!(target: "mme", "activate default EPS bearer context accept RNTI={rnti}");
			}
			(pd, t) => {
				error!(target: "mme", "not handling NAS message PD={pd:#x} MSG_TYPE={t:#04x}");
			}
		}

		user.lock().increment_nas_count_ul();
		self.run_state_machine(&user, rb_id);
	}

	fn handle_rrc_cmd_resp(&self, rnti: u16, rb_id: RbId, resp: RrcCmdResp) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "mme", "command response for unknown RNTI={rnti}");
			return;
		};
		match resp {
			RrcCmdResp::Security => {
				let proc = {
					let mut locked = user.lock();
					let esm_info_transfer = locked.esm_info_transfer;
					let Some(rb) = locked.rb_mut(rb_id) else {
						return;
					};
					match rb.mme_proc {
						MmeProc::Attach => {
							rb.mme_state = if esm_info_transfer {
								MmeState::EsmInfoTransfer
							} else {
								MmeState::AttachAccept
							};
						}
						MmeProc::ServiceRequest => rb.mme_state = MmeState::SetupDrb,
						proc => {
							error!(target: "mme", "MME in invalid procedure {proc:?}");
							return;
						}
					}
					rb.mme_proc
				};
				debug!(target: "mme", "RRC security established RNTI={rnti} ({proc:?})");
				self.run_state_machine(&user, rb_id);
			}
		}
	}

	fn run_state_machine(&self, user: &UserRef, rb_id: RbId) {
		let (proc, state) = {
			let locked = user.lock();
			match locked.rb(rb_id) {
				Some(rb) => (rb.mme_proc, rb.mme_state),
				None => return,
			}
		};
		match proc {
			MmeProc::Attach => self.attach_sm(user, rb_id, state),
			MmeProc::ServiceRequest => self.service_req_sm(user, rb_id, state),
			MmeProc::Detach => self.detach_sm(user, rb_id, state),
			MmeProc::Idle => {
				error!(target: "mme", "MME state machine run while idle");
			}
		}
	}

	// ---- security envelope ----

	fn unprotect(&self, user: &UserRef, raw: &[u8]) -> crate::error::Result<Vec<u8>> {
		if raw.len() < 2 {
			return Err(crate::error::Error::InvalidParam);
		}
		let sec_hdr = raw[0] >> 4;
		let pd = raw[0] & 0xF;
		if pd == PD_ESM || sec_hdr == SEC_HDR_PLAIN || sec_hdr == nas::SEC_HDR_SERVICE_REQUEST {
			return Ok(raw.to_vec());
		}
		if raw.len() < 7 {
			return Err(crate::error::Error::InvalidParam);
		}
		let locked = user.lock();
		let Some(auth_vec) = locked.auth_vec() else {
			// No context yet; accept the inner message as-is.
			return Ok(raw[6..].to_vec());
		};
		nas::unpack_security_protected_nas_msg(
			raw,
			security::EEA0,
			&auth_vec.k_nas_int,
			&auth_vec.k_nas_enc,
			auth_vec.nas_count_ul,
			Direction::Uplink,
		)
	}

	fn protect(&self, user: &UserRef, plain: Vec<u8>, sec_hdr: u8) -> Vec<u8> {
		let mut locked = user.lock();
		match locked.auth_vec() {
			Some(auth_vec) => {
				let wrapped = nas::pack_security_protected_nas_msg(
					&plain,
					sec_hdr,
					security::EEA0,
					&auth_vec.k_nas_int,
					&auth_vec.k_nas_enc,
					auth_vec.nas_count_dl,
					Direction::Downlink,
				);
				locked.increment_nas_count_dl();
				wrapped
			}
			None => plain,
		}
	}

	// ---- message parsers ----

	fn parse_attach_request(&self, msg: &[u8], user: &UserRef, rb_id: RbId) -> Option<UserRef> {
		let parsed = match nas_msg::unpack_attach_request(msg) {
			Ok(parsed) => parsed,
			Err(err) => {
				error!(target: "mme", "undecodable attach request: {err}");
				return None;
			}
		};
		let rnti = user.lock().c_rnti();
		info!(target: "mme", "received attach request for RNTI={rnti} and RB={rb_id}");

		// The piggybacked ESM message is the PDN connectivity request.
		if let Ok((PD_ESM, t)) = nas::parse_msg_header(&parsed.esm_msg) {
			if t == EsmMsgType::PdnConnectivityRequest as u8 {
				self.parse_pdn_connectivity_request(&parsed.esm_msg, user);
			}
		}

		{
			let mut locked = user.lock();
			locked.attach_type = parsed.eps_attach_type;
			locked.caps = caps_from(&parsed.ue_network_cap);
			if let Some(rb) = locked.rb_mut(rb_id) {
				rb.mme_proc = MmeProc::Attach;
			}
		}

		let mut active = Arc::clone(user);
		match parsed.eps_mobile_id {
			MobileId::Guti(guti) => {
				if let Some(existing) = self.user_mgr.find_user_guti(&guti) {
					if !Arc::ptr_eq(&existing, user) {
						let c_rnti = user.lock().c_rnti();
						{
							let mut locked_existing = existing.lock();
							let mut locked_new = user.lock();
							locked_existing.take_rbs_from(&mut locked_new);
							locked_existing.caps = caps_from(&parsed.ue_network_cap);
							locked_existing.attach_type = parsed.eps_attach_type;
						}
						self.user_mgr.transfer_c_rnti(c_rnti, &existing);
						active = existing;
					}
					info!(
						target: "mme",
						"IMSI={} is associated with RNTI={rnti}",
						active.lock().imsi_str()
					);
					set_mme_state(&active, rb_id, MmeState::Authenticate);
				} else {
					let mut locked = active.lock();
					if locked.id().is_some() {
						if locked.caps.eea.supports(0) && locked.caps.eia.supports(2) {
							set_state_locked(&mut locked, rb_id, MmeState::Authenticate);
						} else {
							locked.emm_cause =
								nas_msg::EMM_CAUSE_UE_SECURITY_CAPABILITIES_MISMATCH;
							set_state_locked(&mut locked, rb_id, MmeState::Reject);
						}
					} else {
						set_state_locked(&mut locked, rb_id, MmeState::IdRequestImsi);
					}
				}
			}
			MobileId::Imsi(imsi) => self.admit_by_imsi(&active, rb_id, imsi),
			MobileId::Imei(imei) => self.admit_by_imei(&active, rb_id, imei),
		}
		(!Arc::ptr_eq(&active, user)).then_some(active)
	}

	fn admit_by_imsi(&self, user: &UserRef, rb_id: RbId, imsi: u64) {
		info!(target: "mme", "IMSI={imsi:015} is associated with RNTI={}", user.lock().c_rnti());
		let mut locked = user.lock();
		if self.hss.is_imsi_allowed(imsi) {
			if locked.caps.eea.supports(0) && locked.caps.eia.supports(2) {
				if let Some(id) = self.hss.user_id_from_imsi(imsi) {
					locked.set_id(id);
				}
				set_state_locked(&mut locked, rb_id, MmeState::Authenticate);
			} else {
				locked.emm_cause = nas_msg::EMM_CAUSE_UE_SECURITY_CAPABILITIES_MISMATCH;
				set_state_locked(&mut locked, rb_id, MmeState::Reject);
			}
		} else {
			locked.temp_id = imsi;
			locked.emm_cause = nas_msg::EMM_CAUSE_IMSI_UNKNOWN_IN_HSS;
			set_state_locked(&mut locked, rb_id, MmeState::Reject);
		}
	}

	fn admit_by_imei(&self, user: &UserRef, rb_id: RbId, imei: u64) {
		info!(target: "mme", "IMEI={imei:015} is associated with RNTI={}", user.lock().c_rnti());
		let mut locked = user.lock();
		if self.hss.is_imei_allowed(imei) {
			if locked.caps.eea.supports(0) && locked.caps.eia.supports(2) {
				if let Some(id) = self.hss.user_id_from_imei(imei) {
					locked.set_id(id);
				}
				set_state_locked(&mut locked, rb_id, MmeState::Authenticate);
			} else {
				locked.emm_cause = nas_msg::EMM_CAUSE_UE_SECURITY_CAPABILITIES_MISMATCH;
				set_state_locked(&mut locked, rb_id, MmeState::Reject);
			}
		} else {
			locked.temp_id = imei;
			locked.emm_cause = nas_msg::EMM_CAUSE_EPS_SERVICES_NOT_ALLOWED;
			set_state_locked(&mut locked, rb_id, MmeState::Reject);
		}
	}

	fn parse_pdn_connectivity_request(&self, esm: &[u8], user: &UserRef) {
		let parsed = match nas_msg::unpack_pdn_connectivity_request(esm) {
			Ok(parsed) => parsed,
			Err(err) => {
				error!(target: "mme", "undecodable PDN connectivity request: {err}");
				return;
			}
		};
		let mut locked = user.lock();
		locked.eps_bearer_id = parsed.eps_bearer_id;
		locked.proc_transaction_id = parsed.proc_transaction_id;
		locked.pdn_type = parsed.pdn_type;
		// The UE-side ESM information transfer remains disabled.
		locked.esm_info_transfer = false;

		let mut pco_reply = Pco::default();
		if let Some(pco) = &parsed.pco {
			for (id, contents) in &pco.opts {
				match *id {
					nas_msg::PCO_ID_IPCP => {
						// IPCP configure-request asking for DNS; answer
						// configure-nak carrying ours.
						if contents.first() == Some(&0x01) {
							let dns = self.dns_addr.to_be_bytes();
							let mut reply = vec![0x03, contents.get(1).copied().unwrap_or(0), 0x00, 0x10];
							reply.extend_from_slice(&[0x81, 0x06]);
							reply.extend_from_slice(&dns);
							reply.extend_from_slice(&[0x83, 0x06]);
							reply.extend_from_slice(&dns);
							pco_reply.opts.push((nas_msg::PCO_ID_IPCP, reply));
						} else {
							error!(target: "mme", "unknown PCO");
						}
					}
					nas_msg::PCO_ID_DNS_SERVER_IPV4_REQUEST => {
						pco_reply
							.opts
							.push((nas_msg::PCO_ID_DNS_SERVER_IPV4, self.dns_addr.to_be_bytes().to_vec()));
					}
					nas_msg::PCO_ID_IP_ADDR_VIA_NAS => {}
					id => error!(target: "mme", "invalid PCO ID ({id:#06x})"),
				}
			}
		}
		locked.pco_reply = pco_reply;
	}

	fn parse_attach_complete(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		let Ok(parsed) = nas_msg::unpack_attach_complete(msg) else {
			error!(target: "mme", "undecodable attach complete");
			return;
		};
		let mut locked = user.lock();
		info!(
			target: "mme",
			"user fully attached imsi={} imei={}",
			locked.imsi_str(),
			locked.imei_str()
		);
		set_state_locked(&mut locked, rb_id, MmeState::Attached);
		drop(locked);

		if let Ok((PD_ESM, t)) = nas::parse_msg_header(&parsed.esm_msg) {
			if t == EsmMsgType::ActivateDefaultEpsBearerContextAccept as u8 {
				info!(target: "mme", "default bearer setup complete");
			}
		}
	}

	fn parse_authentication_response(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		let Ok(parsed) = nas_msg::unpack_authentication_response(msg) else {
			error!(target: "mme", "undecodable authentication response");
			return;
		};
		let mut locked = user.lock();
		let Some(id) = locked.id() else {
			set_state_locked(&mut locked, rb_id, MmeState::AuthRejected);
			return;
		};
		match self.hss.auth_vec(&id) {
			Some(auth_vec) if auth_vec.res == parsed.res => {
				info!(
					target: "mme",
					"user authentication successful imsi={} imei={}",
					locked.imsi_str(),
					locked.imei_str()
				);
				locked.set_auth_vec(auth_vec);
				set_state_locked(&mut locked, rb_id, MmeState::EnableSecurity);
			}
			Some(_) => {
				info!(target: "mme", "user authentication rejected (RES MISMATCH)");
				set_state_locked(&mut locked, rb_id, MmeState::AuthRejected);
			}
			None => {
				info!(target: "mme", "user authentication rejected (NO AUTH VEC)");
				set_state_locked(&mut locked, rb_id, MmeState::AuthRejected);
			}
		}
	}

	fn parse_authentication_failure(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		let Ok(parsed) = nas_msg::unpack_authentication_failure(msg) else {
			error!(target: "mme", "undecodable authentication failure");
			return;
		};
		if parsed.emm_cause == nas_msg::EMM_CAUSE_SYNCH_FAILURE {
			if let Some(auts) = parsed.auth_fail_param {
				let (id, mcc, mnc) = {
					let locked = user.lock();
					let sys_info = self.sys_info.read();
					(locked.id(), sys_info.mcc, sys_info.mnc)
				};
				if let Some(id) = id {
					self.hss.security_resynch(&id, mcc, mnc, &auts);
					// State stays Authenticate: the machine sends a fresh
					// request from the resynchronised sequence.
					return;
				}
			}
		}
		error!(target: "mme", "authentication failure cause={:#04x}", parsed.emm_cause);
		set_mme_state(user, rb_id, MmeState::Release);
	}

	fn parse_identity_response(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		let Ok(parsed) = nas_msg::unpack_identity_response(msg) else {
			error!(target: "mme", "undecodable identity response");
			return;
		};
		match parsed.mobile_id {
			MobileId::Imsi(imsi) => self.admit_by_imsi(user, rb_id, imsi),
			MobileId::Imei(imei) => self.admit_by_imei(user, rb_id, imei),
			MobileId::Guti(_) => {
				error!(target: "mme", "identity response carrying a GUTI");
			}
		}
	}

	fn parse_security_mode_complete(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		let Ok(parsed) = nas_msg::unpack_security_mode_complete(msg) else {
			error!(target: "mme", "undecodable security mode complete");
			return;
		};
		let locked = user.lock();
		if let (Some(imeisv), Some(id)) = (parsed.imeisv, locked.id()) {
			if id.imei / 10 != imeisv / 100 {
				error!(
					target: "mme",
					"received IMEISV ({imeisv}) does not match stored IMEI ({})",
					id.imei
				);
			}
		}
		drop(locked);
		set_mme_state(user, rb_id, MmeState::RrcSecurity);
	}

	fn parse_security_mode_reject(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		if let Ok(parsed) = nas_msg::unpack_security_mode_reject(msg) {
			error!(target: "mme", "security mode rejected cause={:#04x}", parsed.emm_cause);
		}
		set_mme_state(user, rb_id, MmeState::Release);
	}

	fn parse_service_request(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		let Ok(parsed) = nas_msg::unpack_service_request(msg) else {
			error!(target: "mme", "undecodable service request");
			return;
		};
		{
			let mut locked = user.lock();
			if let Some(rb) = locked.rb_mut(rb_id) {
				rb.mme_proc = MmeProc::ServiceRequest;
			}
		}
		info!(target: "mme", "received service request for RNTI={}", user.lock().c_rnti());

		if parsed.ksi != 0 {
			error!(target: "mme", "invalid KSI ({}) in service request", parsed.ksi);
			self.send_service_reject(user, rb_id, nas_msg::EMM_CAUSE_IMPLICITLY_DETACHED);
			set_mme_state(user, rb_id, MmeState::Release);
			return;
		}

		let (stored_count, id) = {
			let locked = user.lock();
			match locked.auth_vec() {
				Some(auth_vec) => (auth_vec.nas_count_ul, locked.id()),
				None => {
					drop(locked);
					self.send_service_reject(user, rb_id, nas_msg::EMM_CAUSE_IMPLICITLY_DETACHED);
					set_mme_state(user, rb_id, MmeState::Release);
					return;
				}
			}
		};

		if stored_count != u32::from(parsed.seq_num) {
			info!(
				target: "mme",
				"sequence number mismatch (rx={}, stored={stored_count})",
				parsed.seq_num
			);
			let new_count = u32::from(parsed.seq_num);
			let Some(id) = id else {
				self.send_service_reject(user, rb_id, nas_msg::EMM_CAUSE_IMPLICITLY_DETACHED);
				set_mme_state(user, rb_id, MmeState::Release);
				return;
			};
			match self.hss.regenerate_enb_security_data(&id, new_count) {
				Some(fresh) => {
					let mut locked = user.lock();
					if let Some(auth_vec) = locked.auth_vec_mut() {
						auth_vec.nas_count_ul = new_count;
						auth_vec.k_enb = fresh.k_enb;
						auth_vec.k_rrc_int = fresh.k_rrc_int;
						auth_vec.k_rrc_enc = fresh.k_rrc_enc;
						auth_vec.k_up_int = fresh.k_up_int;
						auth_vec.k_up_enc = fresh.k_up_enc;
					}
				}
				None => {
					self.send_service_reject(user, rb_id, nas_msg::EMM_CAUSE_IMPLICITLY_DETACHED);
					set_mme_state(user, rb_id, MmeState::Release);
					return;
				}
			}
		}
		set_mme_state(user, rb_id, MmeState::RrcSecurity);
	}

	fn parse_esm_information_response(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		match nas_msg::unpack_esm_information_response(msg) {
			Ok(parsed) => {
				info!(target: "mme", "ESM information response apn={:?}", parsed.apn);
				set_mme_state(user, rb_id, MmeState::AttachAccept);
			}
			Err(err) => error!(target: "mme", "undecodable ESM information response: {err}"),
		}
	}

	fn parse_detach_request(&self, msg: &[u8], user: &UserRef, rb_id: RbId) {
		let Ok(_parsed) = nas_msg::unpack_detach_request(msg) else {
			error!(target: "mme", "undecodable detach request");
			return;
		};
		let mut locked = user.lock();
		info!(target: "mme", "received detach request imsi={}", locked.imsi_str());
		if let Some(rb) = locked.rb_mut(rb_id) {
			rb.mme_proc = MmeProc::Detach;
			rb.mme_state = MmeState::SendDetachAccept;
		}
		locked.prepare_for_deletion();
	}

	// ---- state machines ----

	fn attach_sm(&self, user: &UserRef, rb_id: RbId, state: MmeState) {
		match state {
			MmeState::IdRequestImsi => self.send_identity_request(user, rb_id),
			MmeState::Reject => {
				user.lock().prepare_for_deletion();
				self.send_attach_reject(user, rb_id);
			}
			MmeState::Authenticate => self.send_authentication_request(user, rb_id),
			MmeState::AuthRejected => self.send_authentication_reject(user, rb_id),
			MmeState::EnableSecurity => self.send_security_mode_command(user, rb_id),
			MmeState::Release => self.send_rrc_command(user, rb_id, RrcCmd::Release),
			MmeState::RrcSecurity => self.send_rrc_command(user, rb_id, RrcCmd::Security),
			MmeState::EsmInfoTransfer => self.send_esm_information_request(user, rb_id),
			MmeState::AttachAccept => self.send_attach_accept(user, rb_id),
			MmeState::Attached => self.send_emm_information(user, rb_id),
			state => {
				error!(target: "mme", "ATTACH state machine invalid state {state:?}");
			}
		}
	}

	fn service_req_sm(&self, user: &UserRef, rb_id: RbId, state: MmeState) {
		match state {
			MmeState::Release => self.send_rrc_command(user, rb_id, RrcCmd::Release),
			MmeState::RrcSecurity => self.send_rrc_command(user, rb_id, RrcCmd::Security),
			MmeState::SetupDrb => {
				self.send_activate_dedicated_eps_bearer_context_request(user, rb_id);
			}
			state => {
				error!(target: "mme", "SERVICE REQUEST state machine invalid state {state:?}");
			}
		}
	}

	fn detach_sm(&self, user: &UserRef, rb_id: RbId, state: MmeState) {
		match state {
			MmeState::SendDetachAccept => {
				self.send_detach_accept(user, rb_id);
				self.send_rrc_command(user, rb_id, RrcCmd::Release);
			}
			state => {
				error!(target: "mme", "DETACH state machine invalid state {state:?}");
			}
		}
	}

	// ---- message senders ----

	fn queue_nas_for_rrc(&self, user: &UserRef, rb_id: RbId, msg: Vec<u8>) {
		let rnti = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			if let Some(rb) = locked.rb_mut(rb_id) {
				rb.queue_rrc_nas_msg(msg);
			}
			rnti
		};
		self.to_rrc
			.send(Dest::Rrc, Message::RrcNasMsgReady { rnti, rb: rb_id });
	}

	fn send_rrc_command(&self, user: &UserRef, rb_id: RbId, cmd: RrcCmd) {
		let rnti = user.lock().c_rnti();
		self.to_rrc
			.send(Dest::Rrc, Message::RrcCmdReady { rnti, rb: rb_id, cmd });
	}

	fn send_identity_request(&self, user: &UserRef, rb_id: RbId) {
		let msg = nas_msg::pack_identity_request(&nas_msg::IdentityRequest {
			id_type: nas_msg::ID_TYPE_IMSI,
		});
		info!(target: "mme", "sending ID request");
		self.queue_nas_for_rrc(user, rb_id, msg);
	}

	fn send_attach_reject(&self, user: &UserRef, rb_id: RbId) {
		let emm_cause = user.lock().emm_cause;
		let msg = nas_msg::pack_attach_reject(&nas_msg::AttachReject { emm_cause });
		info!(target: "mme", "sending attach reject cause={emm_cause:#04x}");
		self.queue_nas_for_rrc(user, rb_id, msg);
		self.send_rrc_command(user, rb_id, RrcCmd::Release);
	}

	fn send_authentication_request(&self, user: &UserRef, rb_id: RbId) {
		let (id, mcc, mnc) = {
			let locked = user.lock();
			let sys_info = self.sys_info.read();
			(locked.id(), sys_info.mcc, sys_info.mnc)
		};
		let Some(id) = id else {
			error!(target: "mme", "authentication requested without an identity");
			return;
		};
		self.hss.generate_security_data(&id, mcc, mnc);
		let Some(auth_vec) = self.hss.auth_vec(&id) else {
			return;
		};
		let msg = nas_msg::pack_authentication_request(&nas_msg::AuthenticationRequest {
			nas_ksi: 0,
			rand: auth_vec.rand,
			autn: auth_vec.autn,
		});
		info!(target: "mme", "sending authentication request imsi={:015}", id.imsi);
		self.queue_nas_for_rrc(user, rb_id, msg);
	}

	fn send_authentication_reject(&self, user: &UserRef, rb_id: RbId) {
		info!(target: "mme", "sending authentication reject");
		self.queue_nas_for_rrc(user, rb_id, nas_msg::pack_authentication_reject());
		self.send_rrc_command(user, rb_id, RrcCmd::Release);
	}

	fn send_security_mode_command(&self, user: &UserRef, rb_id: RbId) {
		let caps = user.lock().caps;
		let msg = nas_msg::pack_security_mode_command(&nas_msg::SecurityModeCommand {
			selected_eea: security::EEA0,
			selected_eia: security::EIA2,
			nas_ksi: 0,
			replayed_ue_security_cap: cap_bytes(&caps),
			imeisv_request: true,
		});
		let protected = self.protect(user, msg, SEC_HDR_INTEGRITY_NEW_CTX);
		info!(target: "mme", "sending security mode command");
		self.queue_nas_for_rrc(user, rb_id, protected);
	}

	fn send_service_reject(&self, user: &UserRef, rb_id: RbId, cause: u8) {
		let msg = nas_msg::pack_service_reject(&nas_msg::ServiceReject { emm_cause: cause });
		info!(target: "mme", "sending service reject cause={cause:#04x}");
		self.queue_nas_for_rrc(user, rb_id, msg);
	}

	fn send_attach_accept(&self, user: &UserRef, rb_id: RbId) {
		let sys_info = self.sys_info.read().clone();
		let m_tmsi = self.user_mgr.get_next_m_tmsi();
		let ip_addr = self.next_ip_addr();

		let esm = {
			let mut locked = user.lock();
			locked.ip_addr = Some(ip_addr);
			if locked.eps_bearer_id == 0 {
				locked.eps_bearer_id = 5;
			}
			if locked.proc_transaction_id == 0 {
				locked.proc_transaction_id = 1;
			}
			nas_msg::pack_activate_default_eps_bearer_context_request(
				&nas_msg::ActivateDefaultEpsBearerContextRequest {
					eps_bearer_id: locked.eps_bearer_id,
					proc_transaction_id: locked.proc_transaction_id,
					qci: 9,
					apn: APN.into(),
					pdn_addr: ip_addr.to_be_bytes(),
					esm_cause: (locked.pdn_type != nas_msg::PDN_TYPE_IPV4)
						.then_some(nas_msg::ESM_CAUSE_PDN_TYPE_IPV4_ONLY_ALLOWED),
					pco: (!locked.pco_reply.opts.is_empty())
						.then(|| locked.pco_reply.clone()),
				},
			)
		};

		let guti = nas_msg::Guti {
			mcc: sys_info.mcc,
			mnc: sys_info.mnc,
			mnc_two_digits: sys_info.mnc_two_digits,
			mme_group_id: 0,
			mme_code: 0,
			m_tmsi,
		};
		user.lock().guti = Some(guti);

		let attach_type = user.lock().attach_type;
		let msg = nas_msg::pack_attach_accept(&nas_msg::AttachAccept {
			eps_attach_result: attach_type,
			t3412: 0,
			tai_mcc: sys_info.mcc,
			tai_mnc: sys_info.mnc,
			tai_mnc_two_digits: sys_info.mnc_two_digits,
			tac: sys_info.sib1.tracking_area_code,
			guti: Some(guti),
			esm_msg: esm,
		});
		let protected = self.protect(user, msg, SEC_HDR_INTEGRITY_AND_CIPHERED);
		info!(
			target: "mme",
			"sending attach accept ip={}.{}.{}.{}",
			ip_addr >> 24,
			(ip_addr >> 16) & 0xFF,
			(ip_addr >> 8) & 0xFF,
			ip_addr & 0xFF
		);
		let rnti = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			if let Some(rb) = locked.rb_mut(rb_id) {
				rb.queue_rrc_nas_msg(protected);
			}
			rnti
		};
		self.to_rrc.send(
			Dest::Rrc,
			Message::RrcCmdReady {
				rnti,
				rb: rb_id,
				cmd: RrcCmd::SetupDefDrb,
			},
		);
	}

	fn send_detach_accept(&self, user: &UserRef, rb_id: RbId) {
		let plain = nas_msg::pack_detach_accept();
		let has_context = user.lock().auth_vec().is_some();
		let msg = if has_context {
			self.protect(user, plain, SEC_HDR_INTEGRITY_AND_CIPHERED)
		} else {
			plain
		};
		info!(target: "mme", "sending detach accept");
		self.queue_nas_for_rrc(user, rb_id, msg);
	}

	fn send_emm_information(&self, user: &UserRef, rb_id: RbId) {
		let now = OffsetDateTime::now_utc();
		let msg = nas_msg::pack_emm_information(&nas_msg::EmmInformation {
			full_net_name: Some(NETWORK_NAME_FULL.into()),
			short_net_name: Some(NETWORK_NAME_SHORT.into()),
			utc_time: Some(nas_msg::UtcTime {
				year: (now.year() % 100) as u8,
				month: u8::from(now.month()),
				day: now.day(),
				hour: now.hour(),
				minute: now.minute(),
				second: now.second(),
				tz: 0,
			}),
		});
		let protected = self.protect(user, msg, SEC_HDR_INTEGRITY_AND_CIPHERED);
		info!(target: "mme", "sending EMM information");
		self.queue_nas_for_rrc(user, rb_id, protected);
	}

	fn send_esm_information_request(&self, user: &UserRef, rb_id: RbId) {
		let proc_transaction_id = {
			let mut locked = user.lock();
			if locked.proc_transaction_id == 0 {
				locked.proc_transaction_id = 1;
			}
			locked.proc_transaction_id
		};
		let msg = nas_msg::pack_esm_information_request(&nas_msg::EsmInformationRequest {
			eps_bearer_id: 0,
			proc_transaction_id,
		});
		let protected = self.protect(user, msg, SEC_HDR_INTEGRITY_AND_CIPHERED);
		info!(target: "mme", "sending ESM information request");
		self.queue_nas_for_rrc(user, rb_id, protected);
	}

	fn send_activate_dedicated_eps_bearer_context_request(&self, user: &UserRef, rb_id: RbId) {
		let (eps_bearer_id, proc_transaction_id) = {
			let mut locked = user.lock();
			if locked.eps_bearer_id == 0 {
				locked.eps_bearer_id = 5;
			}
			(locked.eps_bearer_id, locked.proc_transaction_id)
		};
		// Bidirectional match-protocol filters for UDP, TCP and ICMP.
		let filters = [(1u8, 17u8), (2, 6), (3, 1)]
			.iter()
			.map(|(id, proto)| nas_msg::PacketFilter {
				id: *id,
				direction: 3,
				eval_precedence: *id,
				components: vec![0x30, *proto],
			})
			.collect();
		let msg = nas_msg::pack_activate_dedicated_eps_bearer_context_request(
			&nas_msg::ActivateDedicatedEpsBearerContextRequest {
				eps_bearer_id: eps_bearer_id + 1,
				proc_transaction_id,
				linked_eps_bearer_id: eps_bearer_id,
				qci: 9,
				tft: filters,
			},
		);
		let protected = self.protect(user, msg, SEC_HDR_INTEGRITY_AND_CIPHERED);
		info!(target: "mme", "sending activate dedicated EPS bearer context request");
		let rnti = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			if let Some(rb) = locked.rb_mut(rb_id) {
				rb.queue_rrc_nas_msg(protected);
			}
			rnti
		};
		self.to_rrc.send(
			Dest::Rrc,
			Message::RrcCmdReady {
				rnti,
				rb: rb_id,
				cmd: RrcCmd::SetupDedDrb,
			},
		);
	}

	// ---- helpers ----

	/// Next UE address; low bytes of 0xFF never leave the allocator.
	fn next_ip_addr(&self) -> u32 {
		let mut next = self.next_ip_addr.lock();
		let addr = *next;
		*next += 1;
		if *next & 0xFF == 0xFF {
			*next += 1;
		}
		addr
	}
}

fn set_mme_state(user: &UserRef, rb_id: RbId, state: MmeState) {
	let mut locked = user.lock();
	set_state_locked(&mut locked, rb_id, state);
}

fn set_state_locked(user: &mut crate::user::User, rb_id: RbId, state: MmeState) {
	if let Some(rb) = user.rb_mut(rb_id) {
		rb.mme_state = state;
	}
}

fn caps_from(cap: &UeNetworkCap) -> SecCaps {
	SecCaps {
		eea: AlgMask::from_bits_truncate(cap.eea),
		eia: AlgMask::from_bits_truncate(cap.eia),
		uea: cap.uea.map(AlgMask::from_bits_truncate),
		uia: cap.uia.map(AlgMask::from_bits_truncate),
		gea: cap.gea.map(AlgMask::from_bits_truncate),
	}
}

fn cap_bytes(caps: &SecCaps) -> UeNetworkCap {
	UeNetworkCap {
		eea: caps.eea.bits(),
		eia: caps.eia.bits(),
		uea: caps.uea.map(|mask| mask.bits()),
		uia: caps.uia.map(|mask| mask.bits()),
		gea: caps.gea.map(|mask| mask.bits()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::timer::TimerManager;

	fn mme() -> Arc<Mme> {
		let timers = Arc::new(TimerManager::new());
		let user_mgr = UserMgr::new(timers);
		let hss = Hss::new();
		let config = ConfigDb::new();
		let to_rrc = Msgq::new("mme_to_rrc");
		Mme::new(user_mgr, hss, &config, to_rrc)
	}

	#[test]
	fn ip_allocation_skips_broadcast_tails() {
		let mme = mme();
		*mme.next_ip_addr.lock() = 0xC0A8_01FD;
		assert_eq!(mme.next_ip_addr(), 0xC0A8_01FD);
		assert_eq!(mme.next_ip_addr(), 0xC0A8_01FE);
		// .255 is skipped by the allocator.
		assert_eq!(mme.next_ip_addr(), 0xC0A8_0200);
	}

	#[test]
	fn first_address_is_start_plus_one() {
		let mme = mme();
		assert_eq!(mme.next_ip_addr(), 0xC0A8_0102);
	}

	#[test]
	fn caps_round_trip_through_masks() {
		let wire = UeNetworkCap {
			eea: 0b1100_0000,
			eia: 0b0110_0000,
			uea: Some(0x80),
			uia: None,
			gea: None,
		};
		let caps = caps_from(&wire);
		assert!(caps.eea.supports(0));
		assert!(caps.eia.supports(2));
		assert!(!caps.eia.supports(0));
		assert_eq!(cap_bytes(&caps).eea, wire.eea);
	}
}
