//! Radio resource control: connection-scoped procedures.
//!
//! SRB0 runs the CCCH state machine (connection setup and
//! reestablishment); SRB1/SRB2 run the DCCH machine. MME drives downlink
//! procedures through the command queue. System-information broadcast is
//! constructed by the config DB and scheduled by MAC; RRC owns only the
//! per-connection signalling.

pub mod msg;

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::sysinfo::SysInfo;
use crate::mac::Mac;
use crate::msgq::{Dest, Envelope, Message, Msgq, RrcCmd, RrcCmdResp};
use crate::rrc::msg::{
	pack_dl_ccch_msg, pack_dl_dcch_msg, unpack_ul_ccch_msg, unpack_ul_dcch_msg, ConReqUeId,
	DlCcchMessage, DlDcchMessage, DrbToAdd, PhysicalConfigDedicated, RadioResourceConfigDedicated,
	SrConfig, UlCcchMessage, UlDcchMessage,
};
use crate::security;
use crate::user::rb::{PdcpConfig, RbId, RrcProc, RrcState};
use crate::user::{UserMgr, UserRef};

const I_SR_MIN: u32 = 15;
const I_SR_MAX: u32 = 34;
const N_1_P_PUCCH_SR: u32 = 1;

/// RAT types listed in the capability enquiry.
const RAT_TYPES: [u8; 5] = [0, 1, 2, 3, 4];

pub struct Rrc {
	user_mgr: Arc<UserMgr>,
	mac: Arc<Mac>,
	to_pdcp: Arc<Msgq>,
	to_mme: Arc<Msgq>,
	sys_info: RwLock<SysInfo>,
	i_sr: Mutex<u32>,
}

impl Rrc {
	pub fn new(
		user_mgr: Arc<UserMgr>,
		mac: Arc<Mac>,
		to_pdcp: Arc<Msgq>,
		to_mme: Arc<Msgq>,
	) -> Arc<Rrc> {
		Arc::new(Rrc {
			user_mgr,
			mac,
			to_pdcp,
			to_mme,
			sys_info: RwLock::new(SysInfo::default()),
			i_sr: Mutex::new(I_SR_MIN),
		})
	}

	pub fn update_sys_info(&self, sys_info: &SysInfo) {
		*self.sys_info.write() = sys_info.clone();
	}

	pub fn start(
		self: &Arc<Rrc>,
		from_pdcp: &Arc<Msgq>,
		from_mme: &Arc<Msgq>,
	) -> Vec<std::thread::JoinHandle<()>> {
		let rrc = Arc::clone(self);
		let pdcp_rx = from_pdcp.attach_rx(0, move |env| rrc.handle_pdcp_msg(env));
		let rrc = Arc::clone(self);
		let mme_rx = from_mme.attach_rx(0, move |env| rrc.handle_mme_msg(env));
		vec![pdcp_rx, mme_rx]
	}

	fn handle_pdcp_msg(&self, env: Envelope) {
		if env.dest != Dest::Rrc && env.dest != Dest::Any {
			self.to_mme.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::RrcPduReady { rnti, rb } => self.handle_pdu_ready(rnti, rb),
			msg => warn!(target: "rrc", "invalid PDCP message {msg:?}"),
		}
	}

	fn handle_mme_msg(&self, env: Envelope) {
		if env.dest != Dest::Rrc && env.dest != Dest::Any {
			self.to_pdcp.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::RrcNasMsgReady { rnti, rb } => self.handle_nas_msg(rnti, rb),
			Message::RrcCmdReady { rnti, rb, cmd } => self.handle_cmd(rnti, rb, cmd),
			msg => warn!(target: "rrc", "invalid MME message {msg:?}"),
		}
	}

	// ---- PDCP handlers ----

	fn handle_pdu_ready(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "rrc", "PDU for unknown RNTI={rnti}");
			return;
		};
		loop {
			let pdu = {
				let mut locked = user.lock();
				let Some(rb) = locked.rb_mut(rb_id) else {
					error!(target: "rrc", "PDU for missing {rb_id} RNTI={rnti}");
					return;
				};
				rb.pop_rrc_pdu()
			};
			let Some(pdu) = pdu else {
				break;
			};
			debug!(target: "rrc", "PDU received RNTI={rnti} RB={rb_id} ({} bytes)", pdu.len());
			match rb_id {
				RbId::Srb0 => self.ccch_sm(&pdu, &user),
				RbId::Srb1 | RbId::Srb2 => self.dcch_sm(&pdu, &user, rb_id),
				_ => {
					error!(target: "rrc", "PDU received on invalid RB={rb_id} RNTI={rnti}");
				}
			}
		}
	}

	// ---- MME handlers ----

	fn handle_nas_msg(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "rrc", "NAS message for unknown RNTI={rnti}");
			return;
		};
		let nas = {
			let mut locked = user.lock();
			locked.rb_mut(rb_id).and_then(|rb| rb.pop_rrc_nas_msg())
		};
		match nas {
			Some(nas) => self.send_dl_info_transfer(&user, rb_id, nas),
			None => error!(target: "rrc", "NAS message ready with no message queued"),
		}
	}

	fn handle_cmd(&self, rnti: u16, rb_id: RbId, cmd: RrcCmd) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "rrc", "command {cmd:?} for unknown RNTI={rnti}");
			return;
		};
		info!(target: "rrc", "received MME command {cmd:?} for RNTI={rnti} RB={rb_id}");
		match cmd {
			RrcCmd::Release => self.send_rrc_con_release(&user, rb_id),
			RrcCmd::Security => {
				self.send_ue_capability_enquiry(&user, rb_id);
				self.send_security_mode_command(&user, rb_id);
			}
			RrcCmd::SetupDefDrb => self.setup_drbs(&user, rb_id, false),
			RrcCmd::SetupDedDrb => self.setup_drbs(&user, rb_id, true),
		}
	}

	fn setup_drbs(&self, user: &UserRef, rb_id: RbId, dedicated: bool) {
		let nas = {
			let mut locked = user.lock();
			let eps_bearer_id = locked.eps_bearer_id;
			let (proc_state, srb1_config) = match locked.rb(RbId::Srb1) {
				Some(srb1) => (
					(srb1.rrc_proc, srb1.rrc_state, srb1.mme_proc, srb1.mme_state),
					srb1.pdcp_config,
				),
				None => {
					error!(target: "rrc", "cannot set up DRBs without SRB1");
					return;
				}
			};

			match locked.setup_rb(RbId::Srb2) {
				Ok(srb2) => {
					srb2.rrc_proc = proc_state.0;
					srb2.rrc_state = proc_state.1;
					srb2.mme_proc = proc_state.2;
					srb2.mme_state = proc_state.3;
					srb2.pdcp_config = srb1_config;
				}
				Err(err) => {
					error!(target: "rrc", "cannot set up SRB2: {err}");
					return;
				}
			}
			match locked.setup_rb(RbId::Drb1) {
				Ok(drb1) => {
					drb1.eps_bearer_id = eps_bearer_id;
					drb1.drb_id = 1;
					drb1.lc_id = 3;
					drb1.log_chan_group = 2;
					drb1.pdcp_config = PdcpConfig::Plain;
				}
				Err(err) => {
					error!(target: "rrc", "cannot set up DRB1: {err}");
					return;
				}
			}
			if dedicated {
				match locked.setup_rb(RbId::Drb2) {
					Ok(drb2) => {
						drb2.eps_bearer_id = eps_bearer_id + 1;
						drb2.drb_id = 2;
						drb2.lc_id = 4;
						drb2.log_chan_group = 3;
						drb2.pdcp_config = PdcpConfig::Plain;
					}
					Err(err) => {
						error!(target: "rrc", "cannot set up DRB2: {err}");
						return;
					}
				}
			}
			locked.rb_mut(rb_id).and_then(|rb| rb.pop_rrc_nas_msg())
		};
		self.send_rrc_con_reconfig(user, rb_id, nas, dedicated);
	}

	// ---- state machines ----

	fn ccch_sm(&self, pdu: &[u8], user: &UserRef) {
		let parsed = match unpack_ul_ccch_msg(pdu) {
			Ok(parsed) => parsed,
			Err(err) => {
				error!(target: "rrc", "undecodable UL-CCCH message: {err}");
				return;
			}
		};
		match parsed {
			UlCcchMessage::ConRequest(req) => {
				// A known S-TMSI folds the new C-RNTI onto the existing
				// record.
				let mut active = Arc::clone(user);
				if let ConReqUeId::STmsi(s_tmsi) = req.ue_id {
					if let Some(existing) =
						self.user_mgr.find_user_s_tmsi(s_tmsi.mmec, s_tmsi.m_tmsi)
					{
						if !Arc::ptr_eq(&existing, user) {
							let c_rnti = user.lock().c_rnti();
							{
								let mut locked_existing = existing.lock();
								let mut locked_new = user.lock();
								locked_existing.take_rbs_from(&mut locked_new);
							}
							self.user_mgr.transfer_c_rnti(c_rnti, &existing);
							active = existing;
							info!(
								target: "rrc",
								"IMSI={} is associated with RNTI={c_rnti}",
								active.lock().imsi_str()
							);
						}
					}
				}

				let mut locked = active.lock();
				let rnti = locked.c_rnti();
				let srb0 = locked.srb0();
				srb0.rrc_proc = RrcProc::ConRequest;
				if srb0.rrc_state != RrcState::Idle {
					error!(
						target: "rrc",
						"connection request in invalid state {:?}",
						srb0.rrc_state
					);
					return;
				}
				srb0.rrc_state = RrcState::Srb1Setup;
				match locked.setup_rb(RbId::Srb1) {
					Ok(srb1) => {
						srb1.rrc_proc = RrcProc::ConRequest;
						srb1.rrc_state = RrcState::WaitForConSetupComplete;
					}
					Err(err) => {
						error!(target: "rrc", "UL-CCCH-Message can't setup srb1: {err}");
						return;
					}
				}
				drop(locked);
				info!(target: "rrc", "connection request RNTI={rnti} cause={}", req.cause);
				self.send_rrc_con_setup(&active);
			}
			UlCcchMessage::ConReestRequest(req) => {
				let Some(existing) = self.user_mgr.find_user(req.c_rnti) else {
					info!(
						target: "rrc",
						"reestablishment for unknown C-RNTI={}, rejecting",
						req.c_rnti
					);
					self.send_rrc_con_reest_reject(user);
					return;
				};
				if !Arc::ptr_eq(&existing, user) {
					let c_rnti = user.lock().c_rnti();
					{
						let mut locked_existing = existing.lock();
						let mut locked_new = user.lock();
						locked_existing.take_rbs_from(&mut locked_new);
					}
					self.user_mgr.transfer_c_rnti(c_rnti, &existing);
				}
				let mut locked = existing.lock();
				let srb0 = locked.srb0();
				srb0.rrc_proc = RrcProc::ConReestRequest;
				srb0.rrc_state = RrcState::Srb1Setup;
				match locked.setup_rb(RbId::Srb1) {
					Ok(srb1) => {
						srb1.rrc_proc = RrcProc::ConReestRequest;
						srb1.rrc_state = RrcState::WaitForConReestComplete;
					}
					Err(err) => {
						error!(target: "rrc", "reestablishment can't setup srb1: {err}");
						drop(locked);
						self.send_rrc_con_reest_reject(&existing);
						return;
					}
				}
				drop(locked);
				self.send_rrc_con_reest(&existing);
			}
		}
	}

	fn dcch_sm(&self, pdu: &[u8], user: &UserRef, rb_id: RbId) {
		let parsed = match unpack_ul_dcch_msg(pdu) {
			Ok(parsed) => parsed,
			Err(err) => {
				error!(target: "rrc", "undecodable UL-DCCH message: {err}");
				return;
			}
		};
		let rnti = user.lock().c_rnti();
		match parsed {
			UlDcchMessage::ConSetupComplete {
				dedicated_info_nas, ..
			} => {
				let mut locked = user.lock();
				if let Some(rb) = locked.rb_mut(rb_id) {
					rb.rrc_state = RrcState::Connected;
					rb.queue_mme_nas_msg(dedicated_info_nas);
				}
				drop(locked);
				info!(target: "rrc", "connection setup complete RNTI={rnti}");
				self.to_mme
					.send(Dest::Mme, Message::MmeNasMsgReady { rnti, rb: rb_id });
			}
			UlDcchMessage::ConReestComplete { .. } => {
				if let Some(rb) = user.lock().rb_mut(rb_id) {
					rb.rrc_state = RrcState::Connected;
				}
			}
			UlDcchMessage::UlInfoTransfer { dedicated_info_nas } => {
				if let Some(rb) = user.lock().rb_mut(rb_id) {
					rb.queue_mme_nas_msg(dedicated_info_nas);
				}
				self.to_mme
					.send(Dest::Mme, Message::MmeNasMsgReady { rnti, rb: rb_id });
			}
			UlDcchMessage::SecurityModeComplete { .. } => {
				self.to_mme.send(
					Dest::Mme,
					Message::MmeRrcCmdResp {
						rnti,
						rb: rb_id,
						resp: RrcCmdResp::Security,
					},
				);
			}
			UlDcchMessage::SecurityModeFailure { .. } => {
				error!(target: "rrc", "security mode failure RNTI={rnti}");
			}
			UlDcchMessage::ConReconfigComplete { .. } => {}
			UlDcchMessage::UeCapabilityInfo { capabilities, .. } => {
				info!(
					target: "rrc",
					"UE capability information for RNTI={rnti} ({} bytes)",
					capabilities.len()
				);
			}
		}
	}

	// ---- message senders ----

	fn queue_for_pdcp(&self, user: &UserRef, rb_id: RbId, pdu: Vec<u8>) {
		let rnti = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			if let Some(rb) = locked.rb_mut(rb_id) {
				rb.queue_pdcp_sdu(pdu);
			}
			rnti
		};
		self.to_pdcp
			.send(Dest::Pdcp, Message::PdcpSduReady { rnti, rb: rb_id });
	}

	fn alloc_sr_resource(&self, rnti: u16) -> SrConfig {
		let mut i_sr = self.i_sr.lock();
		let allocated = *i_sr;
		*i_sr = if *i_sr >= I_SR_MAX { I_SR_MIN } else { *i_sr + 1 };
		self.mac.add_periodic_sr_pucch(rnti, allocated, N_1_P_PUCCH_SR);
		SrConfig {
			i_sr: allocated as u8,
			n_1_pucch_sr: N_1_P_PUCCH_SR as u16,
		}
	}

	fn default_srb1_config(&self, rnti: u16) -> RadioResourceConfigDedicated {
		RadioResourceConfigDedicated {
			srb_to_add: vec![1],
			drb_to_add: vec![],
			phy_config: PhysicalConfigDedicated {
				sr_config: Some(self.alloc_sr_resource(rnti)),
			},
		}
	}

	fn send_rrc_con_setup(&self, user: &UserRef) {
		let (rnti, transaction_id) = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			(rnti, locked.srb0().rrc_transaction_id)
		};
		let msg = DlCcchMessage::ConSetup {
			rrc_transaction_id: transaction_id,
			config: self.default_srb1_config(rnti),
		};
		info!(target: "rrc", "sending RRC connection setup RNTI={rnti}");
		self.queue_for_pdcp(user, RbId::Srb0, pack_dl_ccch_msg(&msg));
	}

	fn send_rrc_con_reest(&self, user: &UserRef) {
		let (rnti, transaction_id) = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			(rnti, locked.srb0().rrc_transaction_id)
		};
		let msg = DlCcchMessage::ConReest {
			rrc_transaction_id: transaction_id,
			config: self.default_srb1_config(rnti),
		};
		info!(target: "rrc", "sending RRC connection reestablishment RNTI={rnti}");
		self.queue_for_pdcp(user, RbId::Srb0, pack_dl_ccch_msg(&msg));
	}

	fn send_rrc_con_reest_reject(&self, user: &UserRef) {
		let rnti = user.lock().c_rnti();
		info!(target: "rrc", "sending RRC connection reestablishment reject RNTI={rnti}");
		self.queue_for_pdcp(user, RbId::Srb0, pack_dl_ccch_msg(&DlCcchMessage::ConReestReject));
	}

	fn send_rrc_con_release(&self, user: &UserRef, rb_id: RbId) {
		let (rnti, transaction_id) = {
			let locked = user.lock();
			(
				locked.c_rnti(),
				locked.rb(rb_id).map(|rb| rb.rrc_transaction_id).unwrap_or(0),
			)
		};
		let msg = DlDcchMessage::ConRelease {
			rrc_transaction_id: transaction_id,
			release_cause: 1, // other
		};
		info!(target: "rrc", "sending RRC connection release RNTI={rnti}");
		self.mac.remove_periodic_sr_pucch(rnti);
		self.queue_for_pdcp(user, rb_id, pack_dl_dcch_msg(&msg));
	}

	fn send_security_mode_command(&self, user: &UserRef, rb_id: RbId) {
		let (rnti, transaction_id) = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			let Some(rb) = locked.rb_mut(rb_id) else {
				return;
			};
			// The command itself already rides under the new context.
			rb.pdcp_config = PdcpConfig::Security;
			(rnti, rb.rrc_transaction_id)
		};
		let msg = DlDcchMessage::SecurityModeCommand {
			rrc_transaction_id: transaction_id,
			cipher_alg: security::EEA0,
			integrity_alg: security::EIA2,
		};
		info!(target: "rrc", "sending security mode command RNTI={rnti}");
		self.queue_for_pdcp(user, rb_id, pack_dl_dcch_msg(&msg));
	}

	fn send_ue_capability_enquiry(&self, user: &UserRef, rb_id: RbId) {
		let transaction_id = {
			let locked = user.lock();
			locked
				.rb(rb_id)
				.map(|rb| (rb.rrc_transaction_id + 1) % 4)
				.unwrap_or(0)
		};
		let msg = DlDcchMessage::UeCapabilityEnquiry {
			rrc_transaction_id: transaction_id,
			rat_types: RAT_TYPES.to_vec(),
		};
		self.queue_for_pdcp(user, rb_id, pack_dl_dcch_msg(&msg));
	}

	fn send_dl_info_transfer(&self, user: &UserRef, rb_id: RbId, nas: Vec<u8>) {
		let (rnti, transaction_id) = {
			let locked = user.lock();
			(
				locked.c_rnti(),
				locked.rb(rb_id).map(|rb| rb.rrc_transaction_id).unwrap_or(0),
			)
		};
		let msg = DlDcchMessage::DlInfoTransfer {
			rrc_transaction_id: transaction_id,
			dedicated_info_nas: nas,
		};
		debug!(target: "rrc", "sending DL info transfer RNTI={rnti} RB={rb_id}");
		self.queue_for_pdcp(user, rb_id, pack_dl_dcch_msg(&msg));
	}

	fn send_rrc_con_reconfig(
		&self,
		user: &UserRef,
		rb_id: RbId,
		nas: Option<Vec<u8>>,
		dedicated: bool,
	) {
		let (rnti, transaction_id, drbs) = {
			let locked = user.lock();
			let mut drbs = Vec::new();
			for id in [RbId::Drb1, RbId::Drb2] {
				if id == RbId::Drb2 && !dedicated {
					continue;
				}
				if let Some(rb) = locked.rb(id) {
					drbs.push(DrbToAdd {
						eps_bearer_id: rb.eps_bearer_id,
						drb_id: rb.drb_id,
						lc_id: rb.lc_id,
						log_chan_group: rb.log_chan_group,
					});
				}
			}
			(
				locked.c_rnti(),
				locked.rb(rb_id).map(|rb| rb.rrc_transaction_id).unwrap_or(0),
				drbs,
			)
		};
		let config = RadioResourceConfigDedicated {
			srb_to_add: vec![2],
			drb_to_add: drbs,
			phy_config: PhysicalConfigDedicated {
				sr_config: Some(self.alloc_sr_resource(rnti)),
			},
		};
		let msg = DlDcchMessage::ConReconfig {
			rrc_transaction_id: transaction_id,
			dedicated_info_nas: nas,
			config: Some(config),
		};
		info!(target: "rrc", "sending RRC connection reconfiguration RNTI={rnti}");
		self.queue_for_pdcp(user, rb_id, pack_dl_dcch_msg(&msg));
	}
}
