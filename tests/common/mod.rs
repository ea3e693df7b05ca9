//! Shared harness: a paced stack instance plus a minimal UE model that
//! speaks the same codecs from the other side of the air interface.

#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use ferrolte::config::ConfigDb;
use ferrolte::hss::Hss;
use ferrolte::mac::pdu::{pack_pdu, unpack_pdu, unpack_rar, MacPdu, Payload, Rar};
use ferrolte::msgq::{Dest, Message};
use ferrolte::nas::msg as nas_msg;
use ferrolte::phy::{add_to_tti, DlSchedule, PucchType, UlSchedule, TTI_MAX};
use ferrolte::rlc::pdu::{pack_amd, unpack_am, AmPdu, AmdPdu, FramingInfo};
use ferrolte::rrc::msg::{
	pack_ul_ccch_msg, pack_ul_dcch_msg, unpack_dl_ccch_msg, unpack_dl_dcch_msg, ConReqUeId,
	ConRequest, DlCcchMessage, DlDcchMessage, STmsi, UlCcchMessage, UlDcchMessage,
};
use ferrolte::security::{self, AuthVec, Direction};
use ferrolte::user::RbId;
use ferrolte::{nas, Stack, StackOptions};

pub const IMSI: u64 = 1_010_000_000_001;
pub const IMEI: u64 = 355_402_090_000_001;
pub const K: [u8; 16] = [
	0x46, 0x5b, 0x5c, 0xe8, 0xb1, 0x99, 0xb4, 0x9f, 0xaa, 0x5f, 0x0a, 0x2e, 0xe2, 0x38, 0xa6,
	0xbc,
];

pub struct TestEnb {
	pub stack: Stack,
	sched_rx: Receiver<(DlSchedule, UlSchedule)>,
	dl_tti: u32,
}

impl TestEnb {
	pub fn start() -> TestEnb {
		let config = ConfigDb::new();
		// Keep the paced runs quiet: errors and warnings only.
		config
			.set_param_u32(ferrolte::config::Param::DebugType, 0x3)
			.unwrap();
		let hss = Hss::new();
		hss.add_user(IMSI, IMEI, K).unwrap();
		let stack = Stack::start(
			config,
			hss,
			StackOptions {
				enable_gw: false,
				pcap_dir: None,
			},
		)
		.unwrap();

		let (tx, rx) = channel();
		stack.queues.mac_to_phy.attach_rx(0, move |env| {
			if let Message::PhySchedule { dl, ul } = env.msg {
				let _ = tx.send((*dl, *ul));
			}
		});
		TestEnb {
			stack,
			sched_rx: rx,
			dl_tti: 1,
		}
	}

	pub fn dl_tti(&self) -> u32 {
		self.dl_tti
	}

	/// One subframe: pace MAC with an RTS and collect the schedule pair.
	pub fn step(&mut self) -> (DlSchedule, UlSchedule) {
		let dl_tti = self.dl_tti;
		let ul_tti = add_to_tti(dl_tti, TTI_MAX + 1 - 3);
		self.dl_tti = add_to_tti(self.dl_tti, 1);
		self.stack.queues.phy_to_mac.send(
			Dest::Mac,
			Message::ReadyToSend {
				dl_tti,
				ul_tti,
				late: false,
			},
		);
		self.sched_rx
			.recv_timeout(Duration::from_secs(5))
			.expect("MAC must answer every RTS")
	}

	/// Step until the probe yields, bounded by `max` subframes.
	pub fn step_until<T>(
		&mut self,
		max: usize,
		mut probe: impl FnMut(&DlSchedule, &UlSchedule) -> Option<T>,
	) -> T {
		for _ in 0..max {
			let (dl, ul) = self.step();
			if let Some(found) = probe(&dl, &ul) {
				return found;
			}
		}
		panic!("condition not met within {max} subframes");
	}

	pub fn push_prach(&self, preamble: u8, timing_adv: u16) {
		let preambles = [(preamble, timing_adv)].into_iter().collect();
		self.stack.queues.phy_to_mac.send(
			Dest::Mac,
			Message::PrachDecode {
				tti: self.dl_tti,
				preambles,
			},
		);
	}

	pub fn push_pusch(&self, rnti: u16, payload: Vec<u8>) {
		self.stack.queues.phy_to_mac.send(
			Dest::Mac,
			Message::PuschDecode {
				rnti,
				payload,
				tti: self.dl_tti,
			},
		);
	}

	pub fn push_pucch(&self, rnti: u16, pucch_type: PucchType, bit: bool, tti: u32) {
		self.stack.queues.phy_to_mac.send(
			Dest::Mac,
			Message::PucchDecode {
				rnti,
				pucch_type,
				bit,
				tti,
			},
		);
	}
}

/// What the UE model decoded out of one downlink subframe.
#[derive(Debug, Clone)]
pub enum DlEvent {
	Rar(Rar),
	ConResId(u64),
	Ccch(DlCcchMessage),
	Dcch(DlDcchMessage),
}

/// The far side of the air interface: enough UE to run the attach,
/// service-request and detach procedures against the stack.
pub struct TestUe {
	pub c_rnti: u16,
	pub srb1_ul_count: u32,
	pub srb1_dl_count: u32,
	pub rlc_ul_sn: u16,
	pub nas_ul_count: u32,
	pub nas_dl_count: u32,
	pub keys: Option<AuthVec>,
	pub srb1_secured: bool,
}

impl Default for TestUe {
	fn default() -> TestUe {
		TestUe::new()
	}
}

impl TestUe {
	pub fn new() -> TestUe {
		TestUe {
			c_rnti: 0,
			srb1_ul_count: 0,
			srb1_dl_count: 0,
			rlc_ul_sn: 0,
			nas_ul_count: 0,
			nas_dl_count: 0,
			keys: None,
			srb1_secured: false,
		}
	}

	pub fn network_cap() -> nas_msg::UeNetworkCap {
		nas_msg::UeNetworkCap {
			// EEA0/EEA1/EEA2 and EIA1/EIA2.
			eea: 0b1110_0000,
			eia: 0b0110_0000,
			uea: None,
			uia: None,
			gea: None,
		}
	}

	/// Msg3: the CCCH connection request rides transparently.
	pub fn msg3(&self, rrc_msg: &UlCcchMessage) -> Vec<u8> {
		pack_pdu(&MacPdu::single_sdu(RbId::Srb0.lcid(), pack_ul_ccch_msg(rrc_msg)))
	}

	/// Wrap an UL-DCCH message through PDCP and RLC AM for SRB1.
	pub fn ul_dcch(&mut self, msg: &UlDcchMessage) -> Vec<u8> {
		let rrc = pack_ul_dcch_msg(msg);
		let count = self.srb1_ul_count;
		self.srb1_ul_count += 1;

		let mut pdcp = vec![(count & 0x1F) as u8];
		pdcp.extend_from_slice(&rrc);
		let mac_i = match (&self.keys, self.srb1_secured) {
			(Some(keys), true) => security::eia2(
				&security::key128(&keys.k_rrc_int),
				count,
				0,
				Direction::Uplink,
				&pdcp,
			),
			_ => [0u8; 4],
		};
		pdcp.extend_from_slice(&mac_i);

		let amd = AmdPdu {
			rf: false,
			p: false,
			fi: FramingInfo::FullSdu,
			sn: self.rlc_ul_sn,
			data: pdcp,
		};
		self.rlc_ul_sn = (self.rlc_ul_sn + 1) % 1024;
		pack_pdu(&MacPdu::single_sdu(RbId::Srb1.lcid(), pack_amd(&amd)))
	}

	/// Wrap a plain NAS message in the protected envelope with the UE's
	/// running uplink count.
	pub fn protect_nas(&mut self, plain: &[u8], sec_hdr: u8) -> Vec<u8> {
		let keys = self.keys.as_ref().expect("NAS protection needs keys");
		let wrapped = nas::pack_security_protected_nas_msg(
			plain,
			sec_hdr,
			security::EEA0,
			&keys.k_nas_int,
			&keys.k_nas_enc,
			self.nas_ul_count,
			Direction::Uplink,
		);
		self.nas_ul_count += 1;
		wrapped
	}

	/// Verify and strip a downlink protected NAS message.
	pub fn unprotect_nas(&mut self, wrapped: &[u8]) -> Vec<u8> {
		if wrapped.first().map(|b| b >> 4) == Some(0) || wrapped.first().map(|b| b & 0xF) == Some(2)
		{
			return wrapped.to_vec();
		}
		let keys = self.keys.as_ref().expect("NAS protection needs keys");
		let inner = nas::unpack_security_protected_nas_msg(
			wrapped,
			security::EEA0,
			&keys.k_nas_int,
			&keys.k_nas_enc,
			self.nas_dl_count,
			Direction::Downlink,
		)
		.expect("downlink NAS MAC must verify");
		self.nas_dl_count += 1;
		inner
	}

	/// Decode every allocation addressed to this UE (or a RAR) in one DL
	/// subframe.
	pub fn decode_dl(&mut self, dl: &DlSchedule) -> Vec<DlEvent> {
		let mut events = Vec::new();
		for alloc in &dl.dl_allocations {
			if alloc.rnti != self.c_rnti {
				if let Ok(rar) = unpack_rar(&alloc.payload) {
					events.push(DlEvent::Rar(rar));
				}
				continue;
			}
			let Ok(mac_pdu) = unpack_pdu(&alloc.payload, false) else {
				continue;
			};
			for sub in &mac_pdu.subheaders {
				match &sub.payload {
					Payload::ConResId(id) => events.push(DlEvent::ConResId(*id)),
					Payload::Sdu(sdu) if sub.lcid == RbId::Srb0.lcid() => {
						if let Ok(msg) = unpack_dl_ccch_msg(sdu) {
							events.push(DlEvent::Ccch(msg));
						}
					}
					Payload::Sdu(sdu) if sub.lcid == RbId::Srb1.lcid() => {
						self.decode_srb1(sdu, &mut events);
					}
					_ => {}
				}
			}
		}
		events
	}

	fn decode_srb1(&mut self, rlc_pdu: &[u8], events: &mut Vec<DlEvent>) {
		let Ok(AmPdu::Amd(amd)) = unpack_am(rlc_pdu) else {
			return;
		};
		if amd.data.len() < 5 {
			return;
		}
		let count = self.srb1_dl_count;
		self.srb1_dl_count += 1;
		let body = &amd.data[..amd.data.len() - 4];
		let mac_i = &amd.data[amd.data.len() - 4..];
		if mac_i != [0u8; 4] {
			let keys = self.keys.as_ref().expect("secured PDU before keys exist");
			let expected = security::eia2(
				&security::key128(&keys.k_rrc_int),
				count,
				0,
				Direction::Downlink,
				body,
			);
			assert_eq!(mac_i, expected, "downlink PDCP MAC-I mismatch");
		}
		if let Ok(msg) = unpack_dl_dcch_msg(&body[1..]) {
			events.push(DlEvent::Dcch(msg));
		}
	}

	pub fn attach_request_nas(&self, mobile_id: nas_msg::MobileId) -> Vec<u8> {
		let esm = nas_msg::pack_pdn_connectivity_request(&nas_msg::PdnConnectivityRequest {
			eps_bearer_id: 0,
			proc_transaction_id: 1,
			pdn_type: nas_msg::PDN_TYPE_IPV4,
			request_type: 1,
			esm_info_transfer_flag: Some(false),
			pco: Some(nas_msg::Pco {
				opts: vec![(nas_msg::PCO_ID_DNS_SERVER_IPV4_REQUEST, vec![])],
			}),
		});
		nas_msg::pack_attach_request(&nas_msg::AttachRequest {
			eps_attach_type: 1,
			nas_ksi: 7,
			eps_mobile_id: mobile_id,
			ue_network_cap: TestUe::network_cap(),
			esm_msg: esm,
		})
	}

	/// Answer an authentication request the way the USIM would.
	pub fn answer_auth(&self, rand: &[u8; 16]) -> [u8; 8] {
		let opc = security::compute_opc(&K);
		let (res, _ck, _ik, _ak) = security::milenage_f2345(&K, &opc, rand);
		res
	}

	/// Recover the SQN hidden in an AUTN.
	pub fn sqn_from_autn(&self, rand: &[u8; 16], autn: &[u8; 16]) -> u64 {
		let opc = security::compute_opc(&K);
		let (_res, _ck, _ik, ak) = security::milenage_f2345(&K, &opc, rand);
		let mut sqn = 0u64;
		for (i, byte) in ak.iter().enumerate() {
			sqn = (sqn << 8) | u64::from(autn[i] ^ byte);
		}
		sqn
	}
}

// Free function so probe closures can re-borrow the UE without fighting
// the borrow checker inside `step_until`.
pub fn ue_decode(ue: &mut TestUe, dl: &DlSchedule) -> Vec<DlEvent> {
	ue.decode_dl(dl)
}

/// Drive the full random access exchange: preamble in, RAR out, Msg3
/// carrying the RRC connection request, connection setup back.
pub fn random_access(enb: &mut TestEnb, ue: &mut TestUe) {
	enb.push_prach(17, 11);
	let rar = enb.step_until(50, |dl, _ul| {
		dl.dl_allocations
			.iter()
			.find_map(|alloc| unpack_rar(&alloc.payload).ok())
	});
	assert_eq!(rar.rapid, 17);
	ue.c_rnti = rar.temp_c_rnti;

	let request = UlCcchMessage::ConRequest(ConRequest {
		ue_id: ConReqUeId::STmsi(STmsi { mmec: 0, m_tmsi: 42 }),
		cause: 4,
	});
	enb.push_pusch(ue.c_rnti, ue.msg3(&request));

	let mut saw_con_res = false;
	let setup = {
		let ue = &mut *ue;
		let saw = &mut saw_con_res;
		enb.step_until(100, move |dl, _ul| {
			let mut found = None;
			for event in ue_decode(ue, dl) {
				match event {
					DlEvent::ConResId(_) => *saw = true,
					DlEvent::Ccch(DlCcchMessage::ConSetup { config, .. }) => found = Some(config),
					_ => {}
				}
			}
			found
		})
	};
	assert!(saw_con_res, "contention resolution identity must echo back");
	assert!(setup.phy_config.sr_config.is_some());
}

/// Run the whole attach to the ATTACHED state. Returns the assigned IP.
pub fn run_attach(enb: &mut TestEnb, ue: &mut TestUe) -> [u8; 4] {
	random_access(enb, ue);

	// Attach request with the known IMSI rides in the setup complete.
	let attach_nas = ue.attach_request_nas(nas_msg::MobileId::Imsi(IMSI));
	let setup_complete = ue.ul_dcch(&UlDcchMessage::ConSetupComplete {
		rrc_transaction_id: 0,
		selected_plmn_id: 0,
		dedicated_info_nas: attach_nas,
	});
	enb.push_pusch(ue.c_rnti, setup_complete);

	// Authentication request comes straight back; no identity request.
	let rand = {
		let ue = &mut *ue;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				if let DlEvent::Dcch(DlDcchMessage::DlInfoTransfer { dedicated_info_nas, .. }) =
					event
				{
					let req = nas_msg::unpack_authentication_request(&dedicated_info_nas)
						.expect("expected an authentication request");
					return Some(req.rand);
				}
			}
			None
		})
	};

	let res = ue.answer_auth(&rand);
	let auth_resp =
		nas_msg::pack_authentication_response(&nas_msg::AuthenticationResponse { res });
	let msg = ue.ul_dcch(&UlDcchMessage::UlInfoTransfer {
		dedicated_info_nas: auth_resp,
	});
	enb.push_pusch(ue.c_rnti, msg);

	// The eNB now owns a vector; mirror its keys and counts.
	let nas_smc = {
		let ue = &mut *ue;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				if let DlEvent::Dcch(DlDcchMessage::DlInfoTransfer { dedicated_info_nas, .. }) =
					event
				{
					return Some(dedicated_info_nas);
				}
			}
			None
		})
	};
	let id = enb.stack.hss.user_id_from_imsi(IMSI).unwrap();
	ue.keys = Some(enb.stack.hss.auth_vec(&id).unwrap());
	ue.nas_ul_count = 1;
	let inner = ue.unprotect_nas(&nas_smc);
	let smc = nas_msg::unpack_security_mode_command(&inner).unwrap();
	assert_eq!(smc.selected_eea, security::EEA0);
	assert_eq!(smc.selected_eia, security::EIA2);

	let smc_complete = nas_msg::pack_security_mode_complete(&nas_msg::SecurityModeComplete {
		imeisv: Some(IMEI / 10 * 100 + 16),
	});
	let protected = ue.protect_nas(&smc_complete, nas::SEC_HDR_INTEGRITY_AND_CIPHERED);
	let msg = ue.ul_dcch(&UlDcchMessage::UlInfoTransfer {
		dedicated_info_nas: protected,
	});
	enb.push_pusch(ue.c_rnti, msg);

	// RRC security mode command follows; from here SRB1 runs secured.
	{
		let ue2 = &mut *ue;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue2, dl) {
				if let DlEvent::Dcch(DlDcchMessage::SecurityModeCommand { integrity_alg, .. }) =
					event
				{
					assert_eq!(integrity_alg, security::EIA2);
					return Some(());
				}
			}
			None
		});
	}
	ue.srb1_secured = true;
	let msg = ue.ul_dcch(&UlDcchMessage::SecurityModeComplete {
		rrc_transaction_id: 0,
	});
	enb.push_pusch(ue.c_rnti, msg);
	let caps = ue.ul_dcch(&UlDcchMessage::UeCapabilityInfo {
		rrc_transaction_id: 1,
		capabilities: vec![0xE0],
	});
	enb.push_pusch(ue.c_rnti, caps);

	// Reconfiguration carries the attach accept with the default bearer.
	let accept_nas = {
		let ue = &mut *ue;
		enb.step_until(300, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				if let DlEvent::Dcch(DlDcchMessage::ConReconfig {
					dedicated_info_nas: Some(nas),
					config: Some(config),
					..
				}) = event
				{
					assert!(config.drb_to_add.iter().any(|drb| drb.drb_id == 1));
					assert!(config.srb_to_add.contains(&2));
					return Some(nas);
				}
			}
			None
		})
	};
	let inner = ue.unprotect_nas(&accept_nas);
	let accept = nas_msg::unpack_attach_accept(&inner).unwrap();
	let esm =
		nas_msg::unpack_activate_default_eps_bearer_context_request(&accept.esm_msg).unwrap();
	assert!(accept.guti.is_some());
	// The PDN connectivity request asked for a DNS server; the configured
	// one comes back in the PCO.
	let pco = esm.pco.as_ref().expect("PCO echo with the DNS answer");
	assert!(pco
		.opts
		.iter()
		.any(|(id, contents)| *id == nas_msg::PCO_ID_DNS_SERVER_IPV4 && contents == &[8, 8, 8, 8]));

	let msg = ue.ul_dcch(&UlDcchMessage::ConReconfigComplete {
		rrc_transaction_id: 0,
	});
	enb.push_pusch(ue.c_rnti, msg);

	let esm_accept = nas_msg::pack_activate_default_eps_bearer_context_accept(
		&nas_msg::BearerContextAccept {
			eps_bearer_id: esm.eps_bearer_id,
			proc_transaction_id: esm.proc_transaction_id,
		},
	);
	let complete = nas_msg::pack_attach_complete(&nas_msg::AttachComplete {
		esm_msg: esm_accept,
	});
	let protected = ue.protect_nas(&complete, nas::SEC_HDR_INTEGRITY_AND_CIPHERED);
	let msg = ue.ul_dcch(&UlDcchMessage::UlInfoTransfer {
		dedicated_info_nas: protected,
	});
	enb.push_pusch(ue.c_rnti, msg);

	// EMM information closes the procedure.
	let emm_info = {
		let ue = &mut *ue;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				if let DlEvent::Dcch(DlDcchMessage::DlInfoTransfer { dedicated_info_nas, .. }) =
					event
				{
					return Some(dedicated_info_nas);
				}
			}
			None
		})
	};
	let inner = ue.unprotect_nas(&emm_info);
	let info = nas_msg::unpack_emm_information(&inner).unwrap();
	assert!(info.utc_time.is_some());

	esm.pdn_addr
}
