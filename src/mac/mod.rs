// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Medium access control: the subframe-accurate scheduler.
//!
//! Owns the 10-slot downlink/uplink subframe rings, the RAR/DL/UL/SR
//! scheduling queues, HARQ retransmission, and the uplink PDU
//! demultiplexer. The PHY paces everything through `ReadyToSend`.

pub mod pdu;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::sysinfo::SysInfo;
use crate::mac::pdu::{
	bsr_max_bytes, pack_pdu, pack_rar, unpack_pdu, MacPdu, Payload, Rar, SubHeader, LCID_CCCH,
	LCID_DCCH_BEGIN, LCID_DCCH_END, LCID_PADDING, LCID_UE_CON_RES_ID,
};
use crate::msgq::{Dest, Envelope, Message, Msgq};
use crate::pcap::{Pcap, PcapDirection};
use crate::phy::{
	self, add_to_tti, is_tti_in_future, Allocation, DlSchedule, Modulation, Pucch, PucchType,
	UlSchedule, TTI_MAX,
};
use crate::timer::TimerManager;
use crate::user::rb::RbId;
use crate::user::{UserMgr, UserRef, USER_INACTIVITY_TIMER_MS};

/// Retransmission ceiling per allocation; beyond it the PDU is dropped.
pub const MAX_HARQ_RETX: u8 = 5;

/// UL grant floor: room for a long BSR and a little headroom.
const BSR_GRANT_SIZE_BYTES: u32 = 10;

struct RarSched {
	dl_alloc: Allocation,
	ul_alloc: Allocation,
	rar: Rar,
	tti: u32,
}

struct DlSched {
	alloc: Allocation,
	mac_pdu: MacPdu,
	tti: u32,
}

struct UlSched {
	alloc: Allocation,
	tti: u32,
}

struct SrEntry {
	i_sr: u32,
	n_1_p_pucch: u32,
	rnti: u16,
}

struct SchedState {
	dl_subfr: [DlSchedule; 10],
	ul_subfr: [UlSchedule; 10],
	cur_dl: usize,
	cur_ul: usize,
}

impl SchedState {
	fn new(sys_info: &SysInfo) -> SchedState {
		let mut state = SchedState {
			dl_subfr: Default::default(),
			ul_subfr: Default::default(),
			cur_dl: 3,
			cur_ul: 0,
		};
		for i in 0..10 {
			state.dl_subfr[i].current_tti = i as u32;
			state.dl_subfr[i].n_avail_prbs = sys_info
				.n_rb_dl
				.saturating_sub(n_reserved_prbs(sys_info, i as u32));
			state.ul_subfr[i].current_tti = i as u32;
			state.ul_subfr[i].n_avail_prbs = sys_info.n_rb_ul;
		}
		// Slots 0..2 already belong to the next frame at start.
		for i in 0..3 {
			state.dl_subfr[i].current_tti = (i + 10) as u32;
		}
		state
	}
}

pub struct Mac {
	user_mgr: Arc<UserMgr>,
	timers: Arc<TimerManager>,
	pcap: Arc<Pcap>,
	to_phy: Arc<Msgq>,
	to_rlc: Arc<Msgq>,
	to_timer: Arc<Msgq>,
	sys_info: RwLock<SysInfo>,
	sched: Mutex<SchedState>,
	rar_queue: Mutex<VecDeque<RarSched>>,
	dl_queue: Mutex<VecDeque<DlSched>>,
	ul_queue: Mutex<VecDeque<UlSched>>,
	sr_queue: Mutex<Vec<SrEntry>>,
	tick: AtomicU32,
	/// Subframes dropped by TTI resynchronisation since start.
	pub skipped_subframes: AtomicU32,
}

impl Mac {
	pub fn new(
		user_mgr: Arc<UserMgr>,
		timers: Arc<TimerManager>,
		pcap: Arc<Pcap>,
		to_phy: Arc<Msgq>,
		to_rlc: Arc<Msgq>,
		to_timer: Arc<Msgq>,
	) -> Arc<Mac> {
		Arc::new(Mac {
			user_mgr,
			timers,
			pcap,
			to_phy,
			to_rlc,
			to_timer,
			sys_info: RwLock::new(SysInfo::default()),
			sched: Mutex::new(SchedState::new(&SysInfo::default())),
			rar_queue: Mutex::new(VecDeque::new()),
			dl_queue: Mutex::new(VecDeque::new()),
			ul_queue: Mutex::new(VecDeque::new()),
			sr_queue: Mutex::new(Vec::new()),
			tick: AtomicU32::new(0),
			skipped_subframes: AtomicU32::new(0),
		})
	}

	pub fn update_sys_info(&self, sys_info: &SysInfo) {
		*self.sys_info.write() = sys_info.clone();
		*self.sched.lock() = SchedState::new(sys_info);
	}

	/// Spawn the consumers. The PHY-facing queue runs at real-time
	/// priority to hold the 1 ms subframe deadline.
	pub fn start(
		self: &Arc<Mac>,
		from_phy: &Arc<Msgq>,
		from_rlc: &Arc<Msgq>,
	) -> Vec<std::thread::JoinHandle<()>> {
		let mac = Arc::clone(self);
		let phy_rx = from_phy.attach_rx(90, move |env| mac.handle_phy_msg(env));
		let mac = Arc::clone(self);
		let rlc_rx = from_rlc.attach_rx(0, move |env| mac.handle_rlc_msg(env));
		vec![phy_rx, rlc_rx]
	}

	fn handle_phy_msg(&self, env: Envelope) {
		if env.dest != Dest::Mac && env.dest != Dest::Any {
			self.to_rlc.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::ReadyToSend { dl_tti, ul_tti, late } => {
				self.handle_ready_to_send(dl_tti, ul_tti, late);
			}
			Message::PrachDecode { tti, preambles } => {
				for (preamble, timing_adv) in preambles {
					self.construct_random_access_response(preamble, timing_adv, tti);
				}
			}
			Message::PucchDecode { rnti, pucch_type, bit, tti } => {
				self.handle_pucch_decode(rnti, pucch_type, bit, tti);
			}
			Message::PuschDecode { rnti, payload, tti } => {
				self.handle_pusch_decode(rnti, &payload, tti);
			}
			msg => warn!(target: "mac", "invalid PHY message {msg:?}"),
		}
	}

	fn handle_rlc_msg(&self, env: Envelope) {
		if env.dest != Dest::Mac && env.dest != Dest::Any {
			self.to_phy.send(env.dest, env.msg);
			return;
		}
		match env.msg {
			Message::MacSduReady { rnti, rb } => self.handle_sdu_ready(rnti, rb),
			msg => debug!(target: "mac", "invalid RLC message {msg:?}"),
		}
	}

	// ---- external interface ----

	/// Register a periodic SR-PUCCH reservation for a connected UE.
	pub fn add_periodic_sr_pucch(&self, rnti: u16, i_sr: u32, n_1_p_pucch: u32) {
		self.sr_queue.lock().push(SrEntry {
			i_sr,
			n_1_p_pucch: n_1_p_pucch.saturating_sub(1),
			rnti,
		});
	}

	pub fn remove_periodic_sr_pucch(&self, rnti: u16) {
		self.sr_queue.lock().retain(|entry| entry.rnti != rnti);
	}

	pub fn has_periodic_sr_pucch(&self, rnti: u16) -> bool {
		self.sr_queue.lock().iter().any(|entry| entry.rnti == rnti)
	}

	// ---- PHY handlers ----

	fn handle_ready_to_send(&self, dl_tti: u32, ul_tti: u32, late: bool) {
		if late {
			warn!(target: "mac", "PHY reported a missed deadline at DL TTI {dl_tti}");
		}
		let tick = self.tick.fetch_add(1, Ordering::Relaxed);
		self.to_timer
			.send(Dest::TimerMgr, Message::TimerTick { tick });

		let sys_info = self.sys_info.read();
		let mut sched = self.sched.lock();
		let mac_dl_tti = sched.dl_subfr[sched.cur_dl].current_tti;
		let diff = i64::from(mac_dl_tti) - i64::from(dl_tti);
		if diff != 2 {
			// Fast-forward enough subframes to restore the +2 lead.
			let num_to_skip = if diff.abs() > 1000 {
				0
			} else if diff < 0 {
				(-diff + 3) as u32
			} else {
				0
			};
			info!(
				target: "mac",
				"MAC DL TTI {mac_dl_tti} vs PHY DL TTI {dl_tti}, skipping {num_to_skip} subframes"
			);
			self.skipped_subframes.fetch_add(num_to_skip, Ordering::Relaxed);
			for _ in 0..num_to_skip {
				advance_ring(&mut sched, &sys_info);
			}
			return;
		}
		if mac_dl_tti != add_to_tti(dl_tti, 2)
			|| sched.ul_subfr[sched.cur_ul].current_tti != add_to_tti(ul_tti, 2)
		{
			error!(
				target: "mac",
				"RTS issue DL {mac_dl_tti}:{dl_tti}, UL {}:{ul_tti}",
				sched.ul_subfr[sched.cur_ul].current_tti
			);
			return;
		}

		let dl = Box::new(sched.dl_subfr[sched.cur_dl].clone());
		let ul = Box::new(sched.ul_subfr[sched.cur_ul].clone());
		self.to_phy.send(Dest::Phy, Message::PhySchedule { dl, ul });

		advance_ring(&mut sched, &sys_info);
		self.scheduler(&sys_info, &mut sched);
	}

	fn handle_pucch_decode(&self, rnti: u16, pucch_type: PucchType, bit: bool, tti: u32) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "mac", "PUCCH decode for unknown RNTI={rnti} TTI={tti}");
			return;
		};
		match pucch_type {
			PucchType::AckNack => self.handle_pucch_ack_nack(&user, tti, bit),
			PucchType::Sr => self.handle_pucch_sr(&user, tti, bit),
		}
	}

	fn handle_pucch_ack_nack(&self, user: &UserRef, tti: u32, ack: bool) {
		let mut locked = user.lock();
		let rnti = locked.c_rnti();
		if ack {
			locked.clear_harq_info(tti);
			debug!(target: "mac", "HARQ ACK RNTI={rnti} TTI={tti}");
			return;
		}
		let Some(mut entry) = locked.clear_harq_info(tti) else {
			error!(target: "mac", "no HARQ info RNTI={rnti} TTI={tti}");
			return;
		};
		drop(locked);
		if entry.alloc.harq_retx_count >= MAX_HARQ_RETX {
			error!(target: "mac", "HARQ retx limit reached RNTI={rnti} TTI={tti}");
			return;
		}
		entry.alloc.harq_retx_count += 1;
		info!(
			target: "mac",
			"HARQ retransmission {} RNTI={rnti} TTI={tti}",
			entry.alloc.harq_retx_count
		);
		let retx_tti = {
			let sched = self.sched.lock();
			add_to_tti(sched.dl_subfr[sched.cur_dl].current_tti, 4)
		};
		self.add_to_dl_sched_queue(retx_tti, entry.mac_pdu, entry.alloc);
	}

	fn handle_pucch_sr(&self, user: &UserRef, tti: u32, present: bool) {
		if !present {
			return;
		}
		let rnti = user.lock().c_rnti();
		info!(target: "mac", "PUCCH SR received for {tti} RNTI={rnti}");
		self.sched_ul(user, BSR_GRANT_SIZE_BYTES * 8);
	}

	fn handle_pusch_decode(&self, rnti: u16, payload: &[u8], tti: u32) {
		let Some(mut user) = self.user_mgr.find_user(rnti) else {
			error!(target: "mac", "PUSCH decode for invalid RNTI ({rnti})");
			return;
		};
		self.user_mgr.reset_c_rnti_timer(rnti);
		self.reset_inactivity_timer(&user);
		user.lock().age_out_harq(tti);
		self.pcap
			.send_lte_pcap_msg(PcapDirection::Uplink, rnti, tti, payload);

		let mac_pdu = match unpack_pdu(payload, true) {
			Ok(mac_pdu) => mac_pdu,
			Err(err) => {
				error!(target: "mac", "undecodable PUSCH PDU RNTI={rnti}: {err}");
				return;
			}
		};
		for sub in &mac_pdu.subheaders {
			match (&sub.payload, sub.lcid) {
				(Payload::Sdu(sdu), LCID_CCCH) => self.handle_ulsch_ccch_sdu(&user, sdu),
				(Payload::Sdu(sdu), lcid) if (LCID_DCCH_BEGIN..=LCID_DCCH_END).contains(&lcid) => {
					self.handle_ulsch_dcch_sdu(&user, lcid, sdu);
				}
				(Payload::CRnti(embedded), _) => {
					if let Some(rebound) = self.handle_ulsch_c_rnti(&user, *embedded) {
						user = rebound;
					}
				}
				(Payload::TruncatedBsr { lcg_id, bsr_idx }, _) => {
					let max = bsr_max_bytes(*bsr_idx);
					info!(target: "mac", "truncated BSR LCG={lcg_id} <= {max} bytes RNTI={rnti}");
					user.lock().set_ul_buffer_size(max);
					self.sched_ul(&user, max * 8);
				}
				(Payload::ShortBsr { lcg_id, bsr_idx }, _) => {
					let max = bsr_max_bytes(*bsr_idx);
					info!(target: "mac", "short BSR LCG={lcg_id} <= {max} bytes RNTI={rnti}");
					user.lock().set_ul_buffer_size(max);
					self.sched_ul(&user, max * 8);
				}
				(Payload::LongBsr { bsr_idx }, _) => {
					let total: u32 = bsr_idx.iter().map(|idx| bsr_max_bytes(*idx)).sum();
					info!(target: "mac", "long BSR <= {total} bytes RNTI={rnti}");
					user.lock().set_ul_buffer_size(total);
					self.sched_ul(&user, total * 8);
				}
				(Payload::PowerHeadroom(ph), _) => {
					debug!(target: "mac", "not handling power headroom report ({ph})");
				}
				(payload, lcid) => {
					warn!(target: "mac", "unhandled UL-SCH element LCID={lcid} {payload:?}");
				}
			}
		}
	}

	fn handle_ulsch_ccch_sdu(&self, user: &UserRef, sdu: &[u8]) {
		let mut locked = user.lock();
		let rnti = locked.c_rnti();
		debug!(target: "mac", "ULSCH CCCH SDU RNTI={rnti} ({} bytes)", sdu.len());

		// The Msg3 payload doubles as the contention resolution identity.
		let mut con_res_id: u64 = 0;
		for byte in sdu.iter().take(6) {
			con_res_id = (con_res_id << 8) | u64::from(*byte);
		}
		let srb0 = locked.srb0();
		srb0.set_con_res_id(con_res_id);
		srb0.set_send_con_res_id(true);
		srb0.queue_rlc_pdu(sdu.to_vec());
		locked.update_ul_buffer_size(sdu.len() as u32);
		let remaining = locked.ul_buffer_size;
		drop(locked);

		self.to_rlc.send(
			Dest::Rlc,
			Message::RlcPduReady {
				rnti,
				rb: RbId::Srb0,
			},
		);
		self.sched_ul(user, remaining * 8);
	}

	fn handle_ulsch_dcch_sdu(&self, user: &UserRef, lcid: u8, sdu: &[u8]) {
		let Some(rb_id) = RbId::from_lcid(lcid) else {
			error!(target: "mac", "ULSCH DCCH SDU with bad LCID={lcid}");
			return;
		};
		let mut locked = user.lock();
		let rnti = locked.c_rnti();
		match locked.rb_mut(rb_id) {
			Some(rb) => rb.queue_rlc_pdu(sdu.to_vec()),
			None => {
				error!(target: "mac", "not handling DCCH SDU for RNTI={rnti}, LCID={lcid}");
				return;
			}
		}
		locked.update_ul_buffer_size(sdu.len() as u32);
		let remaining = locked.ul_buffer_size;
		drop(locked);

		self.to_rlc
			.send(Dest::Rlc, Message::RlcPduReady { rnti, rb: rb_id });
		self.sched_ul(user, remaining * 8);
	}

	/// C-RNTI control element: the UE already owns a connection; fold the
	/// transient record into it.
	fn handle_ulsch_c_rnti(&self, user: &UserRef, embedded_rnti: u16) -> Option<UserRef> {
		let transient_rnti = user.lock().c_rnti();
		info!(target: "mac", "received C_RNTI={embedded_rnti} for C_RNTI={transient_rnti}");
		if embedded_rnti == transient_rnti {
			return None;
		}
		let existing = self.user_mgr.find_user(embedded_rnti)?;
		self.user_mgr.release_c_rnti(transient_rnti);
		Some(existing)
	}

	// ---- RLC handler ----

	fn handle_sdu_ready(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "mac", "SDU ready for unknown RNTI={rnti}");
			return;
		};
		let mut locked = user.lock();
		let Some(sdu) = locked.rb_mut(rb_id).and_then(|rb| rb.pop_mac_sdu()) else {
			error!(target: "mac", "sdu_ready with no SDU queued RNTI={rnti}");
			return;
		};

		let n_ant = self.sys_info.read().n_ant;
		let mut alloc = Allocation::new_dl(rnti, if n_ant == 1 { 1 } else { 2 });
		alloc.ndi = locked.dl_ndi();
		locked.flip_dl_ndi();

		let mut mac_pdu = MacPdu::default();
		let send_con_res = locked
			.rb_mut(rb_id)
			.map(|rb| rb.send_con_res_id())
			.unwrap_or(false);
		if send_con_res {
			let con_res_id = locked.rb_mut(rb_id).map(|rb| rb.con_res_id()).unwrap_or(0);
			mac_pdu.subheaders.push(SubHeader {
				lcid: LCID_UE_CON_RES_ID,
				payload: Payload::ConResId(con_res_id),
			});
			if let Some(rb) = locked.rb_mut(rb_id) {
				rb.set_send_con_res_id(false);
			}
		}
		mac_pdu.subheaders.push(SubHeader::sdu(rb_id.lcid(), sdu));
		drop(locked);

		let target_tti = {
			let sched = self.sched.lock();
			add_to_tti(sched.dl_subfr[sched.cur_dl].current_tti, 4)
		};
		self.add_to_dl_sched_queue(target_tti, mac_pdu, alloc);
	}

	// ---- data constructors ----

	fn construct_random_access_response(&self, preamble: u8, timing_adv: u16, tti: u32) {
		let Ok((c_rnti, _user)) = self.user_mgr.add_user() else {
			error!(target: "mac", "no free C-RNTI or add_user fail");
			return;
		};

		let sys_info = self.sys_info.read();
		let mut dl_alloc = Allocation::new_dl(phy::ra_rnti(tti), 1);
		let mut ul_alloc = Allocation::new_ul(c_rnti);
		let (tbs, mcs, n_prb) = phy::get_tbs_mcs_and_n_prb_for_ul(56, sys_info.n_rb_ul);
		ul_alloc.tbs = tbs;
		ul_alloc.mcs = mcs;
		ul_alloc.n_prb = n_prb;

		let rar = Rar {
			rapid: preamble,
			timing_adv,
			hopping: false,
			rba: 0,
			mcs,
			tpc: 0,
			ul_delay: false,
			csi_req: false,
			temp_c_rnti: c_rnti,
		};
		// Pack once now to size the DL allocation; the RBA is filled in
		// when the grant gets its PRBs at commit time.
		dl_alloc.payload = pack_rar(&rar);

		let mut rar_queue = self.rar_queue.lock();
		rar_queue.push_back(RarSched {
			dl_alloc,
			ul_alloc,
			rar,
			tti,
		});
		info!(target: "mac", "RAR scheduled {} (RNTI={c_rnti})", rar_queue.len());
	}

	// ---- scheduler ----

	fn sched_ul(&self, user: &UserRef, requested_bits: u32) {
		if requested_bits == 0 {
			return;
		}
		let (rnti, ndi, max_bytes) = {
			let mut locked = user.lock();
			let ndi = locked.ul_ndi();
			locked.flip_ul_ndi();
			(locked.c_rnti(), ndi, locked.max_ul_bytes_per_subfn)
		};
		let bits_req = requested_bits.min(max_bytes * 8);
		let sys_info = self.sys_info.read();
		let (tbs, mcs, n_prb) = phy::get_tbs_mcs_and_n_prb_for_ul(bits_req, sys_info.n_rb_ul);
		let mut alloc = Allocation::new_ul(rnti);
		alloc.tbs = tbs;
		alloc.mcs = mcs;
		alloc.n_prb = n_prb;
		alloc.ndi = ndi;
		alloc.modulation = ul_modulation(mcs);

		let target_tti = {
			let sched = self.sched.lock();
			add_to_tti(sched.ul_subfr[sched.cur_ul].current_tti, 4)
		};
		let mut ul_queue = self.ul_queue.lock();
		let duplicate = ul_queue
			.iter()
			.any(|entry| entry.alloc.rnti == rnti && entry.tti == target_tti);
		if duplicate {
			return;
		}
		info!(
			target: "mac",
			"UL scheduled (mcs={mcs}, tbs={tbs}, N_prb={n_prb}) for RNTI={rnti}, UL_QUEUE_SIZE={}",
			ul_queue.len() + 1
		);
		ul_queue.push_back(UlSched { alloc, tti: target_tti });
	}

	fn add_to_dl_sched_queue(&self, mut target_tti: u32, mac_pdu: MacPdu, alloc: Allocation) {
		let mut dl_queue = self.dl_queue.lock();
		// Two PDUs for one RNTI cannot share a subframe; nudge the later
		// one forward.
		while dl_queue
			.iter()
			.any(|entry| entry.alloc.rnti == alloc.rnti && entry.tti == target_tti)
		{
			target_tti = add_to_tti(target_tti, 1);
		}
		dl_queue.push_back(DlSched {
			alloc,
			mac_pdu,
			tti: target_tti,
		});
	}

	/// One scheduling pass over the queues, filling the subframe the ring
	/// is currently building. Priority order: RAR, then DL (HARQ
	/// retransmissions are already at the queue head by their earlier
	/// target TTIs), then UL grants, then the SR table.
	fn scheduler(&self, sys_info: &SysInfo, sched: &mut SchedState) {
		let n_cce = phy::get_n_cce(sys_info.n_rb_dl);
		let cur_dl = sched.cur_dl;
		let built_tti = sched.dl_subfr[cur_dl].current_tti;
		let ra_resp_win = u32::from(sys_info.sib2.rach.ra_resp_win_size);

		// Random access responses within their response window.
		let mut rar_queue = self.rar_queue.lock();
		loop {
			let Some(mut rar_sched) = rar_queue.pop_front() else {
				break;
			};
			let resp_win_start = add_to_tti(rar_sched.tti, 3);
			let age = (built_tti + TTI_MAX + 1 - resp_win_start) % (TTI_MAX + 1);
			if age >= TTI_MAX / 2 {
				// Window has not opened yet.
				rar_queue.push_front(rar_sched);
				break;
			}
			if age > ra_resp_win {
				info!(target: "mac", "RAR outside of resp win {} {built_tti}", rar_sched.tti);
				continue;
			}

			let (tbs, mcs, n_prb) = phy::get_tbs_mcs_and_n_prb_for_dl(
				rar_sched.dl_alloc.payload.len() as u32 * 8,
				sys_info.n_rb_dl,
			);
			rar_sched.dl_alloc.tbs = tbs;
			rar_sched.dl_alloc.mcs = mcs;
			rar_sched.dl_alloc.n_prb = n_prb;

			let msg3_slot = (cur_dl + 6) % 10;
			let dl_free = sched.dl_subfr[cur_dl].n_avail_prbs
				- sched.dl_subfr[cur_dl].n_sched_prbs;
			let ul_free = sched.ul_subfr[msg3_slot].n_avail_prbs
				- sched.ul_subfr[msg3_slot].n_sched_prbs;
			let dcis_used = (sched.dl_subfr[cur_dl].dl_allocations.len()
				+ sched.dl_subfr[cur_dl].ul_allocations.len()) as u32;
			if rar_sched.dl_alloc.n_prb > dl_free
				|| rar_sched.ul_alloc.n_prb > ul_free
				|| dcis_used >= n_cce
			{
				rar_queue.push_front(rar_sched);
				break;
			}

			// Place the Msg3 grant and bake its RBA into the RAR.
			let rb_start = sched.ul_subfr[msg3_slot].next_prb;
			sched.ul_subfr[msg3_slot].next_prb += rar_sched.ul_alloc.n_prb;
			rar_sched.ul_alloc.prb_start = rb_start;
			rar_sched.rar.rba = riv_for(sys_info.n_rb_ul, rar_sched.ul_alloc.n_prb, rb_start);
			rar_sched.dl_alloc.payload = pack_rar(&rar_sched.rar);

			self.pcap.send_lte_pcap_msg(
				PcapDirection::Downlink,
				rar_sched.dl_alloc.rnti,
				built_tti,
				&rar_sched.dl_alloc.payload,
			);
			info!(
				target: "mac",
				"RAR sent TTI={built_tti} msg3 TTI={}",
				sched.ul_subfr[msg3_slot].current_tti
			);

			sched.dl_subfr[cur_dl].n_sched_prbs += rar_sched.dl_alloc.n_prb;
			sched.ul_subfr[msg3_slot].n_sched_prbs += rar_sched.ul_alloc.n_prb;
			sched.dl_subfr[cur_dl].dl_allocations.push(rar_sched.dl_alloc);
			sched.ul_subfr[msg3_slot].decodes.push(rar_sched.ul_alloc);
		}
		drop(rar_queue);

		// Downlink PDUs in FIFO order.
		let mut dl_queue = self.dl_queue.lock();
		loop {
			let Some(mut dl_sched) = dl_queue.pop_front() else {
				break;
			};
			if dl_sched.tti != built_tti && !is_tti_in_future(dl_sched.tti, built_tti) {
				warn!(target: "mac", "dropping stale DL PDU for TTI={}", dl_sched.tti);
				continue;
			}

			let payload = pack_pdu(&dl_sched.mac_pdu);
			let dl_free =
				sched.dl_subfr[cur_dl].n_avail_prbs - sched.dl_subfr[cur_dl].n_sched_prbs;
			let (tbs, mcs, n_prb) =
				phy::get_tbs_mcs_and_n_prb_for_dl(payload.len() as u32 * 8, dl_free.max(1));
			dl_sched.alloc.tbs = tbs;
			dl_sched.alloc.mcs = mcs;
			dl_sched.alloc.n_prb = n_prb;
			dl_sched.alloc.modulation = dl_modulation(mcs);

			// Pad the PDU out to the transport block size.
			let n_bits = payload.len() as u32 * 8;
			if tbs > n_bits {
				pad_mac_pdu(&mut dl_sched.mac_pdu, ((tbs - n_bits) / 8) as usize);
			}
			dl_sched.alloc.payload = pack_pdu(&dl_sched.mac_pdu);

			let dcis_used = (sched.dl_subfr[cur_dl].dl_allocations.len()
				+ sched.dl_subfr[cur_dl].ul_allocations.len()) as u32;
			if dl_sched.alloc.n_prb > dl_free || dcis_used >= n_cce {
				// Out of headroom; the head retries next subframe.
				dl_queue.push_front(dl_sched);
				break;
			}

			self.pcap.send_lte_pcap_msg(
				PcapDirection::Downlink,
				dl_sched.alloc.rnti,
				built_tti,
				&dl_sched.alloc.payload,
			);
			info!(
				target: "mac",
				"DL allocation (mcs={mcs}, tbs={tbs}, N_prb={n_prb}) sent for RNTI={} CURRENT_TTI={built_tti}",
				dl_sched.alloc.rnti
			);

			// ACK/NACK opportunity exactly four subframes out, and the
			// allocation parked for HARQ until then.
			let ack_slot = (cur_dl + 4) % 10;
			let ack_tti = sched.ul_subfr[ack_slot].current_tti;
			sched.ul_subfr[ack_slot].pucch.push(Pucch {
				pucch_type: PucchType::AckNack,
				n_1_p_pucch: u32::from(sys_info.sib2.pucch.n1_pucch_an),
				rnti: dl_sched.alloc.rnti,
				decode: true,
			});
			if let Some(user) = self.user_mgr.find_user(dl_sched.alloc.rnti) {
				user.lock()
					.store_harq_info(ack_tti, dl_sched.mac_pdu, dl_sched.alloc.clone());
			}

			sched.dl_subfr[cur_dl].n_sched_prbs += dl_sched.alloc.n_prb;
			sched.dl_subfr[cur_dl].dl_allocations.push(dl_sched.alloc);
		}
		drop(dl_queue);

		// Uplink grants: DCI in this subframe, decode four later.
		let mut ul_queue = self.ul_queue.lock();
		loop {
			let Some(mut ul_sched) = ul_queue.pop_front() else {
				break;
			};
			let grant_slot = (cur_dl + 4) % 10;
			let ul_free = sched.ul_subfr[grant_slot].n_avail_prbs
				- sched.ul_subfr[grant_slot].n_sched_prbs;
			let dcis_used = (sched.dl_subfr[cur_dl].dl_allocations.len()
				+ sched.dl_subfr[cur_dl].ul_allocations.len()) as u32;
			if ul_sched.alloc.n_prb > ul_free || dcis_used >= n_cce {
				ul_queue.push_front(ul_sched);
				break;
			}
			let rb_start = sched.ul_subfr[grant_slot].next_prb;
			sched.ul_subfr[grant_slot].next_prb += ul_sched.alloc.n_prb;
			ul_sched.alloc.prb_start = rb_start;
			info!(
				target: "mac",
				"UL allocation sent for RNTI={} CURRENT_TTI={}",
				ul_sched.alloc.rnti,
				sched.ul_subfr[grant_slot].current_tti
			);
			sched.ul_subfr[grant_slot].n_sched_prbs += ul_sched.alloc.n_prb;
			sched.ul_subfr[grant_slot].decodes.push(ul_sched.alloc.clone());
			sched.dl_subfr[cur_dl].ul_allocations.push(ul_sched.alloc);
		}
		drop(ul_queue);

		// Periodic SR reservations whose period/offset hits this UL
		// subframe.
		let cur_ul = sched.cur_ul;
		let ul_tti = sched.ul_subfr[cur_ul].current_tti;
		for entry in self.sr_queue.lock().iter() {
			let (periodicity, offset) = phy::pucch_map_sr_config_idx(entry.i_sr);
			if (ul_tti + periodicity - offset) % periodicity == 0 {
				sched.ul_subfr[cur_ul].pucch.push(Pucch {
					pucch_type: PucchType::Sr,
					n_1_p_pucch: entry.n_1_p_pucch,
					rnti: entry.rnti,
					decode: true,
				});
			}
		}
	}

	fn reset_inactivity_timer(&self, user: &UserRef) {
		let mut locked = user.lock();
		match locked.inactivity_timer {
			Some(timer_id) => self.timers.reset_timer(timer_id, USER_INACTIVITY_TIMER_MS),
			None => {
				let c_rnti = locked.c_rnti();
				locked.inactivity_timer = Some(self.timers.start_timer(
					USER_INACTIVITY_TIMER_MS,
					crate::timer::Expiry::UeInactivity { c_rnti },
				));
			}
		}
	}
}

fn dl_modulation(mcs: u8) -> Modulation {
	match mcs {
		0..=9 => Modulation::Qpsk,
		10..=16 => Modulation::Qam16,
		_ => Modulation::Qam64,
	}
}

fn ul_modulation(mcs: u8) -> Modulation {
	match mcs {
		0..=10 => Modulation::Qpsk,
		11..=20 => Modulation::Qam16,
		_ => Modulation::Qam64,
	}
}

/// Resource indication value for a contiguous UL grant.
fn riv_for(n_rb_ul: u32, n_prb: u32, rb_start: u32) -> u16 {
	let riv = if n_prb.saturating_sub(1) <= n_rb_ul / 2 {
		n_rb_ul * (n_prb - 1) + rb_start
	} else {
		n_rb_ul * (n_rb_ul - n_prb + 1) + (n_rb_ul - 1 - rb_start)
	};
	(riv & 0x3FF) as u16
}

/// Insert padding subheaders: one or two bytes go in front (zero-body
/// subheaders), anything larger becomes a trailing padding region.
fn pad_mac_pdu(mac_pdu: &mut MacPdu, n_pad: usize) {
	let padding = SubHeader {
		lcid: LCID_PADDING,
		payload: Payload::Padding,
	};
	match n_pad {
		0 => {}
		1 => mac_pdu.subheaders.insert(0, padding),
		2 => {
			mac_pdu.subheaders.insert(0, padding.clone());
			mac_pdu.subheaders.insert(1, padding);
		}
		_ => mac_pdu.subheaders.push(padding),
	}
}

/// Ship the current slots forward one subframe and clear the freed slot
/// for the next frame.
fn advance_ring(sched: &mut SchedState, sys_info: &SysInfo) {
	let cur_dl = sched.cur_dl;
	let cur_ul = sched.cur_ul;
	let next_dl_tti = add_to_tti(sched.dl_subfr[cur_dl].current_tti, 10);
	let next_ul_tti = add_to_tti(sched.ul_subfr[cur_ul].current_tti, 10);

	sched.dl_subfr[cur_dl] = DlSchedule {
		current_tti: next_dl_tti,
		n_avail_prbs: sys_info.n_rb_dl.saturating_sub(n_reserved_prbs(sys_info, next_dl_tti)),
		..DlSchedule::default()
	};
	sched.ul_subfr[cur_ul] = UlSchedule {
		current_tti: next_ul_tti,
		n_avail_prbs: sys_info.n_rb_ul,
		..UlSchedule::default()
	};

	sched.cur_dl = (cur_dl + 1) % 10;
	sched.cur_ul = (cur_ul + 1) % 10;
}

/// PRBs claimed by the broadcast channels in a given subframe: MIB every
/// frame, SIB1 on even-frame subframe five, SI messages on their
/// window/periodicity grid.
fn n_reserved_prbs(sys_info: &SysInfo, tti: u32) -> u32 {
	let mut reserved = 0;
	if tti % 10 == 0 {
		reserved += 6;
	}
	if tti % 10 == 5 && (tti / 10) % 2 == 0 {
		reserved += sys_info.sib1_alloc.n_prb;
	}
	let si_win = sys_info.si_win_len.max(1);
	let si_periodicity = sys_info.si_periodicity_t.max(8);
	for (i, alloc) in sys_info.sib_alloc.iter().enumerate() {
		let i = i as u32;
		if !alloc.payload.is_empty()
			&& (i * si_win) % 10 == tti % 10
			&& (i * si_win) / 10 == (tti / 10) % si_periodicity
		{
			reserved += alloc.n_prb;
		}
	}
	reserved
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_starts_with_a_three_slot_lead() {
		let sys_info = SysInfo {
			n_rb_dl: 50,
			n_rb_ul: 50,
			..SysInfo::default()
		};
		let state = SchedState::new(&sys_info);
		assert_eq!(state.cur_dl, 3);
		assert_eq!(state.cur_ul, 0);
		assert_eq!(state.dl_subfr[0].current_tti, 10);
		assert_eq!(state.dl_subfr[2].current_tti, 12);
		assert_eq!(state.dl_subfr[3].current_tti, 3);
	}

	#[test]
	fn advance_clears_and_steps_ten_ttis() {
		let sys_info = SysInfo {
			n_rb_dl: 50,
			n_rb_ul: 50,
			..SysInfo::default()
		};
		let mut state = SchedState::new(&sys_info);
		state.dl_subfr[3].n_sched_prbs = 7;
		advance_ring(&mut state, &sys_info);
		assert_eq!(state.cur_dl, 4);
		assert_eq!(state.dl_subfr[3].current_tti, 13);
		assert_eq!(state.dl_subfr[3].n_sched_prbs, 0);
	}

	#[test]
	fn mib_and_sib1_reserve_prbs() {
		let mut sys_info = SysInfo {
			n_rb_dl: 50,
			n_rb_ul: 50,
			si_win_len: 2,
			si_periodicity_t: 8,
			..SysInfo::default()
		};
		sys_info.sib1_alloc.n_prb = 3;
		assert_eq!(n_reserved_prbs(&sys_info, 0), 6);
		assert_eq!(n_reserved_prbs(&sys_info, 5), 3);
		assert_eq!(n_reserved_prbs(&sys_info, 15), 0);
	}

	#[test]
	fn modulation_bands() {
		assert_eq!(dl_modulation(9), Modulation::Qpsk);
		assert_eq!(dl_modulation(10), Modulation::Qam16);
		assert_eq!(dl_modulation(17), Modulation::Qam64);
		assert_eq!(ul_modulation(10), Modulation::Qpsk);
		assert_eq!(ul_modulation(21), Modulation::Qam64);
	}

	#[test]
	fn padding_placement_follows_size() {
		let mut one = MacPdu::single_sdu(1, vec![1, 2, 3]);
		pad_mac_pdu(&mut one, 1);
		assert_eq!(one.subheaders[0].lcid, LCID_PADDING);
		assert_eq!(one.subheaders.len(), 2);

		let mut two = MacPdu::single_sdu(1, vec![1, 2, 3]);
		pad_mac_pdu(&mut two, 2);
		assert_eq!(two.subheaders[0].lcid, LCID_PADDING);
		assert_eq!(two.subheaders[1].lcid, LCID_PADDING);

		let mut big = MacPdu::single_sdu(1, vec![1, 2, 3]);
		pad_mac_pdu(&mut big, 40);
		assert_eq!(big.subheaders.last().unwrap().lcid, LCID_PADDING);
	}

	#[test]
	fn riv_encodes_narrow_grants() {
		assert_eq!(riv_for(50, 1, 0), 0);
		assert_eq!(riv_for(50, 2, 3), 53);
	}
}
