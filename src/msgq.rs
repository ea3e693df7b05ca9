// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The message fabric: named bounded queues with one consumer thread each.
//!
//! Layers never share mutable state directly; everything crosses these
//! queues. Payloads address users and bearers by value ids (C-RNTI plus
//! [`RbId`]); the user manager owns the records behind them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::warn;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::phy::{DlSchedule, PucchType, UlSchedule};
use crate::user::RbId;

/// Per-queue capacity; overflow drops the newest message with a warning.
const QUEUE_DEPTH: usize = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dest {
	Phy,
	Mac,
	Rlc,
	Pdcp,
	Rrc,
	Mme,
	Gw,
	TimerMgr,
	Any,
}

/// Commands MME issues to RRC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RrcCmd {
	Release,
	Security,
	SetupDefDrb,
	SetupDedDrb,
}

/// Command responses RRC reports back to MME.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RrcCmdResp {
	Security,
}

#[derive(Clone, Debug)]
pub enum Message {
	Kill,

	// MAC -> PHY
	PhySchedule {
		dl: Box<DlSchedule>,
		ul: Box<UlSchedule>,
	},

	// PHY -> MAC
	ReadyToSend {
		dl_tti: u32,
		ul_tti: u32,
		late: bool,
	},
	PrachDecode {
		tti: u32,
		/// Decoded (preamble, timing advance) pairs, at most 64.
		preambles: SmallVec<[(u8, u16); 4]>,
	},
	PucchDecode {
		rnti: u16,
		pucch_type: PucchType,
		/// Decoded payload bit (ACK/NACK or SR presence).
		bit: bool,
		tti: u32,
	},
	PuschDecode {
		rnti: u16,
		payload: Vec<u8>,
		tti: u32,
	},

	// RLC -> MAC / MAC -> RLC
	MacSduReady { rnti: u16, rb: RbId },
	RlcPduReady { rnti: u16, rb: RbId },

	// MAC -> timer manager
	TimerTick { tick: u32 },

	// PDCP -> RLC / RLC -> PDCP
	RlcSduReady { rnti: u16, rb: RbId },
	PdcpPduReady { rnti: u16, rb: RbId },

	// RRC -> PDCP / PDCP -> RRC
	PdcpSduReady { rnti: u16, rb: RbId },
	RrcPduReady { rnti: u16, rb: RbId },

	// MME -> RRC
	RrcNasMsgReady { rnti: u16, rb: RbId },
	RrcCmdReady { rnti: u16, rb: RbId, cmd: RrcCmd },

	// RRC -> MME
	MmeNasMsgReady { rnti: u16, rb: RbId },
	MmeRrcCmdResp { rnti: u16, rb: RbId, resp: RrcCmdResp },

	// GW -> PDCP / PDCP -> GW
	PdcpDataSduReady { rnti: u16, rb: RbId },
	GwDataReady { rnti: u16, rb: RbId },
}

#[derive(Clone, Debug)]
pub struct Envelope {
	pub dest: Dest,
	pub msg: Message,
}

struct Inner {
	buf: VecDeque<Envelope>,
}

/// A named bounded FIFO. Producers `send`; exactly one consumer thread is
/// spawned with `attach_rx`.
pub struct Msgq {
	name: &'static str,
	inner: Mutex<Inner>,
	avail: Condvar,
}

impl Msgq {
	pub fn new(name: &'static str) -> Arc<Msgq> {
		Arc::new(Msgq {
			name,
			inner: Mutex::new(Inner {
				buf: VecDeque::with_capacity(QUEUE_DEPTH),
			}),
			avail: Condvar::new(),
		})
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	pub fn send(&self, dest: Dest, msg: Message) {
		let mut inner = self.inner.lock();
		if inner.buf.len() >= QUEUE_DEPTH && !matches!(msg, Message::Kill) {
			// The ring keeps the latest messages; the oldest one falls out.
			if let Some(evicted) = inner.buf.pop_front() {
				warn!(
					target: "msgq",
					"{} full, dropping {:?}",
					self.name,
					discriminant_name(&evicted.msg)
				);
			}
		}
		inner.buf.push_back(Envelope { dest, msg });
		drop(inner);
		self.avail.notify_one();
	}

	pub fn send_to_any(&self, msg: Message) {
		self.send(Dest::Any, msg);
	}

	/// Enqueue the shutdown marker; the consumer exits once it reaches it.
	pub fn kill(&self) {
		self.send(Dest::Any, Message::Kill);
	}

	fn recv(&self) -> Envelope {
		let mut inner = self.inner.lock();
		loop {
			if let Some(env) = inner.buf.pop_front() {
				return env;
			}
			self.avail.wait(&mut inner);
		}
	}

	/// Spawn the consumer thread. `prio != 0` requests SCHED_FIFO at that
	/// priority; every consumer clears the last CPU (reserved for
	/// PHY/radio) from its affinity mask.
	pub fn attach_rx<F>(self: &Arc<Msgq>, prio: u32, mut callback: F) -> JoinHandle<()>
	where
		F: FnMut(Envelope) + Send + 'static,
	{
		let queue = Arc::clone(self);
		std::thread::Builder::new()
			.name(queue.name.into())
			.spawn(move || {
				set_rx_thread_attrs(prio);
				loop {
					let env = queue.recv();
					if matches!(env.msg, Message::Kill) {
						break;
					}
					callback(env);
				}
			})
			.expect("spawning a msgq consumer cannot fail")
	}
}

fn discriminant_name(msg: &Message) -> &'static str {
	match msg {
		Message::Kill => "Kill",
		Message::PhySchedule { .. } => "PhySchedule",
		Message::ReadyToSend { .. } => "ReadyToSend",
		Message::PrachDecode { .. } => "PrachDecode",
		Message::PucchDecode { .. } => "PucchDecode",
		Message::PuschDecode { .. } => "PuschDecode",
		Message::MacSduReady { .. } => "MacSduReady",
		Message::RlcPduReady { .. } => "RlcPduReady",
		Message::TimerTick { .. } => "TimerTick",
		Message::RlcSduReady { .. } => "RlcSduReady",
		Message::PdcpPduReady { .. } => "PdcpPduReady",
		Message::PdcpSduReady { .. } => "PdcpSduReady",
		Message::RrcPduReady { .. } => "RrcPduReady",
		Message::RrcNasMsgReady { .. } => "RrcNasMsgReady",
		Message::RrcCmdReady { .. } => "RrcCmdReady",
		Message::MmeNasMsgReady { .. } => "MmeNasMsgReady",
		Message::MmeRrcCmdResp { .. } => "MmeRrcCmdResp",
		Message::PdcpDataSduReady { .. } => "PdcpDataSduReady",
		Message::GwDataReady { .. } => "GwDataReady",
	}
}

/// Apply scheduling class and affinity to the calling consumer thread.
/// Failures are logged and ignored: unprivileged runs (tests, development)
/// fall back to the default scheduler.
fn set_rx_thread_attrs(prio: u32) {
	unsafe {
		if prio != 0 {
			let param = libc::sched_param {
				sched_priority: prio as libc::c_int,
			};
			if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) != 0 {
				warn!(target: "msgq", "SCHED_FIFO prio {prio} unavailable, using default scheduler");
			}
		}

		let n_cores = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
		if n_cores > 1 {
			let mut mask: libc::cpu_set_t = core::mem::zeroed();
			if libc::pthread_getaffinity_np(
				libc::pthread_self(),
				core::mem::size_of::<libc::cpu_set_t>(),
				&mut mask,
			) == 0
			{
				// The last core is reserved for the PHY/radio thread.
				libc::CPU_CLR(n_cores as usize - 1, &mut mask);
				let _ = libc::pthread_setaffinity_np(
					libc::pthread_self(),
					core::mem::size_of::<libc::cpu_set_t>(),
					&mask,
				);
			}
		}
	}
}
