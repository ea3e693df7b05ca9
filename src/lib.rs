// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Layered protocol stack of an LTE FDD eNodeB.
//!
//! The stack is a pipeline of cooperating layer tasks — MAC, RLC, PDCP,
//! RRC, MME — plus the user/bearer manager, the HSS and the IP gateway,
//! glued together by typed bounded message queues. The PHY and the radio
//! are external: they pace MAC through `ReadyToSend` messages on the
//! PHY-facing queue and consume the `PhySchedule` replies.

pub mod bits;
pub mod config;
pub mod error;
pub mod gw;
pub mod hss;
pub mod logging;
pub mod mac;
pub mod mme;
pub mod msgq;
pub mod nas;
pub mod pcap;
pub mod pdcp;
pub mod phy;
pub mod rlc;
pub mod rrc;
pub mod security;
pub mod timer;
pub mod user;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::info;

use crate::config::{ConfigDb, Param};
use crate::error::Result;
use crate::gw::Gw;
use crate::hss::Hss;
use crate::mac::Mac;
use crate::mme::Mme;
use crate::msgq::{Message, Msgq};
use crate::pcap::Pcap;
use crate::pdcp::Pdcp;
use crate::rlc::Rlc;
use crate::rrc::Rrc;
use crate::timer::TimerManager;
use crate::user::UserMgr;

/// Every named queue of the message fabric. The PHY-facing pair is the
/// stack's outer boundary: the radio front-end pushes decode events into
/// `phy_to_mac` and consumes schedules from `mac_to_phy`.
pub struct StackQueues {
	pub phy_to_mac: Arc<Msgq>,
	pub mac_to_phy: Arc<Msgq>,
	pub mac_to_rlc: Arc<Msgq>,
	pub mac_to_timer: Arc<Msgq>,
	pub rlc_to_mac: Arc<Msgq>,
	pub rlc_to_pdcp: Arc<Msgq>,
	pub pdcp_to_rlc: Arc<Msgq>,
	pub pdcp_to_rrc: Arc<Msgq>,
	pub rrc_to_pdcp: Arc<Msgq>,
	pub rrc_to_mme: Arc<Msgq>,
	pub mme_to_rrc: Arc<Msgq>,
	pub pdcp_to_gw: Arc<Msgq>,
	pub gw_to_pdcp: Arc<Msgq>,
}

impl StackQueues {
	fn new() -> StackQueues {
		StackQueues {
			phy_to_mac: Msgq::new("phy_to_mac"),
			mac_to_phy: Msgq::new("mac_to_phy"),
			mac_to_rlc: Msgq::new("mac_to_rlc"),
			mac_to_timer: Msgq::new("mac_to_timer"),
			rlc_to_mac: Msgq::new("rlc_to_mac"),
			rlc_to_pdcp: Msgq::new("rlc_to_pdcp"),
			pdcp_to_rlc: Msgq::new("pdcp_to_rlc"),
			pdcp_to_rrc: Msgq::new("pdcp_to_rrc"),
			rrc_to_pdcp: Msgq::new("rrc_to_pdcp"),
			rrc_to_mme: Msgq::new("rrc_to_mme"),
			mme_to_rrc: Msgq::new("mme_to_rrc"),
			pdcp_to_gw: Msgq::new("pdcp_to_gw"),
			gw_to_pdcp: Msgq::new("gw_to_pdcp"),
		}
	}

	fn all(&self) -> [&Arc<Msgq>; 13] {
		[
			&self.phy_to_mac,
			&self.mac_to_phy,
			&self.mac_to_rlc,
			&self.mac_to_timer,
			&self.rlc_to_mac,
			&self.rlc_to_pdcp,
			&self.pdcp_to_rlc,
			&self.pdcp_to_rrc,
			&self.rrc_to_pdcp,
			&self.rrc_to_mme,
			&self.mme_to_rrc,
			&self.pdcp_to_gw,
			&self.gw_to_pdcp,
		]
	}
}

#[derive(Default)]
pub struct StackOptions {
	/// Open the TUN device and run the gateway (needs CAP_NET_ADMIN).
	pub enable_gw: bool,
	/// Override the pcap file locations.
	pub pcap_dir: Option<PathBuf>,
}

/// The running protocol stack: service handles plus the consumer threads.
/// Built with [`Stack::start`], torn down with [`Stack::stop`].
pub struct Stack {
	pub config: Arc<ConfigDb>,
	pub hss: Arc<Hss>,
	pub timers: Arc<TimerManager>,
	pub user_mgr: Arc<UserMgr>,
	pub mac: Arc<Mac>,
	pub rlc: Arc<Rlc>,
	pub pdcp: Arc<Pdcp>,
	pub rrc: Arc<Rrc>,
	pub mme: Arc<Mme>,
	pub gw: Option<Arc<Gw>>,
	pub queues: StackQueues,
	handles: Vec<JoinHandle<()>>,
	started: bool,
}

impl Stack {
	pub fn start(config: Arc<ConfigDb>, hss: Arc<Hss>, opts: StackOptions) -> Result<Stack> {
		logging::init();
		logging::set_severity_mask(config.get_u32(Param::DebugType));
		logging::set_facility_mask(config.get_u32(Param::DebugLevel));

		let pcap = if config.get_i64(Param::EnablePcap) == 1 {
			let dir = opts.pcap_dir.unwrap_or_else(std::env::temp_dir);
			Arc::new(Pcap::open(
				&dir.join("ferrolte_enb_mac.pcap"),
				&dir.join("ferrolte_enb_ip.pcap"),
			)?)
		} else {
			Arc::new(Pcap::disabled())
		};

		let timers = Arc::new(TimerManager::new());
		let user_mgr = UserMgr::new(Arc::clone(&timers));
		let queues = StackQueues::new();

		let mac = Mac::new(
			Arc::clone(&user_mgr),
			Arc::clone(&timers),
			Arc::clone(&pcap),
			Arc::clone(&queues.mac_to_phy),
			Arc::clone(&queues.mac_to_rlc),
			Arc::clone(&queues.mac_to_timer),
		);
		let rlc = Rlc::new(
			Arc::clone(&user_mgr),
			Arc::clone(&queues.rlc_to_mac),
			Arc::clone(&queues.rlc_to_pdcp),
		);
		let pdcp = Pdcp::new(
			Arc::clone(&user_mgr),
			Arc::clone(&queues.pdcp_to_rlc),
			Arc::clone(&queues.pdcp_to_rrc),
			Arc::clone(&queues.pdcp_to_gw),
		);
		let rrc = Rrc::new(
			Arc::clone(&user_mgr),
			Arc::clone(&mac),
			Arc::clone(&queues.rrc_to_pdcp),
			Arc::clone(&queues.rrc_to_mme),
		);
		let mme = Mme::new(
			Arc::clone(&user_mgr),
			Arc::clone(&hss),
			&config,
			Arc::clone(&queues.mme_to_rrc),
		);

		// Every layer keeps a local snapshot of the broadcast bundle;
		// registration replays the current one, later commits push fresh
		// copies.
		{
			let mac = Arc::clone(&mac);
			config.on_sys_info(Box::new(move |sys_info| mac.update_sys_info(sys_info)));
			let rlc = Arc::clone(&rlc);
			config.on_sys_info(Box::new(move |sys_info| rlc.update_sys_info(sys_info)));
			let pdcp = Arc::clone(&pdcp);
			config.on_sys_info(Box::new(move |sys_info| pdcp.update_sys_info(sys_info)));
			let rrc = Arc::clone(&rrc);
			config.on_sys_info(Box::new(move |sys_info| rrc.update_sys_info(sys_info)));
			let mme = Arc::clone(&mme);
			config.on_sys_info(Box::new(move |sys_info| mme.update_sys_info(sys_info)));
		}
		config.construct_sys_info();

		let mut handles = Vec::new();
		handles.extend(mac.start(&queues.phy_to_mac, &queues.rlc_to_mac));
		handles.extend(rlc.start(&queues.mac_to_rlc, &queues.pdcp_to_rlc));
		handles.extend(pdcp.start(&queues.rlc_to_pdcp, &queues.rrc_to_pdcp, &queues.gw_to_pdcp));
		handles.extend(rrc.start(&queues.pdcp_to_rrc, &queues.mme_to_rrc));
		handles.extend(mme.start(&queues.rrc_to_mme));

		// Timer ticks arrive once per subframe from MAC; expiries are
		// dispatched to the user manager, and every tick also drives the
		// delayed-deletion sweep.
		{
			let timers = Arc::clone(&timers);
			let user_mgr = Arc::clone(&user_mgr);
			handles.push(queues.mac_to_timer.attach_rx(0, move |env| {
				if let Message::TimerTick { .. } = env.msg {
					for expiry in timers.tick() {
						user_mgr.handle_timer_expiry(expiry);
					}
					user_mgr.sweep_delayed_delete();
				}
			}));
		}

		let gw = if opts.enable_gw {
			let gw = Gw::start(
				Arc::clone(&user_mgr),
				Arc::clone(&pcap),
				&config,
				Arc::clone(&queues.gw_to_pdcp),
			)?;
			handles.extend(gw.spawn(&queues.pdcp_to_gw));
			Some(gw)
		} else {
			None
		};

		config.set_started(true);
		info!(target: "iface", "stack started ({} consumer threads)", handles.len());
		Ok(Stack {
			config,
			hss,
			timers,
			user_mgr,
			mac,
			rlc,
			pdcp,
			rrc,
			mme,
			gw,
			queues,
			handles,
			started: true,
		})
	}

	/// Kill every queue consumer and join the layer threads. The GW
	/// receive thread exits with the process; its TUN read has no
	/// wake-up.
	pub fn stop(&mut self) {
		if !self.started {
			return;
		}
		self.started = false;
		if let Some(gw) = &self.gw {
			gw.stop();
		}
		for queue in self.queues.all() {
			queue.kill();
		}
		for handle in self.handles.drain(..) {
			if handle.thread().name() == Some("gw_rx") {
				continue;
			}
			let _ = handle.join();
		}
		self.config.set_started(false);
		info!(target: "iface", "stack stopped");
	}
}

impl Drop for Stack {
	fn drop(&mut self) {
		self.stop();
	}
}
