// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! IP gateway: bridges user-plane traffic between PDCP and a local TUN
//! device.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::config::{ConfigDb, Param};
use crate::error::{Error, Result};
use crate::msgq::{Dest, Envelope, Message, Msgq};
use crate::pcap::Pcap;
use crate::user::rb::RbId;
use crate::user::UserMgr;

const TUN_DEV_NAME: &[u8] = b"tun_ferrolte";
const MAX_DATAGRAM: usize = 9000;

pub struct Gw {
	user_mgr: Arc<UserMgr>,
	pcap: Arc<Pcap>,
	to_pdcp: Arc<Msgq>,
	tun: std::fs::File,
	started: AtomicBool,
}

impl Gw {
	/// Open and configure the TUN device, then hand back the gateway.
	/// Failures carry the OS error text and abort the stack start.
	pub fn start(
		user_mgr: Arc<UserMgr>,
		pcap: Arc<Pcap>,
		config: &ConfigDb,
		to_pdcp: Arc<Msgq>,
	) -> Result<Arc<Gw>> {
		let ip_addr = config.get_u32(Param::IpAddrStart);
		let tun = open_tun(ip_addr)?;
		info!(target: "gw", "TUN device up at {}.{}.{}.{}/24",
			ip_addr >> 24, (ip_addr >> 16) & 0xFF, (ip_addr >> 8) & 0xFF, ip_addr & 0xFF);
		Ok(Arc::new(Gw {
			user_mgr,
			pcap,
			to_pdcp,
			tun,
			started: AtomicBool::new(true),
		}))
	}

	pub fn stop(&self) {
		self.started.store(false, Ordering::Relaxed);
	}

	/// Spawn the PDCP consumer and the TUN receive thread.
	pub fn spawn(
		self: &Arc<Gw>,
		from_pdcp: &Arc<Msgq>,
	) -> Vec<std::thread::JoinHandle<()>> {
		let gw = Arc::clone(self);
		let pdcp_rx = from_pdcp.attach_rx(0, move |env| gw.handle_pdcp_msg(env));
		let gw = Arc::clone(self);
		let tun_rx = std::thread::Builder::new()
			.name("gw_rx".into())
			.spawn(move || gw.receive_loop())
			.expect("spawning the GW receive thread cannot fail");
		vec![pdcp_rx, tun_rx]
	}

	fn handle_pdcp_msg(&self, env: Envelope) {
		if env.dest != Dest::Gw && env.dest != Dest::Any {
			warn!(target: "gw", "message for {:?} has nowhere to go", env.dest);
			return;
		}
		match env.msg {
			Message::GwDataReady { rnti, rb } => self.handle_gw_data(rnti, rb),
			msg => error!(target: "gw", "invalid PDCP message {msg:?}"),
		}
	}

	fn handle_gw_data(&self, rnti: u16, rb_id: RbId) {
		let Some(user) = self.user_mgr.find_user(rnti) else {
			error!(target: "gw", "data for unknown RNTI={rnti}");
			return;
		};
		loop {
			let datagram = {
				let mut locked = user.lock();
				locked.rb_mut(rb_id).and_then(|rb| rb.pop_gw_data_msg())
			};
			let Some(datagram) = datagram else {
				break;
			};
			debug!(target: "gw", "writing {} bytes for RNTI={rnti}", datagram.len());
			self.pcap.send_ip_pcap_msg(&datagram);
			let mut tun = &self.tun;
			if tun.write(&datagram).unwrap_or(0) != datagram.len() {
				error!(target: "gw", "write failure");
			}
		}
	}

	/// Read datagrams from the TUN device, accumulate until the IPv4
	/// total length is satisfied, and dispatch by destination address.
	fn receive_loop(&self) {
		clear_last_core_affinity();
		let mut buf = vec![0u8; MAX_DATAGRAM];
		let mut pending = 0usize;
		while self.started.load(Ordering::Relaxed) {
			let mut tun = &self.tun;
			let n_bytes = match tun.read(&mut buf[pending..]) {
				Ok(0) | Err(_) => break,
				Ok(n) => n,
			};
			pending += n_bytes;
			if pending < 20 {
				continue;
			}
			let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
			if pending < total_len {
				continue;
			}
			let datagram = buf[..total_len].to_vec();
			pending = 0;
			self.dispatch(datagram);
		}
	}

	fn dispatch(&self, datagram: Vec<u8>) {
		let dst = u32::from_be_bytes([datagram[16], datagram[17], datagram[18], datagram[19]]);
		let Some(user) = self.user_mgr.find_user_ip(dst) else {
			return;
		};
		let rnti = {
			let mut locked = user.lock();
			let rnti = locked.c_rnti();
			let Some(rb) = locked.rb_mut(RbId::Drb1) else {
				return;
			};
			rb.queue_pdcp_data_sdu(datagram.clone());
			rnti
		};
		debug!(target: "gw", "IP packet for RNTI={rnti} ({} bytes)", datagram.len());
		self.pcap.send_ip_pcap_msg(&datagram);
		self.to_pdcp.send(
			Dest::Pdcp,
			Message::PdcpDataSduReady {
				rnti,
				rb: RbId::Drb1,
			},
		);
	}
}

fn os_error() -> Error {
	Error::CantStart(std::io::Error::last_os_error().to_string())
}

/// Open `/dev/net/tun`, set the interface name and flags, assign the
/// address and /24 netmask, and bring the interface up.
fn open_tun(ip_addr: u32) -> Result<std::fs::File> {
	let tun = std::fs::OpenOptions::new()
		.read(true)
		.write(true)
		.open("/dev/net/tun")
		.map_err(|e| Error::CantStart(e.to_string()))?;

	unsafe {
		let mut ifr: libc::ifreq = core::mem::zeroed();
		for (dst, src) in ifr.ifr_name.iter_mut().zip(TUN_DEV_NAME) {
			*dst = *src as libc::c_char;
		}
		ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;
		if libc::ioctl(tun.as_raw_fd(), libc::TUNSETIFF, &ifr) < 0 {
			return Err(os_error());
		}

		let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
		if sock < 0 {
			return Err(os_error());
		}

		let mut addr: libc::sockaddr_in = core::mem::zeroed();
		addr.sin_family = libc::AF_INET as libc::sa_family_t;
		addr.sin_addr.s_addr = ip_addr.to_be();
		ifr.ifr_ifru.ifru_addr = *(&addr as *const libc::sockaddr_in).cast::<libc::sockaddr>();
		if libc::ioctl(sock, libc::SIOCSIFADDR, &ifr) < 0 {
			libc::close(sock);
			return Err(os_error());
		}

		addr.sin_addr.s_addr = 0xFFFF_FF00u32.to_be();
		ifr.ifr_ifru.ifru_netmask =
			*(&addr as *const libc::sockaddr_in).cast::<libc::sockaddr>();
		if libc::ioctl(sock, libc::SIOCSIFNETMASK, &ifr) < 0 {
			libc::close(sock);
			return Err(os_error());
		}

		if libc::ioctl(sock, libc::SIOCGIFFLAGS, &ifr) < 0 {
			libc::close(sock);
			return Err(os_error());
		}
		ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
		if libc::ioctl(sock, libc::SIOCSIFFLAGS, &ifr) < 0 {
			libc::close(sock);
			return Err(os_error());
		}
		libc::close(sock);
	}
	Ok(tun)
}

/// The last core is reserved for the PHY/radio.
fn clear_last_core_affinity() {
	unsafe {
		let n_cores = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
		if n_cores > 1 {
			let mut mask: libc::cpu_set_t = core::mem::zeroed();
			if libc::pthread_getaffinity_np(
				libc::pthread_self(),
				core::mem::size_of::<libc::cpu_set_t>(),
				&mut mask,
			) == 0
			{
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
