//! eNodeB daemon entry point: explicit construction and teardown of the
//! process-scoped services.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferrolte::config::{ConfigDb, Param};
use ferrolte::hss::Hss;
use ferrolte::{Stack, StackOptions};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
	SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() {
	ferrolte::logging::init();

	let config = ConfigDb::new();
	let hss = Hss::new();

	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--config" => {
				if let Some(path) = args.next() {
					config.set_cnfg_file(Some(PathBuf::from(path)));
				}
			}
			"--users" => {
				if let Some(path) = args.next() {
					hss.set_user_file(Some(PathBuf::from(path)));
				}
			}
			arg => {
				eprintln!("usage: ferrolte-enb [--config FILE] [--users FILE]");
				eprintln!("unknown argument: {arg}");
				std::process::exit(2);
			}
		}
	}

	hss.read_user_file();
	config.read_cnfg_file();

	let handler = on_signal as extern "C" fn(libc::c_int);
	unsafe {
		libc::signal(libc::SIGINT, handler as libc::sighandler_t);
		libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
	}

	let mut stack = match Stack::start(
		config,
		hss,
		StackOptions {
			enable_gw: true,
			pcap_dir: None,
		},
	) {
		Ok(stack) => stack,
		Err(err) => {
			eprintln!("fail \"{}\" stack start", err.taxonomy_text());
			std::process::exit(1);
		}
	};

	println!(
		"ok ferrolte eNodeB up (cell {}, {} PRBs)",
		stack.config.get_i64(Param::NIdCell),
		stack.config.get_i64(Param::NRbDl)
	);

	while !SHUTDOWN.load(Ordering::Relaxed) {
		std::thread::sleep(Duration::from_millis(250));
	}
	stack.stop();
}
