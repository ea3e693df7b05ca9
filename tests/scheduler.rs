//! Scheduler invariants observed from the PHY boundary: grant timing,
//! PRB budgets, SR reservations.

mod common;

use common::{run_attach, TestEnb, TestUe};
use ferrolte::mac::pdu::{pack_pdu, MacPdu, Payload, SubHeader};
use ferrolte::phy::{add_to_tti, get_n_cce, PucchType};

#[test]
fn ul_grants_decode_exactly_four_subframes_later() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);

	// A buffer status report asks for an uplink grant.
	let mut bsr_pdu = MacPdu::default();
	bsr_pdu.subheaders.push(SubHeader {
		lcid: ferrolte::mac::pdu::LCID_SHORT_BSR,
		payload: Payload::ShortBsr {
			lcg_id: 0,
			bsr_idx: 20,
		},
	});
	enb.push_pusch(ue.c_rnti, pack_pdu(&bsr_pdu));

	let c_rnti = ue.c_rnti;
	let (grant_tti, n_prb) = enb.step_until(100, |dl, _ul| {
		dl.ul_allocations
			.iter()
			.find(|alloc| alloc.rnti == c_rnti)
			.map(|alloc| (dl.current_tti, alloc.n_prb))
	});
	assert!(n_prb >= 1);

	// The decode plan for the same grant sits at exactly t+4.
	let decode_tti = add_to_tti(grant_tti, 4);
	enb.step_until(10, |_dl, ul| {
		(ul.current_tti == decode_tti).then(|| {
			let decode = ul
				.decodes
				.iter()
				.find(|alloc| alloc.rnti == c_rnti)
				.expect("decode opportunity at t+4");
			assert_eq!(decode.n_prb, n_prb);
		})
	});
	enb.stack.stop();
}

#[test]
fn prb_and_dci_budgets_hold_in_every_subframe() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);

	let sys_info = enb.stack.config.sys_info();
	let n_cce = get_n_cce(sys_info.n_rb_dl);
	for _ in 0..100 {
		let (dl, ul) = enb.step();
		let dl_prbs: u32 = dl.dl_allocations.iter().map(|alloc| alloc.n_prb).sum();
		assert!(dl_prbs <= dl.n_avail_prbs);
		assert!((dl.dl_allocations.len() + dl.ul_allocations.len()) as u32 <= n_cce);
		let ul_prbs: u32 = ul.decodes.iter().map(|alloc| alloc.n_prb).sum();
		assert!(ul_prbs <= ul.n_avail_prbs);
	}
	enb.stack.stop();
}

#[test]
fn sr_reservation_recurs_on_its_period() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);

	// I_SR 15..34 map to a 20 subframe period; every reservation must
	// recur exactly one period later.
	let c_rnti = ue.c_rnti;
	let mut hits = Vec::new();
	for _ in 0..45 {
		let (_dl, ul) = enb.step();
		for entry in &ul.pucch {
			if entry.rnti == c_rnti && entry.pucch_type == PucchType::Sr {
				hits.push(ul.current_tti);
			}
		}
	}
	assert!(hits.len() >= 2, "expected periodic SR opportunities, got {hits:?}");
	assert!(
		hits.iter().any(|&hit| hits.contains(&add_to_tti(hit, 20))),
		"SR opportunities must repeat on the 20 subframe period: {hits:?}"
	);
	enb.stack.stop();
}

#[test]
fn tti_drift_is_resynchronised_and_counted() {
	use std::sync::atomic::Ordering;
	use std::time::Duration;

	use ferrolte::msgq::{Dest, Message};

	let mut enb = TestEnb::start();
	// A PHY report far behind the ring forces a fast-forward.
	enb.stack.queues.phy_to_mac.send(
		Dest::Mac,
		Message::ReadyToSend {
			dl_tti: 50,
			ul_tti: 47,
			late: false,
		},
	);
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	while enb.stack.mac.skipped_subframes.load(Ordering::Relaxed) == 0 {
		assert!(std::time::Instant::now() < deadline, "resync never happened");
		std::thread::sleep(Duration::from_millis(5));
	}
	assert_eq!(enb.stack.mac.skipped_subframes.load(Ordering::Relaxed), 50);
	enb.stack.stop();
}

#[test]
fn sr_triggers_an_uplink_grant() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);

	let c_rnti = ue.c_rnti;
	let sr_tti = enb.step_until(50, |_dl, ul| {
		ul.pucch
			.iter()
			.find(|entry| entry.rnti == c_rnti && entry.pucch_type == PucchType::Sr)
			.map(|_| ul.current_tti)
	});
	enb.push_pucch(c_rnti, PucchType::Sr, true, sr_tti);

	enb.step_until(50, |dl, _ul| {
		dl.ul_allocations
			.iter()
			.find(|alloc| alloc.rnti == c_rnti)
			.map(|_| ())
	});
	enb.stack.stop();
}
