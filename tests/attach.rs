//! End-to-end attach: random access through EMM information, driven
//! through the PHY-facing queues.

mod common;

use common::{run_attach, TestEnb, TestUe};
use ferrolte::user::rb::{MmeState, RbId, RrcState};

#[test]
fn attach_without_identity_request() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();

	let ip = run_attach(&mut enb, &mut ue);
	// First UE address is the range start plus one.
	assert_eq!(ip, [192, 168, 1, 2]);

	let user = enb.stack.user_mgr.find_user(ue.c_rnti).unwrap();
	{
		let locked = user.lock();
		assert_eq!(locked.ip_addr, Some(0xC0A8_0102));
		assert!(locked.guti.is_some());
		let srb1 = locked.rb(RbId::Srb1).unwrap();
		assert_eq!(srb1.rrc_state, RrcState::Connected);
		assert_eq!(srb1.mme_state, MmeState::Attached);
		assert!(locked.rb(RbId::Srb2).is_some());
		assert!(locked.rb(RbId::Drb1).is_some());
	}
	// The connection holds a periodic SR-PUCCH reservation.
	assert!(enb.stack.mac.has_periodic_sr_pucch(ue.c_rnti));

	enb.stack.stop();
}

#[test]
fn nas_counts_advance_monotonically_through_attach() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);

	let user = enb.stack.user_mgr.find_user(ue.c_rnti).unwrap();
	let locked = user.lock();
	let auth_vec = locked.auth_vec().unwrap();
	// Three protected downlink messages (NAS SMC, attach accept, EMM
	// information) and three counted uplink ones.
	assert_eq!(auth_vec.nas_count_dl, 3);
	assert_eq!(auth_vec.nas_count_ul, 3);
	drop(locked);
	enb.stack.stop();
}
