//! Service request with a stale NAS count: the MME adopts the UE's
//! sequence number, re-derives the K_eNB-rooted keys, and moves to RRC
//! security.

mod common;

use std::time::Duration;

use common::{run_attach, TestEnb, TestUe};
use ferrolte::nas::msg as nas_msg;
use ferrolte::rrc::msg::UlDcchMessage;
use ferrolte::user::rb::{MmeProc, MmeState, RbId};

#[test]
fn stale_count_regenerates_the_rrc_keys() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);

	let user = enb.stack.user_mgr.find_user(ue.c_rnti).unwrap();
	let (old_count, old_k_rrc_int, old_k_enb) = {
		let locked = user.lock();
		let auth_vec = locked.auth_vec().unwrap();
		(auth_vec.nas_count_ul, auth_vec.k_rrc_int, auth_vec.k_enb)
	};

	let stale_seq = ((old_count + 5) & 0x1F) as u8;
	let service_req = nas_msg::pack_service_request(&nas_msg::ServiceRequest {
		ksi: 0,
		seq_num: stale_seq,
		short_mac: 0xbeef,
	});
	let msg = ue.ul_dcch(&UlDcchMessage::UlInfoTransfer {
		dedicated_info_nas: service_req,
	});
	enb.push_pusch(ue.c_rnti, msg);

	// The NAS path runs without pacing; poll for the MME to catch up.
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	loop {
		{
			let locked = user.lock();
			let srb1 = locked.rb(RbId::Srb1).unwrap();
			if srb1.mme_proc == MmeProc::ServiceRequest && srb1.mme_state == MmeState::RrcSecurity
			{
				break;
			}
		}
		assert!(std::time::Instant::now() < deadline, "MME never reached RRC security");
		std::thread::sleep(Duration::from_millis(10));
	}

	let locked = user.lock();
	let auth_vec = locked.auth_vec().unwrap();
	// The stored count is overwritten with the UE's sequence number (plus
	// the post-parse increment), and the K_eNB-rooted keys changed.
	let expected = u32::from(stale_seq) + 1;
	assert_eq!(auth_vec.nas_count_ul, expected);
	assert_ne!(auth_vec.k_enb, old_k_enb);
	assert_ne!(auth_vec.k_rrc_int, old_k_rrc_int);
	drop(locked);
	enb.stack.stop();
}

#[test]
fn nonzero_ksi_is_rejected_as_implicitly_detached() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);

	let service_req = nas_msg::pack_service_request(&nas_msg::ServiceRequest {
		ksi: 3,
		seq_num: 0,
		short_mac: 0,
	});
	let msg = ue.ul_dcch(&UlDcchMessage::UlInfoTransfer {
		dedicated_info_nas: service_req,
	});
	enb.push_pusch(ue.c_rnti, msg);

	let user = enb.stack.user_mgr.find_user(ue.c_rnti).unwrap();
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	loop {
		{
			let locked = user.lock();
			let srb1 = locked.rb(RbId::Srb1).unwrap();
			if srb1.mme_proc == MmeProc::ServiceRequest && srb1.mme_state == MmeState::Release {
				break;
			}
		}
		assert!(std::time::Instant::now() < deadline, "MME never moved to release");
		std::thread::sleep(Duration::from_millis(10));
	}
	enb.stack.stop();
}
