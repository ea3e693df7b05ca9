//! Detach: a protected detach accept comes back, the SR-PUCCH
//! reservation disappears, the release follows, and the record is marked
//! for deletion.

mod common;

use common::{run_attach, ue_decode, DlEvent, TestEnb, TestUe, IMSI};
use ferrolte::nas::msg as nas_msg;
use ferrolte::nas::{self, SEC_HDR_INTEGRITY_AND_CIPHERED};
use ferrolte::rrc::msg::{DlDcchMessage, UlDcchMessage};

#[test]
fn detach_accept_release_and_deletion() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	run_attach(&mut enb, &mut ue);
	assert!(enb.stack.mac.has_periodic_sr_pucch(ue.c_rnti));

	let detach = nas_msg::pack_detach_request(&nas_msg::DetachRequest {
		detach_type: 1,
		nas_ksi: 0,
		mobile_id: nas_msg::MobileId::Imsi(IMSI),
	});
	let protected = ue.protect_nas(&detach, SEC_HDR_INTEGRITY_AND_CIPHERED);
	let msg = ue.ul_dcch(&UlDcchMessage::UlInfoTransfer {
		dedicated_info_nas: protected,
	});
	enb.push_pusch(ue.c_rnti, msg);

	let mut saw_accept = false;
	{
		let ue = &mut ue;
		let saw_accept = &mut saw_accept;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				match event {
					DlEvent::Dcch(DlDcchMessage::DlInfoTransfer { dedicated_info_nas, .. }) => {
						// The accept rides integrity-protected and
						// ciphered under the live context.
						assert_eq!(
							dedicated_info_nas[0] >> 4,
							SEC_HDR_INTEGRITY_AND_CIPHERED
						);
						let inner = ue.unprotect_nas(&dedicated_info_nas);
						let (pd, msg_type) = nas::parse_msg_header(&inner).unwrap();
						assert_eq!(pd, nas::PD_EMM);
						assert_eq!(msg_type, nas_msg::EmmMsgType::DetachAccept as u8);
						*saw_accept = true;
					}
					DlEvent::Dcch(DlDcchMessage::ConRelease { .. }) => {
						assert!(*saw_accept, "release must follow the detach accept");
						return Some(());
					}
					_ => {}
				}
			}
			None
		});
	}

	let user = enb.stack.user_mgr.find_user(ue.c_rnti).unwrap();
	assert!(user.lock().is_delete_pending());
	assert!(!enb.stack.mac.has_periodic_sr_pucch(ue.c_rnti));
	enb.stack.stop();
}
