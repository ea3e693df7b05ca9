//! Identity handling: an unknown GUTI triggers an identity request, an
//! unknown IMSI draws an attach reject followed by a connection release.

mod common;

use common::{random_access, ue_decode, DlEvent, TestEnb, TestUe, IMSI};
use ferrolte::nas::msg as nas_msg;
use ferrolte::rrc::msg::{DlDcchMessage, UlDcchMessage};

#[test]
fn unknown_guti_triggers_identity_request() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	random_access(&mut enb, &mut ue);

	let attach_nas = ue.attach_request_nas(nas_msg::MobileId::Guti(nas_msg::Guti {
		mcc: 1,
		mnc: 1,
		mnc_two_digits: true,
		mme_group_id: 0,
		mme_code: 0,
		m_tmsi: 0x7777_7777,
	}));
	let msg = ue.ul_dcch(&UlDcchMessage::ConSetupComplete {
		rrc_transaction_id: 0,
		selected_plmn_id: 0,
		dedicated_info_nas: attach_nas,
	});
	enb.push_pusch(ue.c_rnti, msg);

	// The MME cannot place the GUTI, so it asks for the IMSI.
	{
		let ue = &mut ue;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				if let DlEvent::Dcch(DlDcchMessage::DlInfoTransfer { dedicated_info_nas, .. }) =
					event
				{
					let req = nas_msg::unpack_identity_request(&dedicated_info_nas)
						.expect("expected an identity request");
					assert_eq!(req.id_type, nas_msg::ID_TYPE_IMSI);
					return Some(());
				}
			}
			None
		});
	}

	// A known IMSI moves the procedure on to authentication.
	let id_resp = nas_msg::pack_identity_response(&nas_msg::IdentityResponse {
		mobile_id: nas_msg::MobileId::Imsi(IMSI),
	});
	let msg = ue.ul_dcch(&UlDcchMessage::UlInfoTransfer {
		dedicated_info_nas: id_resp,
	});
	enb.push_pusch(ue.c_rnti, msg);

	{
		let ue = &mut ue;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				if let DlEvent::Dcch(DlDcchMessage::DlInfoTransfer { dedicated_info_nas, .. }) =
					event
				{
					assert!(nas_msg::unpack_authentication_request(&dedicated_info_nas).is_ok());
					return Some(());
				}
			}
			None
		});
	}
	enb.stack.stop();
}

#[test]
fn unknown_imsi_draws_attach_reject_and_release() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();
	random_access(&mut enb, &mut ue);

	let attach_nas = ue.attach_request_nas(nas_msg::MobileId::Imsi(IMSI + 99));
	let msg = ue.ul_dcch(&UlDcchMessage::ConSetupComplete {
		rrc_transaction_id: 0,
		selected_plmn_id: 0,
		dedicated_info_nas: attach_nas,
	});
	enb.push_pusch(ue.c_rnti, msg);

	let mut saw_reject = false;
	{
		let ue = &mut ue;
		let saw_reject = &mut saw_reject;
		enb.step_until(200, move |dl, _ul| {
			for event in ue_decode(ue, dl) {
				match event {
					DlEvent::Dcch(DlDcchMessage::DlInfoTransfer { dedicated_info_nas, .. }) => {
						let reject = nas_msg::unpack_attach_reject(&dedicated_info_nas)
							.expect("expected an attach reject");
						assert_eq!(reject.emm_cause, nas_msg::EMM_CAUSE_IMSI_UNKNOWN_IN_HSS);
						*saw_reject = true;
					}
					DlEvent::Dcch(DlDcchMessage::ConRelease { .. }) => {
						assert!(*saw_reject, "release must follow the reject");
						return Some(());
					}
					_ => {}
				}
			}
			None
		});
	}

	// The record is parked for the delayed-deletion sweep.
	let user = enb.stack.user_mgr.find_user(ue.c_rnti).unwrap();
	assert!(user.lock().is_delete_pending());
	enb.stack.stop();
}
