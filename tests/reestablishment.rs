//! Connection reestablishment: without a known C-RNTI the request is
//! rejected on the CCCH.

mod common;

use common::{TestEnb, TestUe};
use ferrolte::mac::pdu::unpack_rar;
use ferrolte::rrc::msg::{ConReestRequest, DlCcchMessage, UlCcchMessage};

#[test]
fn unknown_c_rnti_reestablishment_is_rejected() {
	let mut enb = TestEnb::start();
	let mut ue = TestUe::new();

	enb.push_prach(9, 0);
	let rar = enb.step_until(50, |dl, _ul| {
		dl.dl_allocations
			.iter()
			.find_map(|alloc| unpack_rar(&alloc.payload).ok())
	});
	ue.c_rnti = rar.temp_c_rnti;

	let reest = UlCcchMessage::ConReestRequest(ConReestRequest {
		c_rnti: 0x5555,
		pci: 0,
		short_mac_i: 0,
		cause: 1,
	});
	enb.push_pusch(ue.c_rnti, ue.msg3(&reest));

	{
		let ue = &mut ue;
		enb.step_until(100, move |dl, _ul| {
			for event in common::ue_decode(ue, dl) {
				if let common::DlEvent::Ccch(DlCcchMessage::ConReestReject) = event {
					return Some(());
				}
			}
			None
		});
	}
	enb.stack.stop();
}
