//! HARQ: a NACK on the ACK/NACK opportunity re-queues the exact same MAC
//! PDU with the retransmission count bumped and the NDI unchanged.

mod common;

use common::TestEnb;
use ferrolte::mac::pdu::unpack_rar;
use ferrolte::phy::{add_to_tti, PucchType};
use ferrolte::rrc::msg::{pack_ul_ccch_msg, ConReqUeId, ConRequest, STmsi, UlCcchMessage};

#[test]
fn nack_triggers_an_identical_retransmission() {
	let mut enb = TestEnb::start();

	enb.push_prach(23, 0);
	let rar = enb.step_until(50, |dl, _ul| {
		dl.dl_allocations
			.iter()
			.find_map(|alloc| unpack_rar(&alloc.payload).ok())
	});
	let c_rnti = rar.temp_c_rnti;

	// The connection setup is the first tracked DL allocation.
	let request = UlCcchMessage::ConRequest(ConRequest {
		ue_id: ConReqUeId::STmsi(STmsi { mmec: 0, m_tmsi: 7 }),
		cause: 0,
	});
	let msg3 = ferrolte::mac::pdu::pack_pdu(&ferrolte::mac::pdu::MacPdu::single_sdu(
		0,
		pack_ul_ccch_msg(&request),
	));
	enb.push_pusch(c_rnti, msg3);

	let (payload, ndi, sent_tti) = enb.step_until(100, |dl, _ul| {
		dl.dl_allocations
			.iter()
			.find(|alloc| alloc.rnti == c_rnti)
			.map(|alloc| (alloc.payload.clone(), alloc.ndi, dl.current_tti))
	});

	// The ACK/NACK opportunity is registered exactly four subframes out.
	let ack_tti = add_to_tti(sent_tti, 4);
	enb.step_until(10, |_dl, ul| {
		(ul.current_tti == ack_tti).then(|| {
			let pucch = ul
				.pucch
				.iter()
				.find(|entry| entry.rnti == c_rnti && entry.pucch_type == PucchType::AckNack)
				.expect("ACK/NACK slot must exist at t+4");
			assert!(pucch.decode);
		})
	});

	enb.push_pucch(c_rnti, PucchType::AckNack, false, ack_tti);

	let retx = enb.step_until(50, |dl, _ul| {
		dl.dl_allocations
			.iter()
			.find(|alloc| alloc.rnti == c_rnti && alloc.harq_retx_count == 1)
			.cloned()
	});
	assert_eq!(retx.payload, payload, "retransmission must carry the same PDU");
	assert_eq!(retx.ndi, ndi, "NDI reverts to the originally transmitted value");
	enb.stack.stop();
}

#[test]
fn retransmissions_stop_at_the_harq_ceiling() {
	let mut enb = TestEnb::start();

	enb.push_prach(5, 0);
	let rar = enb.step_until(50, |dl, _ul| {
		dl.dl_allocations
			.iter()
			.find_map(|alloc| unpack_rar(&alloc.payload).ok())
	});
	let c_rnti = rar.temp_c_rnti;

	let request = UlCcchMessage::ConRequest(ConRequest {
		ue_id: ConReqUeId::Random(0x55),
		cause: 0,
	});
	let msg3 = ferrolte::mac::pdu::pack_pdu(&ferrolte::mac::pdu::MacPdu::single_sdu(
		0,
		pack_ul_ccch_msg(&request),
	));
	enb.push_pusch(c_rnti, msg3);

	// NACK every transmission; the sixth NACK finds the counter at the
	// ceiling and the PDU is dropped.
	for expected_retx in 0..ferrolte::mac::MAX_HARQ_RETX + 1 {
		let sent_tti = enb.step_until(100, |dl, _ul| {
			dl.dl_allocations
				.iter()
				.find(|alloc| {
					alloc.rnti == c_rnti && alloc.harq_retx_count == expected_retx
				})
				.map(|_| dl.current_tti)
		});
		enb.push_pucch(c_rnti, PucchType::AckNack, false, add_to_tti(sent_tti, 4));
	}

	// Nothing beyond the ceiling ever goes out.
	for _ in 0..30 {
		let (dl, _ul) = enb.step();
		assert!(!dl
			.dl_allocations
			.iter()
			.any(|alloc| alloc.rnti == c_rnti
				&& alloc.harq_retx_count > ferrolte::mac::MAX_HARQ_RETX));
	}
	enb.stack.stop();
}
