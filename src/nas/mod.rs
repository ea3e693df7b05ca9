//! NAS (EMM/ESM) message handling: the 24.301 header conventions and the
//! security-protected envelope. The message bodies live in [`msg`].

pub mod msg;

use crate::error::{Error, Result};
use crate::security::{self, Direction};

pub const PD_EMM: u8 = 0x7;
pub const PD_ESM: u8 = 0x2;

/// Security header types (24.301 9.3.1).
pub const SEC_HDR_PLAIN: u8 = 0x0;
pub const SEC_HDR_INTEGRITY: u8 = 0x1;
pub const SEC_HDR_INTEGRITY_AND_CIPHERED: u8 = 0x2;
pub const SEC_HDR_INTEGRITY_NEW_CTX: u8 = 0x3;
pub const SEC_HDR_INTEGRITY_AND_CIPHERED_NEW_CTX: u8 = 0x4;
pub const SEC_HDR_SERVICE_REQUEST: u8 = 0xC;

/// Marker returned by [`parse_msg_header`] for a service request, which has
/// no message type octet of its own.
pub const MSG_TYPE_SERVICE_REQUEST: u8 = 0xFF;

/// Peek protocol discriminator and message type, looking through the
/// security-protected envelope without verifying it.
pub fn parse_msg_header(data: &[u8]) -> Result<(u8, u8)> {
	if data.len() < 2 {
		return Err(Error::InvalidParam);
	}
	let pd = data[0] & 0x0F;
	let sec_hdr = data[0] >> 4;
	if pd == PD_ESM {
		if data.len() < 3 {
			return Err(Error::InvalidParam);
		}
		return Ok((pd, data[2]));
	}
	match sec_hdr {
		SEC_HDR_PLAIN => Ok((pd, data[1])),
		SEC_HDR_SERVICE_REQUEST => Ok((pd, MSG_TYPE_SERVICE_REQUEST)),
		_ => {
			// MAC(4) + SEQ(1) + inner header
			if data.len() < 8 {
				return Err(Error::InvalidParam);
			}
			parse_msg_header(&data[6..])
		}
	}
}

/// Wrap a packed plain NAS message in the security-protected envelope:
/// cipher the payload, then integrity-protect SEQ || payload with EIA2.
pub fn pack_security_protected_nas_msg(
	plain: &[u8],
	sec_hdr: u8,
	eea_alg: u8,
	k_nas_int: &[u8; 32],
	k_nas_enc: &[u8; 32],
	count: u32,
	direction: Direction,
) -> Vec<u8> {
	let mut payload = plain.to_vec();
	if sec_hdr == SEC_HDR_INTEGRITY_AND_CIPHERED || sec_hdr == SEC_HDR_INTEGRITY_AND_CIPHERED_NEW_CTX
	{
		security::apply_eea(
			eea_alg,
			&security::key128(k_nas_enc),
			count,
			0,
			direction,
			&mut payload,
		);
	}
	let seq = (count & 0xFF) as u8;
	let mut to_mac = Vec::with_capacity(1 + payload.len());
	to_mac.push(seq);
	to_mac.extend_from_slice(&payload);
	let mac = security::eia2(&security::key128(k_nas_int), count, 0, direction, &to_mac);

	let mut out = Vec::with_capacity(6 + payload.len());
	out.push((sec_hdr << 4) | PD_EMM);
	out.extend_from_slice(&mac);
	out.push(seq);
	out.extend_from_slice(&payload);
	out
}

/// Unwrap a security-protected NAS message: verify the MAC-I against the
/// expected count, decipher, and return the inner plain message. Plain
/// input passes through untouched.
pub fn unpack_security_protected_nas_msg(
	data: &[u8],
	eea_alg: u8,
	k_nas_int: &[u8; 32],
	k_nas_enc: &[u8; 32],
	count: u32,
	direction: Direction,
) -> Result<Vec<u8>> {
	if data.len() < 2 {
		return Err(Error::InvalidParam);
	}
	let sec_hdr = data[0] >> 4;
	if sec_hdr == SEC_HDR_PLAIN || sec_hdr == SEC_HDR_SERVICE_REQUEST || data[0] & 0x0F == PD_ESM {
		return Ok(data.to_vec());
	}
	if data.len() < 7 {
		return Err(Error::InvalidParam);
	}
	let mac: [u8; 4] = [data[1], data[2], data[3], data[4]];
	let seq = data[5];
	if seq != (count & 0xFF) as u8 {
		return Err(Error::InvalidParam);
	}
	let expected = security::eia2(&security::key128(k_nas_int), count, 0, direction, &data[5..]);
	if expected != mac {
		return Err(Error::InvalidParam);
	}
	let mut payload = data[6..].to_vec();
	if sec_hdr == SEC_HDR_INTEGRITY_AND_CIPHERED || sec_hdr == SEC_HDR_INTEGRITY_AND_CIPHERED_NEW_CTX
	{
		security::apply_eea(
			eea_alg,
			&security::key128(k_nas_enc),
			count,
			0,
			direction,
			&mut payload,
		);
	}
	Ok(payload)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::security::EEA0;

	#[test]
	fn protected_envelope_round_trip() {
		let k_int = [0x11u8; 32];
		let k_enc = [0x22u8; 32];
		let plain = vec![0x07, 0x55, 0x01];
		let wrapped = pack_security_protected_nas_msg(
			&plain,
			SEC_HDR_INTEGRITY_AND_CIPHERED,
			EEA0,
			&k_int,
			&k_enc,
			5,
			Direction::Downlink,
		);
		let unwrapped = unpack_security_protected_nas_msg(
			&wrapped,
			EEA0,
			&k_int,
			&k_enc,
			5,
			Direction::Downlink,
		)
		.unwrap();
		assert_eq!(unwrapped, plain);
	}

	#[test]
	fn wrong_count_is_rejected() {
		let k_int = [0x11u8; 32];
		let k_enc = [0x22u8; 32];
		let wrapped = pack_security_protected_nas_msg(
			&[0x07, 0x55, 0x01],
			SEC_HDR_INTEGRITY_AND_CIPHERED,
			EEA0,
			&k_int,
			&k_enc,
			5,
			Direction::Downlink,
		);
		assert!(unpack_security_protected_nas_msg(
			&wrapped,
			EEA0,
			&k_int,
			&k_enc,
			6,
			Direction::Downlink,
		)
		.is_err());
	}

	#[test]
	fn header_peeks_through_the_envelope() {
		let k = [0u8; 32];
		let wrapped = pack_security_protected_nas_msg(
			&[0x07, 0x55],
			SEC_HDR_INTEGRITY_AND_CIPHERED,
			EEA0,
			&k,
			&k,
			0,
			Direction::Downlink,
		);
		assert_eq!(parse_msg_header(&wrapped).unwrap(), (PD_EMM, 0x55));
	}

	#[test]
	fn esm_header_has_its_own_layout() {
		// EBI 5, PD ESM, PTI 1, msg type 0xC1
		assert_eq!(parse_msg_header(&[0x52, 0x01, 0xC1]).unwrap(), (PD_ESM, 0xC1));
	}

	#[test]
	fn service_request_header() {
		assert_eq!(
			parse_msg_header(&[0xC7, 0x05, 0xaa, 0xbb]).unwrap(),
			(PD_EMM, MSG_TYPE_SERVICE_REQUEST)
		);
	}
}
