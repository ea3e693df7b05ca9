// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! EPS security primitives: Milenage f1-f5*, the 33.401 key derivations,
//! EIA2 integrity and EEA0/EEA2 ciphering.
//!
//! The stack treats these as a library; everything here is pure
//! computation over fixed-size keys.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use hmac::Hmac;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Operator variant algorithm configuration field.
pub const OP: [u8; 16] = [
	0xcd, 0xc2, 0x02, 0xd5, 0x12, 0x3e, 0x20, 0xf6, 0x2b, 0x6d, 0x67, 0x6a, 0xc7, 0x2c, 0xb3, 0x18,
];

pub const AMF: [u8; 2] = [0x80, 0x00];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
	Uplink = 0,
	Downlink = 1,
}

/// Algorithm type distinguishers for the 33.401 A.7 key derivation.
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum AlgKey {
	NasEnc = 0x01,
	NasInt = 0x02,
	RrcEnc = 0x03,
	RrcInt = 0x04,
	UpEnc = 0x05,
	UpInt = 0x06,
}

/// EPS integrity algorithm identities carried in security mode commands.
pub const EIA2: u8 = 2;
/// EPS encryption algorithm identities.
pub const EEA0: u8 = 0;
pub const EEA2: u8 = 2;

/// One complete authentication vector plus every key derived from it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthVec {
	pub rand: [u8; 16],
	pub autn: [u8; 16],
	pub res: [u8; 8],
	pub k_asme: [u8; 32],
	pub k_enb: [u8; 32],
	pub k_nas_int: [u8; 32],
	pub k_nas_enc: [u8; 32],
	pub k_rrc_int: [u8; 32],
	pub k_rrc_enc: [u8; 32],
	pub k_up_int: [u8; 32],
	pub k_up_enc: [u8; 32],
	pub nas_count_ul: u32,
	pub nas_count_dl: u32,
}

/// The 128-bit algorithm key is the low half of a 256-bit derived key.
pub fn key128(key: &[u8; 32]) -> [u8; 16] {
	let mut out = [0u8; 16];
	out.copy_from_slice(&key[16..32]);
	out
}

fn aes_block(k: &[u8; 16], input: &[u8; 16]) -> [u8; 16] {
	let cipher = Aes128::new(GenericArray::from_slice(k));
	let mut block = GenericArray::clone_from_slice(input);
	cipher.encrypt_block(&mut block);
	block.into()
}

fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
	let mut out = [0u8; 16];
	for i in 0..16 {
		out[i] = a[i] ^ b[i];
	}
	out
}

fn rotate(input: &[u8; 16], bits: usize) -> [u8; 16] {
	let bytes = bits / 8;
	let mut out = [0u8; 16];
	for i in 0..16 {
		out[i] = input[(i + bytes) % 16];
	}
	out
}

/// OP_c as the UE and HSS share it.
pub fn compute_opc(k: &[u8; 16]) -> [u8; 16] {
	compute_opc_with(k, &OP)
}

pub fn compute_opc_with(k: &[u8; 16], op: &[u8; 16]) -> [u8; 16] {
	xor16(&aes_block(k, op), op)
}

/// f1: network authentication code MAC-A.
pub fn milenage_f1(k: &[u8; 16], opc: &[u8; 16], rand: &[u8; 16], sqn: &[u8; 6], amf: &[u8; 2]) -> [u8; 8] {
	let temp = aes_block(k, &xor16(rand, opc));
	let mut in1 = [0u8; 16];
	in1[0..6].copy_from_slice(sqn);
	in1[6..8].copy_from_slice(amf);
	in1[8..14].copy_from_slice(sqn);
	in1[14..16].copy_from_slice(amf);
	// c1 = 0, r1 = 64
	let tmp = xor16(&temp, &rotate(&xor16(&in1, opc), 64));
	let out1 = xor16(&aes_block(k, &tmp), opc);
	let mut mac_a = [0u8; 8];
	mac_a.copy_from_slice(&out1[0..8]);
	mac_a
}

/// f1*: resynchronisation code MAC-S (same core as f1, second output half).
pub fn milenage_f1_star(
	k: &[u8; 16],
	opc: &[u8; 16],
	rand: &[u8; 16],
	sqn: &[u8; 6],
	amf: &[u8; 2],
) -> [u8; 8] {
	let temp = aes_block(k, &xor16(rand, opc));
	let mut in1 = [0u8; 16];
	in1[0..6].copy_from_slice(sqn);
	in1[6..8].copy_from_slice(amf);
	in1[8..14].copy_from_slice(sqn);
	in1[14..16].copy_from_slice(amf);
	let tmp = xor16(&temp, &rotate(&xor16(&in1, opc), 64));
	let out1 = xor16(&aes_block(k, &tmp), opc);
	let mut mac_s = [0u8; 8];
	mac_s.copy_from_slice(&out1[8..16]);
	mac_s
}

/// f2/f3/f4/f5: (RES, CK, IK, AK).
pub fn milenage_f2345(
	k: &[u8; 16],
	opc: &[u8; 16],
	rand: &[u8; 16],
) -> ([u8; 8], [u8; 16], [u8; 16], [u8; 6]) {
	let temp = aes_block(k, &xor16(rand, opc));

	// f2/f5: c2 = ..01, r2 = 0
	let mut c2 = [0u8; 16];
	c2[15] = 1;
	let out2 = xor16(&aes_block(k, &xor16(&xor16(&temp, opc), &c2)), opc);
	let mut res = [0u8; 8];
	res.copy_from_slice(&out2[8..16]);
	let mut ak = [0u8; 6];
	ak.copy_from_slice(&out2[0..6]);

	// f3: c3 = ..02, r3 = 32
	let mut c3 = [0u8; 16];
	c3[15] = 2;
	let mut tmp = rotate(&xor16(&temp, opc), 32);
	for i in 0..16 {
		tmp[i] ^= c3[i];
	}
	let ck = xor16(&aes_block(k, &tmp), opc);

	// f4: c4 = ..04, r4 = 64
	let mut c4 = [0u8; 16];
	c4[15] = 4;
	let mut tmp = rotate(&xor16(&temp, opc), 64);
	for i in 0..16 {
		tmp[i] ^= c4[i];
	}
	let ik = xor16(&aes_block(k, &tmp), opc);

	(res, ck, ik, ak)
}

/// f5*: anonymity key for resynchronisation.
pub fn milenage_f5_star(k: &[u8; 16], opc: &[u8; 16], rand: &[u8; 16]) -> [u8; 6] {
	let temp = aes_block(k, &xor16(rand, opc));
	// c5 = ..08, r5 = 96
	let mut c5 = [0u8; 16];
	c5[15] = 8;
	let mut tmp = rotate(&xor16(&temp, opc), 96);
	for i in 0..16 {
		tmp[i] ^= c5[i];
	}
	let out5 = xor16(&aes_block(k, &tmp), opc);
	let mut ak = [0u8; 6];
	ak.copy_from_slice(&out5[0..6]);
	ak
}

fn kdf(key: &[u8], s: &[u8]) -> [u8; 32] {
	let mut mac =
		<HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
	mac.update(s);
	mac.finalize().into_bytes().into()
}

/// Serving-network id as carried in the K_ASME derivation (and the GUTI).
fn plmn_id(mcc: u16, mnc: u16) -> [u8; 3] {
	let mcc_d = [(mcc / 100 % 10) as u8, (mcc / 10 % 10) as u8, (mcc % 10) as u8];
	let two_digit_mnc = mnc < 100;
	let mnc_d = if two_digit_mnc {
		[0xF, (mnc / 10 % 10) as u8, (mnc % 10) as u8]
	} else {
		[(mnc / 100 % 10) as u8, (mnc / 10 % 10) as u8, (mnc % 10) as u8]
	};
	[
		(mcc_d[1] << 4) | mcc_d[0],
		(mnc_d[0] << 4) | mcc_d[2],
		(mnc_d[2] << 4) | mnc_d[1],
	]
}

/// 33.401 A.2: K_ASME from CK || IK, SN id and SQN xor AK.
pub fn derive_k_asme(ck: &[u8; 16], ik: &[u8; 16], mcc: u16, mnc: u16, sqn_xor_ak: &[u8; 6]) -> [u8; 32] {
	let mut key = [0u8; 32];
	key[0..16].copy_from_slice(ck);
	key[16..32].copy_from_slice(ik);
	let sn_id = plmn_id(mcc, mnc);
	let mut s = Vec::with_capacity(1 + 3 + 2 + 6 + 2);
	s.push(0x10);
	s.extend_from_slice(&sn_id);
	s.extend_from_slice(&3u16.to_be_bytes());
	s.extend_from_slice(sqn_xor_ak);
	s.extend_from_slice(&6u16.to_be_bytes());
	kdf(&key, &s)
}

/// 33.401 A.3: K_eNB from K_ASME and the uplink NAS count.
pub fn derive_k_enb(k_asme: &[u8; 32], nas_count_ul: u32) -> [u8; 32] {
	let mut s = Vec::with_capacity(1 + 4 + 2);
	s.push(0x11);
	s.extend_from_slice(&nas_count_ul.to_be_bytes());
	s.extend_from_slice(&4u16.to_be_bytes());
	kdf(k_asme, &s)
}

/// 33.401 A.7: algorithm key from K_ASME (NAS) or K_eNB (RRC/UP).
pub fn derive_alg_key(parent: &[u8; 32], alg: AlgKey, alg_id: u8) -> [u8; 32] {
	let s = [0x15, alg as u8, 0x00, 0x01, alg_id, 0x00, 0x01];
	kdf(parent, &s)
}

fn count_bearer_dir_prefix(count: u32, bearer: u8, direction: Direction) -> [u8; 8] {
	let mut prefix = [0u8; 8];
	prefix[0..4].copy_from_slice(&count.to_be_bytes());
	prefix[4] = ((bearer & 0x1F) << 3) | ((direction as u8) << 2);
	prefix
}

/// 128-EIA2: AES-CMAC over COUNT || BEARER | DIRECTION || message,
/// truncated to 32 bits.
pub fn eia2(key: &[u8; 16], count: u32, bearer: u8, direction: Direction, msg: &[u8]) -> [u8; 4] {
	let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
	mac.update(&count_bearer_dir_prefix(count, bearer, direction));
	mac.update(msg);
	let tag = mac.finalize().into_bytes();
	let mut out = [0u8; 4];
	out.copy_from_slice(&tag[0..4]);
	out
}

/// 128-EEA2: AES counter mode. Encrypt and decrypt are the same operation.
pub fn eea2(key: &[u8; 16], count: u32, bearer: u8, direction: Direction, data: &mut [u8]) {
	let mut counter_block = [0u8; 16];
	counter_block[0..8].copy_from_slice(&count_bearer_dir_prefix(count, bearer, direction));
	let mut block_idx: u64 = 0;
	for chunk in data.chunks_mut(16) {
		counter_block[8..16].copy_from_slice(&block_idx.to_be_bytes());
		let keystream = aes_block(key, &counter_block);
		for (byte, ks) in chunk.iter_mut().zip(keystream.iter()) {
			*byte ^= ks;
		}
		block_idx += 1;
	}
}

/// Apply the configured EPS encryption algorithm in place.
pub fn apply_eea(alg_id: u8, key: &[u8; 16], count: u32, bearer: u8, direction: Direction, data: &mut [u8]) {
	match alg_id {
		EEA0 => {}
		_ => eea2(key, count, bearer, direction, data),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// 3GPP TS 35.207/35.208 test set 1.
	fn test_set_1() -> ([u8; 16], [u8; 16], [u8; 16]) {
		let k: [u8; 16] = hex::decode("465b5ce8b199b49faa5f0a2ee238a6bc")
			.unwrap()
			.try_into()
			.unwrap();
		let rand: [u8; 16] = hex::decode("23553cbe9637a89d218ae64dae47bf35")
			.unwrap()
			.try_into()
			.unwrap();
		let op: [u8; 16] = hex::decode("cdc202d5123e20f62b6d676ac72cb318")
			.unwrap()
			.try_into()
			.unwrap();
		(k, rand, op)
	}

	#[test]
	fn opc_derivation_matches_reference() {
		let (k, _, op) = test_set_1();
		let opc = compute_opc_with(&k, &op);
		assert_eq!(hex::encode(opc), "cd63cb71954a9f4e48a5994e37a02baf");
	}

	#[test]
	fn milenage_f1_matches_reference() {
		let (k, rand, op) = test_set_1();
		let opc = compute_opc_with(&k, &op);
		let sqn: [u8; 6] = hex::decode("ff9bb4d0b607").unwrap().try_into().unwrap();
		let amf: [u8; 2] = [0xb9, 0xb9];
		assert_eq!(hex::encode(milenage_f1(&k, &opc, &rand, &sqn, &amf)), "4a9ffac354dfafb3");
		assert_eq!(
			hex::encode(milenage_f1_star(&k, &opc, &rand, &sqn, &amf)),
			"01cfaf9ec4e871e9"
		);
	}

	#[test]
	fn milenage_f2345_matches_reference() {
		let (k, rand, op) = test_set_1();
		let opc = compute_opc_with(&k, &op);
		let (res, ck, ik, ak) = milenage_f2345(&k, &opc, &rand);
		assert_eq!(hex::encode(res), "a54211d5e3ba50bf");
		assert_eq!(hex::encode(ck), "b40ba9a3c58b2a05bbf0d987b21bf8cb");
		assert_eq!(hex::encode(ik), "f769bcd751044604127672711c6d3441");
		assert_eq!(hex::encode(ak), "aa689c648370");
		assert_eq!(hex::encode(milenage_f5_star(&k, &opc, &rand)), "451e8beca43b");
	}

	#[test]
	fn eea2_round_trips() {
		let key = [0x42u8; 16];
		let original = b"user plane payload".to_vec();
		let mut data = original.clone();
		eea2(&key, 7, 3, Direction::Downlink, &mut data);
		assert_ne!(data, original);
		eea2(&key, 7, 3, Direction::Downlink, &mut data);
		assert_eq!(data, original);
	}

	#[test]
	fn eia2_binds_count_bearer_direction() {
		let key = [0x17u8; 16];
		let msg = b"integrity protected";
		let base = eia2(&key, 1, 0, Direction::Downlink, msg);
		assert_ne!(base, eia2(&key, 2, 0, Direction::Downlink, msg));
		assert_ne!(base, eia2(&key, 1, 1, Direction::Downlink, msg));
		assert_ne!(base, eia2(&key, 1, 0, Direction::Uplink, msg));
	}

	#[test]
	fn eea0_is_the_null_cipher() {
		let key = [0u8; 16];
		let mut data = b"unchanged".to_vec();
		apply_eea(EEA0, &key, 9, 1, Direction::Uplink, &mut data);
		assert_eq!(data, b"unchanged");
	}

	#[test]
	fn two_digit_mnc_uses_filler() {
		assert_eq!(plmn_id(1, 1), [0x00, 0xf1, 0x10]);
		assert_eq!(plmn_id(310, 410), [0x13, 0x40, 0x01]);
	}
}
