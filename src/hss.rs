// Copyright (c) 2026 The Ferrolte Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Home subscriber server: the subscriber table and EPS-AKA.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::security::{self, AlgKey, AuthVec, AMF};
use crate::user::ue::UserId;

pub const IND_HE_N_BITS: u64 = 5;
pub const IND_HE_MASK: u64 = 0x1F;
pub const SEQ_HE_MAX: u64 = 0x7FFF_FFFF_FFFF;

/// Long-term subscriber data.
#[derive(Clone, Debug)]
struct StoredData {
	k: [u8; 16],
}

/// Material produced by the last vector generation.
#[derive(Clone, Debug, Default)]
struct GeneratedData {
	auth_vec: AuthVec,
	sqn_he: u64,
	seq_he: u64,
	ind_he: u64,
	ck: [u8; 16],
	ik: [u8; 16],
	ak: [u8; 6],
}

#[derive(Clone, Debug)]
struct HssUser {
	id: UserId,
	stored: StoredData,
	generated: GeneratedData,
}

pub struct Hss {
	users: Mutex<Vec<HssUser>>,
	user_file: Mutex<Option<PathBuf>>,
}

impl Hss {
	pub fn new() -> Arc<Hss> {
		Arc::new(Hss {
			users: Mutex::new(Vec::new()),
			user_file: Mutex::new(None),
		})
	}

	pub fn add_user(&self, imsi: u64, imei: u64, k: [u8; 16]) -> Result<()> {
		let mut users = self.users.lock();
		if users.iter().any(|user| user.id.imsi == imsi) {
			return Err(Error::InvalidParam);
		}
		users.push(HssUser {
			id: UserId { imsi, imei },
			stored: StoredData { k },
			generated: GeneratedData::default(),
		});
		drop(users);
		self.write_user_file();
		Ok(())
	}

	pub fn del_user(&self, imsi: u64) -> Result<()> {
		let mut users = self.users.lock();
		let before = users.len();
		users.retain(|user| user.id.imsi != imsi);
		let removed = users.len() != before;
		drop(users);
		if removed {
			self.write_user_file();
			Ok(())
		} else {
			Err(Error::InvalidParam)
		}
	}

	pub fn is_imsi_allowed(&self, imsi: u64) -> bool {
		self.users.lock().iter().any(|user| user.id.imsi == imsi)
	}

	pub fn is_imei_allowed(&self, imei: u64) -> bool {
		self.users.lock().iter().any(|user| user.id.imei == imei)
	}

	pub fn user_id_from_imsi(&self, imsi: u64) -> Option<UserId> {
		self.users
			.lock()
			.iter()
			.find(|user| user.id.imsi == imsi)
			.map(|user| user.id)
	}

	pub fn user_id_from_imei(&self, imei: u64) -> Option<UserId> {
		self.users
			.lock()
			.iter()
			.find(|user| user.id.imei == imei)
			.map(|user| user.id)
	}

	/// Run one AKA round: fresh RAND, next SQN, Milenage, and the full key
	/// hierarchy down to the RRC/UP keys. The vector is bound to the user
	/// until the next round.
	pub fn generate_security_data(&self, id: &UserId, mcc: u16, mnc: u16) {
		let mut users = self.users.lock();
		let Some(user) = users.iter_mut().find(|user| user.id.imsi == id.imsi) else {
			warn!(target: "user", "vector requested for unknown IMSI={:015}", id.imsi);
			return;
		};

		let mut rand_bytes = [0u8; 16];
		rand::rngs::OsRng.fill_bytes(&mut rand_bytes);

		// SQN = SEQ || IND, 48 bits total.
		user.generated.seq_he = (user.generated.seq_he + 1) & (SEQ_HE_MAX >> IND_HE_N_BITS);
		user.generated.ind_he = (user.generated.ind_he + 1) & IND_HE_MASK;
		user.generated.sqn_he =
			(user.generated.seq_he << IND_HE_N_BITS) | user.generated.ind_he;

		Hss::derive_vector(user, rand_bytes, mcc, mnc);
	}

	/// Resynchronise from an AUTS: recover SQN_MS, restart above it, then
	/// regenerate with the same key hierarchy.
	pub fn security_resynch(&self, id: &UserId, mcc: u16, mnc: u16, auts: &[u8; 14]) {
		let mut users = self.users.lock();
		let Some(user) = users.iter_mut().find(|user| user.id.imsi == id.imsi) else {
			warn!(target: "user", "resynch for unknown IMSI={:015}", id.imsi);
			return;
		};

		let k = user.stored.k;
		let opc = security::compute_opc(&k);
		let ak_star = security::milenage_f5_star(&k, &opc, &user.generated.auth_vec.rand);
		let mut sqn_ms = 0u64;
		for i in 0..6 {
			sqn_ms = (sqn_ms << 8) | u64::from(auts[i] ^ ak_star[i]);
		}
		user.generated.sqn_he = (sqn_ms + 1) & ((1 << 48) - 1);
		user.generated.seq_he = user.generated.sqn_he >> IND_HE_N_BITS;
		user.generated.ind_he = user.generated.sqn_he & IND_HE_MASK;
		info!(target: "user", "resynch IMSI={:015} SQN={:012x}", id.imsi, user.generated.sqn_he);

		let mut rand_bytes = [0u8; 16];
		rand::rngs::OsRng.fill_bytes(&mut rand_bytes);
		Hss::derive_vector(user, rand_bytes, mcc, mnc);
	}

	/// Re-derive the K_eNB-rooted keys for a resume with a known NAS
	/// count, leaving the AKA material untouched.
	pub fn regenerate_enb_security_data(&self, id: &UserId, nas_count_ul: u32) -> Option<AuthVec> {
		let mut users = self.users.lock();
		let user = users.iter_mut().find(|user| user.id.imsi == id.imsi)?;
		if user.generated.auth_vec == AuthVec::default() {
			return None;
		}
		let auth_vec = &mut user.generated.auth_vec;
		auth_vec.nas_count_ul = nas_count_ul;
		auth_vec.k_enb = security::derive_k_enb(&auth_vec.k_asme, nas_count_ul);
		auth_vec.k_rrc_int =
			security::derive_alg_key(&auth_vec.k_enb, AlgKey::RrcInt, security::EIA2);
		auth_vec.k_rrc_enc =
			security::derive_alg_key(&auth_vec.k_enb, AlgKey::RrcEnc, security::EEA0);
		auth_vec.k_up_enc = security::derive_alg_key(&auth_vec.k_enb, AlgKey::UpEnc, security::EEA0);
		auth_vec.k_up_int = security::derive_alg_key(&auth_vec.k_enb, AlgKey::UpInt, security::EIA2);
		Some(auth_vec.clone())
	}

	pub fn auth_vec(&self, id: &UserId) -> Option<AuthVec> {
		let users = self.users.lock();
		let user = users.iter().find(|user| user.id.imsi == id.imsi)?;
		if user.generated.auth_vec == AuthVec::default() {
			None
		} else {
			Some(user.generated.auth_vec.clone())
		}
	}

	fn derive_vector(user: &mut HssUser, rand_bytes: [u8; 16], mcc: u16, mnc: u16) {
		let k = user.stored.k;
		let opc = security::compute_opc(&k);
		let mut sqn = [0u8; 6];
		for (i, byte) in sqn.iter_mut().enumerate() {
			*byte = (user.generated.sqn_he >> (40 - i * 8)) as u8;
		}

		let mac_a = security::milenage_f1(&k, &opc, &rand_bytes, &sqn, &AMF);
		let (res, ck, ik, ak) = security::milenage_f2345(&k, &opc, &rand_bytes);

		let mut sqn_xor_ak = [0u8; 6];
		for i in 0..6 {
			sqn_xor_ak[i] = sqn[i] ^ ak[i];
		}
		let mut autn = [0u8; 16];
		autn[0..6].copy_from_slice(&sqn_xor_ak);
		autn[6..8].copy_from_slice(&AMF);
		autn[8..16].copy_from_slice(&mac_a);

		let k_asme = security::derive_k_asme(&ck, &ik, mcc, mnc, &sqn_xor_ak);
		let k_enb = security::derive_k_enb(&k_asme, 0);

		let auth_vec = AuthVec {
			rand: rand_bytes,
			autn,
			res,
			k_asme,
			k_enb,
			k_nas_int: security::derive_alg_key(&k_asme, AlgKey::NasInt, security::EIA2),
			k_nas_enc: security::derive_alg_key(&k_asme, AlgKey::NasEnc, security::EEA0),
			k_rrc_int: security::derive_alg_key(&k_enb, AlgKey::RrcInt, security::EIA2),
			k_rrc_enc: security::derive_alg_key(&k_enb, AlgKey::RrcEnc, security::EEA0),
			k_up_int: security::derive_alg_key(&k_enb, AlgKey::UpInt, security::EIA2),
			k_up_enc: security::derive_alg_key(&k_enb, AlgKey::UpEnc, security::EEA0),
			nas_count_ul: 0,
			nas_count_dl: 0,
		};
		user.generated.ck = ck;
		user.generated.ik = ik;
		user.generated.ak = ak;
		user.generated.auth_vec = auth_vec;
	}

	// ---- user file ----

	pub fn set_user_file(&self, path: Option<PathBuf>) {
		*self.user_file.lock() = path;
	}

	/// Replay `imsi imei k` lines through the normal add path.
	pub fn read_user_file(&self) {
		let Some(path) = self.user_file.lock().clone() else {
			return;
		};
		let Ok(file) = std::fs::File::open(&path) else {
			return;
		};
		for line in std::io::BufReader::new(file).lines().map_while(|l| l.ok()) {
			let fields: Vec<&str> = line.split_whitespace().collect();
			if fields.len() != 3 {
				continue;
			}
			let (Ok(imsi), Ok(imei)) = (fields[0].parse(), fields[1].parse()) else {
				continue;
			};
			let Some(k) = parse_hex_key(fields[2]) else {
				continue;
			};
			let mut users = self.users.lock();
			if !users.iter().any(|user| user.id.imsi == imsi) {
				users.push(HssUser {
					id: UserId { imsi, imei },
					stored: StoredData { k },
					generated: GeneratedData::default(),
				});
			}
		}
		info!(target: "user", "loaded {} subscribers from {}", self.users.lock().len(), path.display());
	}

	fn write_user_file(&self) {
		let Some(path) = self.user_file.lock().clone() else {
			return;
		};
		let users = self.users.lock();
		let mut out = String::new();
		for user in users.iter() {
			out.push_str(&format!(
				"{:015} {:015} {}\n",
				user.id.imsi,
				user.id.imei,
				hex_key(&user.stored.k)
			));
		}
		drop(users);
		if let Ok(mut file) = std::fs::File::create(&path) {
			let _ = file.write_all(out.as_bytes());
		}
	}

	pub fn print_all_users(&self) -> String {
		let users = self.users.lock();
		let mut out = String::new();
		for user in users.iter() {
			out.push_str(&format!("imsi={:015} imei={:015}\n", user.id.imsi, user.id.imei));
		}
		out
	}
}

fn parse_hex_key(s: &str) -> Option<[u8; 16]> {
	if s.len() != 32 {
		return None;
	}
	let mut k = [0u8; 16];
	for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
		let hi = (chunk[0] as char).to_digit(16)?;
		let lo = (chunk[1] as char).to_digit(16)?;
		k[i] = ((hi << 4) | lo) as u8;
	}
	Some(k)
}

fn hex_key(k: &[u8; 16]) -> String {
	use core::fmt::Write as _;

	let mut out = String::with_capacity(32);
	for byte in k {
		let _ = write!(out, "{byte:02x}");
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::security::Direction;

	const IMSI: u64 = 1_010_000_000_001;
	const IMEI: u64 = 355_402_090_000_001;

	fn hss_with_user() -> Arc<Hss> {
		let hss = Hss::new();
		hss.add_user(IMSI, IMEI, [0x11; 16]).unwrap();
		hss
	}

	#[test]
	fn admission_gates() {
		let hss = hss_with_user();
		assert!(hss.is_imsi_allowed(IMSI));
		assert!(!hss.is_imsi_allowed(IMSI + 1));
		assert!(hss.is_imei_allowed(IMEI));
		assert!(hss.user_id_from_imsi(IMSI).is_some());
	}

	#[test]
	fn vector_generation_populates_all_keys() {
		let hss = hss_with_user();
		let id = hss.user_id_from_imsi(IMSI).unwrap();
		assert!(hss.auth_vec(&id).is_none());
		hss.generate_security_data(&id, 1, 1);
		let auth_vec = hss.auth_vec(&id).unwrap();
		assert_ne!(auth_vec.rand, [0u8; 16]);
		assert_ne!(auth_vec.k_asme, [0u8; 32]);
		assert_ne!(auth_vec.k_nas_int, auth_vec.k_rrc_int);
	}

	#[test]
	fn fresh_vector_changes_rand_and_sqn() {
		let hss = hss_with_user();
		let id = hss.user_id_from_imsi(IMSI).unwrap();
		hss.generate_security_data(&id, 1, 1);
		let first = hss.auth_vec(&id).unwrap();
		hss.generate_security_data(&id, 1, 1);
		let second = hss.auth_vec(&id).unwrap();
		assert_ne!(first.rand, second.rand);
		assert_ne!(first.autn, second.autn);
	}

	#[test]
	fn resynch_restarts_above_the_ue_sqn() {
		let hss = hss_with_user();
		let id = hss.user_id_from_imsi(IMSI).unwrap();
		hss.generate_security_data(&id, 1, 1);
		let auth_vec = hss.auth_vec(&id).unwrap();

		// Build an AUTS claiming SQN_MS = 0x000000001200 from the UE side.
		let k = [0x11u8; 16];
		let opc = security::compute_opc(&k);
		let ak_star = security::milenage_f5_star(&k, &opc, &auth_vec.rand);
		let sqn_ms: u64 = 0x1200;
		let mut auts = [0u8; 14];
		for i in 0..6 {
			auts[i] = ((sqn_ms >> (40 - i * 8)) as u8) ^ ak_star[i];
		}
		hss.security_resynch(&id, 1, 1, &auts);

		let users = hss.users.lock();
		assert_eq!(users[0].generated.sqn_he, sqn_ms + 1);
	}

	#[test]
	fn regenerate_rederives_the_rrc_keys() {
		let hss = hss_with_user();
		let id = hss.user_id_from_imsi(IMSI).unwrap();
		hss.generate_security_data(&id, 1, 1);
		let before = hss.auth_vec(&id).unwrap();
		let after = hss.regenerate_enb_security_data(&id, 7).unwrap();
		assert_eq!(before.k_asme, after.k_asme);
		assert_ne!(before.k_enb, after.k_enb);
		assert_ne!(before.k_rrc_int, after.k_rrc_int);
		assert_eq!(after.nas_count_ul, 7);
	}

	#[test]
	fn generated_vector_verifies_like_a_ue() {
		let hss = hss_with_user();
		let id = hss.user_id_from_imsi(IMSI).unwrap();
		hss.generate_security_data(&id, 1, 1);
		let auth_vec = hss.auth_vec(&id).unwrap();

		// UE side: recompute RES and the AUTN MAC from K and RAND.
		let k = [0x11u8; 16];
		let opc = security::compute_opc(&k);
		let (res, _ck, _ik, ak) = security::milenage_f2345(&k, &opc, &auth_vec.rand);
		assert_eq!(res, auth_vec.res);
		let mut sqn = [0u8; 6];
		for i in 0..6 {
			sqn[i] = auth_vec.autn[i] ^ ak[i];
		}
		let mac_a = security::milenage_f1(&k, &opc, &auth_vec.rand, &sqn, &AMF);
		assert_eq!(&auth_vec.autn[8..16], &mac_a);

		// And the integrity key must work for NAS protection.
		let mac = security::eia2(
			&security::key128(&auth_vec.k_nas_int),
			0,
			0,
			Direction::Downlink,
			b"probe",
		);
		assert_ne!(mac, [0u8; 4]);
	}

	#[test]
	fn user_file_round_trip() {
		let dir = std::env::temp_dir().join("ferrolte-hss-test");
		let _ = std::fs::create_dir_all(&dir);
		let path = dir.join("user_db.txt");
		let _ = std::fs::remove_file(&path);

		let hss = Hss::new();
		hss.set_user_file(Some(path.clone()));
		hss.add_user(IMSI, IMEI, [0xab; 16]).unwrap();

		let reloaded = Hss::new();
		reloaded.set_user_file(Some(path.clone()));
		reloaded.read_user_file();
		assert!(reloaded.is_imsi_allowed(IMSI));
		let _ = std::fs::remove_file(&path);
	}
}
