//! EMM and ESM message bodies.
//!
//! Octet-aligned 24.301-style encodings for the procedures this MME runs.
//! Identities are carried as 15-digit numerics; the BCD helpers put them
//! on the wire.

use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};
use crate::nas::{PD_EMM, PD_ESM, SEC_HDR_PLAIN, SEC_HDR_SERVICE_REQUEST};

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum EmmMsgType {
	AttachRequest = 0x41,
	AttachAccept = 0x42,
	AttachComplete = 0x43,
	AttachReject = 0x44,
	DetachRequest = 0x45,
	DetachAccept = 0x46,
	ServiceReject = 0x4E,
	AuthenticationRequest = 0x52,
	AuthenticationResponse = 0x53,
	AuthenticationReject = 0x54,
	IdentityRequest = 0x55,
	IdentityResponse = 0x56,
	AuthenticationFailure = 0x5C,
	SecurityModeCommand = 0x5D,
	SecurityModeComplete = 0x5E,
	SecurityModeReject = 0x5F,
	EmmStatus = 0x60,
	EmmInformation = 0x61,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum EsmMsgType {
	ActivateDefaultEpsBearerContextRequest = 0xC1,
	ActivateDefaultEpsBearerContextAccept = 0xC2,
	ActivateDedicatedEpsBearerContextRequest = 0xC5,
	ActivateDedicatedEpsBearerContextAccept = 0xC6,
	PdnConnectivityRequest = 0xD0,
	EsmInformationRequest = 0xD9,
	EsmInformationResponse = 0xDA,
}

// EMM cause values (24.301 annex A).
pub const EMM_CAUSE_IMSI_UNKNOWN_IN_HSS: u8 = 0x02;
pub const EMM_CAUSE_EPS_SERVICES_NOT_ALLOWED: u8 = 0x07;
pub const EMM_CAUSE_IMPLICITLY_DETACHED: u8 = 0x0A;
pub const EMM_CAUSE_SYNCH_FAILURE: u8 = 0x15;
pub const EMM_CAUSE_UE_SECURITY_CAPABILITIES_MISMATCH: u8 = 0x17;

pub const ID_TYPE_IMSI: u8 = 1;
pub const ID_TYPE_IMEI: u8 = 3;
pub const ID_TYPE_IMEISV: u8 = 5;
pub const ID_TYPE_GUTI: u8 = 6;

pub const PDN_TYPE_IPV4: u8 = 1;

// Optional IE tags.
const IEI_GUTI: u8 = 0x50;
const IEI_AUTS: u8 = 0x30;
const IEI_IMEISV: u8 = 0x23;
const IEI_PCO: u8 = 0x27;
const IEI_ESM_CAUSE: u8 = 0x58;
const IEI_NET_NAME_FULL: u8 = 0x43;
const IEI_NET_NAME_SHORT: u8 = 0x45;
const IEI_UTC_TIME: u8 = 0x47;

pub const ESM_CAUSE_PDN_TYPE_IPV4_ONLY_ALLOWED: u8 = 0x32;

// Protocol configuration option ids.
pub const PCO_ID_IPCP: u16 = 0x8021;
pub const PCO_ID_DNS_SERVER_IPV4_REQUEST: u16 = 0x000D;
pub const PCO_ID_DNS_SERVER_IPV4: u16 = 0x000D;
pub const PCO_ID_IP_ADDR_VIA_NAS: u16 = 0x000A;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Guti {
	pub mcc: u16,
	pub mnc: u16,
	pub mnc_two_digits: bool,
	pub mme_group_id: u16,
	pub mme_code: u8,
	pub m_tmsi: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MobileId {
	Guti(Guti),
	/// 15-digit IMSI as a number.
	Imsi(u64),
	/// 15-digit IMEI as a number.
	Imei(u64),
}

fn push_plmn(out: &mut Vec<u8>, mcc: u16, mnc: u16, mnc_two_digits: bool) {
	let mcc_d = [(mcc / 100 % 10) as u8, (mcc / 10 % 10) as u8, (mcc % 10) as u8];
	let mnc_d = if mnc_two_digits {
		[0xF, (mnc / 10 % 10) as u8, (mnc % 10) as u8]
	} else {
		[(mnc / 100 % 10) as u8, (mnc / 10 % 10) as u8, (mnc % 10) as u8]
	};
	out.push((mcc_d[1] << 4) | mcc_d[0]);
	out.push((mnc_d[0] << 4) | mcc_d[2]);
	out.push((mnc_d[2] << 4) | mnc_d[1]);
}

fn read_plmn(data: &[u8]) -> Result<(u16, u16, bool)> {
	if data.len() < 3 {
		return Err(Error::InvalidParam);
	}
	let mcc = u16::from(data[0] & 0xF) * 100 + u16::from(data[0] >> 4) * 10 + u16::from(data[1] & 0xF);
	let mnc_hi = data[1] >> 4;
	let two_digits = mnc_hi == 0xF;
	let mnc = if two_digits {
		u16::from(data[2] & 0xF) * 10 + u16::from(data[2] >> 4)
	} else {
		u16::from(mnc_hi) * 100 + u16::from(data[2] & 0xF) * 10 + u16::from(data[2] >> 4)
	};
	Ok((mcc, mnc, two_digits))
}

fn digits_of(id: u64) -> [u8; 15] {
	let mut digits = [0u8; 15];
	let mut rest = id;
	for slot in digits.iter_mut().rev() {
		*slot = (rest % 10) as u8;
		rest /= 10;
	}
	digits
}

fn number_of(digits: &[u8]) -> u64 {
	digits.iter().fold(0u64, |acc, d| acc * 10 + u64::from(*d))
}

/// Mobile identity IE contents (without the length octet).
fn push_mobile_id(out: &mut Vec<u8>, id: &MobileId) {
	match id {
		MobileId::Guti(guti) => {
			out.push(0xF0 | ID_TYPE_GUTI);
			push_plmn(out, guti.mcc, guti.mnc, guti.mnc_two_digits);
			out.extend_from_slice(&guti.mme_group_id.to_be_bytes());
			out.push(guti.mme_code);
			out.extend_from_slice(&guti.m_tmsi.to_be_bytes());
		}
		MobileId::Imsi(imsi) => push_bcd_id(out, ID_TYPE_IMSI, &digits_of(*imsi)),
		MobileId::Imei(imei) => push_bcd_id(out, ID_TYPE_IMEI, &digits_of(*imei)),
	}
}

fn push_bcd_id(out: &mut Vec<u8>, id_type: u8, digits: &[u8]) {
	// 15 digits: odd count, filler in the last high nibble.
	out.push((digits[0] << 4) | 0x08 | id_type);
	for pair in digits[1..].chunks(2) {
		if pair.len() == 2 {
			out.push((pair[1] << 4) | pair[0]);
		} else {
			out.push(0xF0 | pair[0]);
		}
	}
}

fn read_mobile_id(data: &[u8]) -> Result<MobileId> {
	if data.is_empty() {
		return Err(Error::InvalidParam);
	}
	let id_type = data[0] & 0x7;
	match id_type {
		ID_TYPE_GUTI => {
			if data.len() < 11 {
				return Err(Error::InvalidParam);
			}
			let (mcc, mnc, mnc_two_digits) = read_plmn(&data[1..4])?;
			Ok(MobileId::Guti(Guti {
				mcc,
				mnc,
				mnc_two_digits,
				mme_group_id: u16::from_be_bytes([data[4], data[5]]),
				mme_code: data[6],
				m_tmsi: u32::from_be_bytes([data[7], data[8], data[9], data[10]]),
			}))
		}
		ID_TYPE_IMSI | ID_TYPE_IMEI => {
			let mut digits = Vec::with_capacity(15);
			digits.push(data[0] >> 4);
			for byte in &data[1..] {
				digits.push(byte & 0xF);
				if byte >> 4 != 0xF {
					digits.push(byte >> 4);
				}
			}
			let id = number_of(&digits);
			if id_type == ID_TYPE_IMSI {
				Ok(MobileId::Imsi(id))
			} else {
				Ok(MobileId::Imei(id))
			}
		}
		_ => Err(Error::InvalidParam),
	}
}

/// UE network capability: per-algorithm support flags, bit 7 = index 0.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UeNetworkCap {
	pub eea: u8,
	pub eia: u8,
	pub uea: Option<u8>,
	pub uia: Option<u8>,
	pub gea: Option<u8>,
}

impl UeNetworkCap {
	pub fn supports_eea(&self, idx: u8) -> bool {
		self.eea & (0x80 >> idx) != 0
	}

	pub fn supports_eia(&self, idx: u8) -> bool {
		self.eia & (0x80 >> idx) != 0
	}
}

fn push_ue_network_cap(out: &mut Vec<u8>, cap: &UeNetworkCap) {
	let mut body = vec![cap.eea, cap.eia];
	if let Some(uea) = cap.uea {
		body.push(uea);
		body.push(cap.uia.unwrap_or(0));
		if let Some(gea) = cap.gea {
			body.push(gea);
		}
	}
	out.push(body.len() as u8);
	out.extend_from_slice(&body);
}

fn read_ue_network_cap(data: &[u8]) -> Result<(UeNetworkCap, usize)> {
	if data.is_empty() {
		return Err(Error::InvalidParam);
	}
	let len = data[0] as usize;
	if data.len() < 1 + len || len < 2 {
		return Err(Error::InvalidParam);
	}
	let body = &data[1..1 + len];
	Ok((
		UeNetworkCap {
			eea: body[0],
			eia: body[1],
			uea: body.get(2).copied(),
			uia: body.get(3).copied(),
			gea: body.get(4).copied(),
		},
		1 + len,
	))
}

/// Protocol configuration options container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pco {
	pub opts: Vec<(u16, Vec<u8>)>,
}

fn push_pco(out: &mut Vec<u8>, pco: &Pco) {
	let mut body = vec![0x80]; // ext bit + configuration protocol PPP
	for (id, contents) in &pco.opts {
		body.extend_from_slice(&id.to_be_bytes());
		body.push(contents.len() as u8);
		body.extend_from_slice(contents);
	}
	out.push(body.len() as u8);
	out.extend_from_slice(&body);
}

fn read_pco(data: &[u8]) -> Result<(Pco, usize)> {
	if data.is_empty() {
		return Err(Error::InvalidParam);
	}
	let len = data[0] as usize;
	if data.len() < 1 + len || len < 1 {
		return Err(Error::InvalidParam);
	}
	let mut pco = Pco::default();
	let mut body = &data[2..1 + len];
	while body.len() >= 3 {
		let id = u16::from_be_bytes([body[0], body[1]]);
		let opt_len = body[2] as usize;
		if body.len() < 3 + opt_len {
			return Err(Error::InvalidParam);
		}
		pco.opts.push((id, body[3..3 + opt_len].to_vec()));
		body = &body[3 + opt_len..];
	}
	Ok((pco, 1 + len))
}

fn emm_header(msg_type: EmmMsgType) -> Vec<u8> {
	vec![(SEC_HDR_PLAIN << 4) | PD_EMM, msg_type as u8]
}

fn esm_header(eps_bearer_id: u8, proc_transaction_id: u8, msg_type: EsmMsgType) -> Vec<u8> {
	vec![(eps_bearer_id << 4) | PD_ESM, proc_transaction_id, msg_type as u8]
}

fn check_emm_header(data: &[u8], msg_type: EmmMsgType) -> Result<&[u8]> {
	if data.len() < 2 || data[0] & 0xF != PD_EMM || data[1] != msg_type as u8 {
		return Err(Error::InvalidParam);
	}
	Ok(&data[2..])
}

fn check_esm_header(data: &[u8], msg_type: EsmMsgType) -> Result<(u8, u8, &[u8])> {
	if data.len() < 3 || data[0] & 0xF != PD_ESM || data[2] != msg_type as u8 {
		return Err(Error::InvalidParam);
	}
	Ok((data[0] >> 4, data[1], &data[3..]))
}

fn push_lv(out: &mut Vec<u8>, value: &[u8]) {
	out.push(value.len() as u8);
	out.extend_from_slice(value);
}

fn read_lv(data: &[u8]) -> Result<(&[u8], usize)> {
	if data.is_empty() {
		return Err(Error::InvalidParam);
	}
	let len = data[0] as usize;
	if data.len() < 1 + len {
		return Err(Error::InvalidParam);
	}
	Ok((&data[1..1 + len], 1 + len))
}

fn push_lv16(out: &mut Vec<u8>, value: &[u8]) {
	out.extend_from_slice(&(value.len() as u16).to_be_bytes());
	out.extend_from_slice(value);
}

fn read_lv16(data: &[u8]) -> Result<(&[u8], usize)> {
	if data.len() < 2 {
		return Err(Error::InvalidParam);
	}
	let len = u16::from_be_bytes([data[0], data[1]]) as usize;
	if data.len() < 2 + len {
		return Err(Error::InvalidParam);
	}
	Ok((&data[2..2 + len], 2 + len))
}

// ------------------------------------------------------------------
// EMM messages
// ------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachRequest {
	pub eps_attach_type: u8,
	pub nas_ksi: u8,
	pub eps_mobile_id: MobileId,
	pub ue_network_cap: UeNetworkCap,
	pub esm_msg: Vec<u8>,
}

pub fn pack_attach_request(msg: &AttachRequest) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::AttachRequest);
	out.push((msg.nas_ksi << 4) | msg.eps_attach_type);
	let mut id = Vec::new();
	push_mobile_id(&mut id, &msg.eps_mobile_id);
	push_lv(&mut out, &id);
	push_ue_network_cap(&mut out, &msg.ue_network_cap);
	push_lv16(&mut out, &msg.esm_msg);
	out
}

pub fn unpack_attach_request(data: &[u8]) -> Result<AttachRequest> {
	let rest = check_emm_header(data, EmmMsgType::AttachRequest)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	let eps_attach_type = rest[0] & 0xF;
	let nas_ksi = rest[0] >> 4;
	let rest = &rest[1..];
	let (id, used) = read_lv(rest)?;
	let eps_mobile_id = read_mobile_id(id)?;
	let rest = &rest[used..];
	let (ue_network_cap, used) = read_ue_network_cap(rest)?;
	let rest = &rest[used..];
	let (esm, _) = read_lv16(rest)?;
	Ok(AttachRequest {
		eps_attach_type,
		nas_ksi,
		eps_mobile_id,
		ue_network_cap,
		esm_msg: esm.to_vec(),
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachAccept {
	pub eps_attach_result: u8,
	/// GPRS timer octet; zero means deactivated.
	pub t3412: u8,
	pub tai_mcc: u16,
	pub tai_mnc: u16,
	pub tai_mnc_two_digits: bool,
	pub tac: u16,
	pub guti: Option<Guti>,
	pub esm_msg: Vec<u8>,
}

pub fn pack_attach_accept(msg: &AttachAccept) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::AttachAccept);
	out.push(msg.eps_attach_result);
	out.push(msg.t3412);
	let mut tai = Vec::new();
	tai.push(0x00); // one TAI, non-consecutive list
	push_plmn(&mut tai, msg.tai_mcc, msg.tai_mnc, msg.tai_mnc_two_digits);
	tai.extend_from_slice(&msg.tac.to_be_bytes());
	push_lv(&mut out, &tai);
	push_lv16(&mut out, &msg.esm_msg);
	if let Some(guti) = &msg.guti {
		out.push(IEI_GUTI);
		let mut id = Vec::new();
		push_mobile_id(&mut id, &MobileId::Guti(*guti));
		push_lv(&mut out, &id);
	}
	out
}

pub fn unpack_attach_accept(data: &[u8]) -> Result<AttachAccept> {
	let rest = check_emm_header(data, EmmMsgType::AttachAccept)?;
	if rest.len() < 2 {
		return Err(Error::InvalidParam);
	}
	let eps_attach_result = rest[0];
	let t3412 = rest[1];
	let rest = &rest[2..];
	let (tai, used) = read_lv(rest)?;
	if tai.len() < 6 {
		return Err(Error::InvalidParam);
	}
	let (tai_mcc, tai_mnc, tai_mnc_two_digits) = read_plmn(&tai[1..4])?;
	let tac = u16::from_be_bytes([tai[4], tai[5]]);
	let rest = &rest[used..];
	let (esm, used) = read_lv16(rest)?;
	let mut rest = &rest[used..];
	let mut guti = None;
	while !rest.is_empty() {
		match rest[0] {
			IEI_GUTI => {
				let (id, used) = read_lv(&rest[1..])?;
				if let MobileId::Guti(parsed) = read_mobile_id(id)? {
					guti = Some(parsed);
				}
				rest = &rest[1 + used..];
			}
			_ => return Err(Error::InvalidParam),
		}
	}
	Ok(AttachAccept {
		eps_attach_result,
		t3412,
		tai_mcc,
		tai_mnc,
		tai_mnc_two_digits,
		tac,
		guti,
		esm_msg: esm.to_vec(),
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachComplete {
	pub esm_msg: Vec<u8>,
}

pub fn pack_attach_complete(msg: &AttachComplete) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::AttachComplete);
	push_lv16(&mut out, &msg.esm_msg);
	out
}

pub fn unpack_attach_complete(data: &[u8]) -> Result<AttachComplete> {
	let rest = check_emm_header(data, EmmMsgType::AttachComplete)?;
	let (esm, _) = read_lv16(rest)?;
	Ok(AttachComplete { esm_msg: esm.to_vec() })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachReject {
	pub emm_cause: u8,
}

pub fn pack_attach_reject(msg: &AttachReject) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::AttachReject);
	out.push(msg.emm_cause);
	out
}

pub fn unpack_attach_reject(data: &[u8]) -> Result<AttachReject> {
	let rest = check_emm_header(data, EmmMsgType::AttachReject)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	Ok(AttachReject { emm_cause: rest[0] })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationRequest {
	pub nas_ksi: u8,
	pub rand: [u8; 16],
	pub autn: [u8; 16],
}

pub fn pack_authentication_request(msg: &AuthenticationRequest) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::AuthenticationRequest);
	out.push(msg.nas_ksi & 0x7);
	out.extend_from_slice(&msg.rand);
	push_lv(&mut out, &msg.autn);
	out
}

pub fn unpack_authentication_request(data: &[u8]) -> Result<AuthenticationRequest> {
	let rest = check_emm_header(data, EmmMsgType::AuthenticationRequest)?;
	if rest.len() < 17 {
		return Err(Error::InvalidParam);
	}
	let nas_ksi = rest[0] & 0x7;
	let mut rand = [0u8; 16];
	rand.copy_from_slice(&rest[1..17]);
	let (autn_bytes, _) = read_lv(&rest[17..])?;
	if autn_bytes.len() != 16 {
		return Err(Error::InvalidParam);
	}
	let mut autn = [0u8; 16];
	autn.copy_from_slice(autn_bytes);
	Ok(AuthenticationRequest { nas_ksi, rand, autn })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationResponse {
	pub res: [u8; 8],
}

pub fn pack_authentication_response(msg: &AuthenticationResponse) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::AuthenticationResponse);
	push_lv(&mut out, &msg.res);
	out
}

pub fn unpack_authentication_response(data: &[u8]) -> Result<AuthenticationResponse> {
	let rest = check_emm_header(data, EmmMsgType::AuthenticationResponse)?;
	let (res_bytes, _) = read_lv(rest)?;
	if res_bytes.len() != 8 {
		return Err(Error::InvalidParam);
	}
	let mut res = [0u8; 8];
	res.copy_from_slice(res_bytes);
	Ok(AuthenticationResponse { res })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationFailure {
	pub emm_cause: u8,
	pub auth_fail_param: Option<[u8; 14]>,
}

pub fn pack_authentication_failure(msg: &AuthenticationFailure) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::AuthenticationFailure);
	out.push(msg.emm_cause);
	if let Some(auts) = &msg.auth_fail_param {
		out.push(IEI_AUTS);
		push_lv(&mut out, auts);
	}
	out
}

pub fn unpack_authentication_failure(data: &[u8]) -> Result<AuthenticationFailure> {
	let rest = check_emm_header(data, EmmMsgType::AuthenticationFailure)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	let emm_cause = rest[0];
	let mut auth_fail_param = None;
	let rest = &rest[1..];
	if !rest.is_empty() && rest[0] == IEI_AUTS {
		let (auts, _) = read_lv(&rest[1..])?;
		if auts.len() != 14 {
			return Err(Error::InvalidParam);
		}
		let mut buf = [0u8; 14];
		buf.copy_from_slice(auts);
		auth_fail_param = Some(buf);
	}
	Ok(AuthenticationFailure {
		emm_cause,
		auth_fail_param,
	})
}

pub fn pack_authentication_reject() -> Vec<u8> {
	emm_header(EmmMsgType::AuthenticationReject)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityRequest {
	pub id_type: u8,
}

pub fn pack_identity_request(msg: &IdentityRequest) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::IdentityRequest);
	out.push(msg.id_type);
	out
}

pub fn unpack_identity_request(data: &[u8]) -> Result<IdentityRequest> {
	let rest = check_emm_header(data, EmmMsgType::IdentityRequest)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	Ok(IdentityRequest { id_type: rest[0] & 0x7 })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityResponse {
	pub mobile_id: MobileId,
}

pub fn pack_identity_response(msg: &IdentityResponse) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::IdentityResponse);
	let mut id = Vec::new();
	push_mobile_id(&mut id, &msg.mobile_id);
	push_lv(&mut out, &id);
	out
}

pub fn unpack_identity_response(data: &[u8]) -> Result<IdentityResponse> {
	let rest = check_emm_header(data, EmmMsgType::IdentityResponse)?;
	let (id, _) = read_lv(rest)?;
	Ok(IdentityResponse {
		mobile_id: read_mobile_id(id)?,
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityModeCommand {
	pub selected_eea: u8,
	pub selected_eia: u8,
	pub nas_ksi: u8,
	pub replayed_ue_security_cap: UeNetworkCap,
	pub imeisv_request: bool,
}

pub fn pack_security_mode_command(msg: &SecurityModeCommand) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::SecurityModeCommand);
	out.push((msg.selected_eea << 4) | (msg.selected_eia & 0xF));
	out.push(msg.nas_ksi & 0x7);
	push_ue_network_cap(&mut out, &msg.replayed_ue_security_cap);
	out.push(0xC0 | u8::from(msg.imeisv_request));
	out
}

pub fn unpack_security_mode_command(data: &[u8]) -> Result<SecurityModeCommand> {
	let rest = check_emm_header(data, EmmMsgType::SecurityModeCommand)?;
	if rest.len() < 2 {
		return Err(Error::InvalidParam);
	}
	let selected_eea = rest[0] >> 4;
	let selected_eia = rest[0] & 0xF;
	let nas_ksi = rest[1] & 0x7;
	let (replayed_ue_security_cap, used) = read_ue_network_cap(&rest[2..])?;
	let rest = &rest[2 + used..];
	let imeisv_request = !rest.is_empty() && rest[0] & 0x1 != 0;
	Ok(SecurityModeCommand {
		selected_eea,
		selected_eia,
		nas_ksi,
		replayed_ue_security_cap,
		imeisv_request,
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityModeComplete {
	/// 16-digit IMEISV when the UE reports it.
	pub imeisv: Option<u64>,
}

pub fn pack_security_mode_complete(msg: &SecurityModeComplete) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::SecurityModeComplete);
	if let Some(imeisv) = msg.imeisv {
		out.push(IEI_IMEISV);
		let mut digits = [0u8; 16];
		let mut rest = imeisv;
		for slot in digits.iter_mut().rev() {
			*slot = (rest % 10) as u8;
			rest /= 10;
		}
		let mut id = Vec::new();
		// even digit count, no filler
		id.push((digits[0] << 4) | ID_TYPE_IMEISV);
		for pair in digits[1..15].chunks(2) {
			id.push((pair[1] << 4) | pair[0]);
		}
		id.push(0xF0 | digits[15]);
		push_lv(&mut out, &id);
	}
	out
}

pub fn unpack_security_mode_complete(data: &[u8]) -> Result<SecurityModeComplete> {
	let rest = check_emm_header(data, EmmMsgType::SecurityModeComplete)?;
	if rest.is_empty() {
		return Ok(SecurityModeComplete { imeisv: None });
	}
	if rest[0] != IEI_IMEISV {
		return Err(Error::InvalidParam);
	}
	let (id, _) = read_lv(&rest[1..])?;
	if id.is_empty() || id[0] & 0x7 != ID_TYPE_IMEISV {
		return Err(Error::InvalidParam);
	}
	let mut digits = Vec::with_capacity(16);
	digits.push(id[0] >> 4);
	for byte in &id[1..] {
		digits.push(byte & 0xF);
		if byte >> 4 != 0xF {
			digits.push(byte >> 4);
		}
	}
	Ok(SecurityModeComplete {
		imeisv: Some(number_of(&digits)),
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityModeReject {
	pub emm_cause: u8,
}

pub fn pack_security_mode_reject(msg: &SecurityModeReject) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::SecurityModeReject);
	out.push(msg.emm_cause);
	out
}

pub fn unpack_security_mode_reject(data: &[u8]) -> Result<SecurityModeReject> {
	let rest = check_emm_header(data, EmmMsgType::SecurityModeReject)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	Ok(SecurityModeReject { emm_cause: rest[0] })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachRequest {
	pub detach_type: u8,
	pub nas_ksi: u8,
	pub mobile_id: MobileId,
}

pub fn pack_detach_request(msg: &DetachRequest) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::DetachRequest);
	out.push((msg.nas_ksi << 4) | (msg.detach_type & 0xF));
	let mut id = Vec::new();
	push_mobile_id(&mut id, &msg.mobile_id);
	push_lv(&mut out, &id);
	out
}

pub fn unpack_detach_request(data: &[u8]) -> Result<DetachRequest> {
	let rest = check_emm_header(data, EmmMsgType::DetachRequest)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	let detach_type = rest[0] & 0xF;
	let nas_ksi = rest[0] >> 4;
	let (id, _) = read_lv(&rest[1..])?;
	Ok(DetachRequest {
		detach_type,
		nas_ksi,
		mobile_id: read_mobile_id(id)?,
	})
}

pub fn pack_detach_accept() -> Vec<u8> {
	emm_header(EmmMsgType::DetachAccept)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRequest {
	pub ksi: u8,
	pub seq_num: u8,
	pub short_mac: u16,
}

pub fn pack_service_request(msg: &ServiceRequest) -> Vec<u8> {
	vec![
		(SEC_HDR_SERVICE_REQUEST << 4) | PD_EMM,
		(msg.ksi << 5) | (msg.seq_num & 0x1F),
		(msg.short_mac >> 8) as u8,
		msg.short_mac as u8,
	]
}

pub fn unpack_service_request(data: &[u8]) -> Result<ServiceRequest> {
	if data.len() < 4 || data[0] != (SEC_HDR_SERVICE_REQUEST << 4) | PD_EMM {
		return Err(Error::InvalidParam);
	}
	Ok(ServiceRequest {
		ksi: data[1] >> 5,
		seq_num: data[1] & 0x1F,
		short_mac: u16::from_be_bytes([data[2], data[3]]),
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceReject {
	pub emm_cause: u8,
}

pub fn pack_service_reject(msg: &ServiceReject) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::ServiceReject);
	out.push(msg.emm_cause);
	out
}

pub fn unpack_service_reject(data: &[u8]) -> Result<ServiceReject> {
	let rest = check_emm_header(data, EmmMsgType::ServiceReject)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	Ok(ServiceReject { emm_cause: rest[0] })
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UtcTime {
	pub year: u8,
	pub month: u8,
	pub day: u8,
	pub hour: u8,
	pub minute: u8,
	pub second: u8,
	pub tz: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmmInformation {
	pub full_net_name: Option<String>,
	pub short_net_name: Option<String>,
	pub utc_time: Option<UtcTime>,
}

pub fn pack_emm_information(msg: &EmmInformation) -> Vec<u8> {
	let mut out = emm_header(EmmMsgType::EmmInformation);
	if let Some(name) = &msg.full_net_name {
		out.push(IEI_NET_NAME_FULL);
		push_lv(&mut out, name.as_bytes());
	}
	if let Some(name) = &msg.short_net_name {
		out.push(IEI_NET_NAME_SHORT);
		push_lv(&mut out, name.as_bytes());
	}
	if let Some(utc) = &msg.utc_time {
		out.push(IEI_UTC_TIME);
		out.extend_from_slice(&[
			utc.year, utc.month, utc.day, utc.hour, utc.minute, utc.second, utc.tz,
		]);
	}
	out
}

pub fn unpack_emm_information(data: &[u8]) -> Result<EmmInformation> {
	let mut rest = check_emm_header(data, EmmMsgType::EmmInformation)?;
	let mut msg = EmmInformation::default();
	while !rest.is_empty() {
		match rest[0] {
			IEI_NET_NAME_FULL => {
				let (name, used) = read_lv(&rest[1..])?;
				msg.full_net_name =
					Some(String::from_utf8(name.to_vec()).map_err(|_| Error::InvalidParam)?);
				rest = &rest[1 + used..];
			}
			IEI_NET_NAME_SHORT => {
				let (name, used) = read_lv(&rest[1..])?;
				msg.short_net_name =
					Some(String::from_utf8(name.to_vec()).map_err(|_| Error::InvalidParam)?);
				rest = &rest[1 + used..];
			}
			IEI_UTC_TIME => {
				if rest.len() < 8 {
					return Err(Error::InvalidParam);
				}
				msg.utc_time = Some(UtcTime {
					year: rest[1],
					month: rest[2],
					day: rest[3],
					hour: rest[4],
					minute: rest[5],
					second: rest[6],
					tz: rest[7],
				});
				rest = &rest[8..];
			}
			_ => return Err(Error::InvalidParam),
		}
	}
	Ok(msg)
}

// ------------------------------------------------------------------
// ESM messages
// ------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PdnConnectivityRequest {
	pub eps_bearer_id: u8,
	pub proc_transaction_id: u8,
	pub pdn_type: u8,
	pub request_type: u8,
	pub esm_info_transfer_flag: Option<bool>,
	pub pco: Option<Pco>,
}

pub fn pack_pdn_connectivity_request(msg: &PdnConnectivityRequest) -> Vec<u8> {
	let mut out = esm_header(
		msg.eps_bearer_id,
		msg.proc_transaction_id,
		EsmMsgType::PdnConnectivityRequest,
	);
	out.push((msg.pdn_type << 4) | (msg.request_type & 0xF));
	if let Some(flag) = msg.esm_info_transfer_flag {
		out.push(0xD0 | u8::from(flag));
	}
	if let Some(pco) = &msg.pco {
		out.push(IEI_PCO);
		push_pco(&mut out, pco);
	}
	out
}

pub fn unpack_pdn_connectivity_request(data: &[u8]) -> Result<PdnConnectivityRequest> {
	let (eps_bearer_id, proc_transaction_id, rest) =
		check_esm_header(data, EsmMsgType::PdnConnectivityRequest)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	let pdn_type = rest[0] >> 4;
	let request_type = rest[0] & 0xF;
	let mut rest = &rest[1..];
	let mut esm_info_transfer_flag = None;
	let mut pco = None;
	while !rest.is_empty() {
		match rest[0] {
			byte if byte & 0xF0 == 0xD0 => {
				esm_info_transfer_flag = Some(byte & 0x1 != 0);
				rest = &rest[1..];
			}
			IEI_PCO => {
				let (parsed, used) = read_pco(&rest[1..])?;
				pco = Some(parsed);
				rest = &rest[1 + used..];
			}
			_ => return Err(Error::InvalidParam),
		}
	}
	Ok(PdnConnectivityRequest {
		eps_bearer_id,
		proc_transaction_id,
		pdn_type,
		request_type,
		esm_info_transfer_flag,
		pco,
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EsmInformationRequest {
	pub eps_bearer_id: u8,
	pub proc_transaction_id: u8,
}

pub fn pack_esm_information_request(msg: &EsmInformationRequest) -> Vec<u8> {
	esm_header(
		msg.eps_bearer_id,
		msg.proc_transaction_id,
		EsmMsgType::EsmInformationRequest,
	)
}

pub fn unpack_esm_information_request(data: &[u8]) -> Result<EsmInformationRequest> {
	let (eps_bearer_id, proc_transaction_id, _) =
		check_esm_header(data, EsmMsgType::EsmInformationRequest)?;
	Ok(EsmInformationRequest {
		eps_bearer_id,
		proc_transaction_id,
	})
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EsmInformationResponse {
	pub eps_bearer_id: u8,
	pub proc_transaction_id: u8,
	pub apn: Option<String>,
}

pub fn pack_esm_information_response(msg: &EsmInformationResponse) -> Vec<u8> {
	let mut out = esm_header(
		msg.eps_bearer_id,
		msg.proc_transaction_id,
		EsmMsgType::EsmInformationResponse,
	);
	if let Some(apn) = &msg.apn {
		out.push(0x28);
		push_lv(&mut out, apn.as_bytes());
	}
	out
}

pub fn unpack_esm_information_response(data: &[u8]) -> Result<EsmInformationResponse> {
	let (eps_bearer_id, proc_transaction_id, rest) =
		check_esm_header(data, EsmMsgType::EsmInformationResponse)?;
	let mut apn = None;
	if !rest.is_empty() && rest[0] == 0x28 {
		let (name, _) = read_lv(&rest[1..])?;
		apn = Some(String::from_utf8(name.to_vec()).map_err(|_| Error::InvalidParam)?);
	}
	Ok(EsmInformationResponse {
		eps_bearer_id,
		proc_transaction_id,
		apn,
	})
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivateDefaultEpsBearerContextRequest {
	pub eps_bearer_id: u8,
	pub proc_transaction_id: u8,
	pub qci: u8,
	pub apn: String,
	pub pdn_addr: [u8; 4],
	pub esm_cause: Option<u8>,
	pub pco: Option<Pco>,
}

pub fn pack_activate_default_eps_bearer_context_request(
	msg: &ActivateDefaultEpsBearerContextRequest,
) -> Vec<u8> {
	let mut out = esm_header(
		msg.eps_bearer_id,
		msg.proc_transaction_id,
		EsmMsgType::ActivateDefaultEpsBearerContextRequest,
	);
	out.push(0x01); // EPS QoS length
	out.push(msg.qci);
	push_lv(&mut out, msg.apn.as_bytes());
	let mut addr = vec![PDN_TYPE_IPV4];
	addr.extend_from_slice(&msg.pdn_addr);
	push_lv(&mut out, &addr);
	if let Some(cause) = msg.esm_cause {
		out.push(IEI_ESM_CAUSE);
		out.push(cause);
	}
	if let Some(pco) = &msg.pco {
		out.push(IEI_PCO);
		push_pco(&mut out, pco);
	}
	out
}

pub fn unpack_activate_default_eps_bearer_context_request(
	data: &[u8],
) -> Result<ActivateDefaultEpsBearerContextRequest> {
	let (eps_bearer_id, proc_transaction_id, rest) =
		check_esm_header(data, EsmMsgType::ActivateDefaultEpsBearerContextRequest)?;
	let (qos, used) = read_lv(rest)?;
	if qos.is_empty() {
		return Err(Error::InvalidParam);
	}
	let qci = qos[0];
	let rest = &rest[used..];
	let (apn_bytes, used) = read_lv(rest)?;
	let apn = String::from_utf8(apn_bytes.to_vec()).map_err(|_| Error::InvalidParam)?;
	let rest = &rest[used..];
	let (addr, used) = read_lv(rest)?;
	if addr.len() != 5 || addr[0] != PDN_TYPE_IPV4 {
		return Err(Error::InvalidParam);
	}
	let pdn_addr = [addr[1], addr[2], addr[3], addr[4]];
	let mut rest = &rest[used..];
	let mut esm_cause = None;
	let mut pco = None;
	while !rest.is_empty() {
		match rest[0] {
			IEI_ESM_CAUSE => {
				if rest.len() < 2 {
					return Err(Error::InvalidParam);
				}
				esm_cause = Some(rest[1]);
				rest = &rest[2..];
			}
			IEI_PCO => {
				let (parsed, used) = read_pco(&rest[1..])?;
				pco = Some(parsed);
				rest = &rest[1 + used..];
			}
			_ => return Err(Error::InvalidParam),
		}
	}
	Ok(ActivateDefaultEpsBearerContextRequest {
		eps_bearer_id,
		proc_transaction_id,
		qci,
		apn,
		pdn_addr,
		esm_cause,
		pco,
	})
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BearerContextAccept {
	pub eps_bearer_id: u8,
	pub proc_transaction_id: u8,
}

pub fn pack_activate_default_eps_bearer_context_accept(msg: &BearerContextAccept) -> Vec<u8> {
	esm_header(
		msg.eps_bearer_id,
		msg.proc_transaction_id,
		EsmMsgType::ActivateDefaultEpsBearerContextAccept,
	)
}

pub fn unpack_activate_default_eps_bearer_context_accept(data: &[u8]) -> Result<BearerContextAccept> {
	let (eps_bearer_id, proc_transaction_id, _) =
		check_esm_header(data, EsmMsgType::ActivateDefaultEpsBearerContextAccept)?;
	Ok(BearerContextAccept {
		eps_bearer_id,
		proc_transaction_id,
	})
}

/// One TFT packet filter of a dedicated bearer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketFilter {
	pub id: u8,
	pub direction: u8,
	pub eval_precedence: u8,
	pub components: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivateDedicatedEpsBearerContextRequest {
	pub eps_bearer_id: u8,
	pub proc_transaction_id: u8,
	pub linked_eps_bearer_id: u8,
	pub qci: u8,
	pub tft: Vec<PacketFilter>,
}

pub fn pack_activate_dedicated_eps_bearer_context_request(
	msg: &ActivateDedicatedEpsBearerContextRequest,
) -> Vec<u8> {
	let mut out = esm_header(
		msg.eps_bearer_id,
		msg.proc_transaction_id,
		EsmMsgType::ActivateDedicatedEpsBearerContextRequest,
	);
	out.push(msg.linked_eps_bearer_id & 0xF);
	out.push(0x01);
	out.push(msg.qci);
	let mut tft = vec![0x20 | msg.tft.len() as u8]; // create new TFT
	for filter in &msg.tft {
		tft.push((filter.direction << 4) | (filter.id & 0xF));
		tft.push(filter.eval_precedence);
		tft.push(filter.components.len() as u8);
		tft.extend_from_slice(&filter.components);
	}
	push_lv(&mut out, &tft);
	out
}

pub fn unpack_activate_dedicated_eps_bearer_context_request(
	data: &[u8],
) -> Result<ActivateDedicatedEpsBearerContextRequest> {
	let (eps_bearer_id, proc_transaction_id, rest) =
		check_esm_header(data, EsmMsgType::ActivateDedicatedEpsBearerContextRequest)?;
	if rest.is_empty() {
		return Err(Error::InvalidParam);
	}
	let linked_eps_bearer_id = rest[0] & 0xF;
	let (qos, used) = read_lv(&rest[1..])?;
	if qos.is_empty() {
		return Err(Error::InvalidParam);
	}
	let qci = qos[0];
	let rest = &rest[1 + used..];
	let (tft_bytes, _) = read_lv(rest)?;
	if tft_bytes.is_empty() {
		return Err(Error::InvalidParam);
	}
	let n_filters = (tft_bytes[0] & 0xF) as usize;
	let mut tft = Vec::with_capacity(n_filters);
	let mut body = &tft_bytes[1..];
	for _ in 0..n_filters {
		if body.len() < 3 {
			return Err(Error::InvalidParam);
		}
		let id = body[0] & 0xF;
		let direction = body[0] >> 4;
		let eval_precedence = body[1];
		let comp_len = body[2] as usize;
		if body.len() < 3 + comp_len {
			return Err(Error::InvalidParam);
		}
		tft.push(PacketFilter {
			id,
			direction,
			eval_precedence,
			components: body[3..3 + comp_len].to_vec(),
		});
		body = &body[3 + comp_len..];
	}
	Ok(ActivateDedicatedEpsBearerContextRequest {
		eps_bearer_id,
		proc_transaction_id,
		linked_eps_bearer_id,
		qci,
		tft,
	})
}

pub fn pack_activate_dedicated_eps_bearer_context_accept(msg: &BearerContextAccept) -> Vec<u8> {
	esm_header(
		msg.eps_bearer_id,
		msg.proc_transaction_id,
		EsmMsgType::ActivateDedicatedEpsBearerContextAccept,
	)
}
