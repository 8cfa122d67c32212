//! Minimal MIKEY (RFC 3830) pre-shared-key message codec.
//!
//! Carries exactly what the `KeyMgmt` exchange needs: a common header with
//! the SRTP-ID map, a timestamp, a RAND, one security policy and one TEK
//! holding the 30-byte SRTP master key + salt. Messages produced by other
//! implementations using the same profile parse cleanly; exotic payloads
//! are rejected rather than skipped.

use std::time::SystemTime;

use rand::RngCore;

use crate::error::{Error, Result};
use crate::rtcp::ntp;

use super::srtp_ctx::SrtpKeyingMaterial;

const MIKEY_VERSION: u8 = 1;
/// Data type: pre-shared key initiator message.
const DATA_TYPE_PSK_INIT: u8 = 0;
/// CS ID map type: SRTP-ID.
const CS_ID_MAP_SRTP: u8 = 0;

// Payload type codes (next-payload values).
const PAYLOAD_LAST: u8 = 0;
const PAYLOAD_KEMAC: u8 = 1;
const PAYLOAD_T: u8 = 5;
const PAYLOAD_SP: u8 = 10;
const PAYLOAD_RAND: u8 = 11;

/// Key data sub-payload: TEK type, no key validity period.
const KEY_DATA_TEK_NO_KV: u8 = 0x20;

/// One crypto session of the SRTP-ID map: a protected SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoSession {
    pub policy_no: u8,
    pub ssrc: u32,
    pub rollover_counter: u32,
}

/// Security policy parameters advertised for SRTP
/// (AES-CM-128 / HMAC-SHA1, 14-byte salt).
const SP_PARAMS: &[(u8, u8)] = &[
    (0, 1),  // encryption algorithm: AES-CM
    (1, 16), // session encryption key length
    (2, 1),  // authentication algorithm: HMAC-SHA1
    (3, 20), // session authentication key length
    (4, 14), // salt length
];

/// A MIKEY message restricted to the profile this engine negotiates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MikeyMessage {
    pub csb_id: u32,
    pub crypto_sessions: Vec<CryptoSession>,
    pub timestamp: u64,
    pub rand: [u8; 16],
    key: [u8; 30],
}

impl MikeyMessage {
    /// Builds an initiator message transporting the given keying material
    /// for the given SSRCs.
    pub fn new(keying: &SrtpKeyingMaterial, ssrcs: &[u32]) -> Self {
        let mut rng = rand::thread_rng();
        let mut rand_bytes = [0u8; 16];
        rng.fill_bytes(&mut rand_bytes);

        let mut key = [0u8; 30];
        key[..16].copy_from_slice(&keying.master_key);
        key[16..].copy_from_slice(&keying.master_salt);

        Self {
            csb_id: rng.next_u32(),
            crypto_sessions: ssrcs
                .iter()
                .map(|&ssrc| CryptoSession {
                    policy_no: 0,
                    ssrc,
                    rollover_counter: 0,
                })
                .collect(),
            timestamp: ntp::to_ntp(SystemTime::now()),
            rand: rand_bytes,
            key,
        }
    }

    /// Keying material transported by the TEK.
    pub fn keying_material(&self) -> SrtpKeyingMaterial {
        let mut master_key = [0u8; 16];
        let mut master_salt = [0u8; 14];
        master_key.copy_from_slice(&self.key[..16]);
        master_salt.copy_from_slice(&self.key[16..]);
        SrtpKeyingMaterial {
            master_key,
            master_salt,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);

        // Common header.
        out.push(MIKEY_VERSION);
        out.push(DATA_TYPE_PSK_INIT);
        out.push(PAYLOAD_T);
        out.push(0); // V = 0, PRF = MIKEY-1
        out.extend_from_slice(&self.csb_id.to_be_bytes());
        out.push(self.crypto_sessions.len() as u8);
        out.push(CS_ID_MAP_SRTP);
        for cs in &self.crypto_sessions {
            out.push(cs.policy_no);
            out.extend_from_slice(&cs.ssrc.to_be_bytes());
            out.extend_from_slice(&cs.rollover_counter.to_be_bytes());
        }

        // T payload: NTP-UTC timestamp.
        out.push(PAYLOAD_RAND);
        out.push(0); // TS type
        out.extend_from_slice(&self.timestamp.to_be_bytes());

        // RAND payload.
        out.push(PAYLOAD_SP);
        out.push(self.rand.len() as u8);
        out.extend_from_slice(&self.rand);

        // SP payload.
        out.push(PAYLOAD_KEMAC);
        out.push(0); // policy number
        out.push(0); // protocol type: SRTP
        let params_len: usize = SP_PARAMS.len() * 3;
        out.extend_from_slice(&(params_len as u16).to_be_bytes());
        for &(ptype, value) in SP_PARAMS {
            out.push(ptype);
            out.push(1);
            out.push(value);
        }

        // KEMAC payload: NULL encryption, NULL MAC, one TEK key data.
        out.push(PAYLOAD_LAST);
        out.push(0); // encr alg: NULL
        let key_data_len = 4 + self.key.len();
        out.extend_from_slice(&(key_data_len as u16).to_be_bytes());
        out.push(PAYLOAD_LAST); // sub-payload chain ends
        out.push(KEY_DATA_TEK_NO_KV);
        out.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.key);
        out.push(0); // MAC alg: NULL

        out
    }

    pub fn parse(data: &[u8]) -> Result<MikeyMessage> {
        let mut r = Reader::new(data);

        if r.u8()? != MIKEY_VERSION {
            return Err(Error::Crypto("unsupported MIKEY version".into()));
        }
        if r.u8()? != DATA_TYPE_PSK_INIT {
            return Err(Error::Crypto("unsupported MIKEY data type".into()));
        }
        let mut next_payload = r.u8()?;
        let _v_prf = r.u8()?;
        let csb_id = r.u32()?;
        let n_cs = r.u8()?;
        if r.u8()? != CS_ID_MAP_SRTP {
            return Err(Error::Crypto("unsupported MIKEY CS ID map type".into()));
        }
        let mut crypto_sessions = Vec::with_capacity(usize::from(n_cs));
        for _ in 0..n_cs {
            crypto_sessions.push(CryptoSession {
                policy_no: r.u8()?,
                ssrc: r.u32()?,
                rollover_counter: r.u32()?,
            });
        }

        let mut timestamp = None;
        let mut rand_bytes = None;
        let mut key = None;

        while next_payload != PAYLOAD_LAST {
            match next_payload {
                PAYLOAD_T => {
                    next_payload = r.u8()?;
                    let ts_type = r.u8()?;
                    if ts_type != 0 {
                        return Err(Error::Crypto("unsupported MIKEY TS type".into()));
                    }
                    timestamp = Some(r.u64()?);
                }
                PAYLOAD_RAND => {
                    next_payload = r.u8()?;
                    let len = usize::from(r.u8()?);
                    let bytes = r.take(len)?;
                    let mut rand16 = [0u8; 16];
                    if bytes.len() != 16 {
                        return Err(Error::Crypto("unsupported MIKEY RAND length".into()));
                    }
                    rand16.copy_from_slice(bytes);
                    rand_bytes = Some(rand16);
                }
                PAYLOAD_SP => {
                    next_payload = r.u8()?;
                    let _policy_no = r.u8()?;
                    if r.u8()? != 0 {
                        return Err(Error::Crypto(
                            "unsupported MIKEY SP protocol type".into(),
                        ));
                    }
                    let len = usize::from(r.u16()?);
                    let _params = r.take(len)?;
                }
                PAYLOAD_KEMAC => {
                    next_payload = r.u8()?;
                    if r.u8()? != 0 {
                        return Err(Error::Crypto(
                            "unsupported MIKEY encryption algorithm".into(),
                        ));
                    }
                    let key_data_len = usize::from(r.u16()?);
                    let key_data = r.take(key_data_len)?;
                    let mut kr = Reader::new(key_data);
                    let _sub_next = kr.u8()?;
                    if kr.u8()? != KEY_DATA_TEK_NO_KV {
                        return Err(Error::Crypto("unsupported MIKEY key data type".into()));
                    }
                    let key_len = usize::from(kr.u16()?);
                    let key_bytes = kr.take(key_len)?;
                    if key_bytes.len() != 30 {
                        return Err(Error::Crypto(format!(
                            "unsupported MIKEY TEK length {}",
                            key_bytes.len()
                        )));
                    }
                    let mut k = [0u8; 30];
                    k.copy_from_slice(key_bytes);
                    key = Some(k);
                    if r.u8()? != 0 {
                        return Err(Error::Crypto("unsupported MIKEY MAC algorithm".into()));
                    }
                }
                other => {
                    return Err(Error::Crypto(format!(
                        "unsupported MIKEY payload type {other}"
                    )))
                }
            }
        }

        Ok(MikeyMessage {
            csb_id,
            crypto_sessions,
            timestamp: timestamp
                .ok_or_else(|| Error::Crypto("MIKEY message without timestamp".into()))?,
            rand: rand_bytes
                .ok_or_else(|| Error::Crypto("MIKEY message without RAND".into()))?,
            key: key.ok_or_else(|| Error::Crypto("MIKEY message without TEK".into()))?,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Crypto("truncated MIKEY message".into()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let keying = SrtpKeyingMaterial::generate();
        let msg = MikeyMessage::new(&keying, &[0xAABB_CCDD, 0x0102_0304]);
        let parsed = MikeyMessage::parse(&msg.marshal()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.crypto_sessions.len(), 2);
        assert_eq!(parsed.crypto_sessions[0].ssrc, 0xAABB_CCDD);
        assert!(parsed.keying_material() == keying);
    }

    #[test]
    fn keying_material_survives() {
        let keying = SrtpKeyingMaterial::generate();
        let msg = MikeyMessage::new(&keying, &[1]);
        let back = MikeyMessage::parse(&msg.marshal()).unwrap().keying_material();
        assert_eq!(back.master_key, keying.master_key);
        assert_eq!(back.master_salt, keying.master_salt);
    }

    #[test]
    fn truncated_rejected() {
        let msg = MikeyMessage::new(&SrtpKeyingMaterial::generate(), &[1]);
        let wire = msg.marshal();
        assert!(MikeyMessage::parse(&wire[..wire.len() - 5]).is_err());
        assert!(MikeyMessage::parse(&[]).is_err());
    }

    #[test]
    fn wrong_version_rejected() {
        let msg = MikeyMessage::new(&SrtpKeyingMaterial::generate(), &[1]);
        let mut wire = msg.marshal();
        wire[0] = 2;
        assert!(MikeyMessage::parse(&wire).is_err());
    }
}
